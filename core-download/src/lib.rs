//! # Offline Download Module
//!
//! Moves remote media items to local storage for offline playback.
//!
//! ## Overview
//!
//! This module handles:
//! - Download records and their status state machine
//! - A persisted, observable store reconciled against the disk at start-up
//! - Storage quota accounting with in-flight reservations
//! - Resumable ranged transfers with retry and backoff
//! - A bounded scheduler gated on network class and quota
//! - Removal of downloads once they have been watched

pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod paths;
pub mod policy;
pub mod quota;
pub mod retry;
pub mod settings;
pub mod store;
pub mod throttle;

mod scheduler;
mod worker;

pub use config::DownloadConfig;
pub use error::{DownloadError, Result};
pub use manager::{DownloadDeps, DownloadManager};
pub use models::{
    BatchOutcome, DownloadId, DownloadOptions, DownloadQuality, DownloadRecord,
    DownloadSnapshot, DownloadStatus, GroupId, ItemDetails, MediaItem, MediaKind, PauseOrigin,
    StorageUsage,
};
pub use policy::AutoRemovePolicy;
pub use quota::StorageQuotaTracker;
pub use retry::{RetryDecision, RetryPolicy};
pub use settings::DownloadSettings;
pub use store::{DownloadStore, ReconcileReport};
