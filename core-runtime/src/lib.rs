//! # Core Runtime Module
//!
//! Shared runtime infrastructure for the download core:
//! - Logging and tracing setup ([`logging`])
//! - Host capability configuration ([`config`])
//! - The broadcast event bus ([`events`])

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{CoreConfig, CoreConfigBuilder, FeatureFlags};
pub use error::{Error, Result};
pub use events::{CoreEvent, DownloadEvent, EventBus, EventStream, PlaybackEvent};
