//! Workspace umbrella crate.
//!
//! Re-exports the download core so host applications can depend on
//! `offline-media-core` alone. The `desktop-shims` feature (default) also
//! pulls in the [`service`] façade with the desktop bridge implementations.

pub use core_download as downloads;
pub use core_download::{
    DownloadConfig, DownloadError, DownloadId, DownloadManager, DownloadQuality, DownloadRecord,
    DownloadStatus, MediaItem,
};

#[cfg(feature = "service")]
pub use core_service as service;
#[cfg(feature = "service")]
pub use core_service::{bootstrap, CoreService};
