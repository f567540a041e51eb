//! # Download Error Types

use crate::models::{DownloadId, DownloadStatus};
use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    // ========================================================================
    // Transfer Errors
    // ========================================================================
    /// Connection-level failure; retried by the worker.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("HTTP status {0}")]
    Http(u16),

    /// The remote resource differs from what the partial file was built from.
    #[error("Source changed: {0}")]
    SourceChanged(String),

    // ========================================================================
    // Item Errors
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Informational: the item already has a record.
    #[error("Already downloaded: {0}")]
    AlreadyDownloaded(String),

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: DownloadId,
        from: DownloadStatus,
        to: DownloadStatus,
    },

    // ========================================================================
    // Storage Errors
    // ========================================================================
    #[error("Storage full: {required} bytes required, {available} bytes available")]
    StorageFull { required: u64, available: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Bridge error: {0}")]
    Bridge(BridgeError),
}

impl DownloadError {
    /// Whether a later attempt of the same transfer may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            DownloadError::Network(_) | DownloadError::Timeout(_) => true,
            DownloadError::Http(status) => is_retriable_status(*status),
            _ => false,
        }
    }

    /// Map a non-success HTTP status onto the taxonomy.
    pub fn from_status(status: u16) -> Self {
        match status {
            404 | 410 => DownloadError::NotFound(format!("server answered HTTP {}", status)),
            415 => DownloadError::UnsupportedFormat(format!("server answered HTTP {}", status)),
            _ => DownloadError::Http(status),
        }
    }
}

fn is_retriable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

impl From<BridgeError> for DownloadError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Timeout(msg) => DownloadError::Timeout(msg),
            BridgeError::Connection(msg) => DownloadError::Network(msg),
            BridgeError::Http { status, .. } => DownloadError::from_status(status),
            BridgeError::NotFound(msg) => DownloadError::NotFound(msg),
            other => DownloadError::Bridge(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
