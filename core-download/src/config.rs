//! Download manager tunables.

use crate::error::{DownloadError, Result};
use crate::retry::RetryPolicy;
use std::time::Duration;

pub const DEFAULT_MANIFEST_FILE_NAME: &str = "manifest.json";

/// Static tuning for the download manager.
///
/// User-facing preferences (quality, Wi-Fi only, storage ceiling) are not
/// here; they are read live through [`crate::settings::DownloadSettings`].
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Transfers allowed to run at once (default: 2)
    pub max_concurrent_downloads: usize,

    /// Backoff for transient failures (default: 4 attempts, 500ms doubling, 30s cap)
    pub retry_policy: RetryPolicy,

    /// Longest the media source, the stream open or a single body read may
    /// stall before it counts as a timeout
    pub read_timeout: Duration,

    /// Read buffer size in bytes (default: 64 KiB)
    pub chunk_size: usize,

    /// Progress is reported at least every this many percent...
    pub progress_min_step_percent: u8,

    /// ...or after this much time, whichever comes first
    pub progress_min_interval: Duration,

    /// How often Pending records are reconsidered without a wake-up
    pub network_recheck_interval: Duration,

    /// Quota estimate for items that carry no size hint (default: 500 MB)
    pub default_estimated_size: u64,

    pub manifest_file_name: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 2,
            retry_policy: RetryPolicy::default(),
            read_timeout: Duration::from_secs(30),
            chunk_size: 64 * 1024,
            progress_min_step_percent: 1,
            progress_min_interval: Duration::from_secs(1),
            network_recheck_interval: Duration::from_secs(15),
            default_estimated_size: 500 * 1000 * 1000,
            manifest_file_name: DEFAULT_MANIFEST_FILE_NAME.to_string(),
        }
    }
}

impl DownloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_downloads(mut self, count: usize) -> Self {
        self.max_concurrent_downloads = count;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_progress_throttle(mut self, min_step_percent: u8, min_interval: Duration) -> Self {
        self.progress_min_step_percent = min_step_percent;
        self.progress_min_interval = min_interval;
        self
    }

    pub fn with_network_recheck_interval(mut self, interval: Duration) -> Self {
        self.network_recheck_interval = interval;
        self
    }

    pub fn with_default_estimated_size(mut self, bytes: u64) -> Self {
        self.default_estimated_size = bytes;
        self
    }

    pub fn with_manifest_file_name(mut self, name: impl Into<String>) -> Self {
        self.manifest_file_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(DownloadError::Config(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }

        if self.retry_policy.max_attempts == 0 {
            return Err(DownloadError::Config(
                "retry_policy.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.chunk_size == 0 {
            return Err(DownloadError::Config("chunk_size must be greater than 0".to_string()));
        }

        if self.read_timeout.is_zero() {
            return Err(DownloadError::Config("read_timeout must be non-zero".to_string()));
        }

        if self.progress_min_step_percent > 100 {
            return Err(DownloadError::Config(
                "progress_min_step_percent cannot exceed 100".to_string(),
            ));
        }

        let name = self.manifest_file_name.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.ends_with(".part") {
            return Err(DownloadError::Config(format!(
                "manifest_file_name '{}' must be a plain file name",
                name
            )));
        }

        Ok(())
    }
}
