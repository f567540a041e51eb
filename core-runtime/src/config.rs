//! # Core Configuration Module
//!
//! Builder for the set of host capabilities the download core runs on.
//!
//! ## Required Dependencies
//!
//! - `MediaSource` - resolves items to downloadable sources (always host-provided)
//!
//! ## Dependencies with desktop defaults
//!
//! - `HttpClient` (reqwest)
//! - `FileSystemAccess` (tokio fs)
//! - `SettingsStore` (SQLite file next to the download directory)
//! - `NetworkMonitor` (reachability probe), only when network awareness is on
//!
//! With the `desktop-shims` feature these are filled in by [`CoreConfigBuilder::build`]
//! when not injected; without it, a missing capability is reported as
//! [`Error::CapabilityMissing`].
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .download_dir("/var/lib/app/downloads")
//!     .media_source(Arc::new(MyMediaApi::new()))
//!     .enable_network_awareness(true)
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{
    Clock, FileSystemAccess, HttpClient, MediaSource, NetworkMonitor, SettingsStore, SystemClock,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAX_EVENT_BUFFER_SIZE: usize = 65_536;

/// Host capabilities and static settings for the core.
#[derive(Clone)]
pub struct CoreConfig {
    /// Root under which one directory per server is created
    pub download_dir: PathBuf,
    pub http_client: Arc<dyn HttpClient>,
    pub file_system: Arc<dyn FileSystemAccess>,
    pub settings_store: Arc<dyn SettingsStore>,
    pub media_source: Arc<dyn MediaSource>,
    /// Required when `features.enable_network_awareness` is set
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,
    pub clock: Arc<dyn Clock>,
    pub event_buffer_size: usize,
    pub features: FeatureFlags,
}

impl fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreConfig")
            .field("download_dir", &self.download_dir)
            .field("http_client", &"HttpClient { .. }")
            .field("file_system", &"FileSystemAccess { .. }")
            .field("settings_store", &"SettingsStore { .. }")
            .field("media_source", &"MediaSource { .. }")
            .field(
                "network_monitor",
                &self.network_monitor.as_ref().map(|_| "NetworkMonitor { .. }"),
            )
            .field("event_buffer_size", &self.event_buffer_size)
            .field("features", &self.features)
            .finish()
    }
}

/// Optional behaviour toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Gate transfers on the network class (Wi-Fi-only preference).
    /// Without it every connection is treated as Wi-Fi.
    pub enable_network_awareness: bool,
    /// Run the policy task that deletes downloads once playback finishes
    /// and the user opted in.
    pub enable_auto_remove_policy: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_network_awareness: true,
            enable_auto_remove_policy: true,
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_dir.as_os_str().is_empty() {
            return Err(Error::Config(
                "Download directory cannot be empty".to_string(),
            ));
        }

        if self.event_buffer_size == 0 || self.event_buffer_size > MAX_EVENT_BUFFER_SIZE {
            return Err(Error::Config(format!(
                "Event buffer size must be between 1 and {}",
                MAX_EVENT_BUFFER_SIZE
            )));
        }

        if self.features.enable_network_awareness && self.network_monitor.is_none() {
            return Err(Error::Config(
                "Network awareness enabled but no NetworkMonitor provided. \
                 Disable the feature or inject a NetworkMonitor implementation."
                    .to_string(),
            ));
        }

        Ok(())
    }
}

fn missing(capability: &str, hint: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: hint.to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
mod defaults {
    use super::*;
    use bridge_desktop::{
        DesktopNetworkMonitor, ReqwestHttpClient, SqliteSettingsStore, TokioFileSystem,
    };

    pub fn http_client() -> Result<Arc<dyn HttpClient>> {
        let client = ReqwestHttpClient::new()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Arc::new(client))
    }

    pub fn file_system(download_dir: &Path) -> Result<Arc<dyn FileSystemAccess>> {
        let data_dir = download_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| download_dir.to_path_buf());
        Ok(Arc::new(TokioFileSystem::with_data_directory(data_dir)))
    }

    pub fn settings_store(download_dir: &Path) -> Result<Arc<dyn SettingsStore>> {
        let path = download_dir
            .parent()
            .map(|parent| parent.join("settings.db"))
            .unwrap_or_else(|| download_dir.join("settings.db"));
        Ok(Arc::new(SqliteSettingsStore::open_lazy(path)))
    }

    pub fn network_monitor() -> Option<Arc<dyn NetworkMonitor>> {
        Some(Arc::new(DesktopNetworkMonitor::new()))
    }
}

#[cfg(not(feature = "desktop-shims"))]
mod defaults {
    use super::*;

    pub fn http_client() -> Result<Arc<dyn HttpClient>> {
        Err(missing(
            "HttpClient",
            "Desktop: enable the 'desktop-shims' feature. Mobile: inject the platform HTTP stack.",
        ))
    }

    pub fn file_system(_download_dir: &Path) -> Result<Arc<dyn FileSystemAccess>> {
        Err(missing(
            "FileSystemAccess",
            "Desktop: enable the 'desktop-shims' feature. Mobile: inject sandboxed storage access.",
        ))
    }

    pub fn settings_store(_download_dir: &Path) -> Result<Arc<dyn SettingsStore>> {
        Err(missing(
            "SettingsStore",
            "Desktop: enable the 'desktop-shims' feature. Mobile: inject UserDefaults/DataStore.",
        ))
    }

    pub fn network_monitor() -> Option<Arc<dyn NetworkMonitor>> {
        None
    }
}

/// Builder for [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    download_dir: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    media_source: Option<Arc<dyn MediaSource>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    event_buffer_size: Option<usize>,
    features: Option<FeatureFlags>,
}

impl CoreConfigBuilder {
    pub fn download_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.download_dir = Some(path.into());
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    pub fn media_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.media_source = Some(source);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn enable_network_awareness(mut self, enabled: bool) -> Self {
        self.features
            .get_or_insert_with(FeatureFlags::default)
            .enable_network_awareness = enabled;
        self
    }

    pub fn enable_auto_remove_policy(mut self, enabled: bool) -> Self {
        self.features
            .get_or_insert_with(FeatureFlags::default)
            .enable_auto_remove_policy = enabled;
        self
    }

    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = Some(features);
        self
    }

    /// Resolve defaults for missing capabilities and validate.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] when the download directory is missing or a
    ///   setting is out of range
    /// - [`Error::CapabilityMissing`] when a capability has no injected
    ///   implementation and no platform default
    pub fn build(self) -> Result<CoreConfig> {
        let download_dir = self.download_dir.ok_or_else(|| {
            Error::Config(
                "Download directory is required. Use .download_dir() to set it.".to_string(),
            )
        })?;

        let media_source = self.media_source.ok_or_else(|| {
            missing(
                "MediaSource",
                "A MediaSource implementation backed by the media server API must be injected.",
            )
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => defaults::http_client()?,
        };
        let file_system = match self.file_system {
            Some(fs) => fs,
            None => defaults::file_system(&download_dir)?,
        };
        let settings_store = match self.settings_store {
            Some(store) => store,
            None => defaults::settings_store(&download_dir)?,
        };

        let features = self.features.unwrap_or_default();
        let network_monitor = match self.network_monitor {
            Some(monitor) => Some(monitor),
            None if features.enable_network_awareness => defaults::network_monitor(),
            None => None,
        };

        let config = CoreConfig {
            download_dir,
            http_client,
            file_system,
            settings_store,
            media_source,
            network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            features,
        };

        config.validate()?;
        Ok(config)
    }
}
