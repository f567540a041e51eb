//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP, filesystem,
//! settings, media API, network monitor) into the download core. Desktop
//! apps typically enable the `desktop-shims` feature (which depends on
//! `bridge-desktop`) so only the media API has to be injected; mobile hosts
//! inject every capability through [`CoreConfig::builder`].
//!
//! ```ignore
//! use core_service::{bootstrap, CoreConfig, DownloadConfig};
//!
//! let config = CoreConfig::builder()
//!     .download_dir(data_dir.join("downloads"))
//!     .media_source(Arc::new(MyMediaApi::new(server)))
//!     .build()?;
//! let core = bootstrap(config, DownloadConfig::default()).await?;
//! let id = core.downloads().start_download(&item, "home", None).await?;
//! ```

pub mod error;

pub use error::{CoreError, Result};

pub use bridge_traits::{MediaSource, NetworkMonitor, PlaybackInfo, PlaybackRequest};
pub use core_download::{DownloadConfig, DownloadManager};
pub use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
pub use core_runtime::{CoreConfig, CoreEvent, EventBus, EventStream, PlaybackEvent};

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop as desktop;

use core_download::AutoRemovePolicy;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    config: Arc<CoreConfig>,
    events: EventBus,
    downloads: Arc<DownloadManager>,
    policy: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CoreService {
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn downloads(&self) -> &Arc<DownloadManager> {
        &self.downloads
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> EventStream {
        self.events.stream()
    }

    /// Report that the player reached the end of an item.
    ///
    /// Returns `false` when nobody is listening (auto-remove disabled and no
    /// host subscribers).
    pub fn notify_playback_finished(&self, item_id: &str, server_id: Option<&str>) -> bool {
        let event = CoreEvent::Playback(PlaybackEvent::Finished {
            item_id: item_id.to_string(),
            server_id: server_id.map(str::to_string),
        });
        self.events.emit(event).is_ok()
    }

    /// Pause running transfers for the next start and stop background tasks.
    pub async fn shutdown(&self) {
        self.downloads.shutdown().await;
        if let Some(policy) = self.policy.lock().await.take() {
            if let Err(e) = policy.await {
                warn!(error = %e, "Auto-remove policy ended abnormally");
            }
        }
        info!("Core service stopped");
    }
}

/// Start the download core on the capabilities in `config`.
///
/// # Errors
///
/// - [`CoreError::InitializationFailed`] when the config does not validate
/// - [`CoreError::Download`] when the download store cannot be opened
pub async fn bootstrap(config: CoreConfig, download_config: DownloadConfig) -> Result<CoreService> {
    config
        .validate()
        .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;

    let events = EventBus::new(config.event_buffer_size);
    let downloads = DownloadManager::start(&config, events.clone(), download_config).await?;

    let policy = if config.features.enable_auto_remove_policy {
        Some(AutoRemovePolicy::new(downloads.clone()).spawn())
    } else {
        None
    };

    info!(
        download_dir = ?config.download_dir,
        network_awareness = config.features.enable_network_awareness,
        auto_remove = policy.is_some(),
        "Core service started"
    );

    Ok(CoreService {
        config: Arc::new(config),
        events,
        downloads,
        policy: Arc::new(Mutex::new(policy)),
    })
}
