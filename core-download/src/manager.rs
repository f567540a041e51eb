//! # Download Manager
//!
//! The one surface the rest of the app calls.
//!
//! ## Overview
//!
//! `DownloadManager` owns the store, the quota tracker and the scheduler,
//! and turns user intents into record changes:
//! - Enqueue single items and batches (idempotent per server and item)
//! - Pause, resume, retry, delete and clear
//! - Answer queries on the committed snapshot
//! - Recalculate storage against the disk
//!
//! Every state change is also published on the [`EventBus`] as a
//! [`DownloadEvent`].
//!
//! ## Usage
//!
//! ```ignore
//! use core_download::{DownloadConfig, DownloadManager, DownloadOptions, MediaItem};
//!
//! let manager = DownloadManager::start(&core_config, events.clone(), DownloadConfig::default()).await?;
//! let item = MediaItem::movie("8f2c", "Heat")?.with_size_hint(4_000_000_000);
//! let id = manager.start_download(item, "jellyfin-home", DownloadOptions::default()).await?;
//! ```

use crate::config::DownloadConfig;
use crate::error::{DownloadError, Result};
use crate::models::{
    BatchOutcome, DownloadId, DownloadOptions, DownloadRecord, DownloadSnapshot, DownloadStatus,
    GroupId, MediaItem, PauseOrigin, StorageUsage,
};
use crate::paths::DownloadLayout;
use crate::quota::StorageQuotaTracker;
use crate::scheduler::Scheduler;
use crate::settings::DownloadSettings;
use crate::store::{delete_if_exists, DownloadStore, ReconcileReport};
use crate::worker::TransferContext;
use bridge_traits::error::BridgeError;
use bridge_traits::http::HttpClient;
use bridge_traits::media::MediaSource;
use bridge_traits::network::NetworkMonitor;
use bridge_traits::storage::{FileSystemAccess, SettingsStore};
use bridge_traits::time::Clock;
use core_runtime::config::CoreConfig;
use core_runtime::events::{DownloadEvent, EventBus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Everything the manager runs on, already resolved.
///
/// [`CoreConfig`] converts into this; tests build it directly.
#[derive(Clone)]
pub struct DownloadDeps {
    pub download_dir: PathBuf,
    pub file_system: Arc<dyn FileSystemAccess>,
    pub http_client: Arc<dyn HttpClient>,
    pub media_source: Arc<dyn MediaSource>,
    pub settings_store: Arc<dyn SettingsStore>,
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,
    pub clock: Arc<dyn Clock>,
}

impl From<&CoreConfig> for DownloadDeps {
    fn from(core: &CoreConfig) -> Self {
        let network_monitor = if core.features.enable_network_awareness {
            core.network_monitor.clone()
        } else {
            None
        };
        Self {
            download_dir: core.download_dir.clone(),
            file_system: core.file_system.clone(),
            http_client: core.http_client.clone(),
            media_source: core.media_source.clone(),
            settings_store: core.settings_store.clone(),
            network_monitor,
            clock: core.clock.clone(),
        }
    }
}

pub struct DownloadManager {
    store: Arc<DownloadStore>,
    quota: Arc<StorageQuotaTracker>,
    settings: DownloadSettings,
    scheduler: Arc<Scheduler>,
    ctx: Arc<TransferContext>,
    clock: Arc<dyn Clock>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Build from a validated [`CoreConfig`].
    pub async fn start(
        core: &CoreConfig,
        events: EventBus,
        config: DownloadConfig,
    ) -> Result<Arc<Self>> {
        Self::with_deps(DownloadDeps::from(core), events, config).await
    }

    /// Open the store, reconcile it against the disk and start scheduling.
    #[instrument(skip_all, fields(download_dir = ?deps.download_dir))]
    pub async fn with_deps(
        deps: DownloadDeps,
        events: EventBus,
        config: DownloadConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let layout = DownloadLayout::new(&deps.download_dir, config.manifest_file_name.clone());
        let store = Arc::new(
            DownloadStore::open(deps.file_system.clone(), layout, deps.clock.clone()).await?,
        );
        let settings = DownloadSettings::new(deps.settings_store.clone());
        let quota = Arc::new(StorageQuotaTracker::new(store.clone(), settings.clone()));

        let ctx = Arc::new(TransferContext {
            store: store.clone(),
            quota: quota.clone(),
            fs: deps.file_system.clone(),
            http: deps.http_client.clone(),
            media: deps.media_source.clone(),
            events,
            config,
        });

        let report = quota.recalculate().await?;
        ctx.emit(DownloadEvent::StorageRecalculated {
            used_bytes: report.used_bytes,
            missing_files: report.missing_files,
            orphans_deleted: report.orphans_deleted,
        });

        let scheduler = Arc::new(Scheduler::new(
            ctx.clone(),
            settings.clone(),
            deps.network_monitor.clone(),
        ));
        let restored = scheduler.requeue_paused_by(PauseOrigin::Lifecycle).await;
        if !restored.is_empty() {
            info!(count = restored.len(), "Requeued downloads paused at shutdown");
        }
        let tasks = scheduler.start();

        info!(
            records = store.snapshot().records.len(),
            used_bytes = report.used_bytes,
            "Download manager started"
        );

        Ok(Arc::new(Self {
            store,
            quota,
            settings,
            scheduler,
            ctx,
            clock: deps.clock,
            tasks: parking_lot::Mutex::new(tasks),
        }))
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    /// Cancelled when [`DownloadManager::shutdown`] runs.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.scheduler.shutdown_signal()
    }

    fn fallback_size(&self) -> u64 {
        self.ctx.config.default_estimated_size
    }

    fn require(&self, id: &DownloadId) -> Result<DownloadRecord> {
        self.store
            .get(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    fn emit_queued(&self, record: &DownloadRecord) {
        self.ctx.emit(DownloadEvent::Queued {
            download_id: record.id.to_string(),
            item_id: record.item_id.clone(),
            name: record.item.name.clone(),
            group_id: record.group_id.map(|g| g.to_string()),
        });
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Enqueue `item` for download from `server_id`.
    ///
    /// An existing record for the same server and item is reused: Completed
    /// and in-flight records are returned as they are, Paused ones are
    /// resumed and Failed ones retried. A new item whose estimated size does
    /// not fit the quota is rejected with [`DownloadError::StorageFull`] and
    /// no record is created.
    #[instrument(skip(self, item, options), fields(item_id = %item.id))]
    pub async fn start_download(
        &self,
        item: MediaItem,
        server_id: &str,
        options: DownloadOptions,
    ) -> Result<DownloadId> {
        item.validate()?;
        validate_server_id(server_id)?;

        if let Some(existing) = self.store.find_by_source(server_id, &item.id) {
            return match existing.status {
                DownloadStatus::Completed
                | DownloadStatus::Downloading
                | DownloadStatus::Pending => {
                    debug!(download_id = %existing.id, status = %existing.status, "Item already has a download");
                    Ok(existing.id)
                }
                DownloadStatus::Paused => {
                    self.resume_download(&existing.id).await?;
                    Ok(existing.id)
                }
                DownloadStatus::Failed => {
                    self.retry_download(&existing.id).await?;
                    Ok(existing.id)
                }
            };
        }

        let quality = match options.quality {
            Some(quality) => quality,
            None => self.settings.quality().await,
        };
        let record = DownloadRecord::new(item, server_id, quality, self.clock.now())
            .with_options(&options);

        self.quota
            .admit(None, record.estimated_size(self.fallback_size()))
            .await?;
        let record = self.store.insert(record).await?;

        info!(download_id = %record.id, quality = %quality.as_str(), "Download queued");
        self.emit_queued(&record);
        self.scheduler.wake();
        Ok(record.id)
    }

    /// Enqueue several items under one group, in the order given.
    ///
    /// Never fails as a whole: items that already have a record, do not
    /// validate or no longer fit the quota are listed in
    /// [`BatchOutcome::skipped`] with the reason.
    #[instrument(skip(self, items, options), fields(count = items.len()))]
    pub async fn start_batch_download(
        &self,
        items: Vec<MediaItem>,
        server_id: &str,
        options: DownloadOptions,
    ) -> Result<BatchOutcome> {
        validate_server_id(server_id)?;

        let group_id = GroupId::new();
        let quality = match options.quality {
            Some(quality) => quality,
            None => self.settings.quality().await,
        };
        let mut outcome = BatchOutcome::default();
        let mut planned = 0u64;

        for item in items {
            let item_id = item.id.clone();
            if let Err(e) = item.validate() {
                outcome.skipped.push((item_id, e));
                continue;
            }
            if let Some(existing) = self.store.find_by_source(server_id, &item.id) {
                outcome.skipped.push((
                    item_id,
                    DownloadError::AlreadyDownloaded(existing.id.to_string()),
                ));
                continue;
            }

            let record = DownloadRecord::new(item, server_id, quality, self.clock.now())
                .with_options(&options)
                .with_group(group_id);
            let estimate = record.estimated_size(self.fallback_size());
            if let Err(e) = self
                .quota
                .admit(None, planned.saturating_add(estimate))
                .await
            {
                outcome.skipped.push((item_id, e));
                continue;
            }

            match self.store.insert(record).await {
                Ok(record) => {
                    planned = planned.saturating_add(estimate);
                    self.emit_queued(&record);
                    outcome.enqueued.push(record.id);
                }
                Err(e) => outcome.skipped.push((item_id, e)),
            }
        }

        if !outcome.enqueued.is_empty() {
            outcome.group_id = Some(group_id);
            self.scheduler.wake();
        }
        info!(
            enqueued = outcome.enqueued_count(),
            skipped = outcome.skipped_count(),
            "Batch queued"
        );
        Ok(outcome)
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Pause a running download. It stays Paused until resumed by id.
    pub async fn pause_download(&self, id: &DownloadId) -> Result<()> {
        self.scheduler.pause(id, PauseOrigin::User).await
    }

    /// Put a Paused download back in the queue. Pending and in-flight
    /// downloads are left alone; a Failed one is retried.
    pub async fn resume_download(&self, id: &DownloadId) -> Result<()> {
        let record = self.require(id)?;
        match record.status {
            DownloadStatus::Paused => {
                self.scheduler.requeue(id).await?;
                info!(download_id = %id, "Download resumed");
                self.scheduler.wake();
                Ok(())
            }
            DownloadStatus::Pending | DownloadStatus::Downloading => Ok(()),
            DownloadStatus::Failed => self.retry_download(id).await,
            DownloadStatus::Completed => Err(DownloadError::InvalidTransition {
                id: *id,
                from: DownloadStatus::Completed,
                to: DownloadStatus::Pending,
            }),
        }
    }

    /// Re-enqueue a Failed download from byte 0 with a fresh retry budget.
    pub async fn retry_download(&self, id: &DownloadId) -> Result<()> {
        let current = self.require(id)?;
        if current.status != DownloadStatus::Failed {
            return Err(DownloadError::InvalidTransition {
                id: *id,
                from: current.status,
                to: DownloadStatus::Pending,
            });
        }

        let record = self
            .store
            .transition(id, DownloadStatus::Pending, |r| {
                r.retry_count = 0;
                r.last_error = None;
                r.downloaded_bytes = 0;
                r.total_bytes = None;
                r.file_path = None;
                r.paused_by = None;
            })
            .await?;

        // A stale partial file would be appended to.
        let partial = self.store.layout().partial_path(&record);
        delete_if_exists(self.ctx.fs.as_ref(), &partial).await?;

        info!(download_id = %id, "Download retried");
        self.ctx.emit(DownloadEvent::Resumed {
            download_id: id.to_string(),
        });
        self.scheduler.wake();
        Ok(())
    }

    /// Stop any transfer, then remove the record and its files.
    #[instrument(skip(self))]
    pub async fn delete_download(&self, id: &DownloadId) -> Result<()> {
        let record = {
            let _admission = self.scheduler.lock_admission().await;
            self.scheduler.cancel(id).await;
            let record = self.store.remove(id).await?;
            self.quota.release(id);
            record
        };

        let layout = self.store.layout();
        delete_if_exists(self.ctx.fs.as_ref(), &layout.partial_path(&record)).await?;
        delete_if_exists(self.ctx.fs.as_ref(), &layout.media_path(&record)).await?;

        info!(item_id = %record.item_id, "Download removed");
        self.ctx.emit(DownloadEvent::Removed {
            download_id: id.to_string(),
            item_id: record.item_id,
        });
        self.scheduler.wake();
        Ok(())
    }

    /// Same as [`DownloadManager::delete_download`]; reads better for
    /// records that are still transferring.
    pub async fn cancel_download(&self, id: &DownloadId) -> Result<()> {
        self.delete_download(id).await
    }

    /// Pause every running download and hold the queue until
    /// [`DownloadManager::resume_all_downloads`]. Pending records stay
    /// Pending.
    pub async fn pause_all_downloads(&self) -> Vec<DownloadId> {
        self.scheduler.pause_all().await
    }

    /// Release the queue and requeue the downloads the global pause
    /// stopped. Downloads paused individually stay Paused.
    pub async fn resume_all_downloads(&self) -> Vec<DownloadId> {
        self.scheduler.resume_all().await
    }

    /// App moving to the background: pause running downloads and hold the
    /// queue.
    pub async fn suspend(&self) -> Vec<DownloadId> {
        self.scheduler.suspend().await
    }

    /// Undo [`DownloadManager::suspend`].
    pub async fn restore(&self) -> Vec<DownloadId> {
        self.scheduler.restore().await
    }

    /// Drop every record and every file under the download root.
    #[instrument(skip(self))]
    pub async fn clear_all_downloads(&self) -> Result<usize> {
        let _admission = self.scheduler.lock_admission().await;
        self.scheduler.cancel_all().await;

        let removed = self.store.clear().await?;
        self.quota.clear_reservations();

        let fs = self.ctx.fs.as_ref();
        let root = self.store.layout().root();
        for entry in fs.list_directory(root).await? {
            let result = match fs.metadata(&entry).await {
                Ok(meta) if meta.is_directory => fs.delete_dir_all(&entry).await,
                Ok(_) => fs.delete_file(&entry).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) | Err(BridgeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(removed = removed.len(), "Cleared all downloads");
        self.ctx.emit(DownloadEvent::Cleared {
            removed: removed.len(),
        });
        Ok(removed.len())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn snapshot(&self) -> Arc<DownloadSnapshot> {
        self.store.snapshot()
    }

    /// Committed snapshots, newest first on every change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DownloadSnapshot>> {
        self.store.subscribe()
    }

    pub fn list_downloads(&self) -> Vec<DownloadRecord> {
        self.store.snapshot().records.clone()
    }

    pub fn get_download(&self, id: &DownloadId) -> Option<DownloadRecord> {
        self.store.get(id)
    }

    pub fn get_download_by_item_id(&self, item_id: &str) -> Option<DownloadRecord> {
        self.store.snapshot().find_by_item(item_id).cloned()
    }

    /// The Completed record for `item_id`, if any.
    pub fn get_downloaded_item(&self, item_id: &str) -> Option<DownloadRecord> {
        self.store
            .snapshot()
            .with_status(DownloadStatus::Completed)
            .find(|r| r.item_id == item_id)
            .cloned()
    }

    pub fn is_item_downloaded(&self, item_id: &str) -> bool {
        self.get_downloaded_item(item_id).is_some()
    }

    /// Where the finished file for `item_id` lives.
    pub fn get_local_path(&self, item_id: &str) -> Option<PathBuf> {
        self.get_downloaded_item(item_id)
            .and_then(|record| record.file_path)
    }

    pub fn active_download_count(&self) -> usize {
        self.scheduler.active_count()
    }

    pub fn is_globally_paused(&self) -> bool {
        self.scheduler.is_globally_paused()
    }

    // ========================================================================
    // Storage
    // ========================================================================

    pub async fn storage_usage(&self) -> StorageUsage {
        self.quota.usage().await
    }

    /// Persist a new ceiling. Pending records that now fit are admitted.
    pub async fn set_max_storage(&self, bytes: u64) -> Result<()> {
        self.settings.set_max_storage_bytes(bytes).await?;
        self.store.set_max_bytes(bytes).await;
        info!(max_bytes = bytes, "Storage limit changed");
        self.scheduler.wake();
        Ok(())
    }

    /// Rescan the disk: drop orphans, fail records whose file vanished and
    /// recompute the used total.
    pub async fn recalculate_used_storage(&self) -> Result<ReconcileReport> {
        let report = self.quota.recalculate().await?;
        self.ctx.emit(DownloadEvent::StorageRecalculated {
            used_bytes: report.used_bytes,
            missing_files: report.missing_files,
            orphans_deleted: report.orphans_deleted,
        });
        self.scheduler.wake();
        Ok(report)
    }

    /// Flag the Completed downloads of `item_id` as played.
    pub async fn mark_played(&self, item_id: &str, server_id: Option<&str>) -> Result<usize> {
        let targets = self.completed_for(item_id, server_id);
        for id in &targets {
            self.store
                .update(id, |r| {
                    r.item.played = true;
                    Ok(())
                })
                .await?;
        }
        Ok(targets.len())
    }

    /// Delete every Completed download whose item has been played.
    pub async fn remove_watched_downloads(&self) -> Result<usize> {
        let watched: Vec<DownloadId> = self
            .store
            .snapshot()
            .with_status(DownloadStatus::Completed)
            .filter(|r| r.item.played)
            .map(|r| r.id)
            .collect();

        for id in &watched {
            self.delete_download(id).await?;
        }
        if !watched.is_empty() {
            info!(count = watched.len(), "Removed watched downloads");
        }
        Ok(watched.len())
    }

    pub(crate) fn completed_for(&self, item_id: &str, server_id: Option<&str>) -> Vec<DownloadId> {
        self.store
            .snapshot()
            .with_status(DownloadStatus::Completed)
            .filter(|r| r.item_id == item_id)
            .filter(|r| server_id.map_or(true, |s| r.server_id == s))
            .map(|r| r.id)
            .collect()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Pause running transfers so they resume on the next start, then stop
    /// the background tasks.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Download task ended abnormally");
            }
        }
        info!("Download manager stopped");
    }
}

fn validate_server_id(server_id: &str) -> Result<()> {
    if server_id.trim().is_empty() {
        return Err(DownloadError::InvalidItem(
            "server id cannot be empty".to_string(),
        ));
    }
    Ok(())
}
