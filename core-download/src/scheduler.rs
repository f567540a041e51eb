//! # Scheduler
//!
//! Admits `Pending` records into a bounded set of running workers.
//!
//! One admission pass runs at a time (the `admission` lock). A pass walks
//! pending records in creation order and launches each one whose network
//! requirement is met and whose estimated size fits the quota, until
//! `max_concurrent_downloads` transfers are running. Records that do not
//! qualify stay `Pending` and are looked at again on the next wake-up: a
//! worker finishing, a new record, a network change or the periodic
//! re-check.
//!
//! Operations that must not race a launch (pause-all, suspend, delete,
//! clear) take the same lock, so once they hold it the set of running
//! transfers cannot grow.

use crate::error::{DownloadError, Result};
use crate::models::{DownloadId, DownloadRecord, DownloadStatus, PauseOrigin};
use crate::settings::DownloadSettings;
use crate::worker::{StopReason, TransferContext, TransferControl, TransferWorker};
use bridge_traits::network::{NetworkInfo, NetworkMonitor, NetworkStatus};
use core_runtime::events::DownloadEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Whether a record may transfer on the current connection.
///
/// No monitor means every connection is acceptable.
pub(crate) fn network_allows(info: Option<&NetworkInfo>, requires_wifi: bool) -> bool {
    match info {
        None => true,
        Some(info) if requires_wifi => info.is_wifi_class(),
        Some(info) => info.status != NetworkStatus::Disconnected,
    }
}

pub(crate) struct Scheduler {
    ctx: Arc<TransferContext>,
    settings: DownloadSettings,
    network: Option<Arc<dyn NetworkMonitor>>,
    active: Mutex<HashMap<DownloadId, Arc<TransferControl>>>,
    admission: tokio::sync::Mutex<()>,
    wake: Notify,
    global_paused: AtomicBool,
    suspended: AtomicBool,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<TransferContext>,
        settings: DownloadSettings,
        network: Option<Arc<dyn NetworkMonitor>>,
    ) -> Self {
        Self {
            ctx,
            settings,
            network,
            active: Mutex::new(HashMap::new()),
            admission: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            global_paused: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the admission loop and, with a monitor, the network listener.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(self.clone().run())];
        if let Some(monitor) = self.network.clone() {
            handles.push(tokio::spawn(self.clone().listen_network(monitor)));
        }
        handles
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_active(&self, id: &DownloadId) -> bool {
        self.active.lock().contains_key(id)
    }

    pub fn is_globally_paused(&self) -> bool {
        self.global_paused.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn is_gated(&self) -> bool {
        self.is_globally_paused() || self.is_suspended() || self.shutdown.is_cancelled()
    }

    /// Cancelled once [`Scheduler::shutdown`] has run.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Block admission passes for as long as the guard lives.
    pub async fn lock_admission(&self) -> MutexGuard<'_, ()> {
        self.admission.lock().await
    }

    async fn run(self: Arc<Self>) {
        let recheck = self.ctx.config.network_recheck_interval;
        debug!(max = self.ctx.config.max_concurrent_downloads, "Download scheduler started");

        loop {
            self.admit_ready().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(recheck) => {}
            }
        }
        debug!("Download scheduler stopped");
    }

    async fn current_network(&self) -> Option<NetworkInfo> {
        let monitor = self.network.as_ref()?;
        match monitor.get_network_info().await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(error = %e, "Network state unavailable, treating as indeterminate");
                Some(NetworkInfo {
                    status: NetworkStatus::Indeterminate,
                    network_type: None,
                    is_metered: false,
                })
            }
        }
    }

    async fn admit_ready(self: &Arc<Self>) {
        let _admission = self.admission.lock().await;
        if self.is_gated() {
            return;
        }

        let network = self.current_network().await;
        let default_wifi_only = self.settings.wifi_only().await;

        self.requeue_network_paused(network.as_ref(), default_wifi_only)
            .await;

        let max = self.ctx.config.max_concurrent_downloads;
        let fallback = self.ctx.config.default_estimated_size;
        let snapshot = self.ctx.store.snapshot();

        for record in snapshot.pending() {
            if self.active_count() >= max || self.is_gated() {
                break;
            }
            if self.is_active(&record.id) {
                continue;
            }

            let requires_wifi = record.wifi_only.unwrap_or(default_wifi_only);
            if !network_allows(network.as_ref(), requires_wifi) {
                debug!(download_id = %record.id, requires_wifi, "Waiting for network");
                continue;
            }

            let estimate = record.estimated_size(fallback);
            if let Err(e) = self.ctx.quota.admit(Some(&record.id), estimate).await {
                debug!(download_id = %record.id, error = %e, "Waiting for storage");
                continue;
            }

            self.launch(record.clone(), estimate).await;
        }
    }

    async fn launch(self: &Arc<Self>, record: DownloadRecord, estimate: u64) {
        let id = record.id;
        let control = Arc::new(TransferControl::new());
        // Registered before the status flips so a pause in between is seen.
        self.active.lock().insert(id, control.clone());

        let partial = self.ctx.store.layout().partial_path(&record);
        let started = self
            .ctx
            .store
            .transition(&id, DownloadStatus::Downloading, |r| {
                r.file_path = Some(partial);
                r.paused_by = None;
            })
            .await;

        let record = match started {
            Ok(record) => record,
            Err(e) => {
                self.active.lock().remove(&id);
                control.mark_finished();
                match e {
                    DownloadError::InvalidTransition { .. } | DownloadError::NotFound(_) => {
                        debug!(download_id = %id, error = %e, "Record left the queue before launch")
                    }
                    e => warn!(download_id = %id, error = %e, "Could not start download"),
                }
                return;
            }
        };

        self.ctx.quota.reserve(id, estimate);
        info!(download_id = %id, item_id = %record.item_id, "Admitted download");

        let scheduler = self.clone();
        tokio::spawn(async move {
            let outcome = TransferWorker::new(scheduler.ctx.clone(), record, control.clone())
                .run()
                .await;
            scheduler.active.lock().remove(&id);
            control.mark_finished();
            scheduler.wake();
            debug!(download_id = %id, ?outcome, "Worker exited");
        });
    }

    /// Signal one running transfer and wait for it to settle.
    ///
    /// Returns `false` when nothing was running for `id`.
    async fn stop_and_wait(&self, id: &DownloadId, reason: StopReason) -> bool {
        let control = self.active.lock().get(id).cloned();
        match control {
            Some(control) => {
                control.request_stop(reason);
                control.finished().await;
                true
            }
            None => false,
        }
    }

    async fn stop_all(&self, reason: StopReason) -> Vec<DownloadId> {
        let controls: Vec<(DownloadId, Arc<TransferControl>)> = self
            .active
            .lock()
            .iter()
            .map(|(id, control)| (*id, control.clone()))
            .collect();

        for (_, control) in &controls {
            control.request_stop(reason);
        }
        for (_, control) in &controls {
            control.finished().await;
        }
        controls.into_iter().map(|(id, _)| id).collect()
    }

    /// Pause one download. Already paused is fine; anything not running is
    /// rejected.
    pub async fn pause(&self, id: &DownloadId, origin: PauseOrigin) -> Result<()> {
        if self.stop_and_wait(id, StopReason::Pause(origin)).await {
            return Ok(());
        }

        let record = self
            .ctx
            .store
            .get(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        match record.status {
            DownloadStatus::Paused => Ok(()),
            from => Err(DownloadError::InvalidTransition {
                id: *id,
                from,
                to: DownloadStatus::Paused,
            }),
        }
    }

    /// Stop a running transfer without recording a pause. The caller owns
    /// the record afterwards.
    pub async fn cancel(&self, id: &DownloadId) -> bool {
        self.stop_and_wait(id, StopReason::Cancel).await
    }

    pub async fn cancel_all(&self) -> Vec<DownloadId> {
        self.stop_all(StopReason::Cancel).await
    }

    #[instrument(skip(self))]
    pub async fn pause_all(&self) -> Vec<DownloadId> {
        self.global_paused.store(true, Ordering::SeqCst);
        let _admission = self.admission.lock().await;
        let paused = self.stop_all(StopReason::Pause(PauseOrigin::Global)).await;
        info!(count = paused.len(), "Paused all downloads");
        paused
    }

    #[instrument(skip(self))]
    pub async fn resume_all(&self) -> Vec<DownloadId> {
        self.global_paused.store(false, Ordering::SeqCst);
        let resumed = self.requeue_paused_by(PauseOrigin::Global).await;
        info!(count = resumed.len(), "Resumed all downloads");
        self.wake();
        resumed
    }

    #[instrument(skip(self))]
    pub async fn suspend(&self) -> Vec<DownloadId> {
        self.suspended.store(true, Ordering::SeqCst);
        let _admission = self.admission.lock().await;
        let paused = self.stop_all(StopReason::Pause(PauseOrigin::Lifecycle)).await;
        info!(count = paused.len(), "Suspended downloads");
        paused
    }

    #[instrument(skip(self))]
    pub async fn restore(&self) -> Vec<DownloadId> {
        self.suspended.store(false, Ordering::SeqCst);
        let resumed = self.requeue_paused_by(PauseOrigin::Lifecycle).await;
        info!(count = resumed.len(), "Restored downloads");
        self.wake();
        resumed
    }

    /// Pause what is running and stop both background tasks.
    pub async fn shutdown(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        {
            let _admission = self.admission.lock().await;
            self.stop_all(StopReason::Pause(PauseOrigin::Lifecycle)).await;
        }
        self.shutdown.cancel();
    }

    /// Move a Paused record back into the admission queue.
    pub async fn requeue(&self, id: &DownloadId) -> Result<DownloadRecord> {
        let record = self
            .ctx
            .store
            .transition(id, DownloadStatus::Pending, |r| r.paused_by = None)
            .await?;
        self.ctx.emit(DownloadEvent::Resumed {
            download_id: id.to_string(),
        });
        Ok(record)
    }

    pub async fn requeue_paused_by(&self, origin: PauseOrigin) -> Vec<DownloadId> {
        let snapshot = self.ctx.store.snapshot();
        let mut resumed = Vec::new();
        for record in snapshot.with_status(DownloadStatus::Paused) {
            if record.paused_by != Some(origin) {
                continue;
            }
            match self.requeue(&record.id).await {
                Ok(_) => resumed.push(record.id),
                Err(e) => warn!(download_id = %record.id, error = %e, "Failed to requeue download"),
            }
        }
        resumed
    }

    async fn requeue_network_paused(&self, network: Option<&NetworkInfo>, default_wifi_only: bool) {
        let snapshot = self.ctx.store.snapshot();
        for record in snapshot.with_status(DownloadStatus::Paused) {
            if record.paused_by != Some(PauseOrigin::Network) {
                continue;
            }
            if network_allows(network, record.wifi_only.unwrap_or(default_wifi_only)) {
                if let Err(e) = self.requeue(&record.id).await {
                    warn!(download_id = %record.id, error = %e, "Failed to requeue download");
                }
            }
        }
    }

    /// Pause transfers the new connection no longer allows.
    async fn apply_network(&self, info: NetworkInfo) {
        let default_wifi_only = self.settings.wifi_only().await;
        {
            let _admission = self.admission.lock().await;
            let snapshot = self.ctx.store.snapshot();
            for record in snapshot.active() {
                let requires_wifi = record.wifi_only.unwrap_or(default_wifi_only);
                if !network_allows(Some(&info), requires_wifi) {
                    info!(download_id = %record.id, ?info.status, "Pausing download for network change");
                    self.stop_and_wait(&record.id, StopReason::Pause(PauseOrigin::Network))
                        .await;
                }
            }
        }
        self.wake();
    }

    async fn listen_network(self: Arc<Self>, monitor: Arc<dyn NetworkMonitor>) {
        let mut changes = match monitor.subscribe_changes().await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "Network change notifications unavailable");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                change = changes.next() => match change {
                    Some(info) => {
                        debug!(?info, "Network changed");
                        self.apply_network(info).await;
                    }
                    None => break,
                },
            }
        }
    }
}
