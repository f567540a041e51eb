//! Auto-removal of watched downloads.
//!
//! Listens for `PlaybackEvent::Finished` on the event bus. With
//! `downloads.auto_remove_watched` on, the finished item's Completed
//! downloads are deleted; otherwise they are only flagged as played so a
//! later [`DownloadManager::remove_watched_downloads`] can sweep them.

use crate::error::Result;
use crate::manager::DownloadManager;
use core_runtime::events::{CoreEvent, EventStream, PlaybackEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct AutoRemovePolicy {
    manager: Arc<DownloadManager>,
}

impl AutoRemovePolicy {
    pub fn new(manager: Arc<DownloadManager>) -> Self {
        Self { manager }
    }

    /// Run until the manager shuts down. Events published after this
    /// returns are seen.
    pub fn spawn(self) -> JoinHandle<()> {
        let events = self
            .manager
            .events()
            .stream()
            .filter(|e| matches!(e, CoreEvent::Playback(PlaybackEvent::Finished { .. })));
        tokio::spawn(self.run(events))
    }

    async fn run(self, mut events: EventStream) {
        let shutdown = self.manager.shutdown_signal();
        debug!("Auto-remove policy started");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(CoreEvent::Playback(PlaybackEvent::Finished { item_id, server_id })) => {
                    if let Err(e) = self.on_finished(&item_id, server_id.as_deref()).await {
                        warn!(item_id = %item_id, error = %e, "Auto-remove failed");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Auto-remove policy fell behind the event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Auto-remove policy stopped");
    }

    /// Handle one finished playback. Returns how many downloads were
    /// removed or flagged.
    pub async fn on_finished(&self, item_id: &str, server_id: Option<&str>) -> Result<usize> {
        if !self.manager.settings().auto_remove_watched().await {
            return self.manager.mark_played(item_id, server_id).await;
        }

        let targets = self.manager.completed_for(item_id, server_id);
        for id in &targets {
            self.manager.delete_download(id).await?;
        }
        if !targets.is_empty() {
            info!(item_id, count = targets.len(), "Removed watched download");
        }
        Ok(targets.len())
    }
}
