//! Storage quota accounting.
//!
//! `used` is the on-disk size of completed downloads, owned by the store.
//! In-flight transfers hold a reservation here for their expected size, so
//! two transfers cannot both be admitted into the same free space.

use crate::error::{DownloadError, Result};
use crate::models::{DownloadId, StorageUsage};
use crate::settings::DownloadSettings;
use crate::store::{DownloadStore, ReconcileReport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct StorageQuotaTracker {
    store: Arc<DownloadStore>,
    settings: DownloadSettings,
    reservations: Mutex<HashMap<DownloadId, u64>>,
}

impl StorageQuotaTracker {
    pub fn new(store: Arc<DownloadStore>, settings: DownloadSettings) -> Self {
        Self {
            store,
            settings,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn used_storage(&self) -> u64 {
        self.store.used_bytes()
    }

    /// Read from settings on every call.
    pub async fn max_storage(&self) -> u64 {
        self.settings.max_storage_bytes().await
    }

    pub fn reserved(&self) -> u64 {
        self.reservations.lock().values().sum()
    }

    pub async fn usage(&self) -> StorageUsage {
        StorageUsage::new(self.used_storage(), self.max_storage().await)
    }

    /// Check that `estimated_bytes` more fit under the ceiling.
    ///
    /// Counts completed bytes plus every reservation except `id`'s own, so a
    /// transfer re-checking with its real size does not count itself twice.
    pub async fn admit(&self, id: Option<&DownloadId>, estimated_bytes: u64) -> Result<()> {
        let max = self.max_storage().await;
        let used = self.used_storage();
        let reserved: u64 = self
            .reservations
            .lock()
            .iter()
            .filter(|(holder, _)| Some(*holder) != id)
            .map(|(_, bytes)| *bytes)
            .sum();

        let committed = used.saturating_add(reserved);
        if committed.saturating_add(estimated_bytes) > max {
            debug!(used, reserved, estimated_bytes, max, "Quota admission refused");
            return Err(DownloadError::StorageFull {
                required: estimated_bytes,
                available: max.saturating_sub(committed),
            });
        }
        Ok(())
    }

    /// Hold `bytes` for `id` until it completes or leaves.
    pub fn reserve(&self, id: DownloadId, bytes: u64) {
        self.reservations.lock().insert(id, bytes);
    }

    pub fn release(&self, id: &DownloadId) {
        self.reservations.lock().remove(id);
    }

    pub fn clear_reservations(&self) {
        self.reservations.lock().clear();
    }

    /// Rescan the download directory and correct records and `used`.
    pub async fn recalculate(&self) -> Result<ReconcileReport> {
        let report = self.store.reconcile().await?;
        self.store.set_max_bytes(self.max_storage().await).await;
        info!(
            used_bytes = report.used_bytes,
            missing_files = report.missing_files,
            orphans_deleted = report.orphans_deleted,
            "Recalculated download storage"
        );
        Ok(report)
    }
}
