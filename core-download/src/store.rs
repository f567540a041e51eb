//! # Download Store
//!
//! Single-writer collection of [`DownloadRecord`]s.
//!
//! Every mutation takes the store lock, builds the next state on a copy,
//! persists the affected server manifests and only then swaps the copy in
//! and publishes a fresh [`DownloadSnapshot`] on a `watch` channel. A
//! failed manifest write leaves both memory and observers on the previous
//! state. Readers only ever see committed snapshots.
//!
//! Manifests are written to `manifest.json.tmp` and renamed over
//! `manifest.json`, so a crash leaves either the old or the new manifest.

use crate::error::{DownloadError, Result};
use crate::models::{DownloadId, DownloadRecord, DownloadSnapshot, DownloadStatus};
use crate::paths::DownloadLayout;
use bridge_traits::error::BridgeError;
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::time::Clock;
use bytes::Bytes;
use core_runtime::logging::strip_path;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

pub const MANIFEST_VERSION: u32 = 1;

/// Message stored on a Completed record whose file disappeared.
pub const FILE_MISSING: &str = "file missing";

/// Persisted form of one server directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub records: Vec<DownloadRecord>,
}

/// What [`DownloadStore::reconcile`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub used_bytes: u64,
    /// Completed records whose file was gone
    pub missing_files: usize,
    /// Pending or Paused records whose partial file was gone
    pub reset_partials: usize,
    pub orphans_deleted: usize,
}

#[derive(Clone)]
struct StoreState {
    records: Vec<DownloadRecord>,
    used_bytes: u64,
    max_bytes: u64,
}

impl StoreState {
    fn position(&self, id: &DownloadId) -> Option<usize> {
        self.records.iter().position(|r| &r.id == id)
    }

    fn to_snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            records: self.records.clone(),
            used_bytes: self.used_bytes,
            max_bytes: self.max_bytes,
        }
    }
}

pub struct DownloadStore {
    fs: Arc<dyn FileSystemAccess>,
    layout: DownloadLayout,
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState>,
    snapshot_tx: watch::Sender<Arc<DownloadSnapshot>>,
}

impl DownloadStore {
    /// Load every server manifest under the layout root.
    ///
    /// Records left `Downloading` by a crash come back as `Pending` with
    /// their offset intact. Corrupt manifests are skipped with a warning.
    #[instrument(skip(fs, layout, clock), fields(root = ?layout.root()))]
    pub async fn open(
        fs: Arc<dyn FileSystemAccess>,
        layout: DownloadLayout,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        fs.create_dir_all(layout.root()).await?;

        let mut records: Vec<DownloadRecord> = Vec::new();
        for dir in fs.list_directory(layout.root()).await? {
            if !fs.metadata(&dir).await?.is_directory {
                continue;
            }
            let manifest_path = layout.manifest_path_in(&dir);
            if !fs.exists(&manifest_path).await? {
                continue;
            }

            let raw = fs.read_file(&manifest_path).await?;
            match serde_json::from_slice::<Manifest>(&raw) {
                Ok(manifest) if manifest.version == MANIFEST_VERSION => {
                    debug!(path = ?manifest_path, count = manifest.records.len(), "Loaded manifest");
                    records.extend(manifest.records);
                }
                Ok(manifest) => warn!(
                    path = ?manifest_path,
                    version = manifest.version,
                    "Skipping manifest with unsupported version"
                ),
                Err(e) => warn!(path = ?manifest_path, error = %e, "Skipping corrupt manifest"),
            }
        }

        let mut seen = HashSet::new();
        records.retain(|r| {
            let fresh = seen.insert((r.server_id.clone(), r.item_id.clone()));
            if !fresh {
                warn!(download_id = %r.id, item_id = %r.item_id, "Dropping duplicate record");
            }
            fresh
        });

        for record in records.iter_mut() {
            if record.status == DownloadStatus::Downloading {
                info!(
                    download_id = %record.id,
                    offset = record.downloaded_bytes,
                    "Requeueing transfer interrupted by shutdown"
                );
                record.status = DownloadStatus::Pending;
                record.paused_by = None;
            }
        }
        records.sort_by_key(|r| r.created_at);

        let used_bytes = records
            .iter()
            .filter(|r| r.status == DownloadStatus::Completed)
            .map(|r| r.downloaded_bytes)
            .sum();

        let state = StoreState {
            records,
            used_bytes,
            max_bytes: 0,
        };
        let (snapshot_tx, _) = watch::channel(Arc::new(state.to_snapshot()));
        info!(records = state.records.len(), "Download store opened");

        Ok(Self {
            fs,
            layout,
            clock,
            state: Mutex::new(state),
            snapshot_tx,
        })
    }

    pub fn layout(&self) -> &DownloadLayout {
        &self.layout
    }

    pub fn snapshot(&self) -> Arc<DownloadSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receives a new snapshot after every committed mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DownloadSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn get(&self, id: &DownloadId) -> Option<DownloadRecord> {
        self.snapshot().get(id).cloned()
    }

    pub fn find_by_source(&self, server_id: &str, item_id: &str) -> Option<DownloadRecord> {
        self.snapshot()
            .records
            .iter()
            .find(|r| r.is_same_source(server_id, item_id))
            .cloned()
    }

    pub fn used_bytes(&self) -> u64 {
        self.snapshot().used_bytes
    }

    /// Add a record. One record per `(server_id, item_id)`.
    pub async fn insert(&self, record: DownloadRecord) -> Result<DownloadRecord> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .records
            .iter()
            .find(|r| r.is_same_source(&record.server_id, &record.item_id))
        {
            return Err(DownloadError::AlreadyDownloaded(existing.id.to_string()));
        }

        let server_id = record.server_id.clone();
        let mut next = state.clone();
        next.records.push(record.clone());
        self.commit(&mut state, next, &[server_id]).await?;
        Ok(record)
    }

    /// Apply `mutate` to a copy of the record and commit it when it succeeds.
    pub async fn update<F>(&self, id: &DownloadId, mutate: F) -> Result<DownloadRecord>
    where
        F: FnOnce(&mut DownloadRecord) -> Result<()>,
    {
        let mut state = self.state.lock().await;
        let index = state
            .position(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        let mut record = state.records[index].clone();
        mutate(&mut record)?;
        record.updated_at = self.clock.now();

        let server_id = record.server_id.clone();
        let mut next = state.clone();
        next.records[index] = record.clone();
        self.commit(&mut state, next, &[server_id]).await?;
        Ok(record)
    }

    /// Move a record to `to`, rejecting edges outside the state machine.
    pub async fn transition<F>(
        &self,
        id: &DownloadId,
        to: DownloadStatus,
        mutate: F,
    ) -> Result<DownloadRecord>
    where
        F: FnOnce(&mut DownloadRecord),
    {
        self.update(id, |record| {
            if !record.status.can_transition_to(to) {
                return Err(DownloadError::InvalidTransition {
                    id: record.id,
                    from: record.status,
                    to,
                });
            }
            record.status = to;
            mutate(record);
            Ok(())
        })
        .await
    }

    /// Record transfer progress for a `Downloading` record.
    ///
    /// `downloaded_bytes` never moves backwards here: a restarted stream
    /// reports lower offsets until it overtakes the previous high-water
    /// mark. Returns `None` when the record is no longer downloading.
    pub async fn record_progress(
        &self,
        id: &DownloadId,
        downloaded: u64,
        total: Option<u64>,
    ) -> Result<Option<DownloadRecord>> {
        let result = self
            .update(id, |record| {
                if record.status != DownloadStatus::Downloading {
                    return Err(DownloadError::InvalidTransition {
                        id: record.id,
                        from: record.status,
                        to: DownloadStatus::Downloading,
                    });
                }
                if total.is_some() {
                    record.total_bytes = total;
                }
                record.downloaded_bytes = record.downloaded_bytes.max(downloaded);
                if let Some(total) = record.total_bytes {
                    record.downloaded_bytes = record.downloaded_bytes.min(total);
                }
                Ok(())
            })
            .await;

        match result {
            Ok(record) => Ok(Some(record)),
            Err(DownloadError::InvalidTransition { .. }) | Err(DownloadError::NotFound(_)) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Flip `Downloading -> Completed` and account the bytes as used.
    pub async fn complete(
        &self,
        id: &DownloadId,
        final_path: PathBuf,
        bytes: u64,
    ) -> Result<DownloadRecord> {
        let mut state = self.state.lock().await;
        let index = state
            .position(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        let mut record = state.records[index].clone();
        if !record.status.can_transition_to(DownloadStatus::Completed) {
            return Err(DownloadError::InvalidTransition {
                id: *id,
                from: record.status,
                to: DownloadStatus::Completed,
            });
        }
        record.status = DownloadStatus::Completed;
        record.downloaded_bytes = bytes;
        record.total_bytes = Some(bytes);
        record.file_path = Some(final_path);
        record.last_error = None;
        record.paused_by = None;
        record.updated_at = self.clock.now();

        let server_id = record.server_id.clone();
        let mut next = state.clone();
        next.records[index] = record.clone();
        next.used_bytes = next.used_bytes.saturating_add(bytes);
        self.commit(&mut state, next, &[server_id]).await?;
        Ok(record)
    }

    /// Drop a record; completed bytes leave the used total.
    pub async fn remove(&self, id: &DownloadId) -> Result<DownloadRecord> {
        let mut state = self.state.lock().await;
        let index = state
            .position(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        let mut next = state.clone();
        let record = next.records.remove(index);
        if record.status == DownloadStatus::Completed {
            next.used_bytes = next.used_bytes.saturating_sub(record.downloaded_bytes);
        }
        self.commit(&mut state, next, &[record.server_id.clone()]).await?;
        Ok(record)
    }

    /// Drop every record and reset the used total to zero.
    pub async fn clear(&self) -> Result<Vec<DownloadRecord>> {
        let mut state = self.state.lock().await;
        let removed = state.records.clone();
        let next = StoreState {
            records: Vec::new(),
            used_bytes: 0,
            max_bytes: state.max_bytes,
        };

        let servers: Vec<String> = removed.iter().map(|r| r.server_id.clone()).collect();
        self.commit(&mut state, next, &servers).await?;
        Ok(removed)
    }

    /// Update the ceiling shown to observers.
    pub async fn set_max_bytes(&self, max_bytes: u64) {
        let mut state = self.state.lock().await;
        if state.max_bytes != max_bytes {
            state.max_bytes = max_bytes;
            self.publish(&state);
        }
    }

    /// Bring records and the used total in line with what is on disk.
    ///
    /// - Completed records whose file is gone become Failed (`"file missing"`)
    /// - Pending or Paused records whose partial file is gone restart at 0
    /// - Files in server directories that no record accounts for are deleted
    /// - `used_bytes` becomes the on-disk size of every Completed file
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let mut report = ReconcileReport::default();
        let mut expected: HashSet<PathBuf> = HashSet::new();
        let mut touched: Vec<String> = Vec::new();
        let now = self.clock.now();

        for record in next.records.iter_mut() {
            let media = self.layout.media_path(record);
            let partial = self.layout.partial_path(record);

            match record.status {
                DownloadStatus::Completed => match self.fs.file_size(&media).await? {
                    Some(size) => {
                        report.used_bytes += size;
                        if record.downloaded_bytes != size || record.total_bytes != Some(size) {
                            record.downloaded_bytes = size;
                            record.total_bytes = Some(size);
                            record.updated_at = now;
                            touched.push(record.server_id.clone());
                        }
                        expected.insert(media);
                    }
                    None => {
                        warn!(
                            download_id = %record.id,
                            file = %strip_path(&media.to_string_lossy()),
                            "Completed download is missing its file"
                        );
                        record.status = DownloadStatus::Failed;
                        record.last_error = Some(FILE_MISSING.to_string());
                        record.file_path = None;
                        record.downloaded_bytes = 0;
                        record.updated_at = now;
                        report.missing_files += 1;
                        touched.push(record.server_id.clone());
                    }
                },
                DownloadStatus::Downloading => {
                    // The worker may publish the final file at any moment.
                    expected.insert(partial);
                    expected.insert(media);
                }
                DownloadStatus::Pending | DownloadStatus::Paused => {
                    match self.fs.file_size(&partial).await? {
                        Some(size) => {
                            if record.downloaded_bytes != size {
                                record.downloaded_bytes = size;
                                record.updated_at = now;
                                touched.push(record.server_id.clone());
                            }
                            expected.insert(partial);
                        }
                        None if record.downloaded_bytes > 0 => {
                            debug!(download_id = %record.id, "Partial file gone, restarting from zero");
                            record.downloaded_bytes = 0;
                            record.file_path = None;
                            record.updated_at = now;
                            report.reset_partials += 1;
                            touched.push(record.server_id.clone());
                        }
                        None => {}
                    }
                }
                DownloadStatus::Failed => {}
            }
        }

        for dir in self.fs.list_directory(self.layout.root()).await? {
            if !self.fs.metadata(&dir).await?.is_directory {
                continue;
            }
            for entry in self.fs.list_directory(&dir).await? {
                if self.layout.is_manifest_file(&entry) || expected.contains(&entry) {
                    continue;
                }
                if self.fs.metadata(&entry).await?.is_directory {
                    continue;
                }
                warn!(file = %strip_path(&entry.to_string_lossy()), "Deleting orphaned download file");
                delete_if_exists(self.fs.as_ref(), &entry).await?;
                report.orphans_deleted += 1;
            }
        }

        next.used_bytes = report.used_bytes;
        self.commit(&mut state, next, &touched).await?;
        Ok(report)
    }

    /// Persist `next` for the given servers, then make it current and publish.
    ///
    /// On a failed write the manifests already rewritten are put back and
    /// `state` is left untouched.
    async fn commit(
        &self,
        state: &mut StoreState,
        next: StoreState,
        servers: &[String],
    ) -> Result<()> {
        let mut dirs: Vec<PathBuf> = servers.iter().map(|s| self.layout.server_dir(s)).collect();
        dirs.sort();
        dirs.dedup();

        for (done, dir) in dirs.iter().enumerate() {
            if let Err(e) = self.persist_dir(&next, dir).await {
                warn!(dir = ?dir, error = %e, "Failed to persist manifest");
                for written in &dirs[..done] {
                    if let Err(e) = self.persist_dir(state, written).await {
                        warn!(dir = ?written, error = %e, "Failed to restore manifest");
                    }
                }
                return Err(e);
            }
        }

        *state = next;
        self.publish(state);
        Ok(())
    }

    async fn persist_dir(&self, state: &StoreState, dir: &Path) -> Result<()> {
        let records: Vec<DownloadRecord> = state
            .records
            .iter()
            .filter(|r| self.layout.server_dir(&r.server_id) == dir)
            .cloned()
            .collect();
        let manifest_path = self.layout.manifest_path_in(dir);

        if records.is_empty() {
            return delete_if_exists(self.fs.as_ref(), &manifest_path).await;
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            records,
        };
        let data = serde_json::to_vec_pretty(&manifest)?;
        let tmp_path = self.layout.manifest_tmp_path_in(dir);

        self.fs.create_dir_all(dir).await?;
        self.fs.write_file(&tmp_path, Bytes::from(data)).await?;
        self.fs.rename(&tmp_path, &manifest_path).await?;
        Ok(())
    }

    fn publish(&self, state: &StoreState) {
        self.snapshot_tx.send_replace(Arc::new(state.to_snapshot()));
    }
}

/// Delete a file, treating "already gone" as success.
pub(crate) async fn delete_if_exists(fs: &dyn FileSystemAccess, path: &Path) -> Result<()> {
    match fs.delete_file(path).await {
        Ok(()) | Err(BridgeError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
