//! # Transfer Worker
//!
//! Moves the bytes of one record from the media server to disk.
//!
//! ## Flow
//!
//! 1. Resolve the item to a [`PlaybackInfo`] through the media source
//! 2. Re-check the quota once the real size is known
//! 3. Append to `<item>.<ext>.part`, resuming with `Range: bytes=N-` when a
//!    partial file exists
//! 4. Rename the partial file onto its final name
//!
//! Pause and cancel are cooperative: the worker observes its
//! [`TransferControl`] between chunks and while waiting on a read, never in
//! the middle of a write, so the partial file always ends on a chunk the
//! server actually sent. The resume offset is the partial file's length.
//!
//! When a resume cannot be served by range (the source says it does not
//! support ranges, or the server answers `200` to a range request) the
//! partial file is discarded and the transfer restarts from byte 0.

use crate::config::DownloadConfig;
use crate::error::{DownloadError, Result};
use crate::models::{DownloadId, DownloadRecord, DownloadStatus, PauseOrigin};
use crate::quota::StorageQuotaTracker;
use crate::retry::RetryDecision;
use crate::store::{delete_if_exists, DownloadStore};
use crate::throttle::ProgressThrottle;
use bridge_traits::error::BridgeError;
use bridge_traits::http::{HttpClient, HttpRequest, HttpStream};
use bridge_traits::media::{MediaSource, PlaybackInfo, PlaybackRequest};
use bridge_traits::storage::FileSystemAccess;
use core_runtime::events::{CoreEvent, DownloadEvent, EventBus};
use core_runtime::logging::strip_path;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Collaborators shared by every worker.
pub(crate) struct TransferContext {
    pub store: Arc<DownloadStore>,
    pub quota: Arc<StorageQuotaTracker>,
    pub fs: Arc<dyn FileSystemAccess>,
    pub http: Arc<dyn HttpClient>,
    pub media: Arc<dyn MediaSource>,
    pub events: EventBus,
    pub config: DownloadConfig,
}

impl TransferContext {
    pub fn emit(&self, event: DownloadEvent) {
        // Nobody listening is not an error.
        let _ = self.events.emit(CoreEvent::Download(event));
    }
}

// ============================================================================
// Control
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Pause(PauseOrigin),
    Cancel,
}

/// Cooperative stop signal for one running transfer, plus the
/// acknowledgement the worker gives once it has settled.
#[derive(Debug, Default)]
pub struct TransferControl {
    stop: CancellationToken,
    reason: parking_lot::Mutex<Option<StopReason>>,
    finished: CancellationToken,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop at its next suspension point. A cancel
    /// overrides an earlier pause request.
    pub fn request_stop(&self, reason: StopReason) {
        {
            let mut current = self.reason.lock();
            if current.is_none() || reason == StopReason::Cancel {
                *current = Some(reason);
            }
        }
        self.stop.cancel();
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }

    pub async fn stop_requested(&self) {
        self.stop.cancelled().await
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    /// Resolves once the worker has closed its file and recorded its state.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }
}

#[derive(Debug)]
pub enum TransferOutcome {
    Completed { bytes: u64 },
    Stopped(StopReason),
    Failed(DownloadError),
}

enum AttemptError {
    Stopped,
    Failed(DownloadError),
}

impl From<DownloadError> for AttemptError {
    fn from(err: DownloadError) -> Self {
        AttemptError::Failed(err)
    }
}

impl From<BridgeError> for AttemptError {
    fn from(err: BridgeError) -> Self {
        AttemptError::Failed(err.into())
    }
}

type AttemptResult<T> = std::result::Result<T, AttemptError>;

// ============================================================================
// Worker
// ============================================================================

pub(crate) struct TransferWorker {
    ctx: Arc<TransferContext>,
    record: DownloadRecord,
    control: Arc<TransferControl>,
    partial: PathBuf,
    target: PathBuf,
}

impl TransferWorker {
    pub fn new(
        ctx: Arc<TransferContext>,
        record: DownloadRecord,
        control: Arc<TransferControl>,
    ) -> Self {
        let layout = ctx.store.layout();
        let partial = layout.partial_path(&record);
        let target = layout.media_path(&record);
        Self {
            ctx,
            record,
            control,
            partial,
            target,
        }
    }

    fn id(&self) -> DownloadId {
        self.record.id
    }

    /// Run the transfer to an outcome and record it in the store.
    #[instrument(skip(self), fields(download_id = %self.record.id, item_id = %self.record.item_id))]
    pub async fn run(self) -> TransferOutcome {
        let resume_offset = self
            .ctx
            .fs
            .file_size(&self.partial)
            .await
            .ok()
            .flatten()
            .unwrap_or(0);
        info!(resume_offset, "Transfer started");
        self.ctx.emit(DownloadEvent::Started {
            download_id: self.id().to_string(),
            item_id: self.record.item_id.clone(),
            resume_offset,
        });

        let outcome = self.run_with_retry().await;
        self.finish(outcome).await
    }

    async fn run_with_retry(&self) -> TransferOutcome {
        let policy = self.ctx.config.retry_policy;
        let mut attempt = 1u32;

        loop {
            if let Some(reason) = self.control.stop_reason() {
                return TransferOutcome::Stopped(reason);
            }

            let err = match self.attempt().await {
                Ok(bytes) => return TransferOutcome::Completed { bytes },
                Err(AttemptError::Stopped) => {
                    return TransferOutcome::Stopped(
                        self.control.stop_reason().unwrap_or(StopReason::Cancel),
                    )
                }
                Err(AttemptError::Failed(err)) => err,
            };

            match policy.decide(attempt, &err) {
                RetryDecision::GiveUp => return TransferOutcome::Failed(err),
                RetryDecision::RetryAfter(delay) => {
                    warn!(attempt, ?delay, error = %err, "Transfer attempt failed, retrying");
                    let message = err.to_string();
                    if let Err(e) = self
                        .ctx
                        .store
                        .update(&self.id(), |r| {
                            r.retry_count += 1;
                            r.last_error = Some(message);
                            Ok(())
                        })
                        .await
                    {
                        warn!(error = %e, "Failed to record retry");
                    }

                    tokio::select! {
                        _ = self.control.stop_requested() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Race `fut` against a stop request.
    async fn or_stop<T>(&self, fut: impl Future<Output = T>) -> AttemptResult<T> {
        tokio::select! {
            biased;
            _ = self.control.stop_requested() => Err(AttemptError::Stopped),
            value = fut => Ok(value),
        }
    }

    /// Race a network call against a stop request and `read_timeout`.
    async fn network_call<T>(
        &self,
        what: &str,
        fut: impl Future<Output = std::result::Result<T, BridgeError>>,
    ) -> AttemptResult<T> {
        let limit = self.ctx.config.read_timeout;
        match self.or_stop(tokio::time::timeout(limit, fut)).await? {
            Ok(result) => Ok(result?),
            Err(_) => Err(DownloadError::Timeout(format!(
                "{} got no answer within {:?}",
                what, limit
            ))
            .into()),
        }
    }

    async fn attempt(&self) -> AttemptResult<u64> {
        let class = self.record.item.media_class();
        let request = PlaybackRequest {
            item_id: self.record.item_id.clone(),
            server_id: self.record.server_id.clone(),
            media_class: class,
            max_bitrate: self.record.quality.max_bitrate(class),
            audio_track_index: self.record.audio_track_index,
            subtitle_track_index: self.record.subtitle_track_index,
        };
        let info: PlaybackInfo = self
            .network_call("playback info", self.ctx.media.get_playback_info(&request))
            .await?;

        if info.download_url.trim().is_empty() {
            return Err(DownloadError::UnsupportedFormat(format!(
                "no downloadable source for item {}",
                self.record.item_id
            ))
            .into());
        }

        if let Some(total) = info.size {
            self.accept_total(total).await?;
        }

        let mut offset = self.ctx.fs.file_size(&self.partial).await?.unwrap_or(0);
        if let Some(total) = info.size {
            if offset > total {
                return Err(DownloadError::SourceChanged(format!(
                    "partial file holds {} bytes but the source has {}",
                    offset, total
                ))
                .into());
            }
            if offset == total && total > 0 {
                debug!("Partial file already complete");
                return Ok(self.publish(total).await?);
            }
        }

        if offset > 0 && !info.supports_range {
            warn!(offset, "Source cannot resume by range, restarting from zero");
            delete_if_exists(self.ctx.fs.as_ref(), &self.partial).await?;
            offset = 0;
        }

        let mut request = HttpRequest::get(&info.download_url);
        if offset > 0 {
            request = request.range_from(offset);
        }
        let stream = self
            .network_call("download request", self.ctx.http.open_stream(request))
            .await?;
        if !stream.is_success() {
            return Err(DownloadError::from_status(stream.status).into());
        }

        if offset > 0 {
            if !stream.is_partial() {
                warn!(offset, status = stream.status, "Server ignored range request, restarting from zero");
                delete_if_exists(self.ctx.fs.as_ref(), &self.partial).await?;
                offset = 0;
            } else if let Some(start) = stream.content_range_start() {
                if start != offset {
                    delete_if_exists(self.ctx.fs.as_ref(), &self.partial).await?;
                    return Err(DownloadError::Network(format!(
                        "server resumed at byte {} instead of {}",
                        start, offset
                    ))
                    .into());
                }
            }
        }

        let total = match info.size {
            Some(total) => Some(total),
            None => {
                let discovered = stream
                    .content_range_total()
                    .or_else(|| stream.content_length.map(|len| len + offset));
                if let Some(total) = discovered {
                    self.accept_total(total).await?;
                }
                discovered
            }
        };

        let written = self.stream_body(stream, offset, total).await?;
        if let Some(total) = total {
            if written < total {
                return Err(DownloadError::Network(format!(
                    "stream ended after {} of {} bytes",
                    written, total
                ))
                .into());
            }
        }

        Ok(self.publish(written).await?)
    }

    /// Take the real size into account: re-check the quota and hold it.
    async fn accept_total(&self, total: u64) -> Result<()> {
        let current = self
            .ctx
            .store
            .get(&self.id())
            .map(|r| r.downloaded_bytes)
            .unwrap_or(0);
        if current > total {
            return Err(DownloadError::SourceChanged(format!(
                "{} bytes already transferred but the source now has {}",
                current, total
            )));
        }

        self.ctx.quota.admit(Some(&self.id()), total).await?;
        self.ctx.quota.reserve(self.id(), total);
        self.ctx
            .store
            .record_progress(&self.id(), 0, Some(total))
            .await?;
        Ok(())
    }

    async fn stream_body(
        &self,
        stream: HttpStream,
        offset: u64,
        total: Option<u64>,
    ) -> AttemptResult<u64> {
        let config = &self.ctx.config;
        let mut body = stream.body;
        let mut writer = self.ctx.fs.open_append_stream(&self.partial).await?;
        let mut buf = vec![0u8; config.chunk_size];
        let mut written = offset;
        let mut throttle =
            ProgressThrottle::new(config.progress_min_step_percent, config.progress_min_interval);

        loop {
            let read = tokio::select! {
                biased;
                _ = self.control.stop_requested() => None,
                read = tokio::time::timeout(config.read_timeout, body.read(&mut buf)) => Some(read),
            };

            let n = match read {
                Some(Ok(Ok(0))) => break,
                Some(Ok(Ok(n))) => n,
                None => {
                    self.settle(&mut writer, written, total).await?;
                    debug!(offset = written, "Transfer stopped at chunk boundary");
                    return Err(AttemptError::Stopped);
                }
                Some(Err(_)) => {
                    self.settle(&mut writer, written, total).await?;
                    return Err(DownloadError::Timeout(format!(
                        "no data for {:?} at byte {}",
                        config.read_timeout, written
                    ))
                    .into());
                }
                Some(Ok(Err(e))) => {
                    self.settle(&mut writer, written, total).await?;
                    return Err(DownloadError::Network(e.to_string()).into());
                }
            };

            if total.is_some_and(|t| written + n as u64 > t) {
                self.settle(&mut writer, written, total).await?;
                return Err(DownloadError::SourceChanged(
                    "server sent more bytes than announced".to_string(),
                )
                .into());
            }

            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| DownloadError::Storage(e.to_string()))?;
            written += n as u64;

            if throttle.should_emit(written, total) {
                writer
                    .flush()
                    .await
                    .map_err(|e| DownloadError::Storage(e.to_string()))?;
                self.report_progress(written, total).await?;
            }
        }

        self.settle(&mut writer, written, total).await?;
        Ok(written)
    }

    /// Flush and close the partial file, then persist the offset.
    async fn settle(
        &self,
        writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
        written: u64,
        total: Option<u64>,
    ) -> Result<()> {
        writer
            .flush()
            .await
            .map_err(|e| DownloadError::Storage(e.to_string()))?;
        writer
            .shutdown()
            .await
            .map_err(|e| DownloadError::Storage(e.to_string()))?;
        self.report_progress(written, total).await
    }

    async fn report_progress(&self, written: u64, total: Option<u64>) -> Result<()> {
        if let Some(record) = self
            .ctx
            .store
            .record_progress(&self.id(), written, total)
            .await?
        {
            self.ctx.emit(DownloadEvent::Progress {
                download_id: record.id.to_string(),
                downloaded_bytes: record.downloaded_bytes,
                total_bytes: record.total_bytes,
                percent: record.progress(),
            });
        }
        Ok(())
    }

    /// Atomically move the partial file onto its final name.
    async fn publish(&self, bytes: u64) -> Result<u64> {
        self.ctx.fs.rename(&self.partial, &self.target).await?;
        debug!(
            file = %strip_path(&self.target.to_string_lossy()),
            bytes,
            "Placed downloaded file"
        );
        Ok(bytes)
    }

    async fn finish(&self, outcome: TransferOutcome) -> TransferOutcome {
        let id = self.id();
        match &outcome {
            TransferOutcome::Completed { bytes } => {
                self.ctx.quota.release(&id);
                match self.ctx.store.complete(&id, self.target.clone(), *bytes).await {
                    Ok(record) => {
                        info!(bytes, "Download completed");
                        self.ctx.emit(DownloadEvent::Completed {
                            download_id: id.to_string(),
                            item_id: record.item_id.clone(),
                            name: record.item.name.clone(),
                            bytes: *bytes,
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to record completed download"),
                }
            }
            TransferOutcome::Stopped(StopReason::Pause(origin)) => {
                self.ctx.quota.release(&id);
                let origin = *origin;
                match self
                    .ctx
                    .store
                    .transition(&id, DownloadStatus::Paused, |r| r.paused_by = Some(origin))
                    .await
                {
                    Ok(record) => {
                        info!(?origin, offset = record.downloaded_bytes, "Download paused");
                        self.ctx.emit(DownloadEvent::Paused {
                            download_id: id.to_string(),
                            downloaded_bytes: record.downloaded_bytes,
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to record pause"),
                }
            }
            TransferOutcome::Stopped(StopReason::Cancel) => {
                self.ctx.quota.release(&id);
                debug!("Transfer cancelled");
            }
            TransferOutcome::Failed(err) => {
                self.ctx.quota.release(&id);
                if let Err(e) = delete_if_exists(self.ctx.fs.as_ref(), &self.partial).await {
                    warn!(error = %e, "Failed to delete partial file");
                }
                let message = err.to_string();
                error!(error = %message, "Download failed");
                let result = self
                    .ctx
                    .store
                    .transition(&id, DownloadStatus::Failed, |r| {
                        r.last_error = Some(message.clone());
                        r.file_path = None;
                        r.downloaded_bytes = 0;
                        r.paused_by = None;
                    })
                    .await;
                match result {
                    Ok(record) => self.ctx.emit(DownloadEvent::Failed {
                        download_id: id.to_string(),
                        item_id: record.item_id,
                        message,
                    }),
                    Err(e) => warn!(error = %e, "Failed to record failure"),
                }
            }
        }
        outcome
    }
}
