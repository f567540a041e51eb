//! Shared fakes and harness for the download manager integration tests.
//!
//! The manager runs against the real `TokioFileSystem` and an in-memory
//! `SqliteSettingsStore` inside a `TempDir`; only the network side is faked.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_desktop::{SqliteSettingsStore, TokioFileSystem};
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse, HttpStream};
use bridge_traits::media::{MediaSource, PlaybackInfo, PlaybackRequest};
use bridge_traits::network::{NetworkChangeStream, NetworkInfo, NetworkMonitor};
use bridge_traits::storage::SettingsStore;
use bridge_traits::time::SystemClock;
use bytes::Bytes;
use core_download::{
    DownloadConfig, DownloadDeps, DownloadManager, DownloadSnapshot, RetryPolicy,
};
use core_runtime::events::EventBus;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{watch, Semaphore};
use tokio_util::io::StreamReader;

pub const SERVER: &str = "jellyfin-home";
const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Deterministic, non-repeating test payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

pub fn url_for(item_id: &str) -> String {
    format!("https://media.test/items/{}/download", item_id)
}

// ============================================================================
// Media source
// ============================================================================

#[derive(Default)]
pub struct FakeMediaSource {
    items: Mutex<HashMap<String, PlaybackInfo>>,
    requests: Mutex<Vec<PlaybackRequest>>,
    stalled: Mutex<HashSet<String>>,
}

impl FakeMediaSource {
    pub fn add(&self, item_id: &str, size: Option<u64>, supports_range: bool) {
        self.items.lock().insert(
            item_id.to_string(),
            PlaybackInfo {
                size,
                container: Some("mp4".to_string()),
                codecs: vec!["h264".to_string()],
                audio_tracks: Vec::new(),
                subtitle_tracks: Vec::new(),
                download_url: url_for(item_id),
                supports_range,
            },
        );
    }

    /// Resolves but offers nothing to download.
    pub fn add_unsupported(&self, item_id: &str) {
        self.add(item_id, Some(10), true);
        if let Some(info) = self.items.lock().get_mut(item_id) {
            info.download_url.clear();
        }
    }

    /// Never answer for this item until [`FakeMediaSource::unstall`].
    pub fn stall(&self, item_id: &str) {
        self.stalled.lock().insert(item_id.to_string());
    }

    pub fn unstall(&self, item_id: &str) {
        self.stalled.lock().remove(item_id);
    }

    pub fn requests(&self) -> Vec<PlaybackRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn get_playback_info(&self, request: &PlaybackRequest) -> BridgeResult<PlaybackInfo> {
        self.requests.lock().push(request.clone());
        let stalled = self.stalled.lock().contains(&request.item_id);
        if stalled {
            std::future::pending::<()>().await;
        }
        self.items
            .lock()
            .get(&request.item_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(request.item_id.clone()))
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Answer with this status and an empty body.
    Status(u16),
    /// Fail to connect.
    Connection,
    /// Deliver this many bytes, then break the stream.
    CutAfter(usize),
}

#[derive(Debug, Clone)]
pub struct LoggedRequest {
    pub url: String,
    pub range_from: Option<u64>,
}

pub struct FakeHttpClient {
    resources: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    failures: Mutex<HashMap<String, VecDeque<Failure>>>,
    requests: Mutex<Vec<LoggedRequest>>,
    ignore_range: AtomicBool,
    chunk_size: usize,
    chunk_delay: Mutex<Duration>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    open_bodies: Arc<AtomicUsize>,
    peak_bodies: Arc<AtomicUsize>,
}

impl FakeHttpClient {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            ignore_range: AtomicBool::new(false),
            chunk_size,
            chunk_delay: Mutex::new(Duration::ZERO),
            gate: Mutex::new(None),
            open_bodies: Arc::new(AtomicUsize::new(0)),
            peak_bodies: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn serve(&self, item_id: &str, data: Vec<u8>) {
        self.resources.lock().insert(url_for(item_id), Arc::new(data));
    }

    pub fn fail_next(&self, item_id: &str, failure: Failure) {
        self.failures
            .lock()
            .entry(url_for(item_id))
            .or_default()
            .push_back(failure);
    }

    /// Answer `200` with the whole body even when a range was asked for.
    pub fn ignore_range(&self, ignore: bool) {
        self.ignore_range.store(ignore, Ordering::SeqCst);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.chunk_delay.lock() = delay;
    }

    /// From now on every chunk needs a permit from the returned semaphore.
    pub fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn requests_for(&self, item_id: &str) -> Vec<LoggedRequest> {
        let url = url_for(item_id);
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }

    /// Most bodies that were ever being read at the same time.
    pub fn peak_concurrent_bodies(&self) -> usize {
        self.peak_bodies.load(Ordering::SeqCst)
    }
}

struct OpenBody(Arc<AtomicUsize>);

impl Drop for OpenBody {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HttpClient for FakeHttpClient {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let data = self
            .resources
            .lock()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(request.url.clone()))?;
        Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::copy_from_slice(&data),
        })
    }

    async fn open_stream(&self, request: HttpRequest) -> BridgeResult<HttpStream> {
        let offset = request.requested_offset();
        self.requests.lock().push(LoggedRequest {
            url: request.url.clone(),
            range_from: offset,
        });

        let failure = self
            .failures
            .lock()
            .get_mut(&request.url)
            .and_then(|queue| queue.pop_front());
        let mut cut_after = None;
        match failure {
            Some(Failure::Status(status)) => {
                return Ok(HttpStream {
                    status,
                    headers: HashMap::new(),
                    content_length: Some(0),
                    body: Box::new(io::Cursor::new(Vec::new())),
                })
            }
            Some(Failure::Connection) => {
                return Err(BridgeError::Connection("connection reset".to_string()))
            }
            Some(Failure::CutAfter(bytes)) => cut_after = Some(bytes),
            None => {}
        }

        let data = self
            .resources
            .lock()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| BridgeError::Http {
                status: 404,
                message: "no such resource".to_string(),
            })?;
        let total = data.len() as u64;

        let ranged = offset.filter(|_| !self.ignore_range.load(Ordering::SeqCst));
        let start = ranged.unwrap_or(0).min(total) as usize;
        let mut headers = HashMap::new();
        let status = match ranged {
            Some(_) => {
                headers.insert(
                    "Content-Range".to_string(),
                    format!("bytes {}-{}/{}", start, total.saturating_sub(1), total),
                );
                206
            }
            None => 200,
        };

        let mut chunks: Vec<io::Result<Bytes>> = data[start..]
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if let Some(limit) = cut_after {
            let keep = limit.div_ceil(self.chunk_size);
            chunks.truncate(keep);
            chunks.push(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream cut",
            )));
        }

        let open = self.open_bodies.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_bodies.fetch_max(open, Ordering::SeqCst);
        let guard = OpenBody(self.open_bodies.clone());

        let delay = *self.chunk_delay.lock();
        let gate = self.gate.lock().clone();
        let stream = futures::stream::unfold(
            (chunks.into_iter(), guard, gate),
            move |(mut chunks, guard, gate)| async move {
                let next = chunks.next()?;
                if let Some(gate) = &gate {
                    match gate.acquire().await {
                        Ok(permit) => permit.forget(),
                        Err(_) => return None,
                    }
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((next, (chunks, guard, gate)))
            },
        );

        Ok(HttpStream {
            status,
            headers,
            content_length: Some(total - start as u64),
            body: Box::new(StreamReader::new(Box::pin(stream))),
        })
    }
}

// ============================================================================
// Network
// ============================================================================

pub struct FakeNetwork {
    tx: watch::Sender<NetworkInfo>,
}

impl FakeNetwork {
    pub fn new(initial: NetworkInfo) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, info: NetworkInfo) {
        self.tx.send_replace(info);
    }
}

struct FakeChangeStream {
    rx: watch::Receiver<NetworkInfo>,
}

#[async_trait]
impl NetworkChangeStream for FakeChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[async_trait]
impl NetworkMonitor for FakeNetwork {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        Ok(self.tx.borrow().clone())
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(FakeChangeStream {
            rx: self.tx.subscribe(),
        }))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn fast_config() -> DownloadConfig {
    DownloadConfig::default()
        .with_retry_policy(RetryPolicy::new(
            4,
            Duration::from_millis(10),
            Duration::from_millis(50),
        ))
        .with_read_timeout(Duration::from_secs(5))
        .with_network_recheck_interval(Duration::from_millis(100))
        .with_progress_throttle(1, Duration::from_millis(10))
}

pub struct Harness {
    pub temp: TempDir,
    pub http: Arc<FakeHttpClient>,
    pub media: Arc<FakeMediaSource>,
    pub settings: Arc<SqliteSettingsStore>,
    pub network: Option<Arc<FakeNetwork>>,
    pub events: EventBus,
    pub config: DownloadConfig,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(fast_config()).await
    }

    pub async fn with_config(config: DownloadConfig) -> Self {
        Self {
            temp: TempDir::new().unwrap(),
            http: Arc::new(FakeHttpClient::new(1024)),
            media: Arc::new(FakeMediaSource::default()),
            settings: Arc::new(SqliteSettingsStore::in_memory().await.unwrap()),
            network: None,
            events: EventBus::new(1024),
            config,
        }
    }

    pub fn with_network(mut self, initial: NetworkInfo) -> Self {
        self.network = Some(Arc::new(FakeNetwork::new(initial)));
        self
    }

    pub fn download_dir(&self) -> PathBuf {
        self.temp.path().join("downloads")
    }

    pub fn server_dir(&self) -> PathBuf {
        self.download_dir().join(SERVER)
    }

    /// Register an item with both the media source and the HTTP server.
    pub fn publish(&self, item_id: &str, data: Vec<u8>, supports_range: bool) {
        self.media
            .add(item_id, Some(data.len() as u64), supports_range);
        self.http.serve(item_id, data);
    }

    pub async fn set_bool(&self, key: &str, value: bool) {
        self.settings.set_bool(key, value).await.unwrap();
    }

    pub async fn set_i64(&self, key: &str, value: i64) {
        self.settings.set_i64(key, value).await.unwrap();
    }

    pub async fn start(&self) -> Arc<DownloadManager> {
        let network: Option<Arc<dyn NetworkMonitor>> = match &self.network {
            Some(network) => Some(network.clone()),
            None => None,
        };
        let deps = DownloadDeps {
            download_dir: self.download_dir(),
            file_system: Arc::new(TokioFileSystem::with_data_directory(self.temp.path())),
            http_client: self.http.clone(),
            media_source: self.media.clone(),
            settings_store: self.settings.clone(),
            network_monitor: network,
            clock: Arc::new(SystemClock),
        };
        DownloadManager::with_deps(deps, self.events.clone(), self.config.clone())
            .await
            .unwrap()
    }
}

/// Wait until `condition` holds on a committed snapshot.
pub async fn wait_for<F>(manager: &DownloadManager, what: &str, condition: F) -> Arc<DownloadSnapshot>
where
    F: Fn(&DownloadSnapshot) -> bool,
{
    let mut rx = manager.subscribe();
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if condition(&snapshot) {
            return snapshot;
        }
        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => panic!("store closed while waiting for {}", what),
            Err(_) => panic!("timed out waiting for {}: {:#?}", what, snapshot.records),
        }
    }
}
