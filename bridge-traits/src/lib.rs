//! # Host Bridge Traits
//!
//! Capabilities the download core needs from its host, expressed as traits.
//!
//! ## Traits
//!
//! ### Networking & I/O
//! - [`HttpClient`](http::HttpClient) - Buffered and range-aware streamed HTTP
//! - [`MediaSource`](media::MediaSource) - Resolves an item to a downloadable source
//! - [`FileSystemAccess`](storage::FileSystemAccess) - File I/O with atomic rename
//!
//! ### Platform Integration
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity class for Wi-Fi-only gating
//! - [`SettingsStore`](storage::SettingsStore) - User preferences, read live
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](logging::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! Every trait reports [`BridgeError`](error::BridgeError). Transport
//! failures use the `Timeout`, `Connection` and `Http` variants so callers
//! can tell retriable failures from permanent ones via
//! [`BridgeError::is_transient`].
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`; they are shared across worker
//! tasks behind `Arc`.

pub mod error;
pub mod http;
pub mod logging;
pub mod media;
pub mod network;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpStream};
pub use logging::{LogEntry, LogLevel, LoggerSink};
pub use media::{MediaClass, MediaSource, MediaTrack, PlaybackInfo, PlaybackRequest};
pub use network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use storage::{FileMetadata, FileSystemAccess, SettingsStore};
pub use time::{Clock, ManualClock, SystemClock};
