//! # Desktop Bridge Implementations
//!
//! Default implementations of the bridge traits for macOS, Windows and Linux:
//! - `HttpClient` using `reqwest` (streamed bodies via `tokio-util`)
//! - `FileSystemAccess` using `tokio::fs`
//! - `SettingsStore` using a SQLite key-value table (`sqlx`)
//! - `NetworkMonitor` using a TCP reachability probe
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, TokioFileSystem};
//!
//! let http = ReqwestHttpClient::new()?;
//! let fs = TokioFileSystem::new();
//! ```

mod filesystem;
mod http;
mod network;
mod settings;

pub use filesystem::TokioFileSystem;
pub use http::ReqwestHttpClient;
pub use network::DesktopNetworkMonitor;
pub use settings::SqliteSettingsStore;
