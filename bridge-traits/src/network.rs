//! Network State Abstraction
//!
//! Reports the current connectivity class so large transfers can be held
//! back on cellular links.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Network connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    Cellular,
    WiFi,
    Ethernet,
    Other,
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    Connected,
    Disconnected,
    /// The host could not tell (e.g. probe timed out)
    Indeterminate,
}

/// Snapshot of the current connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
    /// Whether the connection has data limits or costs
    pub is_metered: bool,
}

impl NetworkInfo {
    pub fn connected(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: matches!(network_type, NetworkType::Cellular),
        }
    }

    pub fn offline() -> Self {
        Self {
            status: NetworkStatus::Disconnected,
            network_type: None,
            is_metered: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == NetworkStatus::Connected
    }

    /// Connected over Wi-Fi or a wired link that is not flagged as metered.
    ///
    /// This is the condition a "Wi-Fi only" download preference waits for.
    pub fn is_wifi_class(&self) -> bool {
        self.is_connected()
            && !self.is_metered
            && matches!(
                self.network_type,
                Some(NetworkType::WiFi) | Some(NetworkType::Ethernet)
            )
    }
}

/// Network monitor trait
///
/// # Platform Support
///
/// - **Desktop**: reachability probe, wired/Wi-Fi assumed unmetered
/// - **iOS**: Network framework path monitor
/// - **Android**: ConnectivityManager
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Get current network information
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    /// Check if currently connected to any network
    async fn is_connected(&self) -> bool {
        self.get_network_info()
            .await
            .map(|info| info.is_connected())
            .unwrap_or(false)
    }

    /// Check if connected via Wi-Fi (or an unmetered wired link)
    async fn is_wifi(&self) -> bool {
        self.get_network_info()
            .await
            .map(|info| info.is_wifi_class())
            .unwrap_or(false)
    }

    /// Subscribe to network status changes
    ///
    /// Implementations emit an update whenever the status or type changes.
    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>>;
}

/// Stream of network status changes
#[async_trait]
pub trait NetworkChangeStream: Send {
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<NetworkInfo>;
}
