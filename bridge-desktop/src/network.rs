//! Network Monitoring Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_PROBE: &str = "1.1.1.1:443";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Desktop network monitor
///
/// Reachability is probed with a TCP connect. Desktop links are reported as
/// unmetered Ethernet-class connections: the OS APIs that tell Wi-Fi from
/// tethered cellular are platform specific and not wired in here.
#[derive(Clone)]
pub struct DesktopNetworkMonitor {
    probe: SocketAddr,
    last_info: Arc<Mutex<Option<NetworkInfo>>>,
    poll_interval: Duration,
}

impl DesktopNetworkMonitor {
    pub fn new() -> Self {
        Self::with_probe(
            DEFAULT_PROBE
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([1, 1, 1, 1], 443))),
        )
    }

    pub fn with_probe(probe: SocketAddr) -> Self {
        Self {
            probe,
            last_info: Arc::new(Mutex::new(None)),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn probe_status(&self) -> NetworkStatus {
        match tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(self.probe)).await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) => NetworkStatus::Disconnected,
            Err(_) => NetworkStatus::Indeterminate,
        }
    }

    /// Last probed state, without probing again.
    pub async fn cached_info(&self) -> Option<NetworkInfo> {
        self.last_info.lock().await.clone()
    }
}

impl Default for DesktopNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        let info = match self.probe_status().await {
            NetworkStatus::Connected => NetworkInfo::connected(NetworkType::Ethernet),
            status => NetworkInfo {
                status,
                network_type: None,
                is_metered: false,
            },
        };

        let mut last = self.last_info.lock().await;
        if last.as_ref() != Some(&info) {
            debug!(status = ?info.status, "Network state changed");
        }
        *last = Some(info.clone());
        Ok(info)
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(PollingChangeStream {
            monitor: self.clone(),
            last: self.cached_info().await,
        }))
    }
}

/// Polls the monitor and yields only when the state differs from the last one seen.
struct PollingChangeStream {
    monitor: DesktopNetworkMonitor,
    last: Option<NetworkInfo>,
}

#[async_trait]
impl NetworkChangeStream for PollingChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        loop {
            tokio::time::sleep(self.monitor.poll_interval).await;
            if let Ok(info) = self.monitor.get_network_info().await {
                if self.last.as_ref() != Some(&info) {
                    self.last = Some(info.clone());
                    return Some(info);
                }
            }
        }
    }
}
