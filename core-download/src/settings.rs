//! User download preferences, read live from the host settings store.

use crate::error::Result;
use crate::models::DownloadQuality;
use bridge_traits::storage::SettingsStore;
use std::sync::Arc;
use tracing::warn;

pub const KEY_QUALITY: &str = "downloads.quality";
pub const KEY_WIFI_ONLY: &str = "downloads.wifi_only";
pub const KEY_AUTO_REMOVE_WATCHED: &str = "downloads.auto_remove_watched";
pub const KEY_MAX_STORAGE_BYTES: &str = "downloads.max_storage_bytes";

pub const DEFAULT_MAX_STORAGE_BYTES: u64 = 50 * 1024 * 1024 * 1024;

/// Typed accessors over [`SettingsStore`].
///
/// Nothing is cached: every getter goes to the store, so a change made by
/// the settings screen applies to the next admission decision. Unreadable or
/// malformed values fall back to the default with a warning.
#[derive(Clone)]
pub struct DownloadSettings {
    store: Arc<dyn SettingsStore>,
}

impl DownloadSettings {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    pub async fn quality(&self) -> DownloadQuality {
        match self.store.get_string(KEY_QUALITY).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|_| {
                warn!(key = KEY_QUALITY, value = %raw, "Unknown download quality, using default");
                DownloadQuality::default()
            }),
            Ok(None) => DownloadQuality::default(),
            Err(e) => {
                warn!(key = KEY_QUALITY, error = %e, "Failed to read setting");
                DownloadQuality::default()
            }
        }
    }

    pub async fn wifi_only(&self) -> bool {
        self.read_bool(KEY_WIFI_ONLY, true).await
    }

    pub async fn auto_remove_watched(&self) -> bool {
        self.read_bool(KEY_AUTO_REMOVE_WATCHED, false).await
    }

    pub async fn max_storage_bytes(&self) -> u64 {
        match self.store.get_i64(KEY_MAX_STORAGE_BYTES).await {
            Ok(Some(value)) if value >= 0 => value as u64,
            Ok(Some(value)) => {
                warn!(key = KEY_MAX_STORAGE_BYTES, value, "Negative storage limit, using default");
                DEFAULT_MAX_STORAGE_BYTES
            }
            Ok(None) => DEFAULT_MAX_STORAGE_BYTES,
            Err(e) => {
                warn!(key = KEY_MAX_STORAGE_BYTES, error = %e, "Failed to read setting");
                DEFAULT_MAX_STORAGE_BYTES
            }
        }
    }

    pub async fn set_quality(&self, quality: DownloadQuality) -> Result<()> {
        Ok(self.store.set_string(KEY_QUALITY, quality.as_str()).await?)
    }

    pub async fn set_wifi_only(&self, enabled: bool) -> Result<()> {
        Ok(self.store.set_bool(KEY_WIFI_ONLY, enabled).await?)
    }

    pub async fn set_auto_remove_watched(&self, enabled: bool) -> Result<()> {
        Ok(self.store.set_bool(KEY_AUTO_REMOVE_WATCHED, enabled).await?)
    }

    pub async fn set_max_storage_bytes(&self, bytes: u64) -> Result<()> {
        let value = i64::try_from(bytes).unwrap_or(i64::MAX);
        Ok(self.store.set_i64(KEY_MAX_STORAGE_BYTES, value).await?)
    }

    async fn read_bool(&self, key: &str, default: bool) -> bool {
        match self.store.get_bool(key).await {
            Ok(value) => value.unwrap_or(default),
            Err(e) => {
                warn!(key, error = %e, "Failed to read setting");
                default
            }
        }
    }
}
