//! # Download Domain Model
//!
//! Records, item snapshots and the status state machine.
//!
//! ## State Machine
//!
//! ```text
//!            admit              finish
//! Pending ─────────> Downloading ─────────> Completed
//!    ^                 │     │                  │
//!    │ resume          │     │ error            │ file missing
//!    │                 v     v                  v (reconcile)
//!  Paused <────────────┘   Failed <─────────────┘
//!                            │
//!    Pending <───────────────┘ retry
//! ```
//!
//! Removal is not a status: deleted records leave the store.

use crate::error::{DownloadError, Result};
use bridge_traits::media::MediaClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Identifies one download instance, distinct from the remote item id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(Uuid);

impl DownloadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DownloadError::NotFound(format!("invalid download id '{}': {}", s, e)))
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DownloadId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Links the sibling records of one batch (a season, an album).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Media Items
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Movie,
    Episode,
    Audio,
    Book,
    AudioBook,
}

impl MediaKind {
    pub fn media_class(&self) -> MediaClass {
        match self {
            MediaKind::Movie | MediaKind::Episode => MediaClass::Video,
            MediaKind::Audio | MediaKind::AudioBook => MediaClass::Audio,
            MediaKind::Book => MediaClass::Book,
        }
    }
}

/// Kind-specific metadata captured with the item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemDetails {
    Movie {
        production_year: Option<i32>,
    },
    Episode {
        series_id: String,
        series_name: Option<String>,
        season_number: Option<u32>,
        episode_number: Option<u32>,
    },
    Audio {
        album_id: Option<String>,
        album: Option<String>,
        album_artist: Option<String>,
        #[serde(default)]
        artists: Vec<String>,
    },
    Book {
        author: Option<String>,
    },
    AudioBook {
        author: Option<String>,
        narrator: Option<String>,
    },
}

impl ItemDetails {
    pub fn kind(&self) -> MediaKind {
        match self {
            ItemDetails::Movie { .. } => MediaKind::Movie,
            ItemDetails::Episode { .. } => MediaKind::Episode,
            ItemDetails::Audio { .. } => MediaKind::Audio,
            ItemDetails::Book { .. } => MediaKind::Book,
            ItemDetails::AudioBook { .. } => MediaKind::AudioBook,
        }
    }
}

/// Snapshot of a remote item, taken when the download is requested so the
/// offline UI never has to ask the server about it.
///
/// Construct through [`MediaItem::new`], which validates the kind-specific
/// fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub name: String,
    /// Container reported by the server (`mkv`, `mp4`, `epub`, ...)
    pub container: Option<String>,
    /// Expected size in bytes, used for quota admission before the real
    /// size is known
    pub size_hint: Option<u64>,
    /// Watched or listened to the end
    #[serde(default)]
    pub played: bool,
    pub details: ItemDetails,
}

impl MediaItem {
    /// # Errors
    ///
    /// `InvalidItem` when the id or name is blank, the container is not a
    /// plain extension, or a kind-specific field is malformed.
    pub fn new(id: impl Into<String>, name: impl Into<String>, details: ItemDetails) -> Result<Self> {
        let item = Self {
            id: id.into(),
            name: name.into(),
            container: None,
            size_hint: None,
            played: false,
            details,
        };
        item.validate()?;
        Ok(item)
    }

    pub fn movie(id: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        Self::new(id, name, ItemDetails::Movie { production_year: None })
    }

    pub fn episode(
        id: impl Into<String>,
        name: impl Into<String>,
        series_id: impl Into<String>,
        season_number: Option<u32>,
        episode_number: Option<u32>,
    ) -> Result<Self> {
        Self::new(
            id,
            name,
            ItemDetails::Episode {
                series_id: series_id.into(),
                series_name: None,
                season_number,
                episode_number,
            },
        )
    }

    pub fn audio(id: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        Self::new(
            id,
            name,
            ItemDetails::Audio {
                album_id: None,
                album: None,
                album_artist: None,
                artists: Vec::new(),
            },
        )
    }

    pub fn book(id: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        Self::new(id, name, ItemDetails::Book { author: None })
    }

    pub fn audio_book(id: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        Self::new(
            id,
            name,
            ItemDetails::AudioBook {
                author: None,
                narrator: None,
            },
        )
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Result<Self> {
        self.container = Some(container.into());
        self.validate()?;
        Ok(self)
    }

    pub fn with_size_hint(mut self, bytes: u64) -> Self {
        self.size_hint = Some(bytes);
        self
    }

    pub fn with_played(mut self, played: bool) -> Self {
        self.played = played;
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.details.kind()
    }

    pub fn media_class(&self) -> MediaClass {
        self.kind().media_class()
    }

    /// Extension of the completed file on disk.
    pub fn file_extension(&self) -> String {
        let container = self
            .container
            .as_deref()
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty());

        match self.kind() {
            MediaKind::Audio | MediaKind::AudioBook => "mp3".to_string(),
            MediaKind::Book => container.unwrap_or_else(|| "epub".to_string()),
            MediaKind::Movie | MediaKind::Episode => container.unwrap_or_else(|| "mp4".to_string()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DownloadError::InvalidItem("item id cannot be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(DownloadError::InvalidItem(format!(
                "item {} has an empty name",
                self.id
            )));
        }
        if let Some(container) = &self.container {
            let valid = !container.is_empty()
                && container.len() <= 10
                && container.chars().all(|c| c.is_ascii_alphanumeric());
            if !valid {
                return Err(DownloadError::InvalidItem(format!(
                    "item {} has an invalid container '{}'",
                    self.id, container
                )));
            }
        }

        match &self.details {
            ItemDetails::Episode { series_id, .. } if series_id.trim().is_empty() => Err(
                DownloadError::InvalidItem(format!("episode {} has no series id", self.id)),
            ),
            ItemDetails::Audio { artists, .. } if artists.iter().any(|a| a.trim().is_empty()) => {
                Err(DownloadError::InvalidItem(format!(
                    "audio item {} lists a blank artist",
                    self.id
                )))
            }
            ItemDetails::Movie {
                production_year: Some(year),
            } if *year < 1800 => Err(DownloadError::InvalidItem(format!(
                "movie {} has an implausible production year {}",
                self.id, year
            ))),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Paused)
                | (Paused, Pending)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Failed, Pending)
                | (Completed, Failed)
        )
    }

    /// Pending or Downloading.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, DownloadStatus::Pending | DownloadStatus::Downloading)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who paused a record. Bulk resumes only touch their own pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseOrigin {
    User,
    Global,
    Lifecycle,
    /// Connection dropped below what the record's Wi-Fi preference allows
    Network,
}

// ============================================================================
// Quality
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadQuality {
    Original,
    #[default]
    High,
    Medium,
    Low,
}

impl DownloadQuality {
    /// Transcoding ceiling in bits per second; `None` keeps the source file.
    pub fn max_bitrate(&self, class: MediaClass) -> Option<u32> {
        match (self, class) {
            (DownloadQuality::Original, _) | (_, MediaClass::Book) => None,
            (DownloadQuality::High, MediaClass::Video) => Some(8_000_000),
            (DownloadQuality::Medium, MediaClass::Video) => Some(4_000_000),
            (DownloadQuality::Low, MediaClass::Video) => Some(1_500_000),
            (DownloadQuality::High, MediaClass::Audio) => Some(320_000),
            (DownloadQuality::Medium, MediaClass::Audio) => Some(192_000),
            (DownloadQuality::Low, MediaClass::Audio) => Some(128_000),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadQuality::Original => "original",
            DownloadQuality::High => "high",
            DownloadQuality::Medium => "medium",
            DownloadQuality::Low => "low",
        }
    }
}

impl FromStr for DownloadQuality {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "original" => Ok(DownloadQuality::Original),
            "high" => Ok(DownloadQuality::High),
            "medium" => Ok(DownloadQuality::Medium),
            "low" => Ok(DownloadQuality::Low),
            other => Err(DownloadError::Config(format!("unknown quality '{}'", other))),
        }
    }
}

/// Per-request choices made when a download is started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Falls back to the `downloads.quality` setting
    pub quality: Option<DownloadQuality>,
    pub audio_track_index: Option<u32>,
    pub subtitle_track_index: Option<u32>,
    /// Overrides the `downloads.wifi_only` setting for these records
    pub wifi_only: Option<bool>,
}

impl DownloadOptions {
    pub fn with_quality(mut self, quality: DownloadQuality) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_tracks(mut self, audio: Option<u32>, subtitle: Option<u32>) -> Self {
        self.audio_track_index = audio;
        self.subtitle_track_index = subtitle;
        self
    }

    pub fn with_wifi_only(mut self, wifi_only: bool) -> Self {
        self.wifi_only = Some(wifi_only);
        self
    }
}

// ============================================================================
// Download Record
// ============================================================================

/// Persisted state of one item's offline transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: DownloadId,
    pub item_id: String,
    pub server_id: String,
    pub item: MediaItem,
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub quality: DownloadQuality,
    pub audio_track_index: Option<u32>,
    pub subtitle_track_index: Option<u32>,
    /// Partial file while transferring, final file once completed
    pub file_path: Option<PathBuf>,
    pub group_id: Option<GroupId>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub paused_by: Option<PauseOrigin>,
    pub wifi_only: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn new(
        item: MediaItem,
        server_id: impl Into<String>,
        quality: DownloadQuality,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DownloadId::new(),
            item_id: item.id.clone(),
            server_id: server_id.into(),
            item,
            status: DownloadStatus::Pending,
            downloaded_bytes: 0,
            total_bytes: None,
            quality,
            audio_track_index: None,
            subtitle_track_index: None,
            file_path: None,
            group_id: None,
            retry_count: 0,
            last_error: None,
            paused_by: None,
            wifi_only: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_options(mut self, options: &DownloadOptions) -> Self {
        self.audio_track_index = options.audio_track_index;
        self.subtitle_track_index = options.subtitle_track_index;
        self.wifi_only = options.wifi_only;
        self
    }

    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// Percentage in `0..=100`, derived from the byte counters.
    pub fn progress(&self) -> u8 {
        if self.status == DownloadStatus::Completed {
            return 100;
        }
        match self.total_bytes {
            Some(total) if total > 0 => {
                ((self.downloaded_bytes.min(total) as u128 * 100) / total as u128) as u8
            }
            _ => 0,
        }
    }

    /// Bytes to hold against the quota while this record is in flight.
    pub fn estimated_size(&self, fallback: u64) -> u64 {
        self.total_bytes
            .or(self.item.size_hint)
            .unwrap_or(fallback)
    }

    pub fn is_same_source(&self, server_id: &str, item_id: &str) -> bool {
        self.server_id == server_id && self.item_id == item_id
    }
}

// ============================================================================
// Read Model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub percentage: f64,
    pub remaining_bytes: u64,
}

impl StorageUsage {
    pub fn new(used_bytes: u64, max_bytes: u64) -> Self {
        let percentage = if max_bytes == 0 {
            0.0
        } else {
            (used_bytes as f64 / max_bytes as f64) * 100.0
        };
        Self {
            used_bytes,
            max_bytes,
            percentage,
            remaining_bytes: max_bytes.saturating_sub(used_bytes),
        }
    }
}

/// Committed view of the store handed to observers.
///
/// Records are kept in creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub records: Vec<DownloadRecord>,
    pub used_bytes: u64,
    pub max_bytes: u64,
}

impl DownloadSnapshot {
    pub fn get(&self, id: &DownloadId) -> Option<&DownloadRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    pub fn find_by_item(&self, item_id: &str) -> Option<&DownloadRecord> {
        self.records.iter().find(|r| r.item_id == item_id)
    }

    pub fn with_status(&self, status: DownloadStatus) -> impl Iterator<Item = &DownloadRecord> {
        self.records.iter().filter(move |r| r.status == status)
    }

    pub fn pending(&self) -> Vec<&DownloadRecord> {
        self.with_status(DownloadStatus::Pending).collect()
    }

    pub fn active(&self) -> Vec<&DownloadRecord> {
        self.with_status(DownloadStatus::Downloading).collect()
    }

    pub fn completed(&self) -> Vec<&DownloadRecord> {
        self.with_status(DownloadStatus::Completed).collect()
    }

    pub fn by_kind(&self, kind: MediaKind) -> Vec<&DownloadRecord> {
        self.records.iter().filter(|r| r.item.kind() == kind).collect()
    }

    pub fn in_group(&self, group_id: &GroupId) -> Vec<&DownloadRecord> {
        self.records
            .iter()
            .filter(|r| r.group_id.as_ref() == Some(group_id))
            .collect()
    }

    pub fn storage_usage(&self) -> StorageUsage {
        StorageUsage::new(self.used_bytes, self.max_bytes)
    }
}

/// Result of a batch request.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub group_id: Option<GroupId>,
    /// New records, in the order the items were supplied
    pub enqueued: Vec<DownloadId>,
    /// Items that were not enqueued, with the reason
    pub skipped: Vec<(String, DownloadError)>,
}

impl BatchOutcome {
    pub fn enqueued_count(&self) -> usize {
        self.enqueued.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}
