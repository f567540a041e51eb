//! Media Source Abstraction
//!
//! The remote media API as seen by the download pipeline: given an item,
//! describe how its bytes can be fetched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Broad class of media, which decides which endpoint serves the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaClass {
    Video,
    Audio,
    Book,
}

/// Parameters for resolving a downloadable source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub item_id: String,
    pub server_id: String,
    pub media_class: MediaClass,
    /// Upper bound for transcoding; `None` asks for the original file.
    pub max_bitrate: Option<u32>,
    pub audio_track_index: Option<u32>,
    pub subtitle_track_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub index: u32,
    pub codec: Option<String>,
    pub language: Option<String>,
    pub title: Option<String>,
}

/// Resolved source descriptor for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackInfo {
    /// Size in bytes of the resource behind `download_url`, when known.
    pub size: Option<u64>,
    pub container: Option<String>,
    pub codecs: Vec<String>,
    pub audio_tracks: Vec<MediaTrack>,
    pub subtitle_tracks: Vec<MediaTrack>,
    pub download_url: String,
    /// Whether the server honours `Range` requests for this resource.
    pub supports_range: bool,
}

/// Remote media API collaborator
///
/// # Example
///
/// ```ignore
/// use bridge_traits::media::{MediaSource, PlaybackRequest};
///
/// async fn size_of(source: &dyn MediaSource, request: &PlaybackRequest) -> Option<u64> {
///     source.get_playback_info(request).await.ok()?.size
/// }
/// ```
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Resolve the download URL and transfer characteristics for an item.
    ///
    /// # Errors
    ///
    /// `BridgeError::NotFound` when the item no longer exists on the server;
    /// transport failures as `Timeout`/`Connection`/`Http`.
    async fn get_playback_info(&self, request: &PlaybackRequest) -> Result<PlaybackInfo>;
}
