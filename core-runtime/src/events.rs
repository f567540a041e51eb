//! # Event Bus System
//!
//! Typed broadcast events shared between the download core, the player and
//! the host UI, built on `tokio::sync::broadcast`.
//!
//! ```text
//! ┌────────────────┐  emit   ┌───────────┐  subscribe  ┌──────────────┐
//! │ Download core  ├────────>│           ├────────────>│ UI / notifier│
//! └────────────────┘         │ EventBus  │             └──────────────┘
//! ┌────────────────┐  emit   │           │  subscribe  ┌──────────────┐
//! │ Player         ├────────>│           ├────────────>│ Auto-remove  │
//! └────────────────┘         └───────────┘             └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, PlaybackEvent};
//!
//! let bus = EventBus::new(64);
//! let mut rx = bus.subscribe();
//! bus.emit(CoreEvent::Playback(PlaybackEvent::Finished {
//!     item_id: "42".to_string(),
//!     server_id: Some("srv".to_string()),
//! }))
//! .ok();
//! assert!(rx.try_recv().is_ok());
//! ```
//!
//! ## Error Handling
//!
//! Slow subscribers receive `RecvError::Lagged(n)` and should resync from
//! the download snapshot rather than treat it as fatal. `emit` fails only
//! when nobody is subscribed, which publishers ignore.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast::{self, error::RecvError, error::SendError, Receiver};

pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Download(DownloadEvent),
    Playback(PlaybackEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Download(e) => e.description(),
            CoreEvent::Playback(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Download(DownloadEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Download(DownloadEvent::Completed { .. })
            | CoreEvent::Download(DownloadEvent::Removed { .. })
            | CoreEvent::Download(DownloadEvent::Cleared { .. }) => EventSeverity::Info,
            CoreEvent::Download(DownloadEvent::StorageRecalculated {
                missing_files, ..
            }) if *missing_files > 0 => EventSeverity::Warning,
            _ => EventSeverity::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Download Events
// ============================================================================

/// Lifecycle of offline downloads.
///
/// Ids are the string form of the download id; `item_id` is the remote
/// media item it was created for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DownloadEvent {
    /// A record was created and is waiting for admission.
    Queued {
        download_id: String,
        item_id: String,
        name: String,
        group_id: Option<String>,
    },
    /// A worker took the record.
    Started {
        download_id: String,
        item_id: String,
        resume_offset: u64,
    },
    /// Throttled transfer progress.
    Progress {
        download_id: String,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        percent: u8,
    },
    Paused {
        download_id: String,
        downloaded_bytes: u64,
    },
    /// Back in the admission queue.
    Resumed { download_id: String },
    /// File is in place and playable offline.
    Completed {
        download_id: String,
        item_id: String,
        name: String,
        bytes: u64,
    },
    Failed {
        download_id: String,
        item_id: String,
        message: String,
    },
    Removed {
        download_id: String,
        item_id: String,
    },
    /// Every record and file was dropped.
    Cleared { removed: usize },
    StorageRecalculated {
        used_bytes: u64,
        missing_files: usize,
        orphans_deleted: usize,
    },
}

impl DownloadEvent {
    fn description(&self) -> &str {
        match self {
            DownloadEvent::Queued { .. } => "Download queued",
            DownloadEvent::Started { .. } => "Download started",
            DownloadEvent::Progress { .. } => "Download progress",
            DownloadEvent::Paused { .. } => "Download paused",
            DownloadEvent::Resumed { .. } => "Download resumed",
            DownloadEvent::Completed { .. } => "Download completed",
            DownloadEvent::Failed { .. } => "Download failed",
            DownloadEvent::Removed { .. } => "Download removed",
            DownloadEvent::Cleared { .. } => "All downloads cleared",
            DownloadEvent::StorageRecalculated { .. } => "Download storage recalculated",
        }
    }

    pub fn download_id(&self) -> Option<&str> {
        match self {
            DownloadEvent::Queued { download_id, .. }
            | DownloadEvent::Started { download_id, .. }
            | DownloadEvent::Progress { download_id, .. }
            | DownloadEvent::Paused { download_id, .. }
            | DownloadEvent::Resumed { download_id }
            | DownloadEvent::Completed { download_id, .. }
            | DownloadEvent::Failed { download_id, .. }
            | DownloadEvent::Removed { download_id, .. } => Some(download_id),
            DownloadEvent::Cleared { .. } | DownloadEvent::StorageRecalculated { .. } => None,
        }
    }
}

// ============================================================================
// Playback Events
// ============================================================================

/// Reported by the player. The download core only listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PlaybackEvent {
    Started { item_id: String },
    /// Item was watched or listened to the end.
    Finished {
        item_id: String,
        server_id: Option<String>,
    },
}

impl PlaybackEvent {
    fn description(&self) -> &str {
        match self {
            PlaybackEvent::Started { .. } => "Playback started",
            PlaybackEvent::Finished { .. } => "Playback finished",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Cloneable handle to a broadcast channel of [`CoreEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// `capacity` is how far a subscriber may fall behind before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers that received the event, or an
    /// error when there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn stream(&self) -> EventStream {
        EventStream::new(self.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// Receiver that skips events not matching an optional predicate.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |f| f(event))
    }

    /// Next matching event.
    ///
    /// # Errors
    ///
    /// `RecvError::Lagged(n)` if the subscriber fell behind by `n` events,
    /// `RecvError::Closed` once every sender is gone.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Next matching event that is already buffered, if any.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Some(Err(RecvError::Closed))
                }
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
