// src/events.rs
//
// Central event bus for the recorder.
//
// Every room transition worth telling someone about (went live, went offline,
// recording started/finished) is represented as a `RoomEvent`.  A single
// `EventBus` backed by a `tokio::sync::broadcast` channel fans out each event
// to every consumer: the notification dispatcher and the status log.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

// ─── Event types ────────────────────────────────────────────────────────────

/// Canonical event type string, used in notification payloads and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "room.went_live")]
    WentLive,
    #[serde(rename = "room.went_offline")]
    WentOffline,
    #[serde(rename = "recording.started")]
    RecordingStarted,
    #[serde(rename = "recording.finished")]
    RecordingFinished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WentLive => "room.went_live",
            Self::WentOffline => "room.went_offline",
            Self::RecordingStarted => "recording.started",
            Self::RecordingFinished => "recording.finished",
        }
    }

    /// Only the live/offline edges reach the push channels; recording events
    /// are for the console.
    pub fn is_push_worthy(&self) -> bool {
        matches!(self, Self::WentLive | Self::WentOffline)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// A fully self-describing room event, ready for serialisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    /// Globally unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// ISO-8601 timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Canonical room URL.
    pub room_url: String,

    /// Platform display name (used as the output directory component).
    pub platform: String,

    /// Broadcaster display name, as resolved (or the user's alias).
    pub anchor: String,

    /// Stream title, when the platform reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl RoomEvent {
    pub fn new(
        event_type: EventType,
        room_url: &str,
        platform: &str,
        anchor: &str,
        title: Option<String>,
    ) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            room_url: room_url.to_string(),
            platform: platform.to_string(),
            anchor: anchor.to_string(),
            title,
        }
    }

    /// Local wall-clock time of the event, formatted for push templates.
    pub fn local_time(&self) -> String {
        self.created_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `RoomEvent`.
///
/// Capacity is generous (1024 events) -- subscribers that lag more than that
/// will skip events (same semantic as `broadcast::RecvError::Lagged`).
///
/// The bus is **cheap to clone** (interior `Arc`).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RoomEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event.  Returns the number of active subscribers that will
    /// receive it.  Silently succeeds even if there are no subscribers.
    pub fn emit(&self, event: RoomEvent) -> usize {
        debug!(event_type = %event.event_type, room = %event.room_url, "event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    /// Obtain a new receiver.  Each receiver gets an independent copy of every
    /// event published *after* this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
