//! Presentation-layer events.
//!
//! The engine fans these out over `tokio::sync::broadcast` channels; hosts
//! render them however they like (console lines, a UI, a JSON bridge).
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `TurnStatusEvent` | `VoiceEngine::subscribe_status` |
//! | `TranscriptEvent` | `VoiceEngine::subscribe_transcripts` |
//! | `ActivityEvent` | `VoiceEngine::subscribe_activity` |
//! | `NoticeEvent` | `VoiceEngine::subscribe_notices` |

use serde::{Deserialize, Serialize};

use crate::audio::envelope::LevelSnapshot;
use crate::turn::TurnState;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Emitted whenever the turn state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStatusEvent {
    pub state: TurnState,
    /// Short human-readable reason ("barge-in", "connecting", ...).
    pub detail: Option<String>,
    /// Capture-sent → reply-audio latency, on entering `Playing`.
    pub latency_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// Backend echo of what it heard.
    User,
    /// Assistant's text reply.
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub role: Speaker,
    pub text: String,
    /// Time since the capture was transmitted.
    pub latency_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// Per-frame level meter data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub level: LevelSnapshot,
}

// ---------------------------------------------------------------------------
// Notices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Backend started a web search.
    Searching,
    /// Microphone failed; explicit re-activation required.
    DeviceError,
    /// Reply could not be played; the turn continues.
    PlaybackError,
    /// Activation gave up waiting for the backend.
    ConnectTimeout,
    ConnectionLost,
    ReplyTimedOut,
    ServerError,
    /// A finished capture could not be encoded or sent.
    CaptureDropped,
}

/// One-off message for the user; never changes turn state by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeEvent {
    pub kind: NoticeKind,
    pub message: String,
}

impl NoticeEvent {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
