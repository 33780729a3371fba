//! # parley-core
//!
//! Full-duplex voice front end for a remote conversational assistant.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → MicrophoneStream → SPSC RingBuffer → frame loop (spawn_blocking)
//!                                                       │
//!                                   EnvelopeSampler → AdaptiveNoiseTracker
//!                                                       │
//!                                             VoiceActivityDetector
//!                                                       │
//!                                               TurnController ──► effects
//!                                      ┌────────────┬───┴─────────┬──────────────┐
//!                                 CaptureRecorder  transport   ReplayPlayer   broadcast events
//!                                  (WAV encode)   (WebSocket)    (rodio)
//! ```
//!
//! The audio callback is zero-alloc. All turn state lives on the frame loop.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod transport;
pub mod turn;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::device::{list_input_devices, DeviceInfo};
pub use engine::{DiagnosticsSnapshot, EngineConfig, VoiceEngine};
pub use error::{ParleyError, Result};
pub use ipc::events::{
    ActivityEvent, NoticeEvent, NoticeKind, Speaker, TranscriptEvent, TurnStatusEvent,
};
pub use transport::ReconnectPolicy;
pub use turn::{TurnController, TurnState};
