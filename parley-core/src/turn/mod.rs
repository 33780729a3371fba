//! Turn-taking state machine.
//!
//! `TurnController` is the single writer of [`TurnState`]. It owns the noise
//! tracker and the voice activity detector, and reacts to one [`TurnInput`]
//! at a time by returning the [`Effect`]s the driver must carry out. It does
//! no I/O itself, so every transition can be exercised with synthetic input.
//!
//! ```text
//!            activate                SpeechStart
//!   Idle ───────────────► Listening ───────────► Capturing
//!    ▲                      ▲  ▲  ▲                  │
//!    │ deactivate /         │  │  └── rejected ──────┤
//!    │ transport closed     │  │                     │ SpeechStop
//!    │ (from any state)     │  └──── error/timeout ─ AwaitingReply
//!    │                      │                        │ reply audio
//!    │                      └── ended/failed/barge ─ Playing
//! ```
//!
//! Asynchronous completions carry a [`Ticket`] (activation epoch + per-epoch
//! sequence number). A completion whose ticket no longer matches what the
//! controller is waiting for is dropped and counted.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Span};

use crate::audio::envelope::{EnvelopeSample, LevelSnapshot};
use crate::capture::CaptureOutcome;
use crate::ipc::events::{NoticeEvent, NoticeKind, Speaker, TurnStatusEvent};
use crate::playback::PlaybackEvent;
use crate::transport::protocol::{decode_audio, ClientMessage, ServerMessage};
use crate::vad::{AdaptiveNoiseTracker, NoiseConfig, VadConfig, VadEvent, VoiceActivityDetector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Listening,
    Capturing,
    AwaitingReply,
    Playing,
}

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Capturing => "capturing",
            TurnState::AwaitingReply => "awaiting_reply",
            TurnState::Playing => "playing",
        }
    }
}

/// Activation counter. Bumped on every activation and deactivation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);

/// Identifies one capture (and the reply to it) within an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub epoch: Epoch,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnConfig {
    pub vad: VadConfig,
    pub noise: NoiseConfig,
    /// Captures open this long are stopped as if the user had paused.
    pub max_capture: Duration,
    /// `None` waits for a reply indefinitely.
    pub reply_timeout: Option<Duration>,
    /// How long an activation waits for the transport to open.
    pub connect_timeout: Duration,
    /// Re-activate after an unclean transport drop once it reconnects.
    pub resume_on_reconnect: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            noise: NoiseConfig::default(),
            max_capture: Duration::from_secs(30),
            reply_timeout: Some(Duration::from_secs(20)),
            connect_timeout: Duration::from_secs(5),
            resume_on_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    Activate,
    Deactivate,
    Toggle,
    /// One envelope sample from the frame loop.
    Frame(EnvelopeSample),
    /// Timer check without a sample (no microphone held).
    Tick,
    InputFailed { epoch: Epoch, reason: String },
    CaptureFinished { ticket: Ticket, outcome: CaptureOutcome },
    CaptureFailed { ticket: Ticket, reason: String },
    /// The last `Transmit` never reached the transport.
    TransmitFailed { reason: String },
    Server(ServerMessage),
    TransportOpened,
    TransportClosed { clean: bool },
    /// Reconnection gave up.
    TransportUnavailable,
    Playback(PlaybackEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Presentation {
    Status(TurnStatusEvent),
    Transcript {
        role: Speaker,
        text: String,
        latency_ms: Option<u64>,
    },
    Notice(NoticeEvent),
}

/// Work for the driver, in the order returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect,
    AcquireInput { epoch: Epoch },
    ReleaseInput,
    BeginCapture(Ticket),
    DiscardCapture(Ticket),
    /// Close the capture and encode it off the frame loop; the result comes
    /// back as `CaptureFinished` / `CaptureFailed`.
    FinalizeCapture(Ticket),
    Transmit(ClientMessage),
    PlayReply { ticket: Ticket, audio: Vec<u8> },
    PausePlayback,
    StopPlayback,
    PlayCue,
    Present(Presentation),
}

/// Running totals for the controller's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStats {
    pub frames: u64,
    pub speech_starts: u64,
    pub episodes_rejected: u64,
    pub captures_sent: u64,
    pub captures_too_small: u64,
    pub replies_played: u64,
    pub barge_ins: u64,
    pub stale_dropped: u64,
    pub reply_timeouts: u64,
}

#[derive(Debug, Clone, Copy)]
struct OpenCapture {
    ticket: Ticket,
    opened_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct PendingReply {
    ticket: Ticket,
    /// Set once the encoded capture went out; `None` while it is still encoding.
    sent_at: Option<Instant>,
    since: Instant,
}

pub struct TurnController {
    config: TurnConfig,
    state: TurnState,
    noise: AdaptiveNoiseTracker,
    vad: VoiceActivityDetector,
    epoch: Epoch,
    next_seq: u64,
    connection_open: bool,
    /// The user wants a live session, even if the transport is down right now.
    wants_active: bool,
    connect_deadline: Option<Instant>,
    input_held: bool,
    capture: Option<OpenCapture>,
    pending: Option<PendingReply>,
    playing: Option<Ticket>,
    /// An episode already open on entering `Listening` (a barge-in, or speech
    /// that began while a reply was pending) is captured on its next crossing.
    capture_on_continue: bool,
    /// A barged-in reply is held paused by the player until stopped.
    paused_reply: bool,
    /// Replies still owed on this connection for requests we gave up on.
    abandoned_replies: u32,
    /// Latency baseline for transcripts of the current request.
    last_sent_at: Option<Instant>,
    level: Option<LevelSnapshot>,
    stats: TurnStats,
    turn_span: Span,
}

impl TurnController {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            noise: AdaptiveNoiseTracker::new(config.noise.clone()),
            vad: VoiceActivityDetector::new(config.vad.clone()),
            config,
            state: TurnState::Idle,
            epoch: Epoch::default(),
            next_seq: 0,
            connection_open: false,
            wants_active: false,
            connect_deadline: None,
            input_held: false,
            capture: None,
            pending: None,
            playing: None,
            capture_on_continue: false,
            paused_reply: false,
            abandoned_replies: 0,
            last_sent_at: None,
            level: None,
            stats: TurnStats::default(),
            turn_span: Span::none(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// True while the user wants a session, including while reconnecting.
    pub fn is_active(&self) -> bool {
        self.wants_active || self.state != TurnState::Idle
    }

    /// Derived flag: the assistant's reply is audible.
    pub fn assistant_audible(&self) -> bool {
        self.state == TurnState::Playing
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise.floor()
    }

    /// Level data from the latest frame.
    pub fn level(&self) -> Option<LevelSnapshot> {
        self.level
    }

    pub fn stats(&self) -> TurnStats {
        self.stats
    }

    /// Apply one input and return the resulting side effects.
    pub fn handle(&mut self, input: TurnInput, now: Instant) -> Vec<Effect> {
        let span = self.turn_span.clone();
        let _entered = span.enter();
        let mut fx = Vec::new();

        match input {
            TurnInput::Activate => self.activate(now, &mut fx),
            TurnInput::Deactivate => self.deactivate(&mut fx),
            TurnInput::Toggle => {
                if self.is_active() {
                    self.deactivate(&mut fx);
                } else {
                    self.activate(now, &mut fx);
                }
            }
            TurnInput::Frame(sample) => {
                self.check_timers(now, &mut fx);
                self.on_frame(sample, &mut fx);
            }
            TurnInput::Tick => self.check_timers(now, &mut fx),
            TurnInput::InputFailed { epoch, reason } => self.on_input_failed(epoch, reason, &mut fx),
            TurnInput::CaptureFinished { ticket, outcome } => {
                self.on_capture_finished(ticket, outcome, now, &mut fx)
            }
            TurnInput::CaptureFailed { ticket, reason } => {
                if self.take_pending_capture(ticket).is_some() {
                    warn!(?ticket, "capture failed: {reason}");
                    self.resume_listening(Some("capture failed"), &mut fx);
                    notice(&mut fx, NoticeKind::CaptureDropped, reason);
                }
            }
            TurnInput::TransmitFailed { reason } => self.on_transmit_failed(reason, &mut fx),
            TurnInput::Server(message) => self.on_server(message, now, &mut fx),
            TurnInput::TransportOpened => self.on_transport_opened(&mut fx),
            TurnInput::TransportClosed { clean } => self.on_transport_closed(clean, &mut fx),
            TurnInput::TransportUnavailable => {
                self.connection_open = false;
                if self.wants_active && self.state == TurnState::Idle {
                    self.wants_active = false;
                    self.connect_deadline = None;
                    notice(&mut fx, NoticeKind::ConnectionLost, "backend unreachable");
                }
            }
            TurnInput::Playback(event) => self.on_playback(event, &mut fx),
        }
        fx
    }

    // ── Activation lifecycle ─────────────────────────────────────────────────

    fn activate(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        if self.state != TurnState::Idle {
            return;
        }
        self.wants_active = true;
        if self.connection_open {
            self.begin_session(fx);
        } else if self.connect_deadline.is_none() {
            self.connect_deadline = Some(now + self.config.connect_timeout);
            fx.push(Effect::Connect);
            self.present_status(Some("connecting"), None, fx);
        }
    }

    fn begin_session(&mut self, fx: &mut Vec<Effect>) {
        self.epoch = Epoch(self.epoch.0 + 1);
        self.next_seq = 0;
        self.connect_deadline = None;
        self.noise.reset();
        self.vad.reset();
        self.capture = None;
        self.pending = None;
        self.playing = None;
        self.capture_on_continue = false;
        self.last_sent_at = None;
        self.input_held = true;
        info!(epoch = self.epoch.0, "session activated");
        fx.push(Effect::AcquireInput { epoch: self.epoch });
        self.enter(TurnState::Listening, None, None, fx);
    }

    fn deactivate(&mut self, fx: &mut Vec<Effect>) {
        self.wants_active = false;
        if self.connect_deadline.take().is_some() && self.state == TurnState::Idle {
            self.present_status(Some("cancelled"), None, fx);
        }
        self.shutdown(Some("deactivated"), fx);
    }

    /// Release everything in a fixed order: playback, input, capture.
    /// A no-op when nothing is held.
    fn shutdown(&mut self, detail: Option<&str>, fx: &mut Vec<Effect>) {
        if self.state == TurnState::Idle && !self.input_held {
            return;
        }
        let paused = std::mem::take(&mut self.paused_reply);
        if self.playing.take().is_some() || paused {
            fx.push(Effect::StopPlayback);
        }
        if self.input_held {
            self.input_held = false;
            fx.push(Effect::ReleaseInput);
        }
        if let Some(open) = self.capture.take() {
            fx.push(Effect::DiscardCapture(open.ticket));
        }
        if let Some(pending) = self.pending.take() {
            if pending.sent_at.is_some() {
                self.abandoned_replies += 1;
            }
        }
        self.capture_on_continue = false;
        self.noise.reset();
        self.vad.reset();
        self.level = None;
        self.epoch = Epoch(self.epoch.0 + 1);
        info!(epoch = self.epoch.0, ?detail, "session ended");
        self.enter(TurnState::Idle, detail, None, fx);
    }

    fn on_input_failed(&mut self, epoch: Epoch, reason: String, fx: &mut Vec<Effect>) {
        if epoch != self.epoch || !self.input_held {
            self.stats.stale_dropped += 1;
            return;
        }
        warn!(epoch = epoch.0, "microphone failed: {reason}");
        self.wants_active = false;
        self.shutdown(Some("microphone unavailable"), fx);
        notice(fx, NoticeKind::DeviceError, reason);
    }

    fn check_timers(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        if let Some(deadline) = self.connect_deadline {
            if now >= deadline && self.state == TurnState::Idle {
                warn!("backend did not open in time");
                self.connect_deadline = None;
                self.wants_active = false;
                self.present_status(Some("backend unreachable"), None, fx);
                notice(fx, NoticeKind::ConnectTimeout, "could not reach the assistant backend");
            }
        }

        match self.state {
            TurnState::Capturing => {
                if let Some(open) = self.capture {
                    if now.saturating_duration_since(open.opened_at) >= self.config.max_capture {
                        info!(ticket = ?open.ticket, "capture hit maximum duration");
                        self.vad.reset();
                        self.finalize_capture(now, fx);
                    }
                }
            }
            TurnState::AwaitingReply => {
                let (Some(timeout), Some(pending)) = (self.config.reply_timeout, self.pending) else {
                    return;
                };
                if now.saturating_duration_since(pending.since) >= timeout {
                    warn!(ticket = ?pending.ticket, "reply timed out");
                    if pending.sent_at.is_some() {
                        self.abandoned_replies += 1;
                    }
                    self.pending = None;
                    self.stats.reply_timeouts += 1;
                    self.resume_listening(Some("reply timed out"), fx);
                    notice(fx, NoticeKind::ReplyTimedOut, "the assistant did not answer in time");
                }
            }
            _ => {}
        }
    }

    // ── Detection ────────────────────────────────────────────────────────────

    fn on_frame(&mut self, sample: EnvelopeSample, fx: &mut Vec<Effect>) {
        if self.state == TurnState::Idle {
            return;
        }
        self.stats.frames += 1;

        let audible = self.assistant_audible();
        let guarded =
            !matches!(self.state, TurnState::Listening) || audible || self.vad.is_speaking();
        let floor = self.noise.update(&sample, guarded);
        let event = self.vad.evaluate(&sample, floor, audible);

        if let Some(t) = self.vad.thresholds() {
            self.level = Some(LevelSnapshot {
                rms: sample.rms,
                noise_floor: floor,
                start_threshold: t.start,
                stop_threshold: t.stop,
                barge_threshold: t.barge,
                speaking: self.vad.is_speaking(),
                assistant_audible: audible,
            });
        }

        if event == VadEvent::SpeechStart {
            self.stats.speech_starts += 1;
        }

        match (self.state, event) {
            (TurnState::Listening, VadEvent::SpeechStart) => {
                self.capture_on_continue = false;
                self.open_capture(sample.at, fx);
            }
            (TurnState::Listening, VadEvent::SpeechContinue) if self.capture_on_continue => {
                self.capture_on_continue = false;
                self.open_capture(sample.at, fx);
            }
            (TurnState::Listening, VadEvent::SpeechStop { .. } | VadEvent::SpeechRejectedTooShort { .. }) => {
                self.capture_on_continue = false;
            }
            (TurnState::Capturing, VadEvent::SpeechStop { speech_ms }) => {
                debug!(speech_ms, "speech stopped");
                self.finalize_capture(sample.at, fx);
            }
            (TurnState::Capturing, VadEvent::SpeechRejectedTooShort { speech_ms }) => {
                debug!(speech_ms, "episode too short, discarding capture");
                self.stats.episodes_rejected += 1;
                if let Some(open) = self.capture.take() {
                    fx.push(Effect::DiscardCapture(open.ticket));
                }
                self.resume_listening(None, fx);
            }
            (TurnState::Playing, VadEvent::SpeechStart) => {
                // Silence the assistant before anything else touches the new episode.
                fx.push(Effect::PausePlayback);
                let paused = self.playing.take();
                info!(ticket = ?paused, rms = sample.rms, "barge-in");
                self.stats.barge_ins += 1;
                self.paused_reply = paused.is_some();
                self.resume_listening(Some("barge-in"), fx);
            }
            _ => {}
        }
    }

    fn open_capture(&mut self, at: Instant, fx: &mut Vec<Effect>) {
        if self.capture.is_some() {
            return;
        }
        let ticket = Ticket {
            epoch: self.epoch,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.turn_span = info_span!("turn", epoch = ticket.epoch.0, turn = ticket.seq);
        self.capture = Some(OpenCapture {
            ticket,
            opened_at: at,
        });
        {
            let _entered = self.turn_span.enter();
            debug!("capture opened");
        }
        fx.push(Effect::BeginCapture(ticket));
        self.enter(TurnState::Capturing, None, None, fx);
    }

    fn finalize_capture(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        let Some(open) = self.capture.take() else {
            return;
        };
        self.pending = Some(PendingReply {
            ticket: open.ticket,
            sent_at: None,
            since: now,
        });
        fx.push(Effect::FinalizeCapture(open.ticket));
        self.enter(TurnState::AwaitingReply, Some("processing"), None, fx);
    }

    // ── Completions ──────────────────────────────────────────────────────────

    /// The pending reply, if `ticket` is the capture it is still encoding.
    fn take_pending_capture(&mut self, ticket: Ticket) -> Option<PendingReply> {
        match self.pending {
            Some(p) if p.ticket == ticket && p.sent_at.is_none() => {
                self.pending = None;
                Some(p)
            }
            _ => {
                debug!(?ticket, "dropping stale capture completion");
                self.stats.stale_dropped += 1;
                None
            }
        }
    }

    fn on_capture_finished(
        &mut self,
        ticket: Ticket,
        outcome: CaptureOutcome,
        now: Instant,
        fx: &mut Vec<Effect>,
    ) {
        let Some(pending) = self.take_pending_capture(ticket) else {
            return;
        };
        match outcome {
            CaptureOutcome::TooSmall { bytes } => {
                debug!(bytes, "capture below size floor, not sent");
                self.stats.captures_too_small += 1;
                self.resume_listening(None, fx);
            }
            CaptureOutcome::Blob(blob) if self.connection_open => {
                info!(
                    bytes = blob.bytes.len(),
                    duration_ms = blob.duration.as_millis() as u64,
                    "sending capture"
                );
                fx.push(Effect::Transmit(ClientMessage::audio(&blob)));
                self.stats.captures_sent += 1;
                self.last_sent_at = Some(now);
                self.pending = Some(PendingReply {
                    sent_at: Some(now),
                    ..pending
                });
            }
            CaptureOutcome::Blob(_) => {
                warn!("transport not open, dropping capture");
                self.resume_listening(None, fx);
                notice(fx, NoticeKind::CaptureDropped, "not connected to the assistant");
            }
        }
    }

    fn on_transmit_failed(&mut self, reason: String, fx: &mut Vec<Effect>) {
        match self.pending {
            Some(p) if self.state == TurnState::AwaitingReply && p.sent_at.is_some() => {
                warn!(ticket = ?p.ticket, "capture never left: {reason}");
                self.pending = None;
                self.last_sent_at = None;
                self.resume_listening(Some("send failed"), fx);
                notice(fx, NoticeKind::CaptureDropped, reason);
            }
            _ => self.stats.stale_dropped += 1,
        }
    }

    fn on_server(&mut self, message: ServerMessage, now: Instant, fx: &mut Vec<Effect>) {
        match message {
            ServerMessage::Transcription { text } => {
                let latency_ms = self.latency_since_send(now);
                fx.push(Effect::Present(Presentation::Transcript {
                    role: Speaker::User,
                    text,
                    latency_ms,
                }));
            }
            ServerMessage::Response { text } => {
                let latency_ms = self.latency_since_send(now);
                fx.push(Effect::Present(Presentation::Transcript {
                    role: Speaker::Assistant,
                    text,
                    latency_ms,
                }));
            }
            ServerMessage::SearchStarted { message } => {
                fx.push(Effect::PlayCue);
                notice(
                    fx,
                    NoticeKind::Searching,
                    message.unwrap_or_else(|| "Searching the web...".into()),
                );
            }
            ServerMessage::Audio { audio } => self.on_reply_audio(audio, now, fx),
            ServerMessage::Error { message } => {
                if self.abandoned_replies > 0 {
                    self.abandoned_replies -= 1;
                    self.stats.stale_dropped += 1;
                    debug!("error for an abandoned request: {message}");
                    return;
                }
                warn!("backend error: {message}");
                match self.state {
                    TurnState::Capturing => {
                        if let Some(open) = self.capture.take() {
                            fx.push(Effect::DiscardCapture(open.ticket));
                        }
                        self.vad.reset();
                        self.resume_listening(Some("backend error"), fx);
                    }
                    TurnState::AwaitingReply => {
                        self.pending = None;
                        self.resume_listening(Some("backend error"), fx);
                    }
                    _ => {}
                }
                notice(fx, NoticeKind::ServerError, message);
            }
        }
    }

    fn on_reply_audio(&mut self, audio: String, now: Instant, fx: &mut Vec<Effect>) {
        if self.abandoned_replies > 0 {
            self.abandoned_replies -= 1;
            self.stats.stale_dropped += 1;
            info!("skipping reply to an abandoned request");
            return;
        }
        let pending = match self.pending {
            Some(p) if self.state == TurnState::AwaitingReply && p.sent_at.is_some() => p,
            _ => {
                debug!(state = self.state.as_str(), "unexpected reply audio, ignoring");
                self.stats.stale_dropped += 1;
                return;
            }
        };
        self.pending = None;

        let bytes = match decode_audio(&audio) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("reply audio undecodable: {e}");
                self.resume_listening(Some("reply unplayable"), fx);
                notice(fx, NoticeKind::PlaybackError, e.to_string());
                return;
            }
        };

        let latency_ms = pending
            .sent_at
            .map(|sent| duration_ms(now.saturating_duration_since(sent)));
        info!(?latency_ms, bytes = bytes.len(), "reply received");
        self.stats.replies_played += 1;
        // Speech picked up while waiting must not carry into barge-in detection.
        self.vad.reset();
        self.paused_reply = false;
        self.playing = Some(pending.ticket);
        fx.push(Effect::PlayReply {
            ticket: pending.ticket,
            audio: bytes,
        });
        self.enter(TurnState::Playing, None, latency_ms, fx);
    }

    fn on_playback(&mut self, event: PlaybackEvent, fx: &mut Vec<Effect>) {
        let ticket = event.ticket();
        if self.playing != Some(ticket) {
            if !matches!(event, PlaybackEvent::Started(_)) {
                self.stats.stale_dropped += 1;
            }
            return;
        }
        match event {
            PlaybackEvent::Started(_) => debug!(?ticket, "reply playing"),
            PlaybackEvent::Ended(_) => {
                self.playing = None;
                self.resume_listening(None, fx);
            }
            PlaybackEvent::Failed(_, reason) => {
                warn!(?ticket, "reply playback failed: {reason}");
                self.playing = None;
                self.resume_listening(Some("playback failed"), fx);
                notice(fx, NoticeKind::PlaybackError, reason);
            }
        }
    }

    // ── Transport ────────────────────────────────────────────────────────────

    fn on_transport_opened(&mut self, fx: &mut Vec<Effect>) {
        self.connection_open = true;
        self.abandoned_replies = 0;
        if self.state == TurnState::Idle && self.wants_active {
            info!("transport open, starting session");
            self.begin_session(fx);
        }
    }

    fn on_transport_closed(&mut self, clean: bool, fx: &mut Vec<Effect>) {
        self.connection_open = false;
        self.abandoned_replies = 0;
        let was_active = self.state != TurnState::Idle;
        let resume = self.wants_active && !clean && self.config.resume_on_reconnect;
        self.wants_active = resume;
        if !resume {
            self.connect_deadline = None;
        }
        if was_active {
            self.close_turn_span();
            self.shutdown(Some("connection lost"), fx);
            let message = if resume {
                "connection lost, reconnecting"
            } else {
                "connection closed"
            };
            notice(fx, NoticeKind::ConnectionLost, message);
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn latency_since_send(&self, now: Instant) -> Option<u64> {
        if self.abandoned_replies > 0 {
            return None;
        }
        self.last_sent_at
            .map(|sent| duration_ms(now.saturating_duration_since(sent)))
    }

    /// Back to `Listening` once a turn is over. An episode the detector still
    /// holds open is captured on its next crossing instead of being lost.
    fn resume_listening(&mut self, detail: Option<&str>, fx: &mut Vec<Effect>) {
        self.close_turn_span();
        self.capture_on_continue = self.vad.is_speaking();
        self.enter(TurnState::Listening, detail, None, fx);
    }

    fn enter(
        &mut self,
        next: TurnState,
        detail: Option<&str>,
        latency_ms: Option<u64>,
        fx: &mut Vec<Effect>,
    ) {
        if next != self.state {
            debug!(from = self.state.as_str(), to = next.as_str(), "turn state");
        }
        self.state = next;
        self.present_status(detail, latency_ms, fx);
    }

    fn present_status(&self, detail: Option<&str>, latency_ms: Option<u64>, fx: &mut Vec<Effect>) {
        fx.push(Effect::Present(Presentation::Status(TurnStatusEvent {
            state: self.state,
            detail: detail.map(str::to_string),
            latency_ms,
        })));
    }

    fn close_turn_span(&mut self) {
        self.turn_span = Span::none();
    }
}

fn notice(fx: &mut Vec<Effect>, kind: NoticeKind, message: impl Into<String>) {
    fx.push(Effect::Present(Presentation::Notice(NoticeEvent::new(kind, message))));
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
