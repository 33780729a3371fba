use std::time::{Duration, Instant};

use approx::assert_abs_diff_eq;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parley_core::audio::envelope::EnvelopeSample;
use parley_core::capture::{AudioBlob, CaptureOutcome, WAV_MIME};
use parley_core::ipc::events::{NoticeKind, Speaker};
use parley_core::playback::PlaybackEvent;
use parley_core::transport::{ClientMessage, ServerMessage};
use parley_core::turn::{
    Effect, Presentation, Ticket, TurnConfig, TurnController, TurnInput, TurnState,
};

const FRAME: Duration = Duration::from_millis(16);
const QUIET: f32 = 0.004;
const LOUD: f32 = 0.1;

struct Harness {
    turn: TurnController,
    now: Instant,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(TurnConfig::default())
    }

    fn with_config(config: TurnConfig) -> Self {
        Self {
            turn: TurnController::new(config),
            now: Instant::now(),
        }
    }

    /// Connected and listening.
    fn listening() -> Self {
        let mut h = Self::new();
        h.input(TurnInput::TransportOpened);
        let fx = h.input(TurnInput::Activate);
        assert!(matches!(fx[0], Effect::AcquireInput { .. }));
        assert_eq!(h.turn.state(), TurnState::Listening);
        h
    }

    fn input(&mut self, input: TurnInput) -> Vec<Effect> {
        self.turn.handle(input, self.now)
    }

    fn frame(&mut self, rms: f32) -> Vec<Effect> {
        self.now += FRAME;
        let sample = EnvelopeSample::new(rms, self.now);
        self.turn.handle(TurnInput::Frame(sample), self.now)
    }

    fn frames(&mut self, rms: f32, count: usize) -> Vec<Effect> {
        (0..count).flat_map(|_| self.frame(rms)).collect()
    }

    fn advance(&mut self, by: Duration) -> Vec<Effect> {
        self.now += by;
        self.input(TurnInput::Tick)
    }

    /// Speak for `speech_frames`, then stay quiet until the episode resolves.
    fn utterance(&mut self, speech_frames: usize) -> Vec<Effect> {
        let mut fx = self.frames(LOUD, speech_frames);
        fx.extend(self.frames(QUIET, 30));
        fx
    }

    /// Listening → AwaitingReply with the capture already transmitted.
    fn awaiting_sent_reply() -> (Self, Ticket) {
        let mut h = Self::listening();
        h.frames(QUIET, 10);
        let fx = h.utterance(32);
        let ticket = finalized(&fx).expect("utterance should finalize");
        let fx = h.input(TurnInput::CaptureFinished {
            ticket,
            outcome: CaptureOutcome::Blob(blob(4_000)),
        });
        assert!(fx.iter().any(|e| matches!(e, Effect::Transmit(_))));
        assert_eq!(h.turn.state(), TurnState::AwaitingReply);
        (h, ticket)
    }

    fn playing() -> (Self, Ticket) {
        let (mut h, ticket) = Self::awaiting_sent_reply();
        let fx = h.input(TurnInput::Server(reply_audio(2_048)));
        assert!(fx.iter().any(|e| matches!(e, Effect::PlayReply { .. })));
        h.input(TurnInput::Playback(PlaybackEvent::Started(ticket)));
        assert_eq!(h.turn.state(), TurnState::Playing);
        (h, ticket)
    }
}

fn blob(len: usize) -> AudioBlob {
    AudioBlob {
        bytes: vec![7u8; len],
        mime: WAV_MIME.into(),
        duration: Duration::from_millis(500),
    }
}

fn reply_audio(len: usize) -> ServerMessage {
    ServerMessage::Audio {
        audio: STANDARD.encode(vec![0x55u8; len]),
    }
}

fn began(fx: &[Effect]) -> Vec<Ticket> {
    fx.iter()
        .filter_map(|e| match e {
            Effect::BeginCapture(t) => Some(*t),
            _ => None,
        })
        .collect()
}

fn finalized(fx: &[Effect]) -> Option<Ticket> {
    fx.iter().find_map(|e| match e {
        Effect::FinalizeCapture(t) => Some(*t),
        _ => None,
    })
}

fn notices(fx: &[Effect]) -> Vec<NoticeKind> {
    fx.iter()
        .filter_map(|e| match e {
            Effect::Present(Presentation::Notice(n)) => Some(n.kind),
            _ => None,
        })
        .collect()
}

// ── Detection ───────────────────────────────────────────────────────────────

#[test]
fn steady_background_converges_without_speech() {
    let mut h = Harness::listening();
    let fx = h.frames(0.02, 300);

    assert!(began(&fx).is_empty());
    assert_eq!(h.turn.state(), TurnState::Listening);
    assert_abs_diff_eq!(h.turn.noise_floor(), 0.02, epsilon = 1e-3);
    let level = h.turn.level().expect("level after frames");
    assert!(level.start_threshold > 0.02);
}

#[test]
fn half_second_utterance_is_captured_and_sent() {
    let mut h = Harness::listening();
    h.frames(QUIET, 10);

    let fx = h.frame(LOUD);
    let opened = began(&fx);
    assert_eq!(opened.len(), 1);
    assert_eq!(h.turn.state(), TurnState::Capturing);

    let mut fx = h.frames(LOUD, 31);
    // The first 25 quiet frames stay within the 400 ms silence window.
    fx.extend(h.frames(QUIET, 25));
    assert!(finalized(&fx).is_none());
    assert_eq!(h.turn.state(), TurnState::Capturing);

    let fx = h.frames(QUIET, 2);
    assert_eq!(finalized(&fx), Some(opened[0]));
    assert_eq!(h.turn.state(), TurnState::AwaitingReply);

    let fx = h.input(TurnInput::CaptureFinished {
        ticket: opened[0],
        outcome: CaptureOutcome::Blob(blob(16_044)),
    });
    let sent = fx.iter().find_map(|e| match e {
        Effect::Transmit(ClientMessage::Audio { audio, mime }) => Some((audio, mime)),
        _ => None,
    });
    let (audio, mime) = sent.expect("capture transmitted");
    assert_eq!(mime, WAV_MIME);
    assert_eq!(STANDARD.decode(audio).expect("valid base64").len(), 16_044);
    assert_eq!(h.turn.stats().captures_sent, 1);
}

#[test]
fn short_burst_is_rejected_and_discarded() {
    let mut h = Harness::listening();
    h.frames(QUIET, 10);
    // 9 frames ≈ 144 ms of speech.
    let fx = h.utterance(9);

    let opened = began(&fx);
    assert_eq!(opened.len(), 1);
    assert!(finalized(&fx).is_none());
    assert!(fx.contains(&Effect::DiscardCapture(opened[0])));
    assert_eq!(h.turn.state(), TurnState::Listening);
    assert_eq!(h.turn.stats().episodes_rejected, 1);
}

#[test]
fn chatter_inside_hysteresis_band_keeps_one_episode() {
    let mut h = Harness::listening();
    h.frames(QUIET, 10);
    let mut fx = h.frame(0.05);
    for i in 0..100 {
        fx.extend(h.frame(if i % 2 == 0 { 0.03 } else { 0.02 }));
    }

    assert_eq!(began(&fx).len(), 1);
    assert!(finalized(&fx).is_none());
    assert!(!fx.iter().any(|e| matches!(e, Effect::DiscardCapture(_))));
    assert_eq!(h.turn.state(), TurnState::Capturing);

    let fx = h.frames(QUIET, 30);
    assert!(finalized(&fx).is_some());
}

#[test]
fn speech_while_awaiting_reply_is_not_captured() {
    let (mut h, _) = Harness::awaiting_sent_reply();
    let fx = h.utterance(40);
    assert!(began(&fx).is_empty());
    assert_eq!(h.turn.state(), TurnState::AwaitingReply);
}

#[test]
fn speech_started_while_awaiting_is_captured_after_a_server_error() {
    let (mut h, _) = Harness::awaiting_sent_reply();
    let fx = h.frames(LOUD, 5);
    assert!(began(&fx).is_empty());

    h.input(TurnInput::Server(ServerMessage::Error {
        message: "model overloaded".into(),
    }));
    assert_eq!(h.turn.state(), TurnState::Listening);

    // The user never paused, yet the episode is picked up on its next frame.
    let fx = h.frame(LOUD);
    assert_eq!(began(&fx).len(), 1);
    assert_eq!(h.turn.state(), TurnState::Capturing);

    let fx = h.utterance(20);
    assert!(finalized(&fx).is_some());
    assert_eq!(h.turn.state(), TurnState::AwaitingReply);
}

#[test]
fn speech_started_while_awaiting_is_captured_after_a_reply_timeout() {
    let (mut h, _) = Harness::awaiting_sent_reply();
    h.frames(LOUD, 5);

    let fx = h.advance(Duration::from_secs(20));
    assert_eq!(notices(&fx), vec![NoticeKind::ReplyTimedOut]);

    let fx = h.frames(LOUD, 3);
    assert_eq!(began(&fx).len(), 1);
    assert_eq!(h.turn.state(), TurnState::Capturing);
}

#[test]
fn silence_while_awaiting_leaves_nothing_to_capture() {
    let (mut h, _) = Harness::awaiting_sent_reply();
    h.frames(QUIET, 5);
    h.input(TurnInput::Server(ServerMessage::Error {
        message: "model overloaded".into(),
    }));

    // A fresh episode still needs its own start crossing.
    let fx = h.frames(QUIET, 20);
    assert!(began(&fx).is_empty());
    let fx = h.frame(LOUD);
    assert_eq!(began(&fx).len(), 1);
}

#[test]
fn noise_floor_is_frozen_outside_quiet_listening() {
    // Awaiting a reply: noise below the start threshold does not adapt the floor.
    let (mut h, _) = Harness::awaiting_sent_reply();
    let floor = h.turn.noise_floor();
    h.frames(0.015, 200);
    assert_abs_diff_eq!(h.turn.noise_floor(), floor, epsilon = 1e-7);
    assert_eq!(h.turn.state(), TurnState::AwaitingReply);

    // Capturing: a short dip below the stop threshold is not room noise.
    let mut h = Harness::listening();
    h.frames(QUIET, 10);
    h.frames(LOUD, 5);
    assert_eq!(h.turn.state(), TurnState::Capturing);
    let floor = h.turn.noise_floor();
    h.frames(0.012, 10);
    assert_abs_diff_eq!(h.turn.noise_floor(), floor, epsilon = 1e-7);
    assert_eq!(h.turn.state(), TurnState::Capturing);

    // Playing: the assistant's own voice below the barge threshold.
    let (mut h, _) = Harness::playing();
    let floor = h.turn.noise_floor();
    h.frames(0.03, 200);
    assert_abs_diff_eq!(h.turn.noise_floor(), floor, epsilon = 1e-7);
    assert_eq!(h.turn.state(), TurnState::Playing);
}

#[test]
fn capture_is_force_finalized_at_max_duration() {
    let mut h = Harness::with_config(TurnConfig {
        max_capture: Duration::from_secs(2),
        ..TurnConfig::default()
    });
    h.input(TurnInput::TransportOpened);
    h.input(TurnInput::Activate);
    h.frames(QUIET, 5);

    let fx = h.frames(LOUD, 200);
    let opened = began(&fx);
    assert_eq!(opened.len(), 1);
    assert_eq!(finalized(&fx), Some(opened[0]));
    assert_eq!(h.turn.state(), TurnState::AwaitingReply);
}

// ── Replies and barge-in ─────────────────────────────────────────────────────

#[test]
fn reply_plays_then_returns_to_listening() {
    let (mut h, ticket) = Harness::awaiting_sent_reply();

    let fx = h.input(TurnInput::Server(ServerMessage::Transcription {
        text: "what's the weather".into(),
    }));
    assert!(matches!(
        &fx[0],
        Effect::Present(Presentation::Transcript { role: Speaker::User, latency_ms: Some(_), .. })
    ));

    let fx = h.input(TurnInput::Server(reply_audio(2_048)));
    let played = fx.iter().find_map(|e| match e {
        Effect::PlayReply { ticket, audio } => Some((*ticket, audio.len())),
        _ => None,
    });
    assert_eq!(played, Some((ticket, 2_048)));
    assert!(h.turn.assistant_audible());

    let fx = h.input(TurnInput::Playback(PlaybackEvent::Ended(ticket)));
    assert!(!fx.is_empty());
    assert_eq!(h.turn.state(), TurnState::Listening);
    assert!(!h.turn.assistant_audible());
}

#[test]
fn barge_in_needs_the_elevated_threshold() {
    let (mut h, _) = Harness::playing();
    let level = {
        h.frame(QUIET);
        h.turn.level().expect("level while playing")
    };
    assert!(level.barge_threshold > level.start_threshold);
    assert!(level.assistant_audible);

    // Above the plain start threshold, below the barge threshold.
    let between = (level.start_threshold + level.barge_threshold) / 2.0;
    let fx = h.frames(between, 10);
    assert!(!fx.contains(&Effect::PausePlayback));
    assert_eq!(h.turn.state(), TurnState::Playing);
}

#[test]
fn barge_in_pauses_before_anything_else() {
    let (mut h, ticket) = Harness::playing();
    h.frames(QUIET, 5);

    let fx = h.frame(LOUD);
    assert_eq!(fx.first(), Some(&Effect::PausePlayback));
    assert_eq!(h.turn.state(), TurnState::Listening);
    assert!(!h.turn.assistant_audible());
    assert_eq!(h.turn.stats().barge_ins, 1);

    // The same episode opens a capture on its next crossing.
    let fx = h.frame(LOUD);
    assert_eq!(began(&fx).len(), 1);
    assert_eq!(h.turn.state(), TurnState::Capturing);

    // Completion of the paused reply is stale.
    let fx = h.input(TurnInput::Playback(PlaybackEvent::Ended(ticket)));
    assert!(fx.is_empty());
    assert_eq!(h.turn.state(), TurnState::Capturing);
}

#[test]
fn playback_failure_returns_to_listening_with_notice() {
    let (mut h, ticket) = Harness::playing();
    let fx = h.input(TurnInput::Playback(PlaybackEvent::Failed(
        ticket,
        "decoder error".into(),
    )));
    assert_eq!(notices(&fx), vec![NoticeKind::PlaybackError]);
    assert_eq!(h.turn.state(), TurnState::Listening);
}

#[test]
fn server_error_while_awaiting_returns_to_listening() {
    let (mut h, _) = Harness::awaiting_sent_reply();
    let fx = h.input(TurnInput::Server(ServerMessage::Error {
        message: "model overloaded".into(),
    }));
    assert_eq!(notices(&fx), vec![NoticeKind::ServerError]);
    assert_eq!(h.turn.state(), TurnState::Listening);
}

#[test]
fn reply_timeout_abandons_the_request() {
    let (mut h, _) = Harness::awaiting_sent_reply();
    assert!(notices(&h.advance(Duration::from_secs(19))).is_empty());

    let fx = h.advance(Duration::from_secs(1));
    assert_eq!(notices(&fx), vec![NoticeKind::ReplyTimedOut]);
    assert_eq!(h.turn.state(), TurnState::Listening);
    assert_eq!(h.turn.stats().reply_timeouts, 1);

    // The late reply is skipped.
    let fx = h.input(TurnInput::Server(reply_audio(2_048)));
    assert!(fx.is_empty());
    assert_eq!(h.turn.state(), TurnState::Listening);
}

#[test]
fn failed_send_returns_to_listening() {
    let (mut h, _) = Harness::awaiting_sent_reply();
    let fx = h.input(TurnInput::TransmitFailed {
        reason: "transport unavailable".into(),
    });
    assert_eq!(notices(&fx), vec![NoticeKind::CaptureDropped]);
    assert_eq!(h.turn.state(), TurnState::Listening);

    // Nothing is owed for a request that never left.
    let fx = h.input(TurnInput::Server(reply_audio(2_048)));
    assert!(!fx.iter().any(|e| matches!(e, Effect::PlayReply { .. })));
    assert_eq!(h.turn.state(), TurnState::Listening);

    // A second failure report has nothing to act on.
    assert!(h
        .input(TurnInput::TransmitFailed {
            reason: "transport unavailable".into(),
        })
        .is_empty());
}

#[test]
fn too_small_capture_is_not_sent() {
    let mut h = Harness::listening();
    h.frames(QUIET, 10);
    let ticket = finalized(&h.utterance(32)).expect("finalized");
    let fx = h.input(TurnInput::CaptureFinished {
        ticket,
        outcome: CaptureOutcome::TooSmall { bytes: 44 },
    });
    assert!(!fx.iter().any(|e| matches!(e, Effect::Transmit(_))));
    assert_eq!(h.turn.state(), TurnState::Listening);
    assert_eq!(h.turn.stats().captures_too_small, 1);
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[test]
fn deactivation_is_ordered_and_idempotent() {
    let (mut h, _) = Harness::playing();
    h.frames(QUIET, 3);

    let fx = h.input(TurnInput::Deactivate);
    let order: Vec<_> = fx
        .iter()
        .filter(|e| !matches!(e, Effect::Present(_)))
        .cloned()
        .collect();
    assert_eq!(order, vec![Effect::StopPlayback, Effect::ReleaseInput]);
    assert_eq!(h.turn.state(), TurnState::Idle);

    assert!(h.input(TurnInput::Deactivate).is_empty());
}

#[test]
fn deactivation_after_barge_in_stops_the_paused_reply() {
    let (mut h, _) = Harness::playing();
    h.frames(QUIET, 5);
    let fx = h.frame(LOUD);
    assert_eq!(fx.first(), Some(&Effect::PausePlayback));

    let fx = h.input(TurnInput::Deactivate);
    let order: Vec<_> = fx
        .iter()
        .filter(|e| !matches!(e, Effect::Present(_)))
        .cloned()
        .collect();
    assert_eq!(order, vec![Effect::StopPlayback, Effect::ReleaseInput]);

    // Once stopped, a later session does not stop it again.
    h.input(TurnInput::Activate);
    let fx = h.input(TurnInput::Deactivate);
    assert!(!fx.contains(&Effect::StopPlayback));
}

#[test]
fn deactivation_mid_capture_discards_after_releasing_input() {
    let mut h = Harness::listening();
    h.frames(QUIET, 5);
    let ticket = began(&h.frames(LOUD, 5))[0];

    let fx = h.input(TurnInput::Deactivate);
    let order: Vec<_> = fx
        .iter()
        .filter(|e| !matches!(e, Effect::Present(_)))
        .cloned()
        .collect();
    assert_eq!(order, vec![Effect::ReleaseInput, Effect::DiscardCapture(ticket)]);
}

#[test]
fn reactivation_starts_from_a_clean_baseline() {
    let mut h = Harness::listening();
    let baseline = h.turn.noise_floor();
    let fx = h.frames(0.015, 200);
    assert!(began(&fx).is_empty());
    assert!(h.turn.noise_floor() > baseline);

    h.input(TurnInput::Deactivate);
    h.input(TurnInput::Activate);
    assert_eq!(h.turn.noise_floor(), baseline);
    assert_eq!(h.turn.state(), TurnState::Listening);
    assert!(h.turn.level().is_none());
}

#[test]
fn completions_from_a_previous_activation_are_dropped() {
    let mut h = Harness::listening();
    h.frames(QUIET, 10);
    let ticket = finalized(&h.utterance(32)).expect("finalized");

    h.input(TurnInput::Deactivate);
    h.input(TurnInput::Activate);
    let fx = h.input(TurnInput::CaptureFinished {
        ticket,
        outcome: CaptureOutcome::Blob(blob(4_000)),
    });
    assert!(fx.is_empty());
    assert_eq!(h.turn.state(), TurnState::Listening);
    assert_eq!(h.turn.stats().stale_dropped, 1);
}

#[test]
fn reply_to_an_exited_session_does_not_play() {
    let (mut h, _) = Harness::awaiting_sent_reply();
    h.input(TurnInput::Deactivate);
    h.input(TurnInput::Activate);

    let fx = h.input(TurnInput::Server(reply_audio(2_048)));
    assert!(!fx.iter().any(|e| matches!(e, Effect::PlayReply { .. })));
    assert_eq!(h.turn.state(), TurnState::Listening);
}

#[test]
fn unclean_drop_resumes_after_reconnect() {
    let mut h = Harness::listening();
    let fx = h.input(TurnInput::TransportClosed { clean: false });
    assert!(fx.contains(&Effect::ReleaseInput));
    assert_eq!(notices(&fx), vec![NoticeKind::ConnectionLost]);
    assert_eq!(h.turn.state(), TurnState::Idle);
    assert!(h.turn.is_active());

    let fx = h.input(TurnInput::TransportOpened);
    assert!(matches!(fx[0], Effect::AcquireInput { .. }));
    assert_eq!(h.turn.state(), TurnState::Listening);
}

#[test]
fn clean_close_ends_the_session() {
    let mut h = Harness::listening();
    h.input(TurnInput::TransportClosed { clean: true });
    assert_eq!(h.turn.state(), TurnState::Idle);
    assert!(!h.turn.is_active());

    h.input(TurnInput::TransportOpened);
    assert_eq!(h.turn.state(), TurnState::Idle);
}

#[test]
fn search_notice_plays_cue_in_any_state() {
    let (mut h, _) = Harness::awaiting_sent_reply();
    let fx = h.input(TurnInput::Server(ServerMessage::SearchStarted { message: None }));
    assert_eq!(fx[0], Effect::PlayCue);
    assert_eq!(notices(&fx), vec![NoticeKind::Searching]);
    assert_eq!(h.turn.state(), TurnState::AwaitingReply);
}
