//! Blocking frame loop.
//!
//! ## Per-frame stages
//!
//! ```text
//! 1. Drain engine commands, transport events, and finished encodes
//! 2. Poll the reply player for completion
//! 3. Drain the microphone ring into the analysis window (and open capture)
//! 4. Envelope sample → TurnController → effects
//! 5. Broadcast the level snapshot, sleep out the rest of the frame
//! ```
//!
//! Everything that touches turn state funnels through [`Driver::dispatch`],
//! which feeds the controller one input at a time and carries out the
//! returned effects in order. Effects that produce follow-up input (a failed
//! microphone open, a playback start) queue it behind the current input.
//!
//! This loop runs in `spawn_blocking`; the microphone stream and the audio
//! output are created and dropped on this thread.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc, Arc,
};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{monitor::LevelMonitor, Broadcasts, EngineCommand, EngineConfig, EngineDiagnostics};
use crate::{
    audio::{
        envelope::{AnalysisWindow, EnvelopeSampler},
        MicrophoneStream,
    },
    buffering::{create_audio_ring, drain_into, AudioConsumer},
    capture::{CaptureOutcome, CaptureRecorder, CaptureSession},
    ipc::events::{ActivityEvent, TranscriptEvent},
    playback::{default_backend, PlaybackEvent, ReplayPlayer},
    transport::{TransportEvent, TransportHandle},
    turn::{Effect, Epoch, Presentation, Ticket, TurnController, TurnInput, TurnState},
};

/// Scratch size for each ring `pop_slice`.
const DRAIN_CHUNK: usize = 1024;

pub(crate) struct DriverContext {
    pub config: EngineConfig,
    pub running: Arc<AtomicBool>,
    pub state: Arc<Mutex<TurnState>>,
    pub commands: Receiver<EngineCommand>,
    pub transport_events: Receiver<TransportEvent>,
    pub transport: TransportHandle,
    pub broadcasts: Broadcasts,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<EngineDiagnostics>,
}

struct Microphone {
    stream: MicrophoneStream,
    consumer: AudioConsumer,
    epoch: Epoch,
    /// Failure already reported to the controller.
    reported: bool,
}

struct Driver {
    ctx: DriverContext,
    turn: TurnController,
    player: ReplayPlayer,
    mic: Option<Microphone>,
    window: AnalysisWindow,
    sampler: EnvelopeSampler,
    recorder: CaptureRecorder,
    scratch: Vec<f32>,
    block: Vec<f32>,
    pending: VecDeque<TurnInput>,
    encoded_tx: Sender<TurnInput>,
    encoded_rx: Receiver<TurnInput>,
    monitor: LevelMonitor,
    activity_seq: u64,
}

/// Run until `ctx.running` becomes false.
pub(crate) fn run(ctx: DriverContext, ready: mpsc::Sender<()>) {
    let (encoded_tx, encoded_rx) = crossbeam_channel::unbounded();
    let window = ctx.config.analysis_window;
    let mut driver = Driver {
        turn: TurnController::new(ctx.config.turn_config()),
        player: ReplayPlayer::new(default_backend()),
        mic: None,
        window: AnalysisWindow::new(window),
        sampler: EnvelopeSampler::new(window),
        recorder: CaptureRecorder::new(),
        scratch: vec![0.0; DRAIN_CHUNK],
        block: Vec::with_capacity(DRAIN_CHUNK * 4),
        pending: VecDeque::new(),
        encoded_tx,
        encoded_rx,
        monitor: LevelMonitor::default(),
        activity_seq: 0,
        ctx,
    };
    info!("frame loop started");
    let _ = ready.send(());

    while driver.ctx.running.load(Ordering::Relaxed) {
        let frame_start = Instant::now();
        driver.tick(frame_start);
        let elapsed = frame_start.elapsed();
        if let Some(rest) = driver.ctx.config.frame_interval.checked_sub(elapsed) {
            std::thread::sleep(rest);
        } else {
            debug!(elapsed_ms = elapsed.as_millis() as u64, "frame overran");
        }
    }

    driver.dispatch(TurnInput::Deactivate);
    let snap = driver.ctx.diagnostics.snapshot();
    info!(
        frames = snap.frames,
        captures_sent = snap.captures_sent,
        replies = snap.replies_played,
        barge_ins = snap.barge_ins,
        rejected = snap.episodes_rejected,
        stale_dropped = snap.stale_dropped,
        "frame loop stopped"
    );
}

impl Driver {
    fn tick(&mut self, now: Instant) {
        while let Ok(command) = self.ctx.commands.try_recv() {
            let input = match command {
                EngineCommand::Activate => TurnInput::Activate,
                EngineCommand::Deactivate => TurnInput::Deactivate,
                EngineCommand::Toggle => TurnInput::Toggle,
            };
            self.dispatch(input);
        }

        while let Ok(event) = self.ctx.transport_events.try_recv() {
            let input = match event {
                TransportEvent::Opened => TurnInput::TransportOpened,
                TransportEvent::Closed { clean } => TurnInput::TransportClosed { clean },
                TransportEvent::Unavailable => TurnInput::TransportUnavailable,
                TransportEvent::Message(message) => {
                    self.ctx.diagnostics.messages_in.fetch_add(1, Ordering::Relaxed);
                    TurnInput::Server(message)
                }
            };
            self.dispatch(input);
        }

        while let Ok(input) = self.encoded_rx.try_recv() {
            self.dispatch(input);
        }

        if let Some(event) = self.player.poll() {
            self.dispatch(TurnInput::Playback(event));
        }

        let failed = self.mic.as_mut().and_then(|mic| {
            if mic.stream.has_failed() && !mic.reported {
                mic.reported = true;
                Some(mic.epoch)
            } else {
                None
            }
        });
        if let Some(epoch) = failed {
            self.ctx.diagnostics.input_failures.fetch_add(1, Ordering::Relaxed);
            self.dispatch(TurnInput::InputFailed {
                epoch,
                reason: "input device stopped delivering audio".into(),
            });
        }

        if self.mic.is_none() {
            self.dispatch(TurnInput::Tick);
            return;
        }

        self.block.clear();
        let n = match self.mic.as_mut() {
            Some(mic) => drain_into(&mut mic.consumer, &mut self.scratch, &mut self.block),
            None => 0,
        };
        self.ctx.diagnostics.samples_in.fetch_add(n, Ordering::Relaxed);
        self.window.push(&self.block);

        let sample = self.sampler.sample(&self.window, now);
        self.dispatch(TurnInput::Frame(sample));
        // After dispatch so the block that opened a capture lands in it.
        self.recorder.push(&self.block);

        if let Some(level) = self.turn.level() {
            let _ = self.ctx.broadcasts.activity.send(ActivityEvent {
                seq: self.activity_seq,
                level,
            });
            self.activity_seq = self.activity_seq.wrapping_add(1);
            self.monitor.observe(&level, self.turn.state(), now);
        }
    }

    fn dispatch(&mut self, input: TurnInput) {
        self.pending.push_back(input);
        while let Some(input) = self.pending.pop_front() {
            let now = Instant::now();
            for effect in self.turn.handle(input, now) {
                self.apply(effect, now);
            }
        }
        self.ctx.diagnostics.record_turn(&self.turn.stats());
    }

    fn apply(&mut self, effect: Effect, now: Instant) {
        match effect {
            Effect::Connect => self.ctx.transport.connect(),
            Effect::AcquireInput { epoch } => self.acquire_input(epoch),
            Effect::ReleaseInput => {
                if let Some(mic) = self.mic.take() {
                    info!(device = mic.stream.device_name.as_str(), "releasing microphone");
                }
                self.window.clear();
            }
            Effect::BeginCapture(ticket) => {
                let rate = self.mic.as_ref().map_or(0, |m| m.stream.sample_rate);
                if rate == 0 {
                    warn!(?ticket, "capture requested without a microphone");
                    return;
                }
                self.recorder.begin(ticket, rate, now);
            }
            Effect::DiscardCapture(ticket) => {
                self.recorder.discard(Some(ticket));
            }
            Effect::FinalizeCapture(ticket) => match self.recorder.take(ticket) {
                Ok(session) => self.encode_off_thread(ticket, session),
                Err(e) => self.pending.push_back(TurnInput::CaptureFailed {
                    ticket,
                    reason: e.to_string(),
                }),
            },
            Effect::Transmit(message) => {
                if !self.ctx.transport.send(message) {
                    error!("transport task gone, capture not sent");
                    self.ctx.diagnostics.send_failures.fetch_add(1, Ordering::Relaxed);
                    self.pending.push_back(TurnInput::TransmitFailed {
                        reason: "transport unavailable".into(),
                    });
                }
            }
            Effect::PlayReply { ticket, audio } => {
                let event = self.player.play(ticket, audio);
                if let PlaybackEvent::Failed(..) = &event {
                    self.ctx.diagnostics.playback_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.pending.push_back(TurnInput::Playback(event));
            }
            Effect::PausePlayback => self.player.pause(),
            Effect::StopPlayback => self.player.stop(),
            Effect::PlayCue => self.player.play_cue(),
            Effect::Present(presentation) => self.present(presentation),
        }
    }

    fn acquire_input(&mut self, epoch: Epoch) {
        self.mic = None;
        self.window.clear();
        let (producer, consumer) = create_audio_ring();
        match MicrophoneStream::open(producer, self.ctx.config.preferred_input_device.as_deref()) {
            Ok(stream) => {
                info!(
                    device = stream.device_name.as_str(),
                    sample_rate = stream.sample_rate,
                    "microphone open"
                );
                self.mic = Some(Microphone {
                    stream,
                    consumer,
                    epoch,
                    reported: false,
                });
            }
            Err(e) => {
                error!("failed to open microphone: {e}");
                self.ctx.diagnostics.input_failures.fetch_add(1, Ordering::Relaxed);
                self.pending.push_back(TurnInput::InputFailed {
                    epoch,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Resample and encode on a worker; the result re-enters the loop as input.
    fn encode_off_thread(&self, ticket: Ticket, session: CaptureSession) {
        let config = self.ctx.config.capture.clone();
        let tx = self.encoded_tx.clone();
        let diagnostics = Arc::clone(&self.ctx.diagnostics);
        let spawned = std::thread::Builder::new()
            .name("parley-encode".into())
            .spawn(move || {
                let input = match session.finish(&config) {
                    Ok(outcome) => {
                        if let CaptureOutcome::Blob(blob) = &outcome {
                            diagnostics.captures_encoded.fetch_add(1, Ordering::Relaxed);
                            diagnostics
                                .capture_bytes
                                .fetch_add(blob.bytes.len(), Ordering::Relaxed);
                        }
                        TurnInput::CaptureFinished { ticket, outcome }
                    }
                    Err(e) => TurnInput::CaptureFailed {
                        ticket,
                        reason: e.to_string(),
                    },
                };
                let _ = tx.send(input);
            });
        if let Err(e) = spawned {
            error!("failed to spawn encoder thread: {e}");
            let _ = self.encoded_tx.send(TurnInput::CaptureFailed {
                ticket,
                reason: e.to_string(),
            });
        }
    }

    fn present(&mut self, presentation: Presentation) {
        match presentation {
            Presentation::Status(event) => {
                *self.ctx.state.lock() = event.state;
                let _ = self.ctx.broadcasts.status.send(event);
            }
            Presentation::Transcript {
                role,
                text,
                latency_ms,
            } => {
                let seq = self.ctx.seq.fetch_add(1, Ordering::Relaxed);
                let _ = self.ctx.broadcasts.transcripts.send(TranscriptEvent {
                    seq,
                    role,
                    text,
                    latency_ms,
                });
            }
            Presentation::Notice(notice) => {
                let _ = self.ctx.broadcasts.notices.send(notice);
            }
        }
    }
}
