//! `VoiceEngine`: top-level lifecycle handle.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceEngine::new()
//!     └─► start(url)      → transport task + frame loop spawned, turn = Idle
//!         ├─► activate()  → connect if needed, microphone opened, turn = Listening
//!         ├─► deactivate()→ playback stopped, microphone released, turn = Idle
//!         └─► stop()      → running=false, frame loop deactivates and exits
//! ```
//!
//! `start()`/`stop()` return an error when called in the wrong state rather
//! than panicking. `activate()`/`deactivate()` are idempotent.
//!
//! ## Threading
//!
//! `cpal::Stream` and rodio's `OutputStream` are `!Send` on some hosts, so the
//! microphone and the playback device are both created *inside* the
//! `spawn_blocking` frame loop and never cross a thread boundary. The loop
//! reports that it is up through a sync oneshot before `start()` returns.

mod driver;
pub mod monitor;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::envelope::DEFAULT_WINDOW,
    capture::CaptureConfig,
    error::{ParleyError, Result},
    ipc::events::{ActivityEvent, NoticeEvent, TranscriptEvent, TurnStatusEvent},
    transport::{self, ReconnectPolicy, TransportHandle},
    turn::{TurnConfig, TurnState, TurnStats},
    vad::{NoiseConfig, VadConfig},
};

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub vad: VadConfig,
    pub noise: NoiseConfig,
    pub capture: CaptureConfig,
    /// Samples per RMS analysis window. Default: 512.
    pub analysis_window: usize,
    /// Frame loop period. Default: 16 ms (display rate).
    pub frame_interval: Duration,
    /// Give up on a reply after this long. `None` waits forever.
    pub reply_timeout: Option<Duration>,
    /// How long an activation waits for the backend connection.
    pub connect_timeout: Duration,
    /// Re-activate automatically after an unclean disconnect.
    pub resume_on_reconnect: bool,
    pub reconnect: ReconnectPolicy,
    /// Input device name; `None` picks the system default.
    pub preferred_input_device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            noise: NoiseConfig::default(),
            capture: CaptureConfig::default(),
            analysis_window: DEFAULT_WINDOW,
            frame_interval: Duration::from_millis(16),
            reply_timeout: Some(Duration::from_secs(20)),
            connect_timeout: Duration::from_secs(5),
            resume_on_reconnect: true,
            reconnect: ReconnectPolicy::default(),
            preferred_input_device: None,
        }
    }
}

impl EngineConfig {
    /// Clamp every field into its working range.
    pub fn normalized(mut self) -> Self {
        self.vad = self.vad.normalized();
        self.noise = self.noise.normalized();
        self.analysis_window = self.analysis_window.clamp(64, 8192);
        self.frame_interval = self
            .frame_interval
            .clamp(Duration::from_millis(5), Duration::from_millis(100));
        self.capture.max_duration = self.capture.max_duration.max(Duration::from_secs(1));
        self.connect_timeout = self.connect_timeout.max(Duration::from_millis(100));
        self.reconnect.base = self.reconnect.base.max(Duration::from_millis(10));
        self.reconnect.max_delay = self.reconnect.max_delay.max(self.reconnect.base);
        self
    }

    pub fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            vad: self.vad.clone(),
            noise: self.noise.clone(),
            max_capture: self.capture.max_duration,
            reply_timeout: self.reply_timeout,
            connect_timeout: self.connect_timeout,
            resume_on_reconnect: self.resume_on_reconnect,
        }
    }
}

/// Counters updated by the frame loop, readable from any thread.
///
/// The turn-level counters mirror [`TurnStats`] after every frame; the rest
/// are bumped directly by the loop and the encoder threads.
pub struct EngineDiagnostics {
    pub samples_in: AtomicUsize,
    pub frames: AtomicUsize,
    pub speech_starts: AtomicUsize,
    pub episodes_rejected: AtomicUsize,
    pub captures_encoded: AtomicUsize,
    pub capture_bytes: AtomicUsize,
    pub captures_sent: AtomicUsize,
    pub captures_too_small: AtomicUsize,
    pub send_failures: AtomicUsize,
    pub messages_in: AtomicUsize,
    pub replies_played: AtomicUsize,
    pub playback_failures: AtomicUsize,
    pub barge_ins: AtomicUsize,
    pub stale_dropped: AtomicUsize,
    pub reply_timeouts: AtomicUsize,
    pub input_failures: AtomicUsize,
}

impl Default for EngineDiagnostics {
    fn default() -> Self {
        Self {
            samples_in: AtomicUsize::new(0),
            frames: AtomicUsize::new(0),
            speech_starts: AtomicUsize::new(0),
            episodes_rejected: AtomicUsize::new(0),
            captures_encoded: AtomicUsize::new(0),
            capture_bytes: AtomicUsize::new(0),
            captures_sent: AtomicUsize::new(0),
            captures_too_small: AtomicUsize::new(0),
            send_failures: AtomicUsize::new(0),
            messages_in: AtomicUsize::new(0),
            replies_played: AtomicUsize::new(0),
            playback_failures: AtomicUsize::new(0),
            barge_ins: AtomicUsize::new(0),
            stale_dropped: AtomicUsize::new(0),
            reply_timeouts: AtomicUsize::new(0),
            input_failures: AtomicUsize::new(0),
        }
    }
}

impl EngineDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Copy the controller's running totals.
    pub fn record_turn(&self, stats: &TurnStats) {
        let store = |counter: &AtomicUsize, value: u64| {
            counter.store(value as usize, Ordering::Relaxed);
        };
        store(&self.frames, stats.frames);
        store(&self.speech_starts, stats.speech_starts);
        store(&self.episodes_rejected, stats.episodes_rejected);
        store(&self.captures_sent, stats.captures_sent);
        store(&self.captures_too_small, stats.captures_too_small);
        store(&self.replies_played, stats.replies_played);
        store(&self.barge_ins, stats.barge_ins);
        store(&self.stale_dropped, stats.stale_dropped);
        store(&self.reply_timeouts, stats.reply_timeouts);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            samples_in: load(&self.samples_in),
            frames: load(&self.frames),
            speech_starts: load(&self.speech_starts),
            episodes_rejected: load(&self.episodes_rejected),
            captures_encoded: load(&self.captures_encoded),
            capture_bytes: load(&self.capture_bytes),
            captures_sent: load(&self.captures_sent),
            captures_too_small: load(&self.captures_too_small),
            send_failures: load(&self.send_failures),
            messages_in: load(&self.messages_in),
            replies_played: load(&self.replies_played),
            playback_failures: load(&self.playback_failures),
            barge_ins: load(&self.barge_ins),
            stale_dropped: load(&self.stale_dropped),
            reply_timeouts: load(&self.reply_timeouts),
            input_failures: load(&self.input_failures),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 16] {
        [
            &self.samples_in,
            &self.frames,
            &self.speech_starts,
            &self.episodes_rejected,
            &self.captures_encoded,
            &self.capture_bytes,
            &self.captures_sent,
            &self.captures_too_small,
            &self.send_failures,
            &self.messages_in,
            &self.replies_played,
            &self.playback_failures,
            &self.barge_ins,
            &self.stale_dropped,
            &self.reply_timeouts,
            &self.input_failures,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub frames: usize,
    pub speech_starts: usize,
    pub episodes_rejected: usize,
    pub captures_encoded: usize,
    pub capture_bytes: usize,
    pub captures_sent: usize,
    pub captures_too_small: usize,
    pub send_failures: usize,
    pub messages_in: usize,
    pub replies_played: usize,
    pub playback_failures: usize,
    pub barge_ins: usize,
    pub stale_dropped: usize,
    pub reply_timeouts: usize,
    pub input_failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineCommand {
    Activate,
    Deactivate,
    Toggle,
}

/// Event fan-out shared by the engine handle and the frame loop.
#[derive(Clone)]
pub(crate) struct Broadcasts {
    pub status: broadcast::Sender<TurnStatusEvent>,
    pub transcripts: broadcast::Sender<TranscriptEvent>,
    pub activity: broadcast::Sender<ActivityEvent>,
    pub notices: broadcast::Sender<NoticeEvent>,
}

impl Broadcasts {
    fn new() -> Self {
        Self {
            status: broadcast::channel(BROADCAST_CAP).0,
            transcripts: broadcast::channel(BROADCAST_CAP).0,
            activity: broadcast::channel(BROADCAST_CAP).0,
            notices: broadcast::channel(BROADCAST_CAP).0,
        }
    }
}

struct Session {
    commands: Sender<EngineCommand>,
    transport: TransportHandle,
    /// Owned by this run's frame loop only; a later `start` gets a fresh one.
    alive: Arc<AtomicBool>,
}

/// The top-level engine handle.
///
/// `VoiceEngine` is `Send + Sync`; wrap it in an `Arc` to share it between a
/// host's input handling and its event-forwarding tasks.
pub struct VoiceEngine {
    config: EngineConfig,
    /// `true` between `start` and `stop`.
    running: AtomicBool,
    /// Mirror of the controller's state, written only by the frame loop.
    state: Arc<Mutex<TurnState>>,
    session: Mutex<Option<Session>>,
    broadcasts: Broadcasts,
    /// Monotonically increasing event sequence counter.
    seq: Arc<AtomicU64>,
    diagnostics: Arc<EngineDiagnostics>,
}

impl VoiceEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: config.normalized(),
            running: AtomicBool::new(false),
            state: Arc::new(Mutex::new(TurnState::Idle)),
            session: Mutex::new(None),
            broadcasts: Broadcasts::new(),
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(EngineDiagnostics::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn the transport task and the frame loop. The session stays idle
    /// until [`activate`](Self::activate).
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// - `ParleyError::AlreadyRunning` if already started.
    /// - `ParleyError::Other` if there is no runtime or the loop died on startup.
    pub fn start(&self, url: impl Into<String>) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ParleyError::AlreadyRunning);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ParleyError::Other(anyhow::anyhow!("no tokio runtime: {e}")))?;
        let _guard = runtime.enter();

        let url = url.into();
        self.diagnostics.reset();
        self.running.store(true, Ordering::SeqCst);
        *self.state.lock() = TurnState::Idle;

        let alive = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (transport, _task) =
            transport::spawn(url.clone(), self.config.reconnect.clone(), event_tx);
        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        let ctx = driver::DriverContext {
            config: self.config.clone(),
            running: Arc::clone(&alive),
            state: Arc::clone(&self.state),
            commands: command_rx,
            transport_events: event_rx,
            transport: transport.clone(),
            broadcasts: self.broadcasts.clone(),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };

        // Sync oneshot: the frame loop signals that it is up.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
        tokio::task::spawn_blocking(move || driver::run(ctx, ready_tx));

        match ready_rx.recv() {
            Ok(()) => {
                info!(url = url.as_str(), "engine started");
                *self.session.lock() = Some(Session {
                    commands: command_tx,
                    transport,
                    alive,
                });
                Ok(())
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                alive.store(false, Ordering::SeqCst);
                transport.shutdown();
                Err(ParleyError::Other(anyhow::anyhow!(
                    "frame loop died unexpectedly"
                )))
            }
        }
    }

    /// Deactivate, close the transport, and end the frame loop.
    ///
    /// # Errors
    /// - `ParleyError::NotRunning` if not started.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ParleyError::NotRunning);
        }
        if let Some(session) = self.session.lock().take() {
            session.alive.store(false, Ordering::SeqCst);
            session.transport.shutdown();
        }
        info!("engine stop requested");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a voice session (the frame loop connects first if needed).
    pub fn activate(&self) -> Result<()> {
        self.command(EngineCommand::Activate)
    }

    pub fn deactivate(&self) -> Result<()> {
        self.command(EngineCommand::Deactivate)
    }

    pub fn toggle(&self) -> Result<()> {
        self.command(EngineCommand::Toggle)
    }

    /// Current turn state (snapshot).
    pub fn state(&self) -> TurnState {
        *self.state.lock()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<TurnStatusEvent> {
        self.broadcasts.status.subscribe()
    }

    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.broadcasts.transcripts.subscribe()
    }

    /// Per-frame level meter data (~60 events per second while active).
    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.broadcasts.activity.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<NoticeEvent> {
        self.broadcasts.notices.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    fn command(&self, command: EngineCommand) -> Result<()> {
        let guard = self.session.lock();
        let Some(session) = guard.as_ref() else {
            return Err(ParleyError::NotRunning);
        };
        session.commands.send(command).map_err(|_| {
            warn!(?command, "frame loop gone, command dropped");
            ParleyError::NotRunning
        })
    }
}

impl Drop for VoiceEngine {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            let _ = self.stop();
        }
    }
}
