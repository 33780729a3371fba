//! Reply playback.
//!
//! [`ReplayPlayer`] plays at most one reply at a time over a
//! [`PlaybackBackend`]. Starting a new reply stops the previous one. The
//! frame loop polls it once per frame for completion, so no callback thread
//! ever touches turn state.

pub mod cue;

use tracing::{debug, warn};

use crate::error::Result;
use crate::turn::Ticket;

/// Inbound replies shorter than this cannot hold real audio.
pub const MIN_REPLY_BYTES: usize = 100;

/// Audio output device seam. Implementations live on the frame-loop thread.
pub trait PlaybackBackend {
    /// Decode and start `audio`, replacing anything already playing.
    fn start(&mut self, audio: Vec<u8>) -> Result<()>;
    /// Halt the current reply in place.
    fn pause(&mut self);
    /// Halt and drop the current reply.
    fn stop(&mut self);
    /// Nothing queued any more (ended, stopped, or never started).
    fn is_finished(&self) -> bool;
    /// Fire-and-forget notification tone, mixed over any reply.
    fn play_cue(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started(Ticket),
    Ended(Ticket),
    Failed(Ticket, String),
}

impl PlaybackEvent {
    pub fn ticket(&self) -> Ticket {
        match self {
            PlaybackEvent::Started(t) | PlaybackEvent::Ended(t) | PlaybackEvent::Failed(t, _) => *t,
        }
    }
}

pub struct ReplayPlayer {
    backend: Box<dyn PlaybackBackend>,
    active: Option<Ticket>,
}

impl ReplayPlayer {
    pub fn new(backend: Box<dyn PlaybackBackend>) -> Self {
        Self {
            backend,
            active: None,
        }
    }

    /// Start `audio` for `ticket`. Returns `Started` or `Failed`; never both.
    pub fn play(&mut self, ticket: Ticket, audio: Vec<u8>) -> PlaybackEvent {
        if let Some(previous) = self.active.take() {
            debug!(?previous, ?ticket, "superseding active reply");
            self.backend.stop();
        }
        if audio.len() < MIN_REPLY_BYTES {
            return PlaybackEvent::Failed(ticket, "reply too small".into());
        }
        match self.backend.start(audio) {
            Ok(()) => {
                self.active = Some(ticket);
                PlaybackEvent::Started(ticket)
            }
            Err(e) => {
                warn!(?ticket, "reply playback failed: {e}");
                PlaybackEvent::Failed(ticket, e.to_string())
            }
        }
    }

    /// Barge-in: silence the reply now. It is not resumed.
    pub fn pause(&mut self) {
        self.backend.pause();
        self.active = None;
    }

    pub fn stop(&mut self) {
        self.backend.stop();
        self.active = None;
    }

    /// Report `Ended` once the active reply has drained.
    pub fn poll(&mut self) -> Option<PlaybackEvent> {
        let ticket = self.active?;
        if self.backend.is_finished() {
            self.active = None;
            return Some(PlaybackEvent::Ended(ticket));
        }
        None
    }

    pub fn play_cue(&mut self) {
        if let Err(e) = self.backend.play_cue() {
            warn!("search cue failed: {e}");
        }
    }
}

#[cfg(feature = "playback")]
pub use rodio_backend::RodioBackend;

#[cfg(feature = "playback")]
mod rodio_backend {
    use std::io::Cursor;

    use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
    use tracing::info;

    use super::{cue::SearchCue, PlaybackBackend};
    use crate::error::{ParleyError, Result};

    /// Default output device via rodio. The device is opened lazily and
    /// reopened on the next reply after a failure. `!Send`, like the stream.
    #[derive(Default)]
    pub struct RodioBackend {
        output: Option<(OutputStream, OutputStreamHandle)>,
        sink: Option<Sink>,
    }

    impl RodioBackend {
        pub fn new() -> Self {
            Self::default()
        }

        fn new_sink(&mut self) -> Result<Sink> {
            if self.output.is_none() {
                let (stream, handle) = OutputStream::try_default()
                    .map_err(|e| ParleyError::Playback(format!("open output: {e}")))?;
                info!("output device opened");
                self.output = Some((stream, handle));
            }
            let Some((_, handle)) = self.output.as_ref() else {
                return Err(ParleyError::Playback("output unavailable".into()));
            };
            match Sink::try_new(handle) {
                Ok(sink) => Ok(sink),
                Err(e) => {
                    self.output = None;
                    Err(ParleyError::Playback(format!("create sink: {e}")))
                }
            }
        }
    }

    impl PlaybackBackend for RodioBackend {
        fn start(&mut self, audio: Vec<u8>) -> Result<()> {
            self.stop();
            let source = Decoder::new(Cursor::new(audio))
                .map_err(|e| ParleyError::Playback(format!("decode failed: {e}")))?;
            let sink = self.new_sink()?;
            sink.append(source);
            self.sink = Some(sink);
            Ok(())
        }

        fn pause(&mut self) {
            if let Some(sink) = &self.sink {
                sink.pause();
            }
        }

        fn stop(&mut self) {
            if let Some(sink) = self.sink.take() {
                sink.stop();
            }
        }

        fn is_finished(&self) -> bool {
            self.sink.as_ref().map_or(true, Sink::empty)
        }

        fn play_cue(&mut self) -> Result<()> {
            let sink = self.new_sink()?;
            sink.append(SearchCue::new());
            sink.detach();
            Ok(())
        }
    }
}

/// Stand-in when built without `playback`: every reply fails, so turns fall
/// straight back to listening.
#[cfg(not(feature = "playback"))]
#[derive(Debug, Default)]
pub struct UnavailableBackend;

#[cfg(not(feature = "playback"))]
impl PlaybackBackend for UnavailableBackend {
    fn start(&mut self, _audio: Vec<u8>) -> Result<()> {
        Err(crate::error::ParleyError::Playback(
            "compiled without playback feature".into(),
        ))
    }

    fn pause(&mut self) {}

    fn stop(&mut self) {}

    fn is_finished(&self) -> bool {
        true
    }

    fn play_cue(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The output backend for this build.
pub fn default_backend() -> Box<dyn PlaybackBackend> {
    #[cfg(feature = "playback")]
    {
        Box::new(RodioBackend::new())
    }
    #[cfg(not(feature = "playback"))]
    {
        Box::new(UnavailableBackend)
    }
}
