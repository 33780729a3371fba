//! Capture sessions: one speech episode's microphone audio, turned into a
//! single upload blob.
//!
//! The frame loop pushes every drained block into the open session. When the
//! turn controller finalizes it, the session is moved to a worker thread,
//! down-sampled to the upload rate and encoded as 16-bit PCM WAV.

use std::io::Cursor;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{debug, warn};

use crate::audio::resample;
use crate::buffering::chunk::{samples_to_duration, AudioChunk};
use crate::error::{ParleyError, Result};
use crate::turn::Ticket;

pub const WAV_MIME: &str = "audio/wav";

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Encoded blobs smaller than this are dropped instead of uploaded.
    pub min_blob_bytes: usize,
    /// Sample rate of the uploaded audio.
    pub target_sample_rate: u32,
    /// A capture still open after this long is force-stopped.
    pub max_duration: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_blob_bytes: 200,
            target_sample_rate: 16_000,
            max_duration: Duration::from_secs(30),
        }
    }
}

/// Encoded audio ready for upload. Ownership passes to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Blob(AudioBlob),
    /// Below the byte floor; expected noise, not an error.
    TooSmall { bytes: usize },
}

/// Audio accumulated between "begin capture" and "finalize".
#[derive(Debug)]
pub struct CaptureSession {
    chunks: Vec<AudioChunk>,
    sample_rate: u32,
    started_at: Instant,
}

impl CaptureSession {
    pub fn begin(sample_rate: u32, started_at: Instant) -> Self {
        Self {
            chunks: Vec::new(),
            sample_rate,
            started_at,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        if !samples.is_empty() {
            self.chunks
                .push(AudioChunk::new(samples.to_vec(), self.sample_rate));
        }
    }

    /// Audio accumulated so far.
    pub fn recorded(&self) -> Duration {
        let samples: usize = self.chunks.iter().map(|c| c.samples.len()).sum();
        samples_to_duration(samples, self.sample_rate)
    }

    /// Resample, encode, and apply the size floor.
    pub fn finish(self, config: &CaptureConfig) -> Result<CaptureOutcome> {
        let duration = self.recorded();
        let samples = AudioChunk::concat(&self.chunks);
        let samples = resample::convert_all(&samples, self.sample_rate, config.target_sample_rate)?;
        let bytes = encode_wav(&samples, config.target_sample_rate)?;
        debug!(
            recorded_ms = duration.as_millis() as u64,
            open_ms = self.started_at.elapsed().as_millis() as u64,
            bytes = bytes.len(),
            "capture encoded"
        );

        if bytes.len() < config.min_blob_bytes {
            debug!(bytes = bytes.len(), "capture below size floor");
            return Ok(CaptureOutcome::TooSmall { bytes: bytes.len() });
        }

        Ok(CaptureOutcome::Blob(AudioBlob {
            bytes,
            mime: WAV_MIME.to_string(),
            duration,
        }))
    }
}

/// Encode mono f32 samples as a 16-bit PCM WAV file in memory.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Holds the one open [`CaptureSession`], keyed by the ticket that opened it.
#[derive(Debug, Default)]
pub struct CaptureRecorder {
    open: Option<(Ticket, CaptureSession)>,
}

impl CaptureRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. Returns `false` and changes nothing if one is already open.
    pub fn begin(&mut self, ticket: Ticket, sample_rate: u32, now: Instant) -> bool {
        if let Some((open, _)) = &self.open {
            warn!(?open, ?ticket, "capture already open, ignoring begin");
            return false;
        }
        self.open = Some((ticket, CaptureSession::begin(sample_rate, now)));
        true
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn push(&mut self, samples: &[f32]) {
        if let Some((_, session)) = self.open.as_mut() {
            session.push(samples);
        }
    }

    /// Hand over the session opened by `ticket`.
    pub fn take(&mut self, ticket: Ticket) -> Result<CaptureSession> {
        match self.open.take() {
            Some((open, session)) if open == ticket => Ok(session),
            other => {
                self.open = other;
                Err(ParleyError::Capture(format!("no open capture for {ticket:?}")))
            }
        }
    }

    /// Drop the open session if it belongs to `ticket`, or any session when `None`.
    pub fn discard(&mut self, ticket: Option<Ticket>) -> bool {
        let matches = match (&self.open, ticket) {
            (Some(_), None) => true,
            (Some((open, _)), Some(ticket)) => *open == ticket,
            (None, _) => false,
        };
        if matches {
            self.open = None;
        }
        matches
    }
}
