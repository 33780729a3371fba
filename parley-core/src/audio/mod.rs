//! Microphone acquisition.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority. It
//! must not allocate in the steady state, block, or do I/O. It downmixes to mono
//! into a reused scratch buffer and hands the result to the SPSC ring producer,
//! whose `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on Windows and macOS. [`MicrophoneStream`] is
//! therefore created and dropped on the frame-loop thread.

pub mod device;
pub mod envelope;
pub mod resample;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, SampleFormat, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use crate::{
    buffering::AudioProducer,
    error::{ParleyError, Result},
};

/// An open microphone. Dropping it closes the device.
pub struct MicrophoneStream {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    faulted: Arc<AtomicBool>,
    pub sample_rate: u32,
    pub device_name: String,
}

impl MicrophoneStream {
    /// Open the preferred input (falling back to the default) and start
    /// pushing mono f32 samples into `producer`.
    ///
    /// # Errors
    /// `NoInputDevice` when nothing can be opened, `AudioDevice` for config
    /// queries, `AudioStream` when the stream cannot be built or started.
    #[cfg(feature = "audio-cpal")]
    pub fn open(producer: AudioProducer, preferred_device: Option<&str>) -> Result<Self> {
        let device = device::resolve_input_device(preferred_device)?;
        let device_name = device.name().unwrap_or_default();

        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(
            device = device_name.as_str(),
            sample_rate,
            channels,
            format = ?supported.sample_format(),
            "opening input device"
        );

        let config: StreamConfig = supported.config();
        let running = Arc::new(AtomicBool::new(true));
        let faulted = Arc::new(AtomicBool::new(false));
        let handles = (producer, Arc::clone(&running), Arc::clone(&faulted));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&device, &config, handles),
            SampleFormat::I16 => build_input::<i16>(&device, &config, handles),
            SampleFormat::U16 => build_input::<u16>(&device, &config, handles),
            SampleFormat::I32 => build_input::<i32>(&device, &config, handles),
            SampleFormat::U8 => build_input::<u8>(&device, &config, handles),
            fmt => Err(ParleyError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            faulted,
            sample_rate,
            device_name,
        })
    }

    /// Stub when built without `audio-cpal`.
    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(_producer: AudioProducer, _preferred_device: Option<&str>) -> Result<Self> {
        Err(ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    /// True once the host reported a stream error (device unplugged, revoked).
    pub fn has_failed(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Make the callback a no-op until the stream is dropped.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "audio-cpal")]
fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    (mut producer, running, faulted): (AudioProducer, Arc<AtomicBool>, Arc<AtomicBool>),
) -> Result<Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::with_capacity(4096);

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                downmix_into(data, channels, |s: T| s.to_sample::<f32>(), &mut mono);
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    warn!(dropped = mono.len() - written, "input ring full");
                }
            },
            move |err| {
                error!("audio stream error: {err}");
                faulted.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| ParleyError::AudioStream(e.to_string()))
}

/// Average interleaved frames down to mono, replacing the contents of `out`.
/// A trailing partial frame is ignored.
pub fn downmix_into<S, F>(interleaved: &[S], channels: usize, to_f32: F, out: &mut Vec<f32>)
where
    S: Copy,
    F: Fn(S) -> f32,
{
    let channels = channels.max(1);
    out.clear();
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().map(|s| to_f32(*s)).sum::<f32>() / channels as f32),
    );
}
