//! RMS envelope sampling over a rolling analysis window.
//!
//! `AnalysisWindow` plays the role of a time-domain analyser node: it keeps
//! the most recent `N` microphone samples. `EnvelopeSampler` turns that
//! window into one [`EnvelopeSample`] per frame: the RMS of the de-biased,
//! normalised buffer. Both are O(N) and allocation-free after construction.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Default analysis window, in samples.
pub const DEFAULT_WINDOW: usize = 512;

/// One amplitude observation: RMS in [0, 1] plus the wall-clock time it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeSample {
    pub rms: f32,
    pub at: Instant,
}

impl EnvelopeSample {
    pub fn new(rms: f32, at: Instant) -> Self {
        Self {
            rms: rms.clamp(0.0, 1.0),
            at,
        }
    }
}

/// Fixed-size circular buffer holding the latest `len` input samples.
///
/// Until `len` samples have arrived the missing part reads as silence.
#[derive(Debug, Clone)]
pub struct AnalysisWindow {
    buf: Vec<f32>,
    head: usize,
}

impl AnalysisWindow {
    pub fn new(len: usize) -> Self {
        Self {
            buf: vec![0.0; len.max(1)],
            head: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push(&mut self, samples: &[f32]) {
        let len = self.buf.len();
        // Only the tail can survive; skip what would be overwritten anyway.
        let samples = if samples.len() > len {
            &samples[samples.len() - len..]
        } else {
            samples
        };
        for &s in samples {
            self.buf[self.head] = s;
            self.head = (self.head + 1) % len;
        }
    }

    /// Copy the window oldest-first into `out` (which must be `len()` long).
    pub fn copy_to(&self, out: &mut [f32]) {
        let (newer, older) = self.buf.split_at(self.head);
        out[..older.len()].copy_from_slice(older);
        out[older.len()..].copy_from_slice(newer);
    }

    pub fn clear(&mut self) {
        self.buf.iter_mut().for_each(|s| *s = 0.0);
        self.head = 0;
    }
}

/// Produces one `EnvelopeSample` per invocation from an `AnalysisWindow`.
#[derive(Debug, Clone)]
pub struct EnvelopeSampler {
    scratch: Vec<f32>,
}

impl EnvelopeSampler {
    pub fn new(window: usize) -> Self {
        Self {
            scratch: vec![0.0; window.max(1)],
        }
    }

    pub fn sample(&mut self, window: &AnalysisWindow, at: Instant) -> EnvelopeSample {
        if self.scratch.len() != window.len() {
            self.scratch.resize(window.len(), 0.0);
        }
        window.copy_to(&mut self.scratch);
        EnvelopeSample::new(debiased_rms(&self.scratch), at)
    }
}

/// RMS after removing the DC component and clamping to [-1, 1].
pub fn debiased_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let n = samples.len() as f32;
    let mean = samples.iter().map(|s| s.clamp(-1.0, 1.0)).sum::<f32>() / n;
    let sum_sq: f32 = samples
        .iter()
        .map(|s| {
            let v = s.clamp(-1.0, 1.0) - mean;
            v * v
        })
        .sum();
    (sum_sq / n).sqrt().min(1.0)
}

/// Level snapshot the presentation layer can render (meter, debug overlay).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelSnapshot {
    pub rms: f32,
    pub noise_floor: f32,
    pub start_threshold: f32,
    pub stop_threshold: f32,
    pub barge_threshold: f32,
    pub speaking: bool,
    pub assistant_audible: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn square_wave_rms_matches_amplitude() {
        let samples: Vec<f32> = (0..512)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        assert_relative_eq!(debiased_rms(&samples), 0.5, epsilon = 1e-5);
    }

    #[test]
    fn dc_offset_is_removed() {
        let samples = vec![0.3f32; 256];
        assert!(debiased_rms(&samples) < 1e-6);
    }

    #[test]
    fn window_keeps_latest_samples_in_order() {
        let mut window = AnalysisWindow::new(4);
        window.push(&[1.0, 2.0, 3.0]);
        window.push(&[4.0, 5.0]);
        let mut out = [0.0; 4];
        window.copy_to(&mut out);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn oversized_push_keeps_tail() {
        let mut window = AnalysisWindow::new(3);
        window.push(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut out = [0.0; 3];
        window.copy_to(&mut out);
        assert_eq!(out, [3.0, 4.0, 5.0]);
    }

    #[test]
    fn sampler_reads_silence_before_window_fills() {
        let window = AnalysisWindow::new(DEFAULT_WINDOW);
        let mut sampler = EnvelopeSampler::new(DEFAULT_WINDOW);
        let sample = sampler.sample(&window, Instant::now());
        assert_eq!(sample.rms, 0.0);
    }
}
