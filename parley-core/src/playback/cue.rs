//! Notification tone played when the backend starts a web search.
//!
//! A one-second sine sweep from 500 Hz to 1200 Hz: 100 ms linear fade-in to
//! 0.25, held until 900 ms, then a linear fade to 0.01 at the end.

use std::time::Duration;

pub const CUE_SAMPLE_RATE: u32 = 44_100;
pub const CUE_DURATION: Duration = Duration::from_secs(1);

const START_HZ: f32 = 500.0;
const END_HZ: f32 = 1200.0;
const PEAK_GAIN: f32 = 0.25;
const TAIL_GAIN: f32 = 0.01;
const FADE_IN_END: f32 = 0.1;
const HOLD_END: f32 = 0.9;

/// Gain at `t` seconds into the cue.
pub fn cue_gain(t: f32) -> f32 {
    if t <= 0.0 {
        0.0
    } else if t < FADE_IN_END {
        PEAK_GAIN * t / FADE_IN_END
    } else if t < HOLD_END {
        PEAK_GAIN
    } else if t < 1.0 {
        let k = (t - HOLD_END) / (1.0 - HOLD_END);
        PEAK_GAIN + (TAIL_GAIN - PEAK_GAIN) * k
    } else {
        TAIL_GAIN
    }
}

/// Instantaneous frequency at `t` seconds.
pub fn cue_frequency(t: f32) -> f32 {
    START_HZ + (END_HZ - START_HZ) * t.clamp(0.0, 1.0)
}

/// Mono f32 sample iterator for the sweep. Phase is accumulated per sample so
/// the rising frequency stays continuous.
#[derive(Debug, Clone)]
pub struct SearchCue {
    index: u32,
    total: u32,
    phase: f32,
}

impl SearchCue {
    pub fn new() -> Self {
        Self {
            index: 0,
            total: (CUE_SAMPLE_RATE as f32 * CUE_DURATION.as_secs_f32()) as u32,
            phase: 0.0,
        }
    }
}

impl Default for SearchCue {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for SearchCue {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.index >= self.total {
            return None;
        }
        let t = self.index as f32 / CUE_SAMPLE_RATE as f32;
        let sample = self.phase.sin() * cue_gain(t);
        self.phase += std::f32::consts::TAU * cue_frequency(t) / CUE_SAMPLE_RATE as f32;
        if self.phase > std::f32::consts::TAU {
            self.phase -= std::f32::consts::TAU;
        }
        self.index += 1;
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.total - self.index) as usize;
        (left, Some(left))
    }
}

#[cfg(feature = "playback")]
impl rodio::Source for SearchCue {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        CUE_SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        Some(CUE_DURATION)
    }
}
