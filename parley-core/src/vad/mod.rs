//! Voice activity detection over a single-channel RMS envelope.
//!
//! Two cooperating pieces:
//! - [`AdaptiveNoiseTracker`] keeps an exponentially smoothed noise floor that
//!   only moves while nobody (user or assistant) is audible.
//! - [`VoiceActivityDetector`] derives a [`ThresholdPair`] from that floor every
//!   frame and turns envelope samples into speech-start / speech-stop events
//!   with hysteresis and minimum-duration gates.

pub mod detector;
pub mod noise;

pub use detector::VoiceActivityDetector;
pub use noise::{AdaptiveNoiseTracker, NoiseConfig};

use std::time::Duration;

use serde::Serialize;

/// Detector tuning. All amplitudes are RMS in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// Start speech when RMS exceeds `noise_floor + start_delta`.
    pub start_delta: f32,
    /// Count silence when RMS falls below `noise_floor + stop_delta`.
    pub stop_delta: f32,
    /// Extra margin over the start threshold needed while the assistant is audible.
    pub barge_delta: f32,
    /// Upper bound for the start threshold so a loud room never makes the detector deaf.
    pub threshold_cap: f32,
    /// Continuous sub-stop-threshold time that ends an episode.
    pub silence_duration: Duration,
    /// Episodes with less speech than this are rejected (coughs, clicks).
    pub min_speech_duration: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            start_delta: 0.018,
            stop_delta: 0.010,
            barge_delta: 0.025,
            threshold_cap: 0.2,
            silence_duration: Duration::from_millis(400),
            min_speech_duration: Duration::from_millis(300),
        }
    }
}

/// Smallest gap kept between the start and stop deltas.
const MIN_HYSTERESIS: f32 = 0.001;

impl VadConfig {
    /// Clamp into a consistent configuration: `0 <= stop_delta < start_delta`,
    /// `barge_delta > 0`, and a cap above the start delta.
    pub fn normalized(mut self) -> Self {
        self.start_delta = self.start_delta.clamp(MIN_HYSTERESIS, 0.5);
        self.stop_delta = self
            .stop_delta
            .clamp(0.0, self.start_delta - MIN_HYSTERESIS);
        self.barge_delta = self.barge_delta.clamp(MIN_HYSTERESIS, 0.5);
        self.threshold_cap = self.threshold_cap.clamp(self.start_delta, 1.0);
        self
    }

    fn hysteresis(&self) -> f32 {
        (self.start_delta - self.stop_delta).max(MIN_HYSTERESIS)
    }
}

/// Thresholds derived from the current noise floor. Recomputed every frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdPair {
    pub start: f32,
    pub stop: f32,
    pub barge: f32,
}

impl ThresholdPair {
    /// The stop threshold is always `start - (start_delta - stop_delta)`, so the
    /// hysteresis gap survives even when the start threshold hits the cap.
    pub fn from_floor(noise_floor: f32, config: &VadConfig) -> Self {
        let start = (noise_floor + config.start_delta).min(config.threshold_cap);
        let stop = start - config.hysteresis();
        Self {
            start,
            stop,
            barge: start + config.barge_delta,
        }
    }

    /// The threshold a sample has to exceed to count as speech.
    pub fn crossing(&self, assistant_audible: bool) -> f32 {
        if assistant_audible {
            self.barge
        } else {
            self.start
        }
    }
}

/// Per-frame detector output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum VadEvent {
    /// Not speaking and nothing crossed.
    None,
    /// Silent → speaking.
    SpeechStart,
    /// Crossed while already speaking; silence timer reset.
    SpeechContinue,
    /// Speaking, but this frame did not cross.
    SilenceTick,
    /// Episode resolved with enough speech to count as an utterance.
    SpeechStop {
        #[serde(rename = "speechMs")]
        speech_ms: u64,
    },
    /// Episode resolved but was shorter than the minimum.
    SpeechRejectedTooShort {
        #[serde(rename = "speechMs")]
        speech_ms: u64,
    },
}

impl VadEvent {
    pub fn is_none(self) -> bool {
        self == VadEvent::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_threshold_exceeds_stop_for_any_floor() {
        let config = VadConfig::default();
        for i in 0..=1000 {
            let floor = i as f32 / 1000.0;
            let t = ThresholdPair::from_floor(floor, &config);
            assert!(t.start > t.stop, "floor={floor} start={} stop={}", t.start, t.stop);
        }
    }

    #[test]
    fn barge_threshold_exceeds_start_for_any_floor() {
        let config = VadConfig::default();
        for i in 0..=1000 {
            let floor = i as f32 / 1000.0;
            let t = ThresholdPair::from_floor(floor, &config);
            assert!(t.barge > t.start);
            assert_eq!(t.crossing(true), t.barge);
            assert_eq!(t.crossing(false), t.start);
        }
    }

    #[test]
    fn normalization_restores_hysteresis() {
        let config = VadConfig {
            start_delta: 0.01,
            stop_delta: 0.02,
            barge_delta: -1.0,
            ..VadConfig::default()
        }
        .normalized();
        assert!(config.stop_delta < config.start_delta);
        assert!(config.barge_delta > 0.0);
        let t = ThresholdPair::from_floor(0.004, &config);
        assert!(t.start > t.stop && t.barge > t.start);
    }

    #[test]
    fn thresholds_follow_reference_constants() {
        let t = ThresholdPair::from_floor(0.004, &VadConfig::default());
        approx::assert_relative_eq!(t.start, 0.022, epsilon = 1e-6);
        approx::assert_relative_eq!(t.stop, 0.014, epsilon = 1e-6);
        approx::assert_relative_eq!(t.barge, 0.047, epsilon = 1e-6);
    }
}
