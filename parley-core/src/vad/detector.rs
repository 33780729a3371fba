//! Hysteresis speech detector.

use std::time::{Duration, Instant};

use super::{ThresholdPair, VadConfig, VadEvent};
use crate::audio::envelope::EnvelopeSample;

/// Lives from the silent→speaking transition until the episode resolves.
#[derive(Debug, Clone, Copy)]
struct SpeechEpisode {
    started_at: Instant,
    /// Set by the first sample below the stop threshold; cleared by any crossing.
    silence_since: Option<Instant>,
}

/// Turns envelope samples into [`VadEvent`]s.
///
/// Durations come from the samples' own timestamps, so a jittery frame
/// cadence changes resolution, not timing.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    episode: Option<SpeechEpisode>,
    last_thresholds: Option<ThresholdPair>,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config: config.normalized(),
            episode: None,
            last_thresholds: None,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn is_speaking(&self) -> bool {
        self.episode.is_some()
    }

    /// Thresholds used by the most recent `evaluate` call.
    pub fn thresholds(&self) -> Option<ThresholdPair> {
        self.last_thresholds
    }

    /// Drop any open episode without emitting an event.
    pub fn reset(&mut self) {
        self.episode = None;
        self.last_thresholds = None;
    }

    pub fn evaluate(
        &mut self,
        sample: &EnvelopeSample,
        noise_floor: f32,
        assistant_audible: bool,
    ) -> VadEvent {
        let thresholds = ThresholdPair::from_floor(noise_floor, &self.config);
        self.last_thresholds = Some(thresholds);
        let crossed = sample.rms > thresholds.crossing(assistant_audible);

        let Some(episode) = self.episode.as_mut() else {
            if crossed {
                self.episode = Some(SpeechEpisode {
                    started_at: sample.at,
                    silence_since: None,
                });
                return VadEvent::SpeechStart;
            }
            return VadEvent::None;
        };

        if crossed {
            episode.silence_since = None;
            return VadEvent::SpeechContinue;
        }

        // Between stop and start the episode neither continues nor gathers silence.
        if sample.rms >= thresholds.stop {
            return VadEvent::SilenceTick;
        }

        let silence_since = *episode.silence_since.get_or_insert(sample.at);
        if sample.at.saturating_duration_since(silence_since) <= self.config.silence_duration {
            return VadEvent::SilenceTick;
        }

        let speech = silence_since.saturating_duration_since(episode.started_at);
        self.episode = None;
        let speech_ms = duration_ms(speech);
        if speech >= self.config.min_speech_duration {
            VadEvent::SpeechStop { speech_ms }
        } else {
            VadEvent::SpeechRejectedTooShort { speech_ms }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
