//! Adaptive noise floor.
//!
//! `floor' = (1 - α)·floor + α·rms`, clamped to `[floor_min, floor_max]`.
//! Updates are skipped during guarded periods (user speaking, assistant
//! audible, or a turn in progress) so the floor tracks room noise only.

use crate::audio::envelope::EnvelopeSample;

#[derive(Debug, Clone, PartialEq)]
pub struct NoiseConfig {
    /// Floor used at activation, before any adaptation.
    pub initial: f32,
    /// Smoothing factor α in (0, 1]; higher adapts faster.
    pub adapt_rate: f32,
    /// Lower clamp. Prevents drift toward zero (hypersensitive detector).
    pub floor_min: f32,
    /// Upper clamp. Prevents drift toward the ceiling (deaf detector).
    pub floor_max: f32,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            initial: 0.004,
            adapt_rate: 0.05,
            floor_min: 0.001,
            floor_max: 0.05,
        }
    }
}

impl NoiseConfig {
    pub fn normalized(mut self) -> Self {
        self.floor_min = self.floor_min.clamp(0.0, 0.5);
        self.floor_max = self.floor_max.clamp(self.floor_min + f32::EPSILON, 1.0);
        self.adapt_rate = self.adapt_rate.clamp(0.001, 1.0);
        self.initial = self.initial.clamp(self.floor_min, self.floor_max);
        self
    }
}

/// Single writer of the noise-floor estimate.
#[derive(Debug, Clone)]
pub struct AdaptiveNoiseTracker {
    config: NoiseConfig,
    floor: f32,
}

impl AdaptiveNoiseTracker {
    pub fn new(config: NoiseConfig) -> Self {
        let config = config.normalized();
        Self {
            floor: config.initial,
            config,
        }
    }

    /// Fold `sample` into the estimate unless `guarded`, and return the floor.
    pub fn update(&mut self, sample: &EnvelopeSample, guarded: bool) -> f32 {
        if !guarded {
            let a = self.config.adapt_rate;
            let next = (1.0 - a) * self.floor + a * sample.rms;
            self.floor = next.clamp(self.config.floor_min, self.config.floor_max);
        }
        self.floor
    }

    pub fn floor(&self) -> f32 {
        self.floor
    }

    /// Back to the configured starting floor (used on every activation).
    pub fn reset(&mut self) {
        self.floor = self.config.initial;
    }
}
