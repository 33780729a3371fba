//! Rate-limited level logging for the frame loop.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::audio::envelope::LevelSnapshot;
use crate::turn::TurnState;

pub struct LevelMonitor {
    interval: Duration,
    last: Option<Instant>,
}

impl LevelMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns `true` when a line was due (and logged).
    pub fn observe(&mut self, level: &LevelSnapshot, state: TurnState, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last = Some(now);
        debug!(
            rms = format_args!("{:.4}", level.rms),
            floor = format_args!("{:.4}", level.noise_floor),
            start = format_args!("{:.4}", level.start_threshold),
            stop = format_args!("{:.4}", level.stop_threshold),
            speaking = level.speaking,
            state = state.as_str(),
            "audio level check"
        );
        true
    }
}

impl Default for LevelMonitor {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level() -> LevelSnapshot {
        LevelSnapshot {
            rms: 0.01,
            noise_floor: 0.004,
            start_threshold: 0.022,
            stop_threshold: 0.014,
            barge_threshold: 0.047,
            speaking: false,
            assistant_audible: false,
        }
    }

    #[test]
    fn logs_at_most_once_per_interval() {
        let mut monitor = LevelMonitor::default();
        let t0 = Instant::now();
        assert!(monitor.observe(&level(), TurnState::Listening, t0));
        assert!(!monitor.observe(&level(), TurnState::Listening, t0 + Duration::from_millis(100)));
        assert!(!monitor.observe(&level(), TurnState::Listening, t0 + Duration::from_millis(499)));
        assert!(monitor.observe(&level(), TurnState::Listening, t0 + Duration::from_millis(500)));
    }
}
