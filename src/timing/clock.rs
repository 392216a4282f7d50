use std::time::{Duration, Instant};

/// Fixed for the lifetime of one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerClock {
    origin: Instant,
    tempo_bpm: f64,
    steps_per_minute: f64,
}

impl SchedulerClock {
    pub fn new(origin: Instant, tempo_bpm: f64, resolution: u32) -> Self {
        Self {
            origin,
            tempo_bpm,
            steps_per_minute: tempo_bpm * resolution as f64,
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn tempo_bpm(&self) -> f64 {
        self.tempo_bpm
    }

    /// Absolute due time of `step`. Negative steps are due at the origin.
    pub fn due(&self, step: i64) -> Instant {
        self.origin + Duration::from_secs_f64(step.max(0) as f64 * 60.0 / self.steps_per_minute)
    }

    /// The new origin is derived from this one, not from the commit time.
    pub fn following(&self, length_steps: i64, tempo_bpm: f64, resolution: u32) -> Self {
        Self::new(self.due(length_steps), tempo_bpm, resolution)
    }
}
