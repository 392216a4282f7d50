mod clock;
mod cycle;
mod quantize;
mod state_machine;

pub use clock::SchedulerClock;
pub use cycle::{ScheduleCycle, TELEMETRY_TRACK, fit_to_cycle};
pub use quantize::{
    DEFAULT_RESOLUTION, Quantized, SkipReason, SkippedEvent, beats_to_ticks, quantize_and_order,
};
pub use state_machine::SchedulerState;
