//! Real-time delivery: cycle building, wall-clock scheduling, output
//! backends and the panic path.

pub mod clock;
pub mod cycles;
pub mod panic;
pub mod scheduler;
pub mod sender;
pub mod session;
mod telemetry;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use cycles::{CycleSource, LoadLevel, ProgramCycles, ProjectHandle};
pub use panic::{OutputHandle, PanicReport, SoundingNotes};
pub use scheduler::{
    DropReason, EmissionOutcome, Poll, Scheduler, SchedulerError, SchedulerUpdate, SessionStats,
};
pub use sender::{MidiSender, MidirSender, RecordingSender, SendError, SentMessage, TimeoutSender};
pub use session::{Session, SessionCommand, SessionEnd};
pub use telemetry::bar_markers;
