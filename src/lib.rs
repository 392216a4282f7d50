pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod expressive;
pub mod project;
pub mod realtime;
pub mod timing;
pub mod validate;

pub use config::Config;
pub use error::ErrorClass;
pub use events::{EventKind, MidiMessage, MusicalEvent, ScheduledEvent};
pub use project::Project;
