mod program_change;
mod smf;

pub use program_change::{
    ProgramAssignment, START_LOOKAHEAD, ensure_program_change, has_program_change_at_start,
    program_changes_at_start, reexport,
};
pub use smf::{FileLayout, MAX_DELTA, serialize};

use crate::config::Config;
use crate::error::ErrorClass;
use crate::expressive;
use crate::project::{Project, ProjectError};
use crate::timing::quantize_and_order;
use crate::validate::{Stage, ValidationError, validate};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("cannot encode event {event_index}: {reason}")]
    Encode { event_index: usize, reason: String },
    #[error("cannot read MIDI file: {0}")]
    Parse(#[from] midly::Error),
    #[error("cannot write MIDI file: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Project(#[from] ProjectError),
}

impl ExportError {
    /// Checkpoint that rejected the events, if a checkpoint did.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ExportError::Validation(err) => Some(err.stage),
            _ => None,
        }
    }

    pub fn event_index(&self) -> Option<usize> {
        match self {
            ExportError::Validation(err) => Some(err.event_index),
            ExportError::Encode { event_index, .. } => Some(*event_index),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ExportError::Validation(err) => err.class(),
            _ => ErrorClass::ContractViolation,
        }
    }
}

pub fn render(project: &Project, config: &Config) -> Result<Vec<u8>, ExportError> {
    project.validate()?;
    let layout = FileLayout::from_project(project, config.resolution)?;

    let quantized = quantize_and_order(&project.musical_events(), config.resolution);
    if !quantized.skipped.is_empty() {
        info!(
            skipped = quantized.skipped.len(),
            "events left out of the export"
        );
    }
    validate(&quantized.events, Stage::PreExpressive)?;

    let events = expressive::apply(
        quantized.events,
        &config.expressive,
        project.bpm,
        config.resolution,
    );
    validate(&events, Stage::PostExpressive)?;
    validate(&events, Stage::PreWrite)?;

    let bytes = serialize(&events, &layout)?;
    debug!(events = events.len(), bytes = bytes.len(), "rendered project");
    Ok(bytes)
}

/// Writes `bytes` next to `path` first and renames it into place, so a
/// failed write never leaves a truncated file behind.
pub fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let partial = partial_path(path);
    let result = fs::write(&partial, bytes).and_then(|()| fs::rename(&partial, path));
    if let Err(err) = result {
        let _ = fs::remove_file(&partial);
        return Err(err.into());
    }
    Ok(())
}

pub fn export_to_file(project: &Project, config: &Config, path: &Path) -> Result<(), ExportError> {
    let bytes = render(project, config)?;
    write_file(path, &bytes)?;
    info!(path = %path.display(), bytes = bytes.len(), "exported");
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::fixtures::groove;
    use crate::project::Note;

    #[test]
    fn bad_velocity_aborts_before_expressive_stage() {
        let mut project = groove();
        project.tracks[0].notes[1].velocity = 0;
        let err = render(&project, &Config::default()).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::PreExpressive));
        assert_eq!(err.class(), ErrorClass::TimingViolation);
        assert!(err.event_index().is_some());
    }

    #[test]
    fn collision_is_reported_as_ordering_error() {
        let mut project = groove();
        project.tracks[0].notes.push(Note {
            pitch: 36,
            velocity: 90,
            start_beat: 0.0,
            duration_beats: 0.5,
        });
        let err = render(&project, &Config::default()).unwrap_err();
        assert_eq!(err.class(), ErrorClass::OrderingInvariantBroken);
    }

    #[test]
    fn render_is_deterministic_with_humanize() {
        let mut config = Config::default();
        config.expressive.humanize_ms = 8.0;
        config.expressive.humanize_vel = 10;
        config.expressive.seed = 42;
        let project = groove();
        assert_eq!(
            render(&project, &config).unwrap(),
            render(&project, &config).unwrap()
        );
    }

    #[test]
    fn partial_file_sits_next_to_target() {
        assert_eq!(
            partial_path(Path::new("/tmp/out/song.mid")),
            PathBuf::from("/tmp/out/song.mid.partial")
        );
    }
}
