use crate::events::MusicalEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("failed to access project file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse project: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to encode project: {0}")]
    Encode(#[from] ron::Error),
    #[error("invalid project: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub pitch: u8,
    pub velocity: u8,
    pub start_beat: f64,
    pub duration_beats: f64,
}

/// Marks the bar (counted from the start of the session) where a section begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub bar: u32,
    pub marker: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackData {
    pub id: usize,
    pub name: String,
    pub channel: u8,
    /// General MIDI program sent once at the start of the track.
    #[serde(default)]
    pub program: Option<u8>,
    pub notes: Vec<Note>,
}

/// Note positions are in quarter-note beats relative to the cycle start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub bpm: f64,
    pub time_signature: (u32, u32),
    pub cycle_bars: u32,
    /// Session length; `None` loops until stopped.
    #[serde(default)]
    pub total_bars: Option<u32>,
    #[serde(default)]
    pub sections: Vec<Section>,
    pub tracks: Vec<TrackData>,
}

impl Project {
    pub fn save(&self, path: &Path) -> Result<(), ProjectError> {
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let ron_string = fs::read_to_string(path)?;
        let project: Project = ron::from_str(&ron_string)?;
        project.validate()?;
        Ok(project)
    }

    pub fn validate(&self) -> Result<(), ProjectError> {
        let invalid = |reason: String| Err(ProjectError::Invalid(reason));

        if !(self.bpm.is_finite() && self.bpm >= 4.0 && self.bpm <= 999.0) {
            return invalid(format!("tempo {} is outside 4..=999 bpm", self.bpm));
        }
        let (beats, unit) = self.time_signature;
        if beats == 0 || beats > 255 || !unit.is_power_of_two() || unit > 64 {
            return invalid(format!("unsupported time signature {beats}/{unit}"));
        }
        if self.cycle_bars == 0 {
            return invalid("cycle_bars must be positive".into());
        }
        if self.total_bars == Some(0) {
            return invalid("total_bars must be positive when given".into());
        }

        if let Some(section) = self.sections.iter().find(|s| s.marker > 127) {
            return invalid(format!(
                "section marker {} at bar {} is above 127",
                section.marker, section.bar
            ));
        }

        let mut ids = BTreeSet::new();
        for track in &self.tracks {
            if !ids.insert(track.id) {
                return invalid(format!("track id {} is used twice", track.id));
            }
            if track.program.is_some_and(|p| p > 127) {
                return invalid(format!("track {} has a program above 127", track.id));
            }
        }
        Ok(())
    }

    pub fn beats_per_bar(&self) -> f64 {
        let (beats, unit) = self.time_signature;
        beats as f64 * (4.0 / unit as f64)
    }

    pub fn cycle_beats(&self) -> f64 {
        self.beats_per_bar() * self.cycle_bars as f64
    }

    /// Cycles in a bounded session; a looping project renders one cycle.
    pub fn cycle_count(&self) -> u64 {
        match self.total_bars {
            Some(total) => total.div_ceil(self.cycle_bars) as u64,
            None => 1,
        }
    }

    pub fn cycle_events(&self, with_programs: bool) -> Vec<MusicalEvent> {
        let mut events = Vec::new();
        for track in &self.tracks {
            if let (true, Some(program)) = (with_programs, track.program) {
                events.push(MusicalEvent::program_change(
                    track.id,
                    track.channel,
                    program,
                    0.0,
                ));
            }
            events.extend(track.notes.iter().map(|note| {
                MusicalEvent::note(
                    track.id,
                    track.channel,
                    note.pitch,
                    note.velocity,
                    note.start_beat,
                    note.duration_beats,
                )
            }));
        }
        events
    }

    pub fn musical_events(&self) -> Vec<MusicalEvent> {
        let cycle_beats = self.cycle_beats();
        let mut events = self.cycle_events(true);
        let first_cycle: Vec<MusicalEvent> = self.cycle_events(false);
        for cycle in 1..self.cycle_count() {
            let offset = cycle as f64 * cycle_beats;
            events.extend(first_cycle.iter().map(|event| MusicalEvent {
                start_beat: event.start_beat + offset,
                ..event.clone()
            }));
        }
        events
    }
}
