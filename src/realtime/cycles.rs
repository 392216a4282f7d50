use super::telemetry::bar_markers;
use crate::config::Config;
use crate::events::{ScheduledEvent, sort_canonical};
use crate::expressive;
use crate::project::{Project, ProjectError};
use crate::timing::{ScheduleCycle, beats_to_ticks, fit_to_cycle, quantize_and_order};
use crate::validate::{Stage, ValidationError, validate};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LoadLevel {
    #[default]
    Nominal,
    /// Velocity humanization is left out.
    SkipVelocityContour,
    /// Velocity humanization and ornaments are left out.
    ShedOrnaments,
}

impl LoadLevel {
    pub fn escalate(self) -> Self {
        match self {
            LoadLevel::Nominal => LoadLevel::SkipVelocityContour,
            LoadLevel::SkipVelocityContour | LoadLevel::ShedOrnaments => LoadLevel::ShedOrnaments,
        }
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadLevel::Nominal => "nominal",
            LoadLevel::SkipVelocityContour => "skip-velocity-contour",
            LoadLevel::ShedOrnaments => "shed-ornaments",
        };
        f.write_str(name)
    }
}

/// `Ok(None)` ends the session after the current cycle.
pub trait CycleSource: Send {
    fn next_cycle(
        &mut self,
        index: u64,
        load: LoadLevel,
    ) -> Result<Option<ScheduleCycle>, ValidationError>;
}

impl<F> CycleSource for F
where
    F: FnMut(u64, LoadLevel) -> Result<Option<ScheduleCycle>, ValidationError> + Send,
{
    fn next_cycle(
        &mut self,
        index: u64,
        load: LoadLevel,
    ) -> Result<Option<ScheduleCycle>, ValidationError> {
        self(index, load)
    }
}

/// Project replacements are heard from the next cycle on.
pub struct ProgramCycles {
    project: Arc<ArcSwap<Project>>,
    config: Config,
}

impl ProgramCycles {
    pub fn new(project: Project, config: Config) -> Self {
        Self {
            project: Arc::new(ArcSwap::from_pointee(project)),
            config,
        }
    }

    pub fn handle(&self) -> ProjectHandle {
        ProjectHandle {
            project: self.project.clone(),
        }
    }

    pub fn build(
        &self,
        project: &Project,
        index: u64,
        load: LoadLevel,
    ) -> Result<ScheduleCycle, ValidationError> {
        let resolution = self.config.resolution;
        let length_steps = beats_to_ticks(project.cycle_beats(), resolution);

        let quantized = quantize_and_order(&project.cycle_events(index == 0), resolution);
        if !quantized.skipped.is_empty() {
            debug!(cycle = index, skipped = quantized.skipped.len(), "events skipped");
        }
        validate(&quantized.events, Stage::PreExpressive)?;

        let expression = match load {
            LoadLevel::Nominal => self.config.expressive.for_cycle(index),
            _ => self.config.expressive.for_cycle(index).without_velocity_jitter(),
        };
        let written: BTreeSet<u32> = quantized
            .events
            .iter()
            .filter(|e| e.payload.is_note_on() && e.tick < length_steps)
            .filter_map(|e| e.note_id)
            .collect();
        let mut events =
            expressive::apply(quantized.events, &expression, project.bpm, resolution);
        keep_in_cycle(&mut events, &written, length_steps);
        if load == LoadLevel::ShedOrnaments {
            shed_ornaments(&mut events, self.config.ghost_vel_max);
        }
        fit_to_cycle(&mut events, length_steps);
        validate(&events, Stage::PostExpressive)?;

        events.extend(bar_markers(
            &self.config.telemetry,
            project,
            index,
            resolution,
        ));
        sort_canonical(&mut events);
        validate(&events, Stage::PreSchedule)?;

        Ok(ScheduleCycle::new(
            index,
            project.bpm,
            resolution,
            length_steps,
            project.cycle_bars,
            events,
        ))
    }
}

impl CycleSource for ProgramCycles {
    fn next_cycle(
        &mut self,
        index: u64,
        load: LoadLevel,
    ) -> Result<Option<ScheduleCycle>, ValidationError> {
        let project = self.project.load_full();
        let first_bar = index.saturating_mul(project.cycle_bars as u64);
        if project
            .total_bars
            .is_some_and(|total| first_bar >= total as u64)
        {
            info!(cycle = index, "session length reached");
            return Ok(None);
        }
        self.build(&project, index, load).map(Some)
    }
}

#[derive(Clone)]
pub struct ProjectHandle {
    project: Arc<ArcSwap<Project>>,
}

impl ProjectHandle {
    pub fn current(&self) -> Arc<Project> {
        self.project.load_full()
    }

    pub fn replace(&self, project: Project) -> Result<(), ProjectError> {
        project.validate()?;
        self.project.store(Arc::new(project));
        info!("project replaced");
        Ok(())
    }
}

/// Pulls notes that were written inside the cycle but shifted past its end
/// back onto the last step, moving their note-offs by the same amount.
fn keep_in_cycle(events: &mut [ScheduledEvent], written: &BTreeSet<u32>, length_steps: i64) {
    let last = length_steps - 1;
    let mut pulled: BTreeMap<u32, i64> = BTreeMap::new();
    for event in events.iter_mut().filter(|e| e.payload.is_note_on()) {
        let Some(id) = event.note_id.filter(|id| written.contains(id)) else {
            continue;
        };
        if event.tick > last {
            pulled.insert(id, event.tick - last);
            event.retime(last);
        }
    }
    if pulled.is_empty() {
        return;
    }
    for event in events.iter_mut().filter(|e| e.payload.is_note_off()) {
        if let Some(by) = event.note_id.and_then(|id| pulled.get(&id)) {
            let tick = event.tick - by;
            event.retime(tick);
        }
    }
    sort_canonical(events);
    debug!(notes = pulled.len(), "notes pulled back into the cycle");
}

fn shed_ornaments(events: &mut Vec<ScheduledEvent>, ghost_vel_max: u8) {
    let shed: BTreeSet<u32> = events
        .iter()
        .filter(|e| e.is_ornament(ghost_vel_max))
        .filter_map(|e| e.note_id)
        .collect();
    if shed.is_empty() {
        return;
    }
    events.retain(|e| e.note_id.is_none_or(|id| !shed.contains(&id)));
    debug!(notes = shed.len(), "ornaments shed");
}
