use crate::events::{ScheduledEvent, sort_canonical};
use std::collections::BTreeSet;
use tracing::warn;

/// Track id carried by telemetry markers so they sort after program tracks.
pub const TELEMETRY_TRACK: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleCycle {
    index: u64,
    tempo_bpm: f64,
    resolution: u32,
    length_steps: i64,
    bars: u32,
    events: Vec<ScheduledEvent>,
}

impl ScheduleCycle {
    pub fn new(
        index: u64,
        tempo_bpm: f64,
        resolution: u32,
        length_steps: i64,
        bars: u32,
        events: Vec<ScheduledEvent>,
    ) -> Self {
        Self {
            index,
            tempo_bpm,
            resolution,
            length_steps,
            bars,
            events,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn tempo_bpm(&self) -> f64 {
        self.tempo_bpm
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn length_steps(&self) -> i64 {
        self.length_steps
    }

    pub fn bars(&self) -> u32 {
        self.bars
    }

    pub fn events(&self) -> &[ScheduledEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Trims events to `[0, length_steps]`; ringing note-offs end on the
/// boundary. Returns how many events were removed.
pub fn fit_to_cycle(events: &mut Vec<ScheduledEvent>, length_steps: i64) -> usize {
    let outside: BTreeSet<u32> = events
        .iter()
        .filter(|e| e.payload.is_note_on() && e.tick >= length_steps)
        .filter_map(|e| e.note_id)
        .collect();

    let before = events.len();
    events.retain(|e| match e.note_id {
        Some(id) if e.payload.is_note() => !outside.contains(&id),
        _ => e.tick < length_steps,
    });
    let removed = before - events.len();
    if removed > 0 {
        warn!(removed, length_steps, "events fall outside the cycle");
    }

    for event in events.iter_mut() {
        if event.payload.is_note_off() && event.tick > length_steps {
            event.retime(length_steps);
        }
    }
    sort_canonical(events);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MusicalEvent;
    use crate::timing::quantize_and_order;

    #[test]
    fn ringing_notes_end_on_the_boundary() {
        let mut events =
            quantize_and_order(&[MusicalEvent::note(0, 0, 60, 100, 3.0, 4.0)], 480).events;
        assert_eq!(fit_to_cycle(&mut events, 1920), 0);
        assert_eq!(events[1].tick, 1920);
    }

    #[test]
    fn notes_past_the_end_are_removed_whole() {
        let mut events = quantize_and_order(
            &[
                MusicalEvent::note(0, 0, 60, 100, 0.0, 1.0),
                MusicalEvent::note(0, 0, 62, 100, 4.0, 1.0),
                MusicalEvent::control_change(0, 0, 7, 100, 5.0),
            ],
            480,
        )
        .events;
        assert_eq!(fit_to_cycle(&mut events, 1920), 3);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.payload.pitch == 60));
    }
}
