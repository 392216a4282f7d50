use crate::events::{ScheduledEvent, sort_canonical};
use crate::timing::beats_to_ticks;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpressiveSpec {
    /// 0.0 (straight) to 1.0 (full swing).
    pub swing: f64,
    /// In beats; 0.5 swings eighth notes.
    pub subdivision_beats: f64,
    /// Maximum timing offset in either direction, in milliseconds.
    pub humanize_ms: f64,
    pub humanize_vel: u8,
    pub seed: u64,
}

impl Default for ExpressiveSpec {
    fn default() -> Self {
        Self {
            swing: 0.0,
            subdivision_beats: 0.5,
            humanize_ms: 0.0,
            humanize_vel: 0,
            seed: 0,
        }
    }
}

impl ExpressiveSpec {
    pub fn is_bypass(&self) -> bool {
        self.swing == 0.0 && self.humanize_ms == 0.0 && self.humanize_vel == 0
    }

    pub fn for_cycle(&self, cycle_index: u64) -> Self {
        Self {
            seed: self.seed.wrapping_add(cycle_index),
            ..self.clone()
        }
    }

    pub fn without_velocity_jitter(&self) -> Self {
        Self {
            humanize_vel: 0,
            ..self.clone()
        }
    }
}

fn note_rng(seed: u64, note_index: u64) -> fastrand::Rng {
    fastrand::Rng::with_seed(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ note_index)
}

/// A bypass spec returns `events` untouched. Note-offs follow their note-on.
pub fn apply(
    events: Vec<ScheduledEvent>,
    spec: &ExpressiveSpec,
    tempo_bpm: f64,
    resolution: u32,
) -> Vec<ScheduledEvent> {
    if spec.is_bypass() {
        return events;
    }

    let mut events = events;
    let sub_ticks = beats_to_ticks(spec.subdivision_beats, resolution);
    let swing_ticks = beats_to_ticks(0.5 * spec.swing * spec.subdivision_beats, resolution);
    let ticks_per_ms = resolution as f64 * tempo_bpm / 60_000.0;

    let mut shifts: BTreeMap<u32, i64> = BTreeMap::new();
    let mut note_index: u64 = 0;

    for event in events.iter_mut().filter(|e| e.payload.is_note_on()) {
        let Some(note_id) = event.note_id else {
            continue;
        };
        let mut rng = note_rng(spec.seed, note_index);
        note_index += 1;

        let mut offset = 0;
        let on_offbeat = sub_ticks > 0 && event.tick.rem_euclid(2 * sub_ticks) == sub_ticks;
        if swing_ticks != 0 && on_offbeat {
            offset += swing_ticks;
        }
        if spec.humanize_ms > 0.0 {
            let ms = (rng.f64() * 2.0 - 1.0) * spec.humanize_ms;
            offset += (ms * ticks_per_ms).round_ties_even() as i64;
        }
        if spec.humanize_vel > 0 {
            let range = spec.humanize_vel as i32;
            let velocity = event.payload.velocity as i32 + rng.i32(-range..=range);
            event.payload.velocity = velocity.clamp(1, 127) as u8;
        }

        let tick = event.tick.saturating_add(offset).max(0);
        shifts.insert(note_id, tick - event.tick);
        event.retime(tick);
    }

    for event in events.iter_mut().filter(|e| e.payload.is_note_off()) {
        if let Some(shift) = event.note_id.and_then(|id| shifts.get(&id)) {
            let tick = event.tick.saturating_add(*shift);
            event.retime(tick);
        }
    }

    sort_canonical(&mut events);
    events
}
