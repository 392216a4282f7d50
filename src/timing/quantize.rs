use crate::events::{EventKind, MusicalEvent, ScheduledEvent, sort_canonical};
use tracing::debug;

/// Ticks per quarter note used when nothing else is configured.
pub const DEFAULT_RESOLUTION: u32 = 480;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("duration is not positive")]
    NonPositiveDuration,
    #[error("start position is not a finite number")]
    NonFiniteStart,
    #[error("note-off supplied without a note-on")]
    StandaloneNoteOff,
    #[error("note end does not fit the tick range")]
    TickOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedEvent {
    pub index: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Quantized {
    pub events: Vec<ScheduledEvent>,
    pub skipped: Vec<SkippedEvent>,
}

/// Rounds half to even.
pub fn beats_to_ticks(beats: f64, resolution: u32) -> i64 {
    (beats * resolution as f64).round_ties_even() as i64
}

pub fn quantize_and_order(events: &[MusicalEvent], resolution: u32) -> Quantized {
    let mut out = Vec::with_capacity(events.len() * 2);
    let mut skipped = Vec::new();
    let mut next_note_id: u32 = 0;

    for (index, event) in events.iter().enumerate() {
        if !event.start_beat.is_finite() {
            skipped.push(SkippedEvent {
                index,
                reason: SkipReason::NonFiniteStart,
            });
            continue;
        }

        let tick = beats_to_ticks(event.start_beat, resolution);

        match event.kind {
            EventKind::NoteOn => {
                if !(event.duration_beats.is_finite() && event.duration_beats > 0.0) {
                    skipped.push(SkippedEvent {
                        index,
                        reason: SkipReason::NonPositiveDuration,
                    });
                    continue;
                }

                let length = beats_to_ticks(event.duration_beats, resolution).max(1);
                let Some(end) = tick.checked_add(length) else {
                    skipped.push(SkippedEvent {
                        index,
                        reason: SkipReason::TickOverflow,
                    });
                    continue;
                };
                let note_id = next_note_id;
                next_note_id += 1;

                let note_off = MusicalEvent {
                    kind: EventKind::NoteOff,
                    start_beat: event.start_beat + event.duration_beats,
                    duration_beats: 0.0,
                    velocity: 0,
                    ..event.clone()
                };

                out.push(ScheduledEvent::new(tick, event.clone(), Some(note_id)));
                out.push(ScheduledEvent::new(end, note_off, Some(note_id)));
            }
            EventKind::NoteOff => skipped.push(SkippedEvent {
                index,
                reason: SkipReason::StandaloneNoteOff,
            }),
            EventKind::ProgramChange { .. } | EventKind::ControlChange { .. } => {
                out.push(ScheduledEvent::new(tick, event.clone(), None));
            }
        }
    }

    for skip in &skipped {
        debug!(index = skip.index, reason = %skip.reason, "skipping event");
    }

    sort_canonical(&mut out);
    Quantized {
        events: out,
        skipped,
    }
}
