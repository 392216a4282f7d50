use crate::error::ErrorClass;
use crate::events::{EventKind, ScheduledEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PreExpressive,
    PostExpressive,
    PreWrite,
    PreSchedule,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::PreExpressive => "pre-expressive",
            Stage::PostExpressive => "post-expressive",
            Stage::PreWrite => "pre-write",
            Stage::PreSchedule => "pre-schedule",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("event is placed before time zero (tick {tick})")]
    NegativeTime { tick: i64 },
    #[error("note lasts {ticks} ticks")]
    NonPositiveDuration { ticks: i64 },
    #[error("pitch {pitch} is outside 0..=127")]
    PitchOutOfRange { pitch: u8 },
    #[error("note-on velocity {velocity} is outside 1..=127")]
    VelocityOutOfRange { velocity: u8 },
    #[error("channel {channel} is outside 0..=15")]
    ChannelOutOfRange { channel: u8 },
    #[error("data byte {value} is outside 0..=127")]
    DataOutOfRange { value: u8 },
    #[error("event sorts before its predecessor")]
    OutOfOrder,
    #[error("second {direction} for channel {channel} pitch {pitch} at tick {tick}")]
    Collision {
        direction: &'static str,
        channel: u8,
        pitch: u8,
        tick: i64,
    },
    #[error("note-on has no matching note-off")]
    UnmatchedNoteOn,
    #[error("note-off has no matching note-on")]
    UnmatchedNoteOff,
    #[error("track {track_id} already has a program change on channel {channel} at time zero")]
    DuplicateProgramChange { track_id: usize, channel: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} check failed at event {event_index}: {reason}")]
pub struct ValidationError {
    pub stage: Stage,
    pub event_index: usize,
    pub reason: Violation,
}

impl ValidationError {
    pub fn class(&self) -> ErrorClass {
        match (&self.reason, self.stage) {
            (Violation::Collision { .. }, _) => ErrorClass::OrderingInvariantBroken,
            (_, Stage::PreExpressive) => ErrorClass::TimingViolation,
            _ => ErrorClass::ContractViolation,
        }
    }
}

#[derive(Default)]
struct NotePair {
    on: Option<(usize, i64)>,
    off_seen: bool,
}

/// Reports the first violation; nothing is repaired.
pub fn validate(events: &[ScheduledEvent], stage: Stage) -> Result<(), ValidationError> {
    let fail = |event_index: usize, reason: Violation| ValidationError {
        stage,
        event_index,
        reason,
    };

    let mut pairs: BTreeMap<u32, NotePair> = BTreeMap::new();
    let mut programs_at_start: BTreeSet<(usize, u8)> = BTreeSet::new();
    let mut same_tick: BTreeSet<(u8, u8, bool)> = BTreeSet::new();
    let mut current_tick = None;

    for (index, event) in events.iter().enumerate() {
        let payload = &event.payload;

        if event.tick < 0 {
            return Err(fail(index, Violation::NegativeTime { tick: event.tick }));
        }
        if payload.channel > 15 {
            return Err(fail(
                index,
                Violation::ChannelOutOfRange {
                    channel: payload.channel,
                },
            ));
        }
        check_data(payload.kind, payload.pitch, payload.velocity).map_err(|v| fail(index, v))?;

        if index > 0 && events[index - 1].sort_key() > event.sort_key() {
            return Err(fail(index, Violation::OutOfOrder));
        }

        if current_tick != Some(event.tick) {
            current_tick = Some(event.tick);
            same_tick.clear();
        }

        match payload.kind {
            EventKind::NoteOn | EventKind::NoteOff => {
                let is_on = payload.is_note_on();
                if !same_tick.insert((payload.channel, payload.pitch, is_on)) {
                    return Err(fail(
                        index,
                        Violation::Collision {
                            direction: if is_on { "note-on" } else { "note-off" },
                            channel: payload.channel,
                            pitch: payload.pitch,
                            tick: event.tick,
                        },
                    ));
                }

                let Some(note_id) = event.note_id else {
                    let reason = if is_on {
                        Violation::UnmatchedNoteOn
                    } else {
                        Violation::UnmatchedNoteOff
                    };
                    return Err(fail(index, reason));
                };
                let pair = pairs.entry(note_id).or_default();
                if is_on {
                    if pair.on.is_some() || pair.off_seen {
                        return Err(fail(index, Violation::UnmatchedNoteOff));
                    }
                    pair.on = Some((index, event.tick));
                } else {
                    let Some((_, on_tick)) = pair.on else {
                        return Err(fail(index, Violation::UnmatchedNoteOff));
                    };
                    if pair.off_seen {
                        return Err(fail(index, Violation::UnmatchedNoteOff));
                    }
                    if event.tick <= on_tick {
                        return Err(fail(
                            index,
                            Violation::NonPositiveDuration {
                                ticks: event.tick - on_tick,
                            },
                        ));
                    }
                    pair.off_seen = true;
                }
            }
            EventKind::ProgramChange { .. } => {
                if event.tick == 0 && !programs_at_start.insert((payload.track_id, payload.channel))
                {
                    return Err(fail(
                        index,
                        Violation::DuplicateProgramChange {
                            track_id: payload.track_id,
                            channel: payload.channel,
                        },
                    ));
                }
            }
            EventKind::ControlChange { .. } => {}
        }
    }

    let unmatched = pairs
        .values()
        .filter(|pair| !pair.off_seen)
        .filter_map(|pair| pair.on.map(|(index, _)| index))
        .min();
    match unmatched {
        Some(index) => Err(fail(index, Violation::UnmatchedNoteOn)),
        None => Ok(()),
    }
}

fn check_data(kind: EventKind, pitch: u8, velocity: u8) -> Result<(), Violation> {
    match kind {
        EventKind::NoteOn | EventKind::NoteOff if pitch > 127 => {
            Err(Violation::PitchOutOfRange { pitch })
        }
        EventKind::NoteOn if !(1..=127).contains(&velocity) => {
            Err(Violation::VelocityOutOfRange { velocity })
        }
        EventKind::ProgramChange { program } if program > 127 => {
            Err(Violation::DataOutOfRange { value: program })
        }
        EventKind::ControlChange { controller, value } if controller > 127 || value > 127 => {
            Err(Violation::DataOutOfRange {
                value: controller.max(value),
            })
        }
        _ => Ok(()),
    }
}
