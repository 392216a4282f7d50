use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    NoteOn,
    NoteOff,
    ProgramChange { program: u8 },
    ControlChange { controller: u8, value: u8 },
}

/// Values are carried as given; range checks belong to the validation gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicalEvent {
    pub kind: EventKind,
    pub start_beat: f64,
    pub duration_beats: f64,
    pub pitch: u8,
    pub velocity: u8,
    pub channel: u8,
    pub track_id: usize,
}

impl MusicalEvent {
    pub fn note(
        track_id: usize,
        channel: u8,
        pitch: u8,
        velocity: u8,
        start_beat: f64,
        duration_beats: f64,
    ) -> Self {
        Self {
            kind: EventKind::NoteOn,
            start_beat,
            duration_beats,
            pitch,
            velocity,
            channel,
            track_id,
        }
    }

    pub fn program_change(track_id: usize, channel: u8, program: u8, start_beat: f64) -> Self {
        Self {
            kind: EventKind::ProgramChange { program },
            start_beat,
            duration_beats: 0.0,
            pitch: 0,
            velocity: 0,
            channel,
            track_id,
        }
    }

    pub fn control_change(
        track_id: usize,
        channel: u8,
        controller: u8,
        value: u8,
        start_beat: f64,
    ) -> Self {
        Self {
            kind: EventKind::ControlChange { controller, value },
            start_beat,
            duration_beats: 0.0,
            pitch: 0,
            velocity: 0,
            channel,
            track_id,
        }
    }

    pub fn is_note_on(&self) -> bool {
        self.kind == EventKind::NoteOn
    }

    pub fn is_note_off(&self) -> bool {
        self.kind == EventKind::NoteOff
    }

    pub fn is_note(&self) -> bool {
        self.is_note_on() || self.is_note_off()
    }
}

/// Tie-break classes for events sharing a tick. Lower sorts first.
pub mod priority {
    pub const NOTE_OFF: u8 = 0;
    pub const SETUP_AT_START: u8 = 0;
    pub const NOTE_ON: u8 = 1;
    pub const OTHER: u8 = 2;
}

/// `note_id` links a note-on to the note-off generated for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEvent {
    pub tick: i64,
    pub priority: u8,
    pub payload: MusicalEvent,
    pub note_id: Option<u32>,
}

impl ScheduledEvent {
    pub fn new(tick: i64, payload: MusicalEvent, note_id: Option<u32>) -> Self {
        Self {
            tick,
            priority: Self::priority_for(&payload.kind, tick),
            payload,
            note_id,
        }
    }

    pub fn priority_for(kind: &EventKind, tick: i64) -> u8 {
        match kind {
            EventKind::NoteOff => priority::NOTE_OFF,
            EventKind::ProgramChange { .. } | EventKind::ControlChange { .. } if tick == 0 => {
                priority::SETUP_AT_START
            }
            EventKind::NoteOn => priority::NOTE_ON,
            _ => priority::OTHER,
        }
    }

    pub fn retime(&mut self, tick: i64) {
        self.tick = tick;
        self.priority = Self::priority_for(&self.payload.kind, tick);
    }

    pub fn sort_key(&self) -> (i64, u8, usize, u8) {
        (self.tick, self.priority, self.payload.track_id, self.payload.pitch)
    }

    /// A note-on quiet enough to be shed under load.
    pub fn is_ornament(&self, ghost_vel_max: u8) -> bool {
        self.payload.is_note_on() && self.payload.velocity <= ghost_vel_max
    }

    pub fn message(&self) -> MidiMessage {
        let payload = &self.payload;
        match payload.kind {
            EventKind::NoteOn => MidiMessage::NoteOn {
                pitch: payload.pitch,
                velocity: payload.velocity,
            },
            EventKind::NoteOff => MidiMessage::NoteOff {
                pitch: payload.pitch,
            },
            EventKind::ProgramChange { program } => MidiMessage::ProgramChange { program },
            EventKind::ControlChange { controller, value } => {
                MidiMessage::ControlChange { controller, value }
            }
        }
    }
}

pub fn sort_canonical(events: &mut [ScheduledEvent]) {
    events.sort_by_key(ScheduledEvent::sort_key);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { pitch: u8, velocity: u8 },
    NoteOff { pitch: u8 },
    ProgramChange { program: u8 },
    ControlChange { controller: u8, value: u8 },
}

impl MidiMessage {
    /// Encodes the message for `channel`; returns the buffer and its used length.
    pub fn encode(&self, channel: u8) -> ([u8; 3], usize) {
        let channel = channel & 0x0F;
        match *self {
            MidiMessage::NoteOn { pitch, velocity } => {
                ([0x90 | channel, pitch & 0x7F, velocity & 0x7F], 3)
            }
            MidiMessage::NoteOff { pitch } => ([0x80 | channel, pitch & 0x7F, 0], 3),
            MidiMessage::ProgramChange { program } => ([0xC0 | channel, program & 0x7F, 0], 2),
            MidiMessage::ControlChange { controller, value } => {
                ([0xB0 | channel, controller & 0x7F, value & 0x7F], 3)
            }
        }
    }
}
