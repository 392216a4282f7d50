use super::ExportError;
use midly::num::{u4, u7, u28};
use midly::{MetaMessage, MidiMessage, Smf, TrackEvent, TrackEventKind};
use std::str::FromStr;
use tracing::debug;

/// How many leading events are inspected before giving up.
pub const START_LOOKAHEAD: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramAssignment {
    /// Index of the track in the file; track 0 is the conductor track.
    pub track_index: usize,
    pub channel: u8,
    pub program: u8,
}

impl FromStr for ProgramAssignment {
    type Err = String;

    /// Parses `TRACK:CHANNEL:PROGRAM`, e.g. `1:0:33`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [track, channel, program] = parts.as_slice() else {
            return Err(format!("expected TRACK:CHANNEL:PROGRAM, got `{s}`"));
        };
        let number = |field: &str, text: &str| {
            text.trim()
                .parse::<u32>()
                .map_err(|e| format!("bad {field} `{text}`: {e}"))
        };
        let track_index = number("track", *track)? as usize;
        let channel = number("channel", *channel)?;
        let program = number("program", *program)?;
        if channel > 15 {
            return Err(format!("channel {channel} is outside 0..=15"));
        }
        if program > 127 {
            return Err(format!("program {program} is outside 0..=127"));
        }
        Ok(Self {
            track_index,
            channel: channel as u8,
            program: program as u8,
        })
    }
}

pub fn has_program_change_at_start(track: &[TrackEvent<'_>], channel: u8) -> bool {
    track
        .iter()
        .take(START_LOOKAHEAD)
        .take_while(|event| event.delta.as_int() == 0)
        .any(|event| {
            matches!(
                event.kind,
                TrackEventKind::Midi {
                    channel: ch,
                    message: MidiMessage::ProgramChange { .. },
                } if ch.as_int() == channel
            )
        })
}

/// Goes right after a leading track-name marker. Returns whether the track
/// was changed.
pub fn ensure_program_change(track: &mut Vec<TrackEvent<'_>>, channel: u8, program: u8) -> bool {
    if has_program_change_at_start(track, channel) {
        return false;
    }

    let at = match track.first() {
        Some(TrackEvent {
            delta,
            kind: TrackEventKind::Meta(MetaMessage::TrackName(_)),
        }) if delta.as_int() == 0 => 1,
        _ => 0,
    };
    track.insert(
        at,
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Midi {
                channel: u4::new(channel & 0x0F),
                message: MidiMessage::ProgramChange {
                    program: u7::new(program & 0x7F),
                },
            },
        },
    );
    true
}

/// Running this on its own output changes nothing.
pub fn reexport(bytes: &[u8], assignments: &[ProgramAssignment]) -> Result<Vec<u8>, ExportError> {
    let mut smf = Smf::parse(bytes)?;

    for assignment in assignments {
        let track_count = smf.tracks.len();
        let Some(track) = smf.tracks.get_mut(assignment.track_index) else {
            return Err(ExportError::Encode {
                event_index: 0,
                reason: format!(
                    "track {} does not exist (file has {track_count})",
                    assignment.track_index
                ),
            });
        };
        let inserted = ensure_program_change(track, assignment.channel, assignment.program);
        debug!(
            track = assignment.track_index,
            channel = assignment.channel,
            inserted,
            "program change at start"
        );
    }

    let mut out = Vec::with_capacity(bytes.len() + assignments.len() * 3);
    smf.write_std(&mut out)?;
    Ok(out)
}

pub fn program_changes_at_start(bytes: &[u8]) -> Result<Vec<(usize, u8, u8)>, ExportError> {
    let smf = Smf::parse(bytes)?;
    let mut found = Vec::new();
    for (index, track) in smf.tracks.iter().enumerate() {
        for event in track
            .iter()
            .take(START_LOOKAHEAD)
            .take_while(|event| event.delta.as_int() == 0)
        {
            if let TrackEventKind::Midi {
                channel,
                message: MidiMessage::ProgramChange { program },
            } = event.kind
            {
                found.push((index, channel.as_int(), program.as_int()));
            }
        }
    }
    Ok(found)
}
