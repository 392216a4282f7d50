use super::ExportError;
use crate::events::{MidiMessage, ScheduledEvent};
use crate::project::Project;
use midly::{
    Format, Header, MetaMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};
use std::collections::BTreeMap;

/// Largest delta a variable-length quantity can hold.
pub const MAX_DELTA: i64 = (1 << 28) - 1;

const MAX_TEMPO_US: u32 = (1 << 24) - 1;

#[derive(Debug, Clone, PartialEq)]
pub struct FileLayout {
    pub name: String,
    pub resolution: u16,
    pub tempo_bpm: f64,
    pub time_signature: (u8, u8),
    /// Track names keyed by track id.
    pub tracks: BTreeMap<usize, String>,
}

impl FileLayout {
    pub fn from_project(project: &Project, resolution: u32) -> Result<Self, ExportError> {
        let resolution = u16::try_from(resolution)
            .ok()
            .filter(|r| (1..=0x7FFF).contains(r))
            .ok_or_else(|| encode_error(0, format!("resolution {resolution} cannot be stored")))?;
        let (beats, unit) = project.time_signature;
        let time_signature = match (u8::try_from(beats), u8::try_from(unit)) {
            (Ok(beats), Ok(unit)) => (beats, unit),
            _ => {
                return Err(encode_error(
                    0,
                    format!("time signature {beats}/{unit} cannot be stored"),
                ));
            }
        };

        Ok(Self {
            name: project.name.clone(),
            resolution,
            tempo_bpm: project.bpm,
            time_signature,
            tracks: project
                .tracks
                .iter()
                .map(|track| (track.id, track.name.clone()))
                .collect(),
        })
    }

    fn tempo_micros(&self) -> Result<u32, ExportError> {
        let micros = (60_000_000.0 / self.tempo_bpm).round();
        if !(micros.is_finite() && micros >= 1.0 && micros <= MAX_TEMPO_US as f64) {
            return Err(encode_error(
                0,
                format!("tempo {} bpm cannot be stored", self.tempo_bpm),
            ));
        }
        Ok(micros as u32)
    }
}

fn encode_error(event_index: usize, reason: String) -> ExportError {
    ExportError::Encode {
        event_index,
        reason,
    }
}

/// Track 0 is the conductor track. Events are written in the order given.
pub fn serialize(events: &[ScheduledEvent], layout: &FileLayout) -> Result<Vec<u8>, ExportError> {
    let mut smf = Smf::new(Header::new(
        Format::Parallel,
        Timing::Metrical(u15::new(layout.resolution)),
    ));
    smf.tracks.push(conductor_track(layout)?);

    let mut tracks: BTreeMap<usize, (Track, i64)> = layout
        .tracks
        .iter()
        .map(|(id, name)| {
            let mut track = Vec::new();
            track.push(meta(0, MetaMessage::TrackName(name.as_bytes())));
            (*id, (track, 0))
        })
        .collect();

    for (index, event) in events.iter().enumerate() {
        let track_id = event.payload.track_id;
        let Some((track, last_tick)) = tracks.get_mut(&track_id) else {
            return Err(encode_error(
                index,
                format!("track {track_id} is not declared in the file layout"),
            ));
        };

        let delta = event.tick - *last_tick;
        if !(0..=MAX_DELTA).contains(&delta) {
            return Err(encode_error(
                index,
                format!("delta of {delta} ticks cannot be stored"),
            ));
        }
        if event.payload.channel > 15 {
            return Err(encode_error(
                index,
                format!("channel {} cannot be stored", event.payload.channel),
            ));
        }

        track.push(TrackEvent {
            delta: u28::new(delta as u32),
            kind: TrackEventKind::Midi {
                channel: u4::new(event.payload.channel),
                message: to_midly(event.message()),
            },
        });
        *last_tick = event.tick;
    }

    for (_, (mut track, _)) in tracks {
        track.push(meta(0, MetaMessage::EndOfTrack));
        smf.tracks.push(track);
    }

    let mut bytes = Vec::new();
    smf.write_std(&mut bytes)
        .map_err(|err| encode_error(events.len(), err.to_string()))?;
    Ok(bytes)
}

fn conductor_track(layout: &FileLayout) -> Result<Track<'_>, ExportError> {
    let (beats, unit) = layout.time_signature;
    if !unit.is_power_of_two() {
        return Err(encode_error(
            0,
            format!("time signature {beats}/{unit} cannot be stored"),
        ));
    }
    Ok(vec![
        meta(0, MetaMessage::TrackName(layout.name.as_bytes())),
        meta(0, MetaMessage::Tempo(u24::new(layout.tempo_micros()?))),
        meta(
            0,
            MetaMessage::TimeSignature(beats, unit.trailing_zeros() as u8, 24, 8),
        ),
        meta(0, MetaMessage::EndOfTrack),
    ])
}

fn meta(delta: u32, message: MetaMessage<'_>) -> TrackEvent<'_> {
    TrackEvent {
        delta: u28::new(delta),
        kind: TrackEventKind::Meta(message),
    }
}

pub(crate) fn to_midly(message: MidiMessage) -> midly::MidiMessage {
    match message {
        MidiMessage::NoteOn { pitch, velocity } => midly::MidiMessage::NoteOn {
            key: u7::new(pitch & 0x7F),
            vel: u7::new(velocity & 0x7F),
        },
        MidiMessage::NoteOff { pitch } => midly::MidiMessage::NoteOff {
            key: u7::new(pitch & 0x7F),
            vel: u7::new(0),
        },
        MidiMessage::ProgramChange { program } => midly::MidiMessage::ProgramChange {
            program: u7::new(program & 0x7F),
        },
        MidiMessage::ControlChange { controller, value } => midly::MidiMessage::Controller {
            controller: u7::new(controller & 0x7F),
            value: u7::new(value & 0x7F),
        },
    }
}
