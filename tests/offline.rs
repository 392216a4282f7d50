use beatline::export::{self, ExportError, ProgramAssignment};
use beatline::project::{Note, Project, TrackData};
use beatline::validate::Stage;
use beatline::{Config, ErrorClass};
use midly::num::u28;
use midly::{MidiMessage, Smf, TrackEventKind};

fn note(pitch: u8, velocity: u8, start_beat: f64, duration_beats: f64) -> Note {
    Note {
        pitch,
        velocity,
        start_beat,
        duration_beats,
    }
}

fn project(tracks: Vec<TrackData>) -> Project {
    Project {
        name: "offline".into(),
        bpm: 96.0,
        time_signature: (4, 4),
        cycle_bars: 1,
        total_bars: None,
        sections: Vec::new(),
        tracks,
    }
}

fn track(id: usize, channel: u8, program: Option<u8>, notes: Vec<Note>) -> TrackData {
    TrackData {
        id,
        name: format!("Track {id}"),
        channel,
        program,
        notes,
    }
}

/// Channel messages of one track with their absolute ticks.
fn messages(bytes: &[u8], track: usize) -> Vec<(u32, MidiMessage)> {
    let smf = Smf::parse(bytes).unwrap();
    let mut tick = 0;
    smf.tracks[track]
        .iter()
        .filter_map(|event| {
            tick += event.delta.as_int();
            match event.kind {
                TrackEventKind::Midi { message, .. } => Some((tick, message)),
                _ => None,
            }
        })
        .collect()
}

#[test]
fn note_off_precedes_note_on_at_the_same_tick() {
    let project = project(vec![track(
        0,
        0,
        None,
        vec![note(60, 100, 0.0, 1.0), note(60, 90, 1.0, 1.0)],
    )]);
    let bytes = export::render(&project, &Config::default()).unwrap();
    let events = messages(&bytes, 1);

    assert_eq!(events.len(), 4);
    assert_eq!(events[1].0, 480);
    assert!(matches!(events[1].1, MidiMessage::NoteOff { .. }));
    assert_eq!(events[2].0, 480);
    assert!(matches!(events[2].1, MidiMessage::NoteOn { .. }));
}

#[test]
fn tiny_notes_last_one_tick_and_empty_notes_are_skipped() {
    let project = project(vec![track(
        0,
        0,
        None,
        vec![
            note(60, 100, 0.0, 0.001),
            note(62, 100, 1.0, 0.0),
            note(64, 100, 2.0, -1.0),
        ],
    )]);
    let bytes = export::render(&project, &Config::default()).unwrap();
    let smf = Smf::parse(&bytes).unwrap();
    let track = &smf.tracks[1];

    // name, note-on, note-off, end of track
    assert_eq!(track.len(), 4);
    assert_eq!(track[2].delta, u28::new(1));
}

#[test]
fn same_input_and_seed_give_identical_bytes() {
    let project = project(vec![
        track(
            0,
            9,
            None,
            (0..16)
                .map(|i| note(42, if i % 2 == 0 { 100 } else { 25 }, i as f64 * 0.25, 0.2))
                .collect(),
        ),
        track(1, 0, Some(38), vec![note(36, 110, 0.0, 2.0), note(43, 110, 2.0, 2.0)]),
    ]);
    let mut config = Config::default();
    config.expressive.swing = 0.5;
    config.expressive.subdivision_beats = 0.25;
    config.expressive.humanize_ms = 6.0;
    config.expressive.humanize_vel = 12;
    config.expressive.seed = 2024;

    let first = export::render(&project, &config).unwrap();
    let second = export::render(&project, &config).unwrap();
    assert_eq!(first, second);

    config.expressive.seed = 2025;
    assert_ne!(first, export::render(&project, &config).unwrap());
}

#[test]
fn reexport_is_idempotent() {
    let project = project(vec![
        track(0, 0, Some(33), vec![note(40, 100, 0.0, 1.0)]),
        track(1, 1, None, vec![note(64, 100, 0.0, 1.0)]),
    ]);
    let bytes = export::render(&project, &Config::default()).unwrap();
    assert_eq!(export::program_changes_at_start(&bytes).unwrap(), vec![(1, 0, 33)]);

    let assignments = [
        ProgramAssignment {
            track_index: 1,
            channel: 0,
            program: 33,
        },
        ProgramAssignment {
            track_index: 2,
            channel: 1,
            program: 4,
        },
    ];
    let once = export::reexport(&bytes, &assignments).unwrap();
    let twice = export::reexport(&once, &assignments).unwrap();

    let expected = vec![(1, 0, 33), (2, 1, 4)];
    assert_eq!(export::program_changes_at_start(&once).unwrap(), expected);
    assert_eq!(export::program_changes_at_start(&twice).unwrap(), expected);
    assert_eq!(once, twice);
}

#[test]
fn failed_export_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.mid");
    let project = project(vec![track(0, 0, None, vec![note(60, 0, 0.0, 1.0)])]);

    let err = export::export_to_file(&project, &Config::default(), &path).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::PreExpressive));
    assert_eq!(err.event_index(), Some(0));
    assert_eq!(err.class(), ErrorClass::TimingViolation);
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[test]
fn write_errors_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("song.mid");
    let err = export::write_file(&path, b"MThd").unwrap_err();
    assert!(matches!(err, ExportError::Io(_)));
    assert!(!path.exists());
}

#[test]
fn exported_file_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("song.mid");
    let project = project(vec![track(0, 0, Some(0), vec![note(60, 100, 0.0, 1.0)])]);
    let config = Config::default();

    export::export_to_file(&project, &config, &path).unwrap();
    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(on_disk, export::render(&project, &config).unwrap());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}
