//! Plays demos/groove.ron against a virtual clock and prints every message
//! the scheduler would have sent.

use beatline::realtime::{ProgramCycles, RecordingSender, Scheduler, Session, VirtualClock};
use beatline::{Config, MidiMessage, Project};
use std::path::Path;

fn main() {
    let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
    let project = Project::load(&demos.join("groove.ron")).expect("failed to load project");
    let config = Config::load(&demos.join("live.ron")).expect("failed to load config");

    let recorder = RecordingSender::new();
    let mut scheduler = Scheduler::new(config.clone(), ProgramCycles::new(project, config));
    scheduler.arm(recorder.clone()).expect("failed to arm");

    let session =
        Session::spawn(scheduler, Box::new(VirtualClock::new())).expect("failed to spawn");
    let end = session.wait();
    end.result.expect("session failed");

    for sent in recorder.messages() {
        let ch = sent.channel;
        match sent.message {
            MidiMessage::NoteOn { pitch, velocity } => {
                println!("Note ON  ch={ch} note={pitch} vel={velocity}");
            }
            MidiMessage::NoteOff { pitch } => println!("Note OFF ch={ch} note={pitch}"),
            MidiMessage::ControlChange { controller, value } => {
                println!("CC       ch={ch} ctrl={controller} val={value}");
            }
            MidiMessage::ProgramChange { program } => println!("Program  ch={ch} prog={program}"),
        }
    }

    if let Some(scheduler) = end.scheduler {
        let stats = scheduler.stats();
        println!(
            "\n{} cycles, {} on time, {} late, {} dropped",
            stats.cycles_completed, stats.sent_on_time, stats.sent_late, stats.dropped
        );
    }
}
