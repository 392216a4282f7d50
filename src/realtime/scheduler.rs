use super::clock::Clock;
use super::cycles::{CycleSource, LoadLevel};
use super::panic::OutputHandle;
use super::sender::{MidiSender, SendError};
use crate::config::Config;
use crate::error::ErrorClass;
use crate::events::ScheduledEvent;
use crate::timing::{ScheduleCycle, SchedulerClock, SchedulerState};
use crate::validate::ValidationError;
use crossbeam::channel::{self, Receiver, Sender};
use serde::Serialize;
use std::fmt;
use std::mem;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const UPDATE_BACKLOG: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler cannot go from {from} to {to}")]
    InvalidTransition {
        from: SchedulerState,
        to: SchedulerState,
    },
    #[error("scheduler is {0}, not running")]
    NotRunning(SchedulerState),
    #[error(transparent)]
    Backend(#[from] SendError),
    #[error(transparent)]
    Contract(#[from] ValidationError),
    #[error("the program produced no cycle to play")]
    EmptySession,
    #[error("scheduler loop did not stop within {0:?}")]
    StopTimeout(Duration),
    #[error("cannot start the scheduler thread: {0}")]
    Spawn(String),
    #[error("scheduler thread panicked")]
    WorkerPanicked,
}

impl SchedulerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SchedulerError::Backend(_)
            | SchedulerError::StopTimeout(_)
            | SchedulerError::Spawn(_)
            | SchedulerError::WorkerPanicked => ErrorClass::BackendFailure,
            SchedulerError::Contract(err) => err.class(),
            _ => ErrorClass::ContractViolation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    LateOrnament { lateness: Duration },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::LateOrnament { lateness } => write!(f, "ornament {lateness:?} late"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmissionOutcome {
    SentOnTime,
    SentLate { lateness: Duration },
    Dropped(DropReason),
    Failed(SendError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub sent_on_time: u64,
    pub sent_late: u64,
    pub dropped: u64,
    pub failed: u64,
    pub cycles_completed: u64,
    pub overloaded_cycles: u64,
}

/// Published on the update channel for whoever watches the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerUpdate {
    StateChanged {
        from: SchedulerState,
        to: SchedulerState,
    },
    CycleCommitted {
        index: u64,
        tempo_bpm: f64,
    },
    Overload {
        cycle: u64,
        late_events: usize,
        dropped: usize,
        level: LoadLevel,
    },
    Fault {
        message: String,
        class: ErrorClass,
    },
    Finished(SessionStats),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    Pending,
    Finished,
}

pub struct Scheduler {
    config: Config,
    state: SchedulerState,
    source: Box<dyn CycleSource>,
    output: OutputHandle,
    cycle: Option<ScheduleCycle>,
    clock: Option<SchedulerClock>,
    cursor: usize,
    load: LoadLevel,
    cycle_late: usize,
    cycle_dropped: usize,
    stats: SessionStats,
    updates: Sender<SchedulerUpdate>,
    update_rx: Receiver<SchedulerUpdate>,
}

impl Scheduler {
    pub fn new(config: Config, source: impl CycleSource + 'static) -> Self {
        let (updates, update_rx) = channel::bounded(UPDATE_BACKLOG);
        let output = OutputHandle::new(config.send_timeout() * 2);
        Self {
            config,
            state: SchedulerState::Idle,
            source: Box::new(source),
            output,
            cycle: None,
            clock: None,
            cursor: 0,
            load: LoadLevel::Nominal,
            cycle_late: 0,
            cycle_dropped: 0,
            stats: SessionStats::default(),
            updates,
            update_rx,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn load_level(&self) -> LoadLevel {
        self.load
    }

    pub fn output(&self) -> OutputHandle {
        self.output.clone()
    }

    /// Only the most recent updates are kept when nobody reads them.
    pub fn updates(&self) -> Receiver<SchedulerUpdate> {
        self.update_rx.clone()
    }

    pub fn arm<S: MidiSender + 'static>(&mut self, sender: S) -> Result<(), SchedulerError> {
        if !self.state.can_arm() {
            error!(from = %self.state, "cannot arm scheduler");
            return Err(SchedulerError::InvalidTransition {
                from: self.state,
                to: SchedulerState::Armed,
            });
        }

        let mut sender = sender;
        if let Err(err) = sender.ready() {
            warn!(%err, "MIDI output is not ready");
            let _ = sender.close();
            return Err(SchedulerError::Backend(err));
        }

        let first = match self.source.next_cycle(0, LoadLevel::Nominal) {
            Ok(Some(cycle)) => cycle,
            Ok(None) => {
                let _ = sender.close();
                return Err(SchedulerError::EmptySession);
            }
            Err(err) => {
                error!(%err, "first cycle rejected");
                let _ = sender.close();
                return Err(SchedulerError::Contract(err));
            }
        };

        self.output.install(Box::new(sender));
        info!(events = first.len(), tempo = first.tempo_bpm(), "scheduler armed");
        self.cycle = Some(first);
        self.clock = None;
        self.cursor = 0;
        self.load = LoadLevel::Nominal;
        self.cycle_late = 0;
        self.cycle_dropped = 0;
        self.stats = SessionStats::default();
        self.transition(SchedulerState::Armed)
    }

    pub fn start(&mut self, now: Instant) -> Result<(), SchedulerError> {
        let Some(cycle) = &self.cycle else {
            return Err(SchedulerError::InvalidTransition {
                from: self.state,
                to: SchedulerState::Running,
            });
        };
        let clock = SchedulerClock::new(now, cycle.tempo_bpm(), cycle.resolution());
        let (index, tempo_bpm) = (cycle.index(), cycle.tempo_bpm());

        self.transition(SchedulerState::Running)?;
        self.clock = Some(clock);
        self.publish(SchedulerUpdate::CycleCommitted { index, tempo_bpm });
        Ok(())
    }

    /// Lateness is measured when each event is sent, so a backend that
    /// blocks makes the events queued behind it late.
    pub fn poll(&mut self, clock: &dyn Clock) -> Result<Poll, SchedulerError> {
        match self.state {
            SchedulerState::Running => {}
            SchedulerState::Stopped => return Ok(Poll::Finished),
            state => return Err(SchedulerError::NotRunning(state)),
        }

        let horizon = clock.now() + self.config.lookahead();
        loop {
            let (Some(cycle), Some(timeline)) = (self.cycle.as_ref(), self.clock) else {
                return Err(SchedulerError::NotRunning(self.state));
            };

            if let Some(event) = cycle.events().get(self.cursor) {
                let due = timeline.due(event.tick);
                if due > horizon {
                    return Ok(Poll::Pending);
                }
                let event = event.clone();
                self.cursor += 1;
                self.emit(&event, due, clock.now())?;
                continue;
            }

            if timeline.due(cycle.length_steps()) > horizon {
                return Ok(Poll::Pending);
            }
            if !self.commit_next_cycle()? {
                self.finish();
                return Ok(Poll::Finished);
            }
        }
    }

    pub fn stop(&mut self) -> Result<(), SchedulerError> {
        if self.state == SchedulerState::Stopped {
            return Ok(());
        }
        if self.state.can_transition_to(SchedulerState::Draining) {
            self.transition(SchedulerState::Draining)?;
        }
        let report = self.output.panic(self.config.panic_enabled);
        info!(released = report.notes_released, "scheduler stopped");

        self.cycle = None;
        self.clock = None;
        self.transition(SchedulerState::Stopped)?;
        self.publish(SchedulerUpdate::Finished(self.stats));
        Ok(())
    }

    fn emit(
        &mut self,
        event: &ScheduledEvent,
        due: Instant,
        now: Instant,
    ) -> Result<(), SchedulerError> {
        let lateness = now.saturating_duration_since(due);
        let late = lateness > self.config.late_drop();
        let ornament = event.is_ornament(self.config.ghost_vel_max);

        let outcome = if late && ornament && self.config.drop_late_ornaments {
            EmissionOutcome::Dropped(DropReason::LateOrnament { lateness })
        } else {
            match self.output.send(&event.message(), event.payload.channel) {
                Ok(()) if late => EmissionOutcome::SentLate { lateness },
                Ok(()) => EmissionOutcome::SentOnTime,
                Err(err) => EmissionOutcome::Failed(err),
            }
        };

        self.record(event, ornament, &outcome);
        match outcome {
            EmissionOutcome::Failed(err) => Err(self.fault(err)),
            _ => Ok(()),
        }
    }

    fn record(&mut self, event: &ScheduledEvent, ornament: bool, outcome: &EmissionOutcome) {
        match outcome {
            EmissionOutcome::SentOnTime => self.stats.sent_on_time += 1,
            EmissionOutcome::SentLate { lateness } => {
                self.stats.sent_late += 1;
                if !ornament {
                    self.cycle_late += 1;
                }
                debug!(tick = event.tick, ?lateness, "sent late");
            }
            EmissionOutcome::Dropped(reason) => {
                self.stats.dropped += 1;
                self.cycle_dropped += 1;
                debug!(tick = event.tick, pitch = event.payload.pitch, %reason, "dropped");
            }
            EmissionOutcome::Failed(_) => self.stats.failed += 1,
        }
    }

    fn commit_next_cycle(&mut self) -> Result<bool, SchedulerError> {
        let (Some(finished), Some(clock)) = (self.cycle.take(), self.clock) else {
            return Ok(false);
        };
        self.stats.cycles_completed += 1;
        self.settle_load(finished.index());

        let index = finished.index() + 1;
        match self.source.next_cycle(index, self.load) {
            Ok(Some(next)) => {
                self.clock = Some(clock.following(
                    finished.length_steps(),
                    next.tempo_bpm(),
                    next.resolution(),
                ));
                info!(
                    cycle = index,
                    tempo = next.tempo_bpm(),
                    load = %self.load,
                    "cycle committed"
                );
                self.publish(SchedulerUpdate::CycleCommitted {
                    index,
                    tempo_bpm: next.tempo_bpm(),
                });
                self.cycle = Some(next);
                self.cursor = 0;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => {
                error!(%err, cycle = index, "next cycle rejected, stopping");
                self.halt(SchedulerUpdate::Fault {
                    message: err.to_string(),
                    class: err.class(),
                });
                Err(SchedulerError::Contract(err))
            }
        }
    }

    fn settle_load(&mut self, cycle: u64) {
        let late = mem::take(&mut self.cycle_late);
        let dropped = mem::take(&mut self.cycle_dropped);
        let previous = self.load;

        if late > 0 {
            self.load = self.load.escalate();
            self.stats.overloaded_cycles += 1;
            warn!(
                cycle,
                late,
                dropped,
                level = %self.load,
                class = %ErrorClass::OverloadCondition,
                "scheduler overloaded"
            );
            self.publish(SchedulerUpdate::Overload {
                cycle,
                late_events: late,
                dropped,
                level: self.load,
            });
        } else if dropped == 0 {
            self.load = LoadLevel::Nominal;
        }

        if self.load != previous {
            info!(from = %previous, to = %self.load, "load level changed");
        }
    }

    fn finish(&mut self) {
        if self.transition(SchedulerState::Draining).is_err() {
            return;
        }
        self.output.panic(false);
        let _ = self.transition(SchedulerState::Stopped);
        info!(
            cycles = self.stats.cycles_completed,
            late = self.stats.sent_late,
            dropped = self.stats.dropped,
            "session finished"
        );
        self.publish(SchedulerUpdate::Finished(self.stats));
    }

    fn fault(&mut self, err: SendError) -> SchedulerError {
        error!(%err, "MIDI backend failed, stopping");
        self.halt(SchedulerUpdate::Fault {
            message: err.to_string(),
            class: ErrorClass::BackendFailure,
        });
        SchedulerError::Backend(err)
    }

    fn halt(&mut self, fault: SchedulerUpdate) {
        let _ = self.transition(SchedulerState::Faulted);
        self.publish(fault);
        let report = self.output.panic(self.config.panic_enabled);
        if !report.completed {
            error!("panic could not reach the MIDI output");
        }
        self.cycle = None;
        self.clock = None;
        let _ = self.transition(SchedulerState::Stopped);
        self.publish(SchedulerUpdate::Finished(self.stats));
    }

    fn transition(&mut self, to: SchedulerState) -> Result<(), SchedulerError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            error!(%from, %to, "illegal scheduler transition");
            return Err(SchedulerError::InvalidTransition { from, to });
        }
        self.state = to;
        debug!(%from, %to, "scheduler state");
        self.publish(SchedulerUpdate::StateChanged { from, to });
        Ok(())
    }

    fn publish(&self, update: SchedulerUpdate) {
        if let Err(channel::TrySendError::Full(update)) = self.updates.try_send(update) {
            // Nobody is reading: make room by dropping the oldest update.
            let _ = self.update_rx.try_recv();
            let _ = self.updates.try_send(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MidiMessage;
    use crate::project::fixtures::groove;
    use crate::realtime::clock::VirtualClock;
    use crate::realtime::cycles::ProgramCycles;
    use crate::realtime::sender::{RecordingSender, SentMessage};
    use std::collections::BTreeSet;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn scheduler(config: Config) -> Scheduler {
        let source = ProgramCycles::new(groove(), config.clone());
        Scheduler::new(config, source)
    }

    fn assert_no_stuck_notes(messages: &[SentMessage]) {
        let mut sounding = BTreeSet::new();
        for sent in messages {
            match sent.message {
                MidiMessage::NoteOn { pitch, .. } => {
                    sounding.insert((sent.channel, pitch));
                }
                MidiMessage::NoteOff { pitch } => {
                    sounding.remove(&(sent.channel, pitch));
                }
                _ => {}
            }
        }
        assert!(sounding.is_empty(), "stuck notes: {sounding:?}");
    }

    struct Unplugged;

    impl MidiSender for Unplugged {
        fn send(&mut self, _: &MidiMessage, _: u8) -> Result<(), SendError> {
            Err(SendError::Closed)
        }

        fn close(&mut self) -> Result<(), SendError> {
            Ok(())
        }

        fn ready(&mut self) -> Result<(), SendError> {
            Err(SendError::PortNotFound("loopback".into()))
        }
    }

    #[test]
    fn unavailable_output_is_rejected_at_arm() {
        let mut scheduler = scheduler(Config::default());
        let err = scheduler.arm(Unplugged).unwrap_err();
        assert!(matches!(err, SchedulerError::Backend(SendError::PortNotFound(_))));
        assert_eq!(err.class(), ErrorClass::BackendFailure);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn cannot_start_before_arming() {
        let mut scheduler = scheduler(Config::default());
        let clock = VirtualClock::new();
        assert!(matches!(
            scheduler.start(clock.now()),
            Err(SchedulerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            scheduler.poll(&clock),
            Err(SchedulerError::NotRunning(SchedulerState::Idle))
        ));
    }

    #[test]
    fn delivers_only_what_is_due() {
        let recorder = RecordingSender::new();
        let mut scheduler = scheduler(Config::default());
        scheduler.arm(recorder.clone()).unwrap();
        let clock = VirtualClock::new();
        scheduler.start(clock.now()).unwrap();

        assert_eq!(scheduler.poll(&clock).unwrap(), Poll::Pending);
        // program change, bass note-on, hat note-on
        assert_eq!(recorder.messages().len(), 3);
        assert_eq!(
            recorder.messages()[0].message,
            MidiMessage::ProgramChange { program: 33 }
        );
        assert_eq!(scheduler.stats().sent_on_time, 3);
    }

    #[test]
    fn plays_a_bounded_session_to_the_end() {
        let mut config = Config::default();
        config.telemetry.bar_cc_enabled = true;
        let recorder = RecordingSender::new();
        let mut scheduler = scheduler(config);
        let updates = scheduler.updates();
        scheduler.arm(recorder.clone()).unwrap();
        let clock = VirtualClock::new();
        scheduler.start(clock.now()).unwrap();

        while scheduler.poll(&clock).unwrap() == Poll::Pending {
            clock.advance(ms(1));
            assert!(clock.elapsed() < ms(10_000), "session never finished");
        }

        let stats = scheduler.stats();
        assert_eq!(stats.sent_on_time, 46);
        assert_eq!(stats.sent_late + stats.dropped, 0);
        assert_eq!(stats.cycles_completed, 2);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.load_level(), LoadLevel::Nominal);
        assert!(recorder.closed());
        assert_no_stuck_notes(&recorder.messages());
        assert!(recorder.messages().contains(&SentMessage {
            message: MidiMessage::ControlChange {
                controller: 20,
                value: 1
            },
            channel: 15
        }));
        assert!(
            updates
                .try_iter()
                .any(|u| u == SchedulerUpdate::Finished(stats))
        );
    }

    #[test]
    fn late_ornaments_are_dropped_and_the_rest_sent_late() {
        let recorder = RecordingSender::new();
        let mut scheduler = scheduler(Config::default());
        let updates = scheduler.updates();
        scheduler.arm(recorder.clone()).unwrap();
        let clock = VirtualClock::new();
        scheduler.start(clock.now()).unwrap();

        // Due by now: ticks 0 and 120 and the first ghost hat at tick 240.
        clock.advance(ms(300));
        scheduler.poll(&clock).unwrap();
        let stats = scheduler.stats();
        assert_eq!(stats.sent_late, 4);
        assert_eq!(stats.dropped, 1);
        assert!(!recorder.messages().iter().any(|m| matches!(
            m.message,
            MidiMessage::NoteOn { velocity: 18, .. }
        )));

        clock.advance(ms(1705));
        scheduler.poll(&clock).unwrap();
        assert_eq!(scheduler.load_level(), LoadLevel::SkipVelocityContour);
        assert!(
            updates
                .try_iter()
                .any(|u| matches!(u, SchedulerUpdate::Overload { cycle: 0, .. }))
        );

        scheduler.stop().unwrap();
        assert!(scheduler.output().sounding().is_empty());
        assert_no_stuck_notes(&recorder.messages());
    }

    #[test]
    fn late_ornaments_are_kept_when_dropping_is_off() {
        let config = Config {
            drop_late_ornaments: false,
            ..Config::default()
        };
        let recorder = RecordingSender::new();
        let mut scheduler = scheduler(config);
        scheduler.arm(recorder.clone()).unwrap();
        let clock = VirtualClock::new();
        scheduler.start(clock.now()).unwrap();

        clock.advance(ms(300));
        scheduler.poll(&clock).unwrap();
        assert_eq!(scheduler.stats().sent_late, 5);
        assert_eq!(scheduler.stats().dropped, 0);
    }

    #[test]
    fn backend_failure_faults_and_allows_rearm() {
        let mut scheduler = scheduler(Config::default());
        let updates = scheduler.updates();
        scheduler.arm(RecordingSender::failing_after(2)).unwrap();
        let clock = VirtualClock::new();
        scheduler.start(clock.now()).unwrap();

        let err = scheduler.poll(&clock).unwrap_err();
        assert!(matches!(err, SchedulerError::Backend(SendError::Write(_))));
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(scheduler.output().sounding().is_empty());
        assert!(!scheduler.output().is_open());

        let seen: Vec<SchedulerUpdate> = updates.try_iter().collect();
        assert!(seen.contains(&SchedulerUpdate::StateChanged {
            from: SchedulerState::Running,
            to: SchedulerState::Faulted,
        }));
        assert!(seen.iter().any(|u| matches!(
            u,
            SchedulerUpdate::Fault {
                class: ErrorClass::BackendFailure,
                ..
            }
        )));

        scheduler.arm(RecordingSender::new()).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Armed);
    }

    #[test]
    fn stop_flushes_sounding_notes() {
        let recorder = RecordingSender::new();
        let mut scheduler = scheduler(Config::default());
        scheduler.arm(recorder.clone()).unwrap();
        let clock = VirtualClock::new();
        scheduler.start(clock.now()).unwrap();
        scheduler.poll(&clock).unwrap();
        assert_eq!(scheduler.output().sounding().len(), 2);

        scheduler.stop().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(recorder.closed());
        assert_no_stuck_notes(&recorder.messages());
        scheduler.stop().unwrap();
    }
}
