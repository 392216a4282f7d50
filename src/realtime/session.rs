use super::clock::Clock;
use super::panic::{OutputHandle, PanicReport};
use super::scheduler::{Poll, Scheduler, SchedulerError, SchedulerUpdate};
use crate::timing::SchedulerState;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Stop,
}

pub fn run(
    scheduler: &mut Scheduler,
    clock: &dyn Clock,
    commands: &Receiver<SessionCommand>,
) -> Result<(), SchedulerError> {
    let tick = scheduler.config().tick();
    if scheduler.state() == SchedulerState::Armed {
        scheduler.start(clock.now())?;
    }

    let mut next_tick = clock.now();
    loop {
        match commands.try_recv() {
            Ok(SessionCommand::Stop) | Err(TryRecvError::Disconnected) => {
                return scheduler.stop();
            }
            Err(TryRecvError::Empty) => {}
        }

        if scheduler.poll(clock)? == Poll::Finished {
            return Ok(());
        }

        next_tick = (next_tick + tick).max(clock.now());
        clock.sleep_until(next_tick);
    }
}

pub struct SessionEnd {
    /// The scheduler, ready to be armed again. `None` when the loop thread
    /// could not be joined.
    pub scheduler: Option<Scheduler>,
    pub result: Result<(), SchedulerError>,
    pub panic: PanicReport,
}

pub struct Session {
    commands: Sender<SessionCommand>,
    done: Receiver<()>,
    worker: Option<JoinHandle<(Scheduler, Result<(), SchedulerError>)>>,
    output: OutputHandle,
    updates: Receiver<SchedulerUpdate>,
    stop_timeout: Duration,
    all_notes_off: bool,
}

impl Session {
    pub fn spawn(scheduler: Scheduler, clock: Box<dyn Clock>) -> Result<Self, SchedulerError> {
        if scheduler.state() != SchedulerState::Armed {
            return Err(SchedulerError::InvalidTransition {
                from: scheduler.state(),
                to: SchedulerState::Running,
            });
        }

        let (command_tx, command_rx) = channel::unbounded();
        let (done_tx, done_rx) = channel::bounded(1);
        let output = scheduler.output();
        let updates = scheduler.updates();
        let stop_timeout = scheduler.config().stop_timeout();
        let all_notes_off = scheduler.config().panic_enabled;

        let worker = thread::Builder::new()
            .name("beatline-scheduler".into())
            .spawn(move || {
                let mut scheduler = scheduler;
                let result = run(&mut scheduler, clock.as_ref(), &command_rx);
                if let Err(err) = &result {
                    error!(%err, class = %err.class(), "session ended with an error");
                }
                let _ = done_tx.send(());
                (scheduler, result)
            })
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;
        info!("session started");

        Ok(Self {
            commands: command_tx,
            done: done_rx,
            worker: Some(worker),
            output,
            updates,
            stop_timeout,
            all_notes_off,
        })
    }

    pub fn updates(&self) -> Receiver<SchedulerUpdate> {
        self.updates.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(|w| w.is_finished())
    }

    /// Asks the loop to stop, waits for it to hand over the output, then
    /// silences anything still sounding.
    pub fn stop(mut self) -> SessionEnd {
        let _ = self.commands.send(SessionCommand::Stop);
        match self.done.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => self.conclude(),
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?self.stop_timeout, "scheduler loop did not acknowledge stop");
                let panic = self.output.panic(self.all_notes_off);
                // Left detached; it exits once it sees the closed output.
                self.worker.take();
                SessionEnd {
                    scheduler: None,
                    result: Err(SchedulerError::StopTimeout(self.stop_timeout)),
                    panic,
                }
            }
        }
    }

    pub fn wait(mut self) -> SessionEnd {
        let _ = self.done.recv();
        self.conclude()
    }

    fn conclude(&mut self) -> SessionEnd {
        let panic = self.output.panic(self.all_notes_off);
        let joined = self.worker.take().map(JoinHandle::join);
        match joined {
            Some(Ok((scheduler, result))) => SessionEnd {
                scheduler: Some(scheduler),
                result,
                panic,
            },
            _ => SessionEnd {
                scheduler: None,
                result: Err(SchedulerError::WorkerPanicked),
                panic,
            },
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        let _ = self.commands.send(SessionCommand::Stop);
        let _ = self.done.recv_timeout(self.stop_timeout);
        self.output.panic(self.all_notes_off);
    }
}
