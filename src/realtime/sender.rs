use crate::events::MidiMessage;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use midir::{MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const CLIENT_NAME: &str = "beatline";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no MIDI output port matches `{0}`")]
    PortNotFound(String),
    #[error("MIDI output is unavailable: {0}")]
    Unavailable(String),
    #[error("MIDI write failed: {0}")]
    Write(String),
    #[error("MIDI send did not complete within {0:?}")]
    Timeout(Duration),
    #[error("MIDI output is closed")]
    Closed,
}

/// Implementations may block inside `send`; wrap them in a
/// [`TimeoutSender`] to bound how long the scheduler waits.
pub trait MidiSender: Send {
    fn send(&mut self, message: &MidiMessage, channel: u8) -> Result<(), SendError>;

    /// The sender counts as closed afterwards even when this fails.
    fn close(&mut self) -> Result<(), SendError>;

    /// Checked once when the scheduler is armed.
    fn ready(&mut self) -> Result<(), SendError> {
        Ok(())
    }
}

impl<S: MidiSender + ?Sized> MidiSender for Box<S> {
    fn send(&mut self, message: &MidiMessage, channel: u8) -> Result<(), SendError> {
        (**self).send(message, channel)
    }

    fn close(&mut self) -> Result<(), SendError> {
        (**self).close()
    }

    fn ready(&mut self) -> Result<(), SendError> {
        (**self).ready()
    }
}

pub struct MidirSender {
    connection: Option<MidiOutputConnection>,
    port_name: String,
}

impl MidirSender {
    pub fn port_names() -> Result<Vec<String>, SendError> {
        let output =
            MidiOutput::new(CLIENT_NAME).map_err(|e| SendError::Unavailable(e.to_string()))?;
        output
            .ports()
            .iter()
            .map(|port| {
                output
                    .port_name(port)
                    .map_err(|e| SendError::Unavailable(e.to_string()))
            })
            .collect()
    }

    /// Connects to the first port whose name contains `port_hint`, or to
    /// the first port at all when no hint is given.
    pub fn open(port_hint: Option<&str>) -> Result<Self, SendError> {
        let output =
            MidiOutput::new(CLIENT_NAME).map_err(|e| SendError::Unavailable(e.to_string()))?;
        let ports = output.ports();

        let found = ports.iter().find_map(|port| {
            let name = output.port_name(port).ok()?;
            match port_hint {
                Some(hint) if !name.contains(hint) => None,
                _ => Some((port.clone(), name)),
            }
        });
        let Some((port, port_name)) = found else {
            return Err(SendError::PortNotFound(
                port_hint.unwrap_or("<any>").to_string(),
            ));
        };

        let connection = output
            .connect(&port, "beatline-out")
            .map_err(|e| SendError::Unavailable(e.to_string()))?;
        info!(port = %port_name, "connected MIDI output");

        Ok(Self {
            connection: Some(connection),
            port_name,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl MidiSender for MidirSender {
    fn send(&mut self, message: &MidiMessage, channel: u8) -> Result<(), SendError> {
        let connection = self.connection.as_mut().ok_or(SendError::Closed)?;
        let (bytes, len) = message.encode(channel);
        connection
            .send(&bytes[..len])
            .map_err(|e| SendError::Write(e.to_string()))
    }

    fn close(&mut self) -> Result<(), SendError> {
        if let Some(connection) = self.connection.take() {
            connection.close();
            info!(port = %self.port_name, "closed MIDI output");
        }
        Ok(())
    }

    fn ready(&mut self) -> Result<(), SendError> {
        match self.connection {
            Some(_) => Ok(()),
            None => Err(SendError::Closed),
        }
    }
}

enum Request {
    Send(MidiMessage, u8),
    Ready,
    Close,
}

/// A timed out call poisons the wrapper: every later call fails fast with
/// [`SendError::Closed`].
pub struct TimeoutSender {
    requests: Option<Sender<Request>>,
    replies: Receiver<Result<(), SendError>>,
    timeout: Duration,
    poisoned: bool,
    worker: Option<JoinHandle<()>>,
}

impl TimeoutSender {
    pub fn spawn<S: MidiSender + 'static>(inner: S, timeout: Duration) -> Result<Self, SendError> {
        let (request_tx, request_rx) = channel::unbounded::<Request>();
        let (reply_tx, reply_rx) = channel::unbounded();

        let worker = thread::Builder::new()
            .name("beatline-midi-send".into())
            .spawn(move || {
                let mut inner = inner;
                while let Ok(request) = request_rx.recv() {
                    let reply = match request {
                        Request::Send(message, channel) => inner.send(&message, channel),
                        Request::Ready => inner.ready(),
                        Request::Close => break,
                    };
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                let _ = reply_tx.send(inner.close());
            })
            .map_err(|e| SendError::Unavailable(e.to_string()))?;

        Ok(Self {
            requests: Some(request_tx),
            replies: reply_rx,
            timeout,
            poisoned: false,
            worker: Some(worker),
        })
    }

    fn call(&mut self, request: Request) -> Result<(), SendError> {
        if self.poisoned {
            return Err(SendError::Closed);
        }
        let requests = self.requests.as_ref().ok_or(SendError::Closed)?;
        requests.send(request).map_err(|_| SendError::Closed)?;

        match self.replies.recv_timeout(self.timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?self.timeout, "MIDI send timed out");
                self.poisoned = true;
                Err(SendError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SendError::Closed),
        }
    }
}

impl MidiSender for TimeoutSender {
    fn send(&mut self, message: &MidiMessage, channel: u8) -> Result<(), SendError> {
        self.call(Request::Send(*message, channel))
    }

    fn close(&mut self) -> Result<(), SendError> {
        let Some(requests) = self.requests.take() else {
            return Ok(());
        };
        if self.poisoned {
            // The worker is stuck in the backend; leave it detached.
            self.worker.take();
            return Err(SendError::Timeout(self.timeout));
        }
        let _ = requests.send(Request::Close);
        match self.replies.recv_timeout(self.timeout) {
            Ok(reply) => {
                if let Some(worker) = self.worker.take() {
                    let _ = worker.join();
                }
                reply
            }
            Err(RecvTimeoutError::Timeout) => Err(SendError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(SendError::Closed),
        }
    }

    fn ready(&mut self) -> Result<(), SendError> {
        self.call(Request::Ready)
    }
}

impl Drop for TimeoutSender {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(%err, "MIDI worker left detached");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub message: MidiMessage,
    pub channel: u8,
}

#[derive(Debug, Default)]
struct Recording {
    messages: Vec<SentMessage>,
    closed: bool,
    fail_after: Option<usize>,
}

/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingSender {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `count` messages, then fails every send with a write error.
    pub fn failing_after(count: usize) -> Self {
        let sender = Self::default();
        sender.recording.lock().fail_after = Some(count);
        sender
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.recording.lock().messages.clone()
    }

    pub fn closed(&self) -> bool {
        self.recording.lock().closed
    }
}

impl MidiSender for RecordingSender {
    fn send(&mut self, message: &MidiMessage, channel: u8) -> Result<(), SendError> {
        let mut recording = self.recording.lock();
        if recording.closed {
            return Err(SendError::Closed);
        }
        if recording
            .fail_after
            .is_some_and(|limit| recording.messages.len() >= limit)
        {
            return Err(SendError::Write("injected failure".into()));
        }
        debug!(?message, channel, "recorded");
        recording.messages.push(SentMessage {
            message: *message,
            channel,
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), SendError> {
        self.recording.lock().closed = true;
        Ok(())
    }

    fn ready(&mut self) -> Result<(), SendError> {
        if self.recording.lock().closed {
            return Err(SendError::Closed);
        }
        Ok(())
    }
}
