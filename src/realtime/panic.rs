use super::sender::{MidiSender, SendError};
use crate::events::MidiMessage;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const ALL_NOTES_OFF: u8 = 123;

/// Notes that received a note-on and no note-off yet, per channel and pitch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoundingNotes {
    notes: BTreeMap<(u8, u8), u32>,
    channels_used: u16,
}

impl SoundingNotes {
    fn note_on(&mut self, channel: u8, pitch: u8) {
        *self.notes.entry((channel, pitch)).or_default() += 1;
        self.channels_used |= 1 << (channel & 0x0F);
    }

    fn note_off(&mut self, channel: u8, pitch: u8) {
        // A note-off silences the key no matter how many note-ons stacked up.
        self.notes.remove(&(channel, pitch));
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn contains(&self, channel: u8, pitch: u8) -> bool {
        self.notes.contains_key(&(channel, pitch))
    }

    pub fn keys(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.notes.keys().copied()
    }

    fn channels(&self) -> impl Iterator<Item = u8> + '_ {
        (0..16u8).filter(|ch| self.channels_used & (1 << ch) != 0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PanicReport {
    pub notes_released: usize,
    pub send_failures: usize,
    /// False when the sender lock could not be taken in time.
    pub completed: bool,
}

/// Lock order: sender, then sounding notes.
#[derive(Clone)]
pub struct OutputHandle {
    sender: Arc<Mutex<Option<Box<dyn MidiSender>>>>,
    sounding: Arc<Mutex<SoundingNotes>>,
    lock_timeout: Duration,
}

impl OutputHandle {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            sender: Arc::new(Mutex::new(None)),
            sounding: Arc::new(Mutex::new(SoundingNotes::default())),
            lock_timeout,
        }
    }

    pub fn install(&self, sender: Box<dyn MidiSender>) {
        let mut slot = self.sender.lock();
        if let Some(previous) = slot.replace(sender) {
            shut(previous);
        }
        *self.sounding.lock() = SoundingNotes::default();
    }

    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    pub fn sounding(&self) -> SoundingNotes {
        self.sounding.lock().clone()
    }

    pub fn send(&self, message: &MidiMessage, channel: u8) -> Result<(), SendError> {
        let mut slot = self.sender.lock();
        let sender = slot.as_mut().ok_or(SendError::Closed)?;
        match *message {
            // Recorded before sending: a half-sent note-on still gets released.
            MidiMessage::NoteOn { pitch, .. } => {
                self.sounding.lock().note_on(channel, pitch);
                sender.send(message, channel)
            }
            MidiMessage::NoteOff { pitch } => {
                sender.send(message, channel)?;
                self.sounding.lock().note_off(channel, pitch);
                Ok(())
            }
            _ => sender.send(message, channel),
        }
    }

    /// Sends a note-off for every sounding note and keeps the sender open.
    pub fn release(&self) -> PanicReport {
        self.silence(false, false)
    }

    /// Note-offs always go out; `all_notes_off` adds controller 123 on every
    /// channel used since the sender was installed.
    pub fn panic(&self, all_notes_off: bool) -> PanicReport {
        let report = self.silence(all_notes_off, true);
        if report.completed && (report.notes_released > 0 || report.send_failures > 0) {
            info!(
                released = report.notes_released,
                failures = report.send_failures,
                "panic"
            );
        }
        report
    }

    pub fn close(&self) {
        if let Some(sender) = self.sender.lock().take() {
            shut(sender);
        }
    }

    fn silence(&self, all_notes_off: bool, close: bool) -> PanicReport {
        let mut report = PanicReport::default();
        let Some(mut slot) = self.sender.try_lock_for(self.lock_timeout) else {
            error!(timeout = ?self.lock_timeout, "could not take the MIDI sender to silence notes");
            return report;
        };
        report.completed = true;

        let mut sounding = self.sounding.lock();
        let Some(sender) = slot.as_mut() else {
            *sounding = SoundingNotes::default();
            return report;
        };

        for (channel, pitch) in sounding.keys().collect::<Vec<_>>() {
            match sender.send(&MidiMessage::NoteOff { pitch }, channel) {
                Ok(()) => report.notes_released += 1,
                Err(err) => {
                    warn!(%err, channel, pitch, "note-off failed");
                    report.send_failures += 1;
                }
            }
        }
        if all_notes_off {
            for channel in sounding.channels().collect::<Vec<_>>() {
                let message = MidiMessage::ControlChange {
                    controller: ALL_NOTES_OFF,
                    value: 0,
                };
                if let Err(err) = sender.send(&message, channel) {
                    warn!(%err, channel, "all-notes-off failed");
                    report.send_failures += 1;
                }
            }
        }

        let channels_used = sounding.channels_used;
        *sounding = SoundingNotes::default();
        if close {
            if let Some(sender) = slot.take() {
                shut(sender);
            }
        } else {
            sounding.channels_used = channels_used;
        }
        report
    }
}

fn shut(mut sender: Box<dyn MidiSender>) {
    if let Err(err) = sender.close() {
        warn!(%err, "closing the MIDI output failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::sender::{RecordingSender, SentMessage};

    fn handle_with(recorder: &RecordingSender) -> OutputHandle {
        let handle = OutputHandle::new(Duration::from_millis(50));
        handle.install(Box::new(recorder.clone()));
        handle
    }

    #[test]
    fn tracks_sounding_notes() {
        let recorder = RecordingSender::new();
        let handle = handle_with(&recorder);
        handle
            .send(&MidiMessage::NoteOn { pitch: 60, velocity: 90 }, 0)
            .unwrap();
        handle
            .send(&MidiMessage::NoteOn { pitch: 64, velocity: 90 }, 1)
            .unwrap();
        handle.send(&MidiMessage::NoteOff { pitch: 60 }, 0).unwrap();

        let sounding = handle.sounding();
        assert_eq!(sounding.len(), 1);
        assert!(sounding.contains(1, 64));
    }

    #[test]
    fn panic_releases_then_closes_once() {
        let recorder = RecordingSender::new();
        let handle = handle_with(&recorder);
        handle
            .send(&MidiMessage::NoteOn { pitch: 60, velocity: 90 }, 2)
            .unwrap();

        let report = handle.panic(true);
        assert_eq!(report.notes_released, 1);
        assert!(report.completed);
        assert!(recorder.closed());
        assert!(!handle.is_open());
        assert_eq!(
            &recorder.messages()[1..],
            &[
                SentMessage {
                    message: MidiMessage::NoteOff { pitch: 60 },
                    channel: 2
                },
                SentMessage {
                    message: MidiMessage::ControlChange {
                        controller: 123,
                        value: 0
                    },
                    channel: 2
                },
            ]
        );

        assert_eq!(handle.panic(true).notes_released, 0);
        assert_eq!(recorder.messages().len(), 3);
    }

    #[test]
    fn panic_swallows_send_errors() {
        let recorder = RecordingSender::failing_after(1);
        let handle = handle_with(&recorder);
        handle
            .send(&MidiMessage::NoteOn { pitch: 60, velocity: 90 }, 0)
            .unwrap();
        assert!(
            handle
                .send(&MidiMessage::NoteOn { pitch: 61, velocity: 90 }, 0)
                .is_err()
        );

        let report = handle.panic(false);
        assert_eq!(report.send_failures, 2);
        assert!(handle.sounding().is_empty());
    }

    #[test]
    fn panic_without_controller_still_releases_notes() {
        let recorder = RecordingSender::new();
        let handle = handle_with(&recorder);
        handle
            .send(&MidiMessage::NoteOn { pitch: 48, velocity: 90 }, 5)
            .unwrap();

        let report = handle.panic(false);
        assert_eq!(report.notes_released, 1);
        assert_eq!(
            recorder.messages().last(),
            Some(&SentMessage {
                message: MidiMessage::NoteOff { pitch: 48 },
                channel: 5
            })
        );
        assert!(
            recorder
                .messages()
                .iter()
                .all(|m| !matches!(m.message, MidiMessage::ControlChange { .. }))
        );
    }

    struct StuckClose(RecordingSender);

    impl MidiSender for StuckClose {
        fn send(&mut self, message: &MidiMessage, channel: u8) -> Result<(), SendError> {
            self.0.send(message, channel)
        }

        fn close(&mut self) -> Result<(), SendError> {
            Err(SendError::Write("port vanished".into()))
        }
    }

    #[test]
    fn failed_close_still_empties_the_slot() {
        let recorder = RecordingSender::new();
        let handle = OutputHandle::new(Duration::from_millis(50));
        handle.install(Box::new(StuckClose(recorder.clone())));
        handle
            .send(&MidiMessage::NoteOn { pitch: 60, velocity: 90 }, 0)
            .unwrap();

        let report = handle.panic(true);
        assert!(report.completed);
        assert_eq!(report.notes_released, 1);
        assert!(!handle.is_open());

        handle.install(Box::new(StuckClose(recorder.clone())));
        handle.close();
        assert!(!handle.is_open());
    }

    #[test]
    fn release_keeps_the_sender() {
        let recorder = RecordingSender::new();
        let handle = handle_with(&recorder);
        handle
            .send(&MidiMessage::NoteOn { pitch: 60, velocity: 90 }, 0)
            .unwrap();
        assert_eq!(handle.release().notes_released, 1);
        assert!(handle.is_open());
        assert!(!recorder.closed());
    }
}
