//! Probe command set and the decoded message types exchanged with it.
//!
//! Framing is handled by the transport; by the time anything reaches this module
//! a command is one byte and a reply is one line of text.

use crate::error::{TrialError, TrialResult};
use serde::{Deserialize, Serialize};

/// MIDI status byte for "note on, channel 1".
pub const NOTE_ON_CH1: u8 = 0x90;

/// Requests understood by the probe firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Zero the probe clock. Reply: acknowledgement.
    Reset,
    /// Read the probe clock. Reply: probe time in microseconds.
    ReadClock,
    /// Emit one MIDI note. Reply: probe time at which the note left the wire.
    Note,
    /// Arm detection of the next incoming MIDI note. Reply: acknowledgement.
    Midi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Ack,
    Timestamp,
}

/// Decoded synchronous reply to a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    /// Probe-relative time in microseconds.
    Timestamp(i64),
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Reset => b'F',
            Command::ReadClock => b'T',
            Command::Note => b'N',
            Command::Midi => b'M',
        }
    }

    pub fn reply_kind(self) -> ReplyKind {
        match self {
            Command::Reset | Command::Midi => ReplyKind::Ack,
            Command::ReadClock | Command::Note => ReplyKind::Timestamp,
        }
    }

    /// Parses the raw reply text for this command.
    pub fn parse_reply(self, raw: &str) -> TrialResult<Reply> {
        let text = raw.trim();
        match self.reply_kind() {
            ReplyKind::Timestamp => text.parse::<i64>().map(Reply::Timestamp).map_err(|_| {
                TrialError::Protocol(format!(
                    "expected decimal timestamp for '{}', got {:?}",
                    self.code() as char,
                    text
                ))
            }),
            ReplyKind::Ack => {
                if text.as_bytes().first() == Some(&self.code()) {
                    Ok(Reply::Ack)
                } else {
                    Err(TrialError::Protocol(format!(
                        "expected acknowledgement '{}', got {:?}",
                        self.code() as char,
                        text
                    )))
                }
            }
        }
    }
}

impl Reply {
    pub fn timestamp(self) -> TrialResult<i64> {
        match self {
            Reply::Timestamp(t) => Ok(t),
            Reply::Ack => Err(TrialError::Protocol("expected timestamp, got acknowledgement".into())),
        }
    }
}

/// Asynchronous notification: the probe observed an event at probe time `t` (µs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerMessage {
    pub t: i64,
}

/// Bytes delivered by the local MIDI layer, as handed to a receive callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiPacket {
    pub data: Vec<u8>,
    pub offset: usize,
    pub count: usize,
    /// Host monotonic receipt time in nanoseconds.
    pub timestamp_ns: i64,
}

impl MidiPacket {
    pub fn new(data: Vec<u8>, timestamp_ns: i64) -> Self {
        let count = data.len();
        MidiPacket { data, offset: 0, count, timestamp_ns }
    }

    /// First byte of the delivered window, if the window is non-empty and in bounds.
    pub fn status(&self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        self.data.get(self.offset).copied()
    }

    /// Checks the note-on discriminator; anything else is unexpected data.
    pub fn check_note_on(&self) -> TrialResult<()> {
        match self.status() {
            Some(NOTE_ON_CH1) => Ok(()),
            Some(other) => Err(TrialError::UnexpectedData(format!(
                "expected 0x90, got 0x{:x} and count was {}",
                other, self.count
            ))),
            None => Err(TrialError::UnexpectedData(format!(
                "empty packet (offset {}, count {})",
                self.offset, self.count
            ))),
        }
    }

    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_ns / 1000
    }
}
