use anyhow::Result;
use std::time::Duration;
use crate::protocol::{Command, MidiPacket, TriggerMessage};

/// Command/reply and notification channels to the probe.
#[cfg_attr(test, mockall::automock)]
pub trait ProbeTransport {
    /// Send a command and wait at most `timeout` for its reply line.
    fn request(&mut self, cmd: Command, timeout: Duration) -> Result<String>;

    /// Open the asynchronous notification path.
    fn start_listener(&mut self) -> Result<()>;

    fn stop_listener(&mut self);

    /// Returns Ok(Some(msg)) if a trigger notification is pending, Ok(None) otherwise.
    fn poll_trigger(&mut self) -> Result<Option<TriggerMessage>>;
}

/// Local MIDI connection to the probe.
#[cfg_attr(test, mockall::automock)]
pub trait MidiPort {
    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Queue `bytes` for transmission at host time `at_host_us`. The time is a hint.
    /// Fails if the port is not open.
    fn schedule_send(&mut self, bytes: &[u8], at_host_us: i64) -> Result<()>;

    /// Returns Ok(Some(packet)) if the MIDI layer delivered bytes, Ok(None) otherwise.
    fn poll_received(&mut self) -> Result<Option<MidiPacket>>;
}

/// Fire-and-forget sink for user-facing messages.
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str);
}
