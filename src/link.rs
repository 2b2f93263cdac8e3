//! Clock Link - command channel, clock offset and trigger notifications for one probe.
//!
//! The probe runs its own microsecond clock. After [`ClockLink::sync_clock`] every probe
//! timestamp can be moved onto the host monotonic timeline with
//! `host_time = probe_time + offset`.
//!
//! Synchronization:
//! 1. `Reset` zeroes the probe clock; the midpoint of that exchange is the base time
//! 2. `sync_rounds` x `ReadClock` round trips, each giving `offset = (t1 + t2) / 2 - t_probe`
//! 3. The round with the smallest round-trip time wins (lucky packet selection)

use log::{debug, info, warn};
use std::sync::Arc;
use crate::clock::HostClock;
use crate::config::LinkConfig;
use crate::error::{TrialError, TrialResult};
use crate::protocol::{Command, Reply};
use crate::traits::{LogSink, ProbeTransport};
use crate::trigger::{TriggerChannel, TriggerHandler};

/// One offset measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSample {
    pub offset_us: i64,
    pub rtt_us: i64,
}

pub struct ClockLink<T, C>
where
    T: ProbeTransport,
    C: HostClock,
{
    transport: T,
    clock: C,
    config: LinkConfig,
    sink: Arc<dyn LogSink>,

    offset_us: Option<i64>,
    base_time_us: Option<i64>,
    sync_count: usize,
    last_drift_us: Option<i64>,

    listening: bool,
    triggers: TriggerChannel,
}

impl<T, C> ClockLink<T, C>
where
    T: ProbeTransport,
    C: HostClock,
{
    pub fn new(transport: T, clock: C, config: LinkConfig, sink: Arc<dyn LogSink>) -> Self {
        ClockLink {
            transport,
            clock,
            config,
            sink,
            offset_us: None,
            base_time_us: None,
            sync_count: 0,
            last_drift_us: None,
            listening: false,
            triggers: TriggerChannel::new(),
        }
    }

    // ========================================================================
    // CLOCK
    // ========================================================================

    /// Zeroes the probe clock and establishes a fresh offset.
    pub fn sync_clock(&mut self) -> TrialResult<i64> {
        let t1 = self.clock.now_micros();
        self.command(Command::Reset)?;
        let t2 = self.clock.now_micros();
        let base_time = t1 + (t2 - t1) / 2;

        let sample = self.measure_offset()?;

        self.base_time_us = Some(base_time);
        self.offset_us = Some(sample.offset_us);
        self.sync_count += 1;

        info!(
            "[Sync #{}] offset={}us rtt={}us base={}us",
            self.sync_count, sample.offset_us, sample.rtt_us, base_time
        );
        self.sink.log(&format!(
            "Synced clocks, offset {} us, round trip {} us",
            sample.offset_us, sample.rtt_us
        ));
        Ok(sample.offset_us)
    }

    /// Runs the ReadClock rounds and returns the lowest-RTT sample.
    pub fn measure_offset(&mut self) -> TrialResult<OffsetSample> {
        let rounds = self.config.sync_rounds.max(1);
        let mut best: Option<OffsetSample> = None;

        for _ in 0..rounds {
            let t1 = self.clock.now_micros();
            let t_probe = self.command(Command::ReadClock)?.timestamp()?;
            let t2 = self.clock.now_micros();

            let sample = OffsetSample {
                offset_us: t1 + (t2 - t1) / 2 - t_probe,
                rtt_us: t2 - t1,
            };
            debug!("ReadClock: t1={} probe={} t2={} -> {:?}", t1, t_probe, t2, sample);

            if best.map_or(true, |b| sample.rtt_us < b.rtt_us) {
                best = Some(sample);
            }
        }

        best.ok_or_else(|| TrialError::Protocol("no clock samples collected".into()))
    }

    /// Re-measures the offset and logs its difference to the established one.
    ///
    /// Never fails and never changes the established offset.
    pub fn check_drift(&mut self) -> Option<i64> {
        let established = match self.offset_us {
            Some(offset) => offset,
            None => {
                self.sink.log("Drift check skipped: clocks were never synced");
                return None;
            }
        };

        let sample = match self.measure_offset() {
            Ok(sample) => sample,
            Err(e) => {
                warn!("[Drift] measurement failed: {}", e);
                self.sink.log(&format!("Drift check failed: {}", e));
                return None;
            }
        };

        let drift = sample.offset_us - established;
        self.last_drift_us = Some(drift);

        if drift.abs() > self.config.drift_warn_threshold_us {
            warn!("[Drift] {:+}us exceeds {}us", drift, self.config.drift_warn_threshold_us);
            self.sink.log(&format!(
                "Clock drift of {:+} us exceeds {} us, consider resyncing more often",
                drift, self.config.drift_warn_threshold_us
            ));
        } else {
            info!("[Drift] {:+}us (rtt {}us)", drift, sample.rtt_us);
            self.sink.log(&format!("Remote clock delayed by {:+} us", drift));
        }
        Some(drift)
    }

    pub fn host_time_now(&self) -> i64 {
        self.clock.now_micros()
    }

    /// Converts a probe timestamp to host monotonic microseconds.
    pub fn probe_to_host(&self, probe_us: i64) -> TrialResult<i64> {
        self.offset_us
            .map(|offset| probe_us + offset)
            .ok_or_else(|| TrialError::Protocol("clock not synchronized".into()))
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset_us
    }

    pub fn base_time(&self) -> Option<i64> {
        self.base_time_us
    }

    pub fn sync_count(&self) -> usize {
        self.sync_count
    }

    pub fn last_drift(&self) -> Option<i64> {
        self.last_drift_us
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Sends one command and blocks (bounded) for its reply.
    ///
    /// Takes `&mut self`, so a second command cannot be issued while a reply is outstanding.
    pub fn command(&mut self, cmd: Command) -> TrialResult<Reply> {
        let raw = self
            .transport
            .request(cmd, self.config.command_timeout())
            .map_err(TrialError::communication)?;
        debug!("Command '{}' -> {:?}", cmd.code() as char, raw.trim());
        cmd.parse_reply(&raw)
    }

    // ========================================================================
    // NOTIFICATIONS
    // ========================================================================

    pub fn start_listener(&mut self) -> TrialResult<()> {
        if self.listening {
            return Ok(());
        }
        self.transport.start_listener().map_err(TrialError::communication)?;
        self.listening = true;
        debug!("Trigger listener started");
        Ok(())
    }

    pub fn stop_listener(&mut self) {
        if self.listening {
            self.transport.stop_listener();
            self.listening = false;
            debug!("Trigger listener stopped");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn set_trigger_handler(&mut self, handler: TriggerHandler) {
        self.triggers.set_handler(handler);
    }

    pub fn clear_trigger_handler(&mut self) {
        self.triggers.clear_handler();
    }

    pub fn has_trigger_handler(&self) -> bool {
        self.triggers.has_handler()
    }

    /// Moves every pending trigger from the transport to the current handler.
    pub fn pump_triggers(&mut self) -> TrialResult<usize> {
        if !self.listening {
            return Ok(0);
        }
        let mut delivered = 0;
        while let Some(msg) = self.transport.poll_trigger().map_err(TrialError::communication)? {
            if self.triggers.dispatch(msg) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

// ============================================================================
// TESTS
// ============================================================================
