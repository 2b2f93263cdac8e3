//! Input-direction trial engine: the probe emits a note, the host observes it.
//!
//! Per trial:
//! 1. `Note` command; the reply is the probe time the note was emitted (`t_walt`)
//! 2. Wait (bounded) for the MIDI layer to deliver a note-on
//! 3. `time_to_subsystem = t_sys - t_walt`, `total = t_app - t_walt`
//!
//! The clock is resynced every `sync_after_repetitions` trials to bound drift.

use log::{debug, info};
use std::sync::Arc;
use crate::clock::HostClock;
use crate::config::{ms_to_us, InputConfig};
use crate::error::TrialError;
use crate::link::ClockLink;
use crate::protocol::{Command, MidiPacket};
use crate::runner::{CompletionCallback, TrialEngine};
use crate::session::{Direction, Outcome, Session, SessionReport};
use crate::timers::{TimerId, TimerQueue};
use crate::traits::{LogSink, MidiPort, ProbeTransport};

pub const SERIES_TO_SUBSYSTEM: &str = "time_to_subsystem";
pub const SERIES_TOTAL: &str = "total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Idle,
    /// Next note request is waiting on its timer.
    Scheduled,
    AwaitingEmitAck,
    AwaitingObservation { t_walt_us: i64 },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputTimer {
    RequestNote,
    ObservationTimeout,
}

pub struct MidiInputTrial<T, C, M>
where
    T: ProbeTransport,
    C: HostClock,
    M: MidiPort,
{
    link: ClockLink<T, C>,
    port: M,
    config: InputConfig,
    sink: Arc<dyn LogSink>,
    on_result: Option<CompletionCallback>,

    timers: TimerQueue<InputTimer>,
    timeout_timer: Option<TimerId>,
    state: InputState,
    session: Option<Session>,
    protocol_failures: usize,
    last_report: Option<SessionReport>,
}

impl<T, C, M> MidiInputTrial<T, C, M>
where
    T: ProbeTransport,
    C: HostClock,
    M: MidiPort,
{
    pub fn new(link: ClockLink<T, C>, port: M, config: InputConfig, sink: Arc<dyn LogSink>) -> Self {
        MidiInputTrial {
            link,
            port,
            config,
            sink,
            on_result: None,
            timers: TimerQueue::new(),
            timeout_timer: None,
            state: InputState::Idle,
            session: None,
            protocol_failures: 0,
            last_report: None,
        }
    }

    pub fn set_repetitions(&mut self, repetitions: usize) {
        self.config.repetitions = repetitions;
    }

    pub fn state(&self) -> InputState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn last_report(&self) -> Option<&SessionReport> {
        self.last_report.as_ref()
    }

    pub fn link(&self) -> &ClockLink<T, C> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut ClockLink<T, C> {
        &mut self.link
    }

    pub fn port_mut(&mut self) -> &mut M {
        &mut self.port
    }

    fn log(&self, message: &str) {
        self.sink.log(message);
    }

    // ========================================================================
    // EVENT HANDLERS
    // ========================================================================

    fn handle_timer(&mut self, timer: InputTimer) {
        match timer {
            InputTimer::RequestNote => self.request_note(),
            InputTimer::ObservationTimeout => {
                self.timeout_timer = None;
                let err = TrialError::Timeout(format!(
                    "no note observed within {} ms",
                    self.config.observation_timeout_ms
                ));
                self.log(&format!("Timed out waiting for note: {}", err));
                self.finish(Outcome::TimedOut);
            }
        }
    }

    fn request_note(&mut self) {
        self.state = InputState::AwaitingEmitAck;
        self.log("Requesting note from probe...");

        let emitted = self
            .link
            .command(Command::Note)
            .and_then(|reply| reply.timestamp())
            .and_then(|t| self.link.probe_to_host(t));

        match emitted {
            Ok(t_walt_us) => {
                self.protocol_failures = 0;
                let deadline = self
                    .link
                    .host_time_now()
                    .saturating_add(self.config.observation_timeout_us());
                self.timeout_timer = Some(self.timers.schedule(deadline, InputTimer::ObservationTimeout));
                self.state = InputState::AwaitingObservation { t_walt_us };
            }
            Err(TrialError::Protocol(msg)) => {
                self.protocol_failures += 1;
                self.log(&format!("Discarding trial, bad NOTE reply: {}", msg));
                if self.protocol_failures >= self.config.max_protocol_failures.max(1) {
                    self.log(&format!(
                        "Giving up after {} malformed replies in a row",
                        self.protocol_failures
                    ));
                    self.finish(Outcome::Aborted);
                } else {
                    self.schedule_request(0);
                }
            }
            Err(e) => {
                self.log(&format!("Error sending NOTE command: {}", e));
                self.finish(Outcome::Aborted);
            }
        }
    }

    fn handle_packet(&mut self, packet: MidiPacket) {
        let t_walt_us = match self.state {
            InputState::AwaitingObservation { t_walt_us } => t_walt_us,
            _ => {
                match packet.check_note_on() {
                    Ok(()) => self.log("Ignoring note received while no trial is armed"),
                    Err(e) => self.log(&e.to_string()),
                }
                return;
            }
        };

        if let Err(e) = packet.check_note_on() {
            // Not a trial; keep waiting on the same observation slot.
            self.log(&e.to_string());
            return;
        }

        if let Some(id) = self.timeout_timer.take() {
            self.timers.cancel(id);
        }
        let t_app = self.link.host_time_now();
        let t_sys = packet.timestamp_us();

        let to_subsystem = (t_sys - t_walt_us) as f64 / 1000.0;
        let to_app = (t_app - t_sys) as f64 / 1000.0;
        let total = (t_app - t_walt_us) as f64 / 1000.0;
        self.log(&format!(
            "Result: Time to MIDI subsystem = {:.3} ms, Time to app = {:.3} ms, Total = {:.3} ms",
            to_subsystem, to_app, total
        ));

        let (done, complete) = match self.session.as_mut() {
            Some(session) => {
                session.record_trial(&[to_subsystem, total]);
                (session.repetitions_done(), session.is_complete())
            }
            None => return,
        };

        let every = self.config.sync_after_repetitions;
        if every > 0 && done > 0 && done % every == 0 {
            debug!("Resync after {} repetitions", done);
            if let Err(e) = self.link.sync_clock() {
                self.log(&format!("Error syncing clocks: {}", e));
                self.finish(Outcome::Aborted);
                return;
            }
        }

        if complete {
            self.finish(Outcome::Completed);
        } else {
            self.schedule_request(0);
        }
    }

    fn schedule_request(&mut self, delay_ms: u64) {
        let at = self.link.host_time_now().saturating_add(ms_to_us(delay_ms));
        self.timers.schedule(at, InputTimer::RequestNote);
        self.state = InputState::Scheduled;
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    fn finish(&mut self, outcome: Outcome) {
        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };

        self.timers.cancel_all();
        self.timeout_timer = None;

        if let Err(e) = self.port.close() {
            self.log(&format!("Error, failed to close MIDI port: {:#}", e));
        }
        self.link.check_drift();

        let report = session.report(outcome);
        if let Some(series) = report.series_named(SERIES_TO_SUBSYSTEM) {
            self.log(&format!("deltas: {:?}", series.values));
        }
        for line in report.summary_lines() {
            self.log(&line);
        }
        info!(
            "Input session {} finished: {:?}, {}/{} repetitions",
            report.session_id, outcome, report.repetitions_done, report.repetitions_requested
        );

        self.state = InputState::Done;
        if let Some(callback) = self.on_result.as_mut() {
            callback(&report);
        }
        self.last_report = Some(report);
    }
}

impl<T, C, M> TrialEngine for MidiInputTrial<T, C, M>
where
    T: ProbeTransport,
    C: HostClock,
    M: MidiPort,
{
    fn run(&mut self) {
        if self.session.is_some() {
            self.log("Test already running, ignoring start request");
            return;
        }

        self.session = Some(Session::new(
            Direction::Input,
            self.config.repetitions,
            &[SERIES_TO_SUBSYSTEM, SERIES_TOTAL],
        ));
        self.protocol_failures = 0;
        self.timers.cancel_all();
        self.state = InputState::Idle;

        if let Err(e) = self.port.open() {
            self.log(&format!("Error setting up test: {}", TrialError::transport(e)));
            self.finish(Outcome::Aborted);
            return;
        }
        if let Err(e) = self.link.sync_clock() {
            self.log(&format!("Error syncing clocks: {}", e));
            self.finish(Outcome::Aborted);
            return;
        }

        if self.session.as_ref().map_or(false, |s| s.is_complete()) {
            self.log("No repetitions requested");
            self.finish(Outcome::Completed);
            return;
        }
        self.schedule_request(self.config.start_delay_ms);
    }

    fn poll(&mut self) {
        // Packets first: a note that arrived before the deadline wins over the timeout.
        while self.session.is_some() {
            match self.port.poll_received() {
                Ok(Some(packet)) => self.handle_packet(packet),
                Ok(None) => break,
                Err(e) => {
                    self.log(&format!("MIDI receive failed: {:#}", e));
                    self.finish(Outcome::Aborted);
                }
            }
        }

        while self.session.is_some() {
            let now = self.link.host_time_now();
            match self.timers.pop_due(now) {
                Some((_, timer)) => self.handle_timer(timer),
                None => break,
            }
        }
    }

    fn end(&mut self) {
        if self.session.is_some() {
            self.log("Test cancelled");
            self.finish(Outcome::Cancelled);
        }
    }

    fn is_active(&self) -> bool {
        self.session.is_some()
    }

    fn set_on_result(&mut self, callback: CompletionCallback) {
        self.on_result = Some(callback);
    }
}

// ============================================================================
// TESTS
// ============================================================================
