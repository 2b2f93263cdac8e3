//! Output-direction trial engine: the host emits notes, the probe reports detection.
//!
//! All N notes are scheduled up front at `t0 + i * interval`. Each trigger
//! notification is matched against the next expected send time, which is
//! advanced by `interval` per detection rather than recomputed from `i`.
//! One whole-run timeout bounds the wait for the last detection.

use log::{debug, info};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use crate::clock::HostClock;
use crate::config::OutputConfig;
use crate::error::TrialError;
use crate::link::ClockLink;
use crate::protocol::{Command, TriggerMessage};
use crate::runner::{CompletionCallback, TrialEngine};
use crate::session::{Direction, Outcome, Session, SessionReport};
use crate::timers::TimerQueue;
use crate::traits::{LogSink, MidiPort, ProbeTransport};

pub const SERIES_LATENCY: &str = "latency";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Idle,
    Scheduled,
    AwaitingDetections,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputTimer {
    RunTimeout,
}

pub struct MidiOutputTrial<T, C, M>
where
    T: ProbeTransport,
    C: HostClock,
    M: MidiPort,
{
    link: ClockLink<T, C>,
    port: M,
    config: OutputConfig,
    sink: Arc<dyn LogSink>,
    on_result: Option<CompletionCallback>,

    timers: TimerQueue<OutputTimer>,
    state: OutputState,
    session: Option<Session>,
    detections: Rc<RefCell<VecDeque<TriggerMessage>>>,
    last_expected_us: i64,
    last_report: Option<SessionReport>,
}

impl<T, C, M> MidiOutputTrial<T, C, M>
where
    T: ProbeTransport,
    C: HostClock,
    M: MidiPort,
{
    pub fn new(link: ClockLink<T, C>, port: M, config: OutputConfig, sink: Arc<dyn LogSink>) -> Self {
        MidiOutputTrial {
            link,
            port,
            config,
            sink,
            on_result: None,
            timers: TimerQueue::new(),
            state: OutputState::Idle,
            session: None,
            detections: Rc::new(RefCell::new(VecDeque::new())),
            last_expected_us: 0,
            last_report: None,
        }
    }

    pub fn set_repetitions(&mut self, repetitions: usize) {
        self.config.repetitions = repetitions;
    }

    pub fn state(&self) -> OutputState {
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

    fn log(&self, message: &str) {
        self.sink.log(message);
    }

    fn interval_us(&self) -> i64 {
        self.config.note_interval_us()
    }

    // ========================================================================
    // SETUP
    // ========================================================================

    fn setup(&mut self) -> Result<(), TrialError> {
        self.port.open().map_err(TrialError::transport)?;
        self.link.sync_clock()?;
        self.link.command(Command::Midi)?;
        self.link.start_listener()?;

        let queue = self.detections.clone();
        self.link.set_trigger_handler(Box::new(move |msg| queue.borrow_mut().push_back(msg)));

        self.schedule_notes()
    }

    fn schedule_notes(&mut self) -> Result<(), TrialError> {
        self.state = OutputState::Scheduled;
        let now = self.link.host_time_now();
        let interval = self.interval_us();
        let t0 = now.saturating_add(interval);

        for i in 0..self.config.repetitions {
            let at = t0.saturating_add(interval.saturating_mul(i as i64));
            self.port
                .schedule_send(&self.config.note, at)
                .map_err(TrialError::transport)?;
        }
        debug!("Scheduled {} notes from t0={}us every {}us", self.config.repetitions, t0, interval);

        self.last_expected_us = t0;
        self.timers.schedule(now.saturating_add(self.config.run_timeout_us()), OutputTimer::RunTimeout);
        self.state = OutputState::AwaitingDetections;
        Ok(())
    }

    // ========================================================================
    // EVENT HANDLERS
    // ========================================================================

    fn handle_detection(&mut self, msg: TriggerMessage) {
        if self.state != OutputState::AwaitingDetections {
            self.log(&format!("Ignoring detection at probe time {} us", msg.t));
            return;
        }

        let detected = match self.link.probe_to_host(msg.t) {
            Ok(t) => t,
            Err(e) => {
                self.log(&format!("Cannot place detection on host clock: {}", e));
                self.finish(Outcome::Aborted);
                return;
            }
        };

        let dt = (detected - self.last_expected_us) as f64 / 1000.0;
        self.log(&format!("Note detected: latency of {:.3} ms", dt));
        self.last_expected_us = self.last_expected_us.saturating_add(self.interval_us());

        let (done, complete) = match self.session.as_mut() {
            Some(session) => {
                session.record_trial(&[dt]);
                (session.repetitions_done(), session.is_complete())
            }
            None => return,
        };

        if complete {
            self.finish(Outcome::Completed);
            return;
        }

        if let Some(every) = self.config.sync_after_repetitions {
            if every > 0 && done % every == 0 {
                debug!("Resync after {} detections", done);
                if let Err(e) = self.link.sync_clock() {
                    self.log(&format!("Error syncing clocks: {}", e));
                    self.finish(Outcome::Aborted);
                    return;
                }
                // Anything still queued was stamped under the previous offset.
                let stale = self.detections.borrow_mut().drain(..).count();
                if stale > 0 {
                    self.log(&format!("Discarding {} detection(s) captured before resync", stale));
                }
            }
        }

        if let Err(e) = self.link.command(Command::Midi) {
            self.log(&format!("Failed to send command CMD_MIDI: {}", e));
            self.finish(Outcome::Aborted);
        }
    }

    fn handle_timer(&mut self, timer: OutputTimer) {
        match timer {
            OutputTimer::RunTimeout => {
                let err = TrialError::Timeout(format!(
                    "{} of {} notes detected",
                    self.session.as_ref().map_or(0, |s| s.repetitions_done()),
                    self.config.repetitions
                ));
                self.log(&format!("Timed out waiting for notes to be detected by the probe: {}", err));
                self.finish(Outcome::TimedOut);
            }
        }
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

        if let Err(e) = self.port.close() {
            self.log(&format!("Error, failed to close MIDI port: {:#}", e));
        }
        self.link.stop_listener();
        self.link.clear_trigger_handler();
        self.detections.borrow_mut().clear();
        self.link.check_drift();

        let report = session.report(outcome);
        for line in report.summary_lines() {
            self.log(&line);
        }
        info!(
            "Output session {} finished: {:?}, {}/{} repetitions",
            report.session_id, outcome, report.repetitions_done, report.repetitions_requested
        );

        self.state = OutputState::Done;
        if let Some(callback) = self.on_result.as_mut() {
            callback(&report);
        }
        self.last_report = Some(report);
    }
}

impl<T, C, M> TrialEngine for MidiOutputTrial<T, C, M>
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
            Direction::Output,
            self.config.repetitions,
            &[SERIES_LATENCY],
        ));
        self.timers.cancel_all();
        self.detections.borrow_mut().clear();
        self.state = OutputState::Idle;

        if let Err(e) = self.setup() {
            self.log(&format!("Error setting up test: {}", e));
            self.finish(Outcome::Aborted);
            return;
        }

        if self.session.as_ref().map_or(false, |s| s.is_complete()) {
            self.log("No repetitions requested");
            self.finish(Outcome::Completed);
        }
    }

    fn poll(&mut self) {
        if self.session.is_none() {
            return;
        }

        if let Err(e) = self.link.pump_triggers() {
            self.log(&format!("Trigger channel failed: {}", e));
            self.finish(Outcome::Aborted);
            return;
        }

        while self.session.is_some() {
            let next = self.detections.borrow_mut().pop_front();
            match next {
                Some(msg) => self.handle_detection(msg),
                None => break,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockHostClock;
    use crate::config::LinkConfig;
    use crate::sink::MemorySink;
    use crate::traits::{MockMidiPort, MockProbeTransport};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    type Engine = MidiOutputTrial<MockProbeTransport, MockHostClock, MockMidiPort>;

    struct Rig {
        now: Arc<AtomicI64>,
        triggers: Arc<Mutex<VecDeque<TriggerMessage>>>,
        sent: Arc<Mutex<Vec<i64>>>,
    }

    fn engine_with(config: OutputConfig, midi_fails_after: Option<usize>) -> (Engine, Rig, Arc<MemorySink>) {
        build(config, midi_fails_after, None)
    }

    /// Probe clock == host clock. Midi acks stop after `midi_fails_after` commands,
    /// Reset acks after `resets_ok`.
    fn build(
        config: OutputConfig,
        midi_fails_after: Option<usize>,
        resets_ok: Option<usize>,
    ) -> (Engine, Rig, Arc<MemorySink>) {
        let now = Arc::new(AtomicI64::new(2_000_000));
        let triggers = Arc::new(Mutex::new(VecDeque::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));

        let mut clock = MockHostClock::new();
        let clock_now = now.clone();
        clock.expect_now_micros().returning(move || clock_now.load(Ordering::SeqCst));

        let mut transport = MockProbeTransport::new();
        let probe_now = now.clone();
        let midi_count = Mutex::new(0usize);
        let reset_count = Mutex::new(0usize);
        transport.expect_request().returning(move |cmd, _| match cmd {
            Command::Reset => {
                let mut count = reset_count.lock().unwrap();
                *count += 1;
                match resets_ok {
                    Some(limit) if *count > limit => Err(anyhow!("probe stopped answering")),
                    _ => Ok("F".into()),
                }
            }
            Command::ReadClock => Ok(probe_now.load(Ordering::SeqCst).to_string()),
            Command::Midi => {
                let mut count = midi_count.lock().unwrap();
                *count += 1;
                match midi_fails_after {
                    Some(limit) if *count > limit => Err(anyhow!("probe stopped answering")),
                    _ => Ok("M".into()),
                }
            }
            Command::Note => Err(anyhow!("unexpected NOTE")),
        });
        transport.expect_start_listener().returning(|| Ok(()));
        transport.expect_stop_listener().return_const(());
        let pending = triggers.clone();
        transport
            .expect_poll_trigger()
            .returning(move || Ok(pending.lock().unwrap().pop_front()));

        let mut port = MockMidiPort::new();
        port.expect_open().returning(|| Ok(()));
        port.expect_close().returning(|| Ok(()));
        let sent_log = sent.clone();
        port.expect_schedule_send()
            .withf(|bytes, _| bytes.to_vec() == vec![0x90u8, 99, 0])
            .returning(move |_, at| {
                sent_log.lock().unwrap().push(at);
                Ok(())
            });
        port.expect_poll_received().returning(|| Ok(None));

        let sink = Arc::new(MemorySink::new());
        let link = ClockLink::new(transport, clock, LinkConfig::default(), sink.clone());
        let engine = MidiOutputTrial::new(link, port, config, sink.clone());
        (engine, Rig { now, triggers, sent }, sink)
    }

    fn capture(engine: &mut Engine) -> Rc<RefCell<Vec<SessionReport>>> {
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = reports.clone();
        engine.set_on_result(Box::new(move |r| sink.borrow_mut().push(r.clone())));
        reports
    }

    fn config(repetitions: usize) -> OutputConfig {
        OutputConfig { repetitions, ..OutputConfig::default() }
    }

    #[test]
    fn test_notes_scheduled_at_fixed_interval() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (mut engine, rig, _) = engine_with(config(4), None);
        engine.run();

        assert_eq!(engine.state(), OutputState::AwaitingDetections);
        assert!(engine.link().is_listening());
        assert!(engine.link().has_trigger_handler());
        assert_eq!(
            *rig.sent.lock().unwrap(),
            vec![2_300_000, 2_600_000, 2_900_000, 3_200_000]
        );
    }

    #[test]
    fn test_detections_produce_deltas() {
        let (mut engine, rig, _) = engine_with(config(3), None);
        let reports = capture(&mut engine);
        engine.run();

        // Detected 1.5ms, 2.0ms, 1.0ms after each expected send
        for (i, late) in [1_500, 2_000, 1_000].iter().enumerate() {
            let t = 2_300_000 + i as i64 * 300_000 + late;
            rig.now.store(t, Ordering::SeqCst);
            rig.triggers.lock().unwrap().push_back(TriggerMessage { t });
            engine.poll();
        }

        assert!(!engine.is_active());
        assert!(!engine.link().is_listening());
        assert!(!engine.link().has_trigger_handler());
        let reports = reports.borrow();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Outcome::Completed);
        assert_eq!(reports[0].series_named(SERIES_LATENCY).unwrap().values, vec![1.5, 2.0, 1.0]);
        assert_eq!(reports[0].median(SERIES_LATENCY), Some(1.5));
    }

    #[test]
    fn test_timeout_after_partial_detections() {
        let (mut engine, rig, sink) = engine_with(config(10), None);
        let reports = capture(&mut engine);
        engine.run();

        for i in 0..5 {
            let t = 2_300_000 + i * 300_000 + 1_000;
            rig.now.store(t, Ordering::SeqCst);
            rig.triggers.lock().unwrap().push_back(TriggerMessage { t });
            engine.poll();
        }
        assert!(engine.is_active());

        // Run timeout: 10 * 300ms + 1000ms after setup
        rig.now.store(2_000_000 + 4_000_000, Ordering::SeqCst);
        engine.poll();

        assert!(!engine.is_active());
        assert!(sink.contains("Timed out waiting for notes"));
        let reports = reports.borrow();
        assert_eq!(reports[0].outcome, Outcome::TimedOut);
        assert_eq!(reports[0].series_named(SERIES_LATENCY).unwrap().values.len(), 5);
    }

    #[test]
    fn test_rearm_failure_finalizes_with_partial_data() {
        // First Midi (setup) and one re-arm succeed, the second re-arm fails
        let (mut engine, rig, sink) = engine_with(config(5), Some(2));
        let reports = capture(&mut engine);
        engine.run();

        for i in 0..2 {
            let t = 2_300_000 + i * 300_000;
            rig.now.store(t, Ordering::SeqCst);
            rig.triggers.lock().unwrap().push_back(TriggerMessage { t });
            engine.poll();
        }

        assert!(!engine.is_active());
        assert!(sink.contains("Failed to send command CMD_MIDI"));
        assert_eq!(reports.borrow()[0].outcome, Outcome::Aborted);
        assert_eq!(reports.borrow()[0].repetitions_done, 2);
    }

    #[test]
    fn test_optional_resync_cadence() {
        let cfg = OutputConfig { sync_after_repetitions: Some(2), ..config(5) };
        let (mut engine, rig, _) = engine_with(cfg, None);
        engine.run();
        assert_eq!(engine.link().sync_count(), 1);

        for i in 0..5 {
            let t = 2_300_000 + i * 300_000;
            rig.now.store(t, Ordering::SeqCst);
            rig.triggers.lock().unwrap().push_back(TriggerMessage { t });
            engine.poll();
        }
        // Initial sync plus after detections 2 and 4; none after the last
        assert_eq!(engine.link().sync_count(), 3);
    }

    #[test]
    fn test_schedule_failure_aborts() {
        let mut clock = MockHostClock::new();
        clock.expect_now_micros().return_const(0i64);
        let mut transport = MockProbeTransport::new();
        transport.expect_request().returning(|cmd, _| match cmd {
            Command::Reset => Ok("F".into()),
            Command::Midi => Ok("M".into()),
            _ => Ok("0".into()),
        });
        transport.expect_start_listener().returning(|| Ok(()));
        transport.expect_stop_listener().times(1).return_const(());
        let mut port = MockMidiPort::new();
        port.expect_open().returning(|| Ok(()));
        port.expect_close().returning(|| Ok(()));
        port.expect_schedule_send()
            .returning(|_, _| Err(anyhow!("input port is not open")));

        let sink = Arc::new(MemorySink::new());
        let link = ClockLink::new(transport, clock, LinkConfig::default(), sink.clone());
        let mut engine = MidiOutputTrial::new(link, port, config(3), sink.clone());
        let reports = capture(&mut engine);
        engine.run();

        assert!(!engine.is_active());
        assert!(sink.contains("input port is not open"));
        assert_eq!(reports.borrow()[0].outcome, Outcome::Aborted);
        assert_eq!(reports.borrow()[0].repetitions_done, 0);
    }

    #[test]
    fn test_zero_repetitions_complete_immediately() {
        let (mut engine, rig, sink) = engine_with(config(0), None);
        let reports = capture(&mut engine);
        engine.run();

        assert!(!engine.is_active());
        assert!(rig.sent.lock().unwrap().is_empty());
        assert!(!engine.link().is_listening());
        assert!(!sink.contains("Timed out"));
        let reports = reports.borrow();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Outcome::Completed);
        assert_eq!(reports[0].repetitions_done, 0);
    }

    #[test]
    fn test_resync_failure_finalizes_with_collected_trials() {
        let cfg = OutputConfig { sync_after_repetitions: Some(2), ..config(5) };
        let (mut engine, rig, sink) = build(cfg, None, Some(1));
        let reports = capture(&mut engine);
        engine.run();

        for i in 0..2 {
            let t = 2_300_000 + i * 300_000 + 1_000;
            rig.now.store(t, Ordering::SeqCst);
            rig.triggers.lock().unwrap().push_back(TriggerMessage { t });
            engine.poll();
        }

        assert!(!engine.is_active());
        assert!(sink.contains("Error syncing clocks"));
        let reports = reports.borrow();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Outcome::Aborted);
        assert_eq!(reports[0].repetitions_done, 2);
        assert_eq!(reports[0].series_named(SERIES_LATENCY).unwrap().values, vec![1.0, 1.0]);
    }

    #[test]
    fn test_detections_queued_before_resync_are_discarded() {
        let cfg = OutputConfig { sync_after_repetitions: Some(1), ..config(5) };
        let (mut engine, rig, sink) = engine_with(cfg, None);
        engine.run();

        // Two detections land in the same poll
        rig.now.store(2_600_000, Ordering::SeqCst);
        rig.triggers.lock().unwrap().push_back(TriggerMessage { t: 2_300_000 });
        rig.triggers.lock().unwrap().push_back(TriggerMessage { t: 2_600_000 });
        engine.poll();

        assert!(engine.is_active());
        assert_eq!(engine.session().unwrap().repetitions_done(), 1);
        assert_eq!(engine.link().sync_count(), 2);
        assert!(sink.contains("Discarding 1 detection(s) captured before resync"));
    }
}
