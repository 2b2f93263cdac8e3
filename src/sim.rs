//! Simulated probe with a virtual host clock.
//!
//! One shared [`SimState`] backs three handles: the command/notification
//! transport, the MIDI port and the host clock. Virtual time only moves when
//! a command round trip happens or the owner calls [`SimProbe::advance`], so
//! runs are deterministic for a given seed.

use anyhow::{anyhow, Result};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use crate::clock::HostClock;
use crate::protocol::{Command, MidiPacket, TriggerMessage};
use crate::traits::{MidiPort, ProbeTransport};

#[derive(Debug, Clone, PartialEq)]
pub struct SimParams {
    /// Probe emits a note -> host MIDI subsystem timestamps it.
    pub midi_in_latency_us: i64,
    /// MIDI subsystem timestamp -> packet visible to the application.
    pub app_latency_us: i64,
    /// Host schedules a note -> probe detects it.
    pub probe_detect_latency_us: i64,
    /// Probe clock rate error relative to the host.
    pub drift_ppm: f64,
    pub rtt_us: i64,
    pub rtt_jitter_us: i64,
    /// Probe stops emitting and detecting notes after this many.
    pub silent_after: Option<usize>,
    pub seed: u64,
}

impl Default for SimParams {
    fn default() -> Self {
        SimParams {
            midi_in_latency_us: 2_000,
            app_latency_us: 500,
            probe_detect_latency_us: 3_000,
            drift_ppm: 0.0,
            rtt_us: 400,
            rtt_jitter_us: 0,
            silent_after: None,
            seed: 1,
        }
    }
}

#[derive(Debug)]
struct PendingPacket {
    visible_at: i64,
    packet: MidiPacket,
}

#[derive(Debug)]
pub struct SimState {
    params: SimParams,
    rng: StdRng,
    now_us: i64,
    epoch_us: i64,

    port_open: bool,
    listening: bool,
    detect_armed: bool,

    notes_emitted: usize,
    notes_detected: usize,
    notes_missed: usize,

    incoming: VecDeque<PendingPacket>,
    scheduled: VecDeque<i64>,
    triggers: VecDeque<TriggerMessage>,
}

impl SimState {
    fn new(params: SimParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        SimState {
            params,
            rng,
            now_us: 1_000_000,
            epoch_us: 0,
            port_open: false,
            listening: false,
            detect_armed: false,
            notes_emitted: 0,
            notes_detected: 0,
            notes_missed: 0,
            incoming: VecDeque::new(),
            scheduled: VecDeque::new(),
            triggers: VecDeque::new(),
        }
    }

    fn probe_time(&self, host_us: i64) -> i64 {
        let elapsed = (host_us - self.epoch_us) as f64;
        (elapsed * (1.0 + self.params.drift_ppm * 1e-6)).round() as i64
    }

    fn silent(&self, count: usize) -> bool {
        self.params.silent_after.map_or(false, |limit| count >= limit)
    }

    fn advance(&mut self, us: i64) {
        self.now_us += us.max(0);
        self.settle();
    }

    /// Delivers scheduled notes whose detection time has passed.
    fn settle(&mut self) {
        while let Some(&at) = self.scheduled.front() {
            let detected_at = at + self.params.probe_detect_latency_us;
            if detected_at > self.now_us {
                break;
            }
            self.scheduled.pop_front();

            if !self.listening || !self.detect_armed || self.silent(self.notes_detected) {
                self.notes_missed += 1;
                debug!("[Sim] note sent at {}us went undetected", at);
                continue;
            }
            self.detect_armed = false;
            self.notes_detected += 1;
            let t = self.probe_time(detected_at);
            self.triggers.push_back(TriggerMessage { t });
        }
    }

    fn round_trip(&mut self) -> i64 {
        let jitter = self.params.rtt_jitter_us.max(0);
        let extra = if jitter > 0 { self.rng.random_range(0..=jitter) } else { 0 };
        self.params.rtt_us.max(0) + extra
    }

    fn respond(&mut self, cmd: Command) -> String {
        match cmd {
            Command::Reset => {
                self.epoch_us = self.now_us;
                "F".to_string()
            }
            Command::ReadClock => self.probe_time(self.now_us).to_string(),
            Command::Note => {
                if !self.silent(self.notes_emitted) {
                    self.notes_emitted += 1;
                    let ts = self.now_us + self.params.midi_in_latency_us;
                    self.incoming.push_back(PendingPacket {
                        visible_at: ts + self.params.app_latency_us,
                        packet: MidiPacket::new(vec![0x90, 60, 100], ts * 1000),
                    });
                }
                self.probe_time(self.now_us).to_string()
            }
            Command::Midi => {
                self.detect_armed = true;
                "M".to_string()
            }
        }
    }
}

/// Owner of the simulation; hands out the collaborator handles.
#[derive(Debug, Clone)]
pub struct SimProbe {
    state: Rc<RefCell<SimState>>,
}

impl SimProbe {
    pub fn new(params: SimParams) -> Self {
        SimProbe { state: Rc::new(RefCell::new(SimState::new(params))) }
    }

    pub fn transport(&self) -> SimTransport {
        SimTransport { state: self.state.clone() }
    }

    pub fn midi_port(&self) -> SimMidiPort {
        SimMidiPort { state: self.state.clone() }
    }

    pub fn clock(&self) -> SimClock {
        SimClock { state: self.state.clone() }
    }

    pub fn advance(&self, us: i64) {
        self.state.borrow_mut().advance(us);
    }

    pub fn now(&self) -> i64 {
        self.state.borrow().now_us
    }

    pub fn notes_emitted(&self) -> usize {
        self.state.borrow().notes_emitted
    }

    pub fn notes_detected(&self) -> usize {
        self.state.borrow().notes_detected
    }

    pub fn notes_missed(&self) -> usize {
        self.state.borrow().notes_missed
    }

    pub fn is_port_open(&self) -> bool {
        self.state.borrow().port_open
    }

    pub fn is_listening(&self) -> bool {
        self.state.borrow().listening
    }

    /// Queues a trigger notification as if the probe had sent one.
    pub fn inject_trigger(&self, msg: TriggerMessage) {
        self.state.borrow_mut().triggers.push_back(msg);
    }
}

pub struct SimTransport {
    state: Rc<RefCell<SimState>>,
}

impl ProbeTransport for SimTransport {
    fn request(&mut self, cmd: Command, timeout: Duration) -> Result<String> {
        let mut state = self.state.borrow_mut();
        let rtt = state.round_trip();
        let limit = timeout.as_micros() as i64;
        if rtt > limit {
            state.advance(limit);
            return Err(anyhow!("no reply to '{}' within {:?}", cmd.code() as char, timeout));
        }

        state.advance(rtt / 2);
        let reply = state.respond(cmd);
        state.advance(rtt - rtt / 2);
        Ok(reply)
    }

    fn start_listener(&mut self) -> Result<()> {
        self.state.borrow_mut().listening = true;
        Ok(())
    }

    fn stop_listener(&mut self) {
        let mut state = self.state.borrow_mut();
        state.listening = false;
        state.triggers.clear();
    }

    fn poll_trigger(&mut self) -> Result<Option<TriggerMessage>> {
        let mut state = self.state.borrow_mut();
        if !state.listening {
            return Ok(None);
        }
        Ok(state.triggers.pop_front())
    }
}

pub struct SimMidiPort {
    state: Rc<RefCell<SimState>>,
}

impl MidiPort for SimMidiPort {
    fn open(&mut self) -> Result<()> {
        self.state.borrow_mut().port_open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.port_open = false;
        state.scheduled.clear();
        state.incoming.clear();
        Ok(())
    }

    fn schedule_send(&mut self, bytes: &[u8], at_host_us: i64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.port_open {
            return Err(anyhow!("input port is not open"));
        }
        if bytes.is_empty() {
            return Err(anyhow!("refusing to send an empty MIDI message"));
        }
        state.scheduled.push_back(at_host_us);
        Ok(())
    }

    fn poll_received(&mut self) -> Result<Option<MidiPacket>> {
        let mut state = self.state.borrow_mut();
        let now = state.now_us;
        match state.incoming.front() {
            Some(pending) if pending.visible_at <= now => {
                Ok(state.incoming.pop_front().map(|p| p.packet))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Clone)]
pub struct SimClock {
    state: Rc<RefCell<SimState>>,
}

impl HostClock for SimClock {
    fn now_micros(&self) -> i64 {
        self.state.borrow().now_us
    }
}
