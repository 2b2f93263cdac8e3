use super::HostClock;
use std::time::Instant;

/// Process-relative monotonic clock for platforms without CLOCK_MONOTONIC.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now_micros(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }
}
