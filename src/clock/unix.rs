use super::HostClock;
use log::error;
use libc::{self, clock_gettime, timespec, CLOCK_MONOTONIC};
use std::mem;

/// CLOCK_MONOTONIC, the same base the platform MIDI stack stamps packets with.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock
    }
}

impl HostClock for MonotonicClock {
    fn now_micros(&self) -> i64 {
        let mut ts: timespec = unsafe { mem::zeroed() };
        let ret = unsafe { clock_gettime(CLOCK_MONOTONIC, &mut ts) };
        reading_to_micros(ret, ts.tv_sec as i64, ts.tv_nsec as i64)
    }
}

/// Converts a `clock_gettime` result; a failed read is logged and yields 0.
fn reading_to_micros(ret: i32, sec: i64, nsec: i64) -> i64 {
    if ret != 0 {
        error!("clock_gettime(CLOCK_MONOTONIC) failed: {}", std::io::Error::last_os_error());
        return 0;
    }
    timespec_to_micros(sec, nsec)
}

fn timespec_to_micros(sec: i64, nsec: i64) -> i64 {
    sec * 1_000_000 + nsec / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timespec_to_micros() {
        assert_eq!(timespec_to_micros(0, 0), 0);
        assert_eq!(timespec_to_micros(1, 999), 1_000_000);
        assert_eq!(timespec_to_micros(2, 1_500), 2_000_001);
        assert_eq!(timespec_to_micros(10, 999_999_999), 10_999_999);
    }

    #[test]
    fn test_failed_reading_yields_zero() {
        let _ = env_logger::builder().is_test(true).try_init();
        assert_eq!(reading_to_micros(-1, 5, 0), 0);
        assert_eq!(reading_to_micros(0, 5, 0), 5_000_000);
    }

    #[test]
    fn test_monotonic_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now_micros();
        assert!(prev > 0);
        for _ in 0..1000 {
            let now = clock.now_micros();
            assert!(now >= prev, "clock went backwards: {} -> {}", prev, now);
            prev = now;
        }
    }
}
