#[cfg(unix)]
pub mod unix;
#[cfg(unix)]
pub use unix::MonotonicClock;

#[cfg(not(unix))]
pub mod fallback;
#[cfg(not(unix))]
pub use fallback::MonotonicClock;

/// Host monotonic time source, in microseconds.
///
/// Probe timestamps are converted into this time base, so every host-side
/// observation must be taken from the same clock.
#[cfg_attr(test, mockall::automock)]
pub trait HostClock {
    fn now_micros(&self) -> i64;
}
