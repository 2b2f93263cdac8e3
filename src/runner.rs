use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use crate::session::SessionReport;

/// Invoked exactly once per session, when it reaches `Done`.
pub type CompletionCallback = Box<dyn FnMut(&SessionReport)>;

/// A trial engine driven by a cooperative event loop.
///
/// All state changes happen inside `run`, `poll` and `end`; the loop owner
/// calls `poll` repeatedly until `is_active` turns false.
pub trait TrialEngine {
    /// Starts a session. Rejected (and logged) while one is already active.
    fn run(&mut self);

    /// Handles due timers and pending notifications / MIDI input.
    fn poll(&mut self);

    /// Cancels the active session; collected data is still reported.
    fn end(&mut self);

    fn is_active(&self) -> bool;

    fn set_on_result(&mut self, callback: CompletionCallback);
}

/// Polls `engine` until its session ends, calling `idle` between iterations.
///
/// Clearing `running` cancels the session on the next iteration.
pub fn drive<E, F>(engine: &mut E, running: &AtomicBool, mut idle: F)
where
    E: TrialEngine + ?Sized,
    F: FnMut(),
{
    while engine.is_active() {
        if !running.load(Ordering::SeqCst) {
            info!("Stop requested, ending session");
            engine.end();
            break;
        }
        engine.poll();
        if engine.is_active() {
            idle();
        }
    }
}
