//! Deferred callbacks for the cooperative event loop.
//!
//! Timers carry a plain value describing what should happen next; the owning
//! engine matches on it when the timer comes due.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
pub struct TimerQueue<K> {
    // (deadline_us, id) orders by deadline, then by scheduling order
    pending: BTreeMap<(i64, TimerId), K>,
    next_id: u64,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        TimerQueue { pending: BTreeMap::new(), next_id: 0 }
    }
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline_us: i64, kind: K) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.pending.insert((deadline_us, id), kind);
        id
    }

    /// Returns true if the timer was still pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let key = self.pending.keys().find(|(_, tid)| *tid == id).copied();
        match key {
            Some(key) => self.pending.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    /// Removes and returns the earliest timer whose deadline is at or before `now_us`.
    pub fn pop_due(&mut self, now_us: i64) -> Option<(TimerId, K)> {
        let key = *self.pending.keys().next()?;
        if key.0 > now_us {
            return None;
        }
        self.pending.remove(&key).map(|kind| (key.1, kind))
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(300, "late");
        timers.schedule(100, "early");
        timers.schedule(100, "early-second");

        assert!(timers.pop_due(99).is_none());
        assert_eq!(timers.pop_due(100).map(|(_, k)| k), Some("early"));
        assert_eq!(timers.pop_due(100).map(|(_, k)| k), Some("early-second"));
        assert!(timers.pop_due(200).is_none());
        assert_eq!(timers.next_deadline(), Some(300));
        assert_eq!(timers.pop_due(1_000).map(|(_, k)| k), Some("late"));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_cancel() {
        let mut timers = TimerQueue::new();
        let a = timers.schedule(10, 'a');
        let b = timers.schedule(20, 'b');

        assert!(timers.cancel(a));
        assert!(!timers.cancel(a));
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.pop_due(50), Some((b, 'b')));
    }

    #[test]
    fn test_cancel_all() {
        let mut timers = TimerQueue::new();
        timers.schedule(1, ());
        timers.schedule(2, ());
        timers.cancel_all();
        assert!(timers.pop_due(i64::MAX).is_none());
        assert_eq!(timers.next_deadline(), None);
    }
}
