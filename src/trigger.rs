//! Single-subscriber notification path for probe trigger messages.

use log::debug;
use crate::protocol::TriggerMessage;

pub type TriggerHandler = Box<dyn FnMut(TriggerMessage)>;

/// Holds at most one handler. Registering replaces the current holder; there is no queue.
#[derive(Default)]
pub struct TriggerChannel {
    handler: Option<TriggerHandler>,
    delivered: u64,
    dropped: u64,
}

impl TriggerChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler`, revoking any previous one. Returns true if one was revoked.
    pub fn set_handler(&mut self, handler: TriggerHandler) -> bool {
        let replaced = self.handler.replace(handler).is_some();
        if replaced {
            debug!("Trigger handler replaced; previous subscriber revoked");
        }
        replaced
    }

    /// Returns true if a handler was installed.
    pub fn clear_handler(&mut self) -> bool {
        self.handler.take().is_some()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Hands `msg` to the current handler. Messages without a subscriber are dropped.
    pub fn dispatch(&mut self, msg: TriggerMessage) -> bool {
        match self.handler.as_mut() {
            Some(handler) => {
                handler(msg);
                self.delivered += 1;
                true
            }
            None => {
                self.dropped += 1;
                debug!("Trigger t={} dropped: no handler registered", msg.t);
                false
            }
        }
    }

    /// (delivered, dropped) counters since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.delivered, self.dropped)
    }
}
