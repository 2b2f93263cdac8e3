use thiserror::Error;

/// Failure kinds the trial engines branch on.
///
/// None of these are fatal to the process: the engine that receives one decides
/// whether to drop the trial, end the run early, or only log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrialError {
    /// Transport failure or timeout talking to the probe.
    #[error("communication with probe failed: {0}")]
    Communication(String),

    /// The probe answered, but the reply could not be understood.
    #[error("malformed reply from probe: {0}")]
    Protocol(String),

    /// A MIDI receive callback delivered bytes that are not a note-on.
    #[error("unexpected MIDI data: {0}")]
    UnexpectedData(String),

    /// Nothing was observed within the configured bound.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The local MIDI port rejected a send (usually: port not open).
    #[error("MIDI transport error: {0}")]
    Transport(String),
}

impl TrialError {
    /// Wraps an opaque collaborator error, keeping the whole context chain.
    pub fn communication(err: anyhow::Error) -> Self {
        TrialError::Communication(format!("{:#}", err))
    }

    pub fn transport(err: anyhow::Error) -> Self {
        TrialError::Transport(format!("{:#}", err))
    }
}

pub type TrialResult<T> = std::result::Result<T, TrialError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn test_communication_keeps_context_chain() {
        let err: anyhow::Result<()> = Err(anyhow!("port closed")).context("sending N");
        let wrapped = TrialError::communication(err.unwrap_err());
        assert_eq!(
            wrapped.to_string(),
            "communication with probe failed: sending N: port closed"
        );
    }

    #[test]
    fn test_transport_display() {
        let wrapped = TrialError::transport(anyhow!("input port is not open"));
        assert_eq!(wrapped.to_string(), "MIDI transport error: input port is not open");
    }
}
