//! Session errors

use std::fmt;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use super::session::SessionState;

/// Protocol phase in which a transport failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Handshake,
    Transfer,
    Terminate,
    Drain,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Open => "open",
            Phase::Handshake => "handshake",
            Phase::Transfer => "transfer",
            Phase::Terminate => "terminate",
            Phase::Drain => "drain",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection error during {phase}: {source}")]
    Connection {
        phase: Phase,
        #[source]
        source: tungstenite::Error,
    },

    #[error("failed to encode handshake: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("chunk size must be positive")]
    InvalidChunkSize,

    #[error("cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("session is closed")]
    Closed,

    #[error("session cancelled")]
    Cancelled,
}

impl SessionError {
    pub(crate) fn connection(phase: Phase, source: tungstenite::Error) -> Self {
        Self::Connection { phase, source }
    }

    /// Phase of a transport failure, if this is one
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Connection { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
