//! Error taxonomy shared by the replica RPC, the coordinator and the gateways.
//!
//! A missing key is not an error anywhere in this crate: reads return
//! `Option`, deletes return `bool`.

use std::{fmt, io, time::Duration};

use thiserror::Error;

/// Failure to complete a call against a replica.
///
/// The coordinator never retries on these. During prepare they count as a
/// "no" vote, during commit/abort they are logged and the replica is left
/// divergent.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error talking to replica: {0}")]
    Io(#[from] io::Error),
    #[error("malformed replica message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("replica reported an error: {0}")]
    Remote(String),
    #[error("replica call timed out after {0:?}")]
    Timeout(Duration),
    #[error("replica closed the connection before replying")]
    Closed,
    #[error("replica task failed: {0}")]
    Task(String),
}

/// A gateway request line that could not be turned into a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// A replica's answer to prepare, as seen by the coordinator.
#[derive(Debug)]
pub enum Vote {
    Yes,
    /// The replica answered and said no.
    Rejected,
    /// The replica could not be asked; counts as a no.
    Unreachable(TransportError),
}

impl Vote {
    pub fn is_yes(&self) -> bool {
        matches!(self, Vote::Yes)
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vote::Yes => f.write_str("yes"),
            Vote::Rejected => f.write_str("rejected"),
            Vote::Unreachable(err) => write!(f, "unreachable ({err})"),
        }
    }
}
