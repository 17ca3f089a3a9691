//! Error types for the bridge.
//!
//! Every failure on the polling path is folded into a [`PollError`] whose
//! [`PollErrorKind`] drives logging and retry decisions. The mapping is:
//!
//! | Source                                         | Kind                |
//! |------------------------------------------------|---------------------|
//! | name resolution failed                         | `DnsUnresolved`     |
//! | connect refused/reset, transport I/O failure   | `Unreachable`       |
//! | connect or transaction timeout                 | `Timeout`           |
//! | mismatched response, undecodable payload       | `ProtocolOutOfSync` |
//! | exception response, missing session, the rest  | `Other`             |

use std::io;
use std::time::Duration;

use pidscope_common::MessageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollErrorKind {
    DnsUnresolved,
    Unreachable,
    Timeout,
    ProtocolOutOfSync,
    Other,
}

impl std::fmt::Display for PollErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollErrorKind::DnsUnresolved => write!(f, "dns_unresolved"),
            PollErrorKind::Unreachable => write!(f, "unreachable"),
            PollErrorKind::Timeout => write!(f, "timeout"),
            PollErrorKind::ProtocolOutOfSync => write!(f, "protocol_out_of_sync"),
            PollErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Failure to open a session with the device.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to resolve '{host}': {reason}")]
    Dns { host: String, reason: String },

    #[error("Device unreachable: {0}")]
    Unreachable(#[source] io::Error),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectError {
    pub fn kind(&self) -> PollErrorKind {
        match self {
            ConnectError::Dns { .. } => PollErrorKind::DnsUnresolved,
            ConnectError::Unreachable(e) if e.kind() == io::ErrorKind::TimedOut => {
                PollErrorKind::Timeout
            }
            ConnectError::Unreachable(_) => PollErrorKind::Unreachable,
            ConnectError::Timeout(_) => PollErrorKind::Timeout,
        }
    }
}

/// Failure of a single Modbus transaction on an open session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Device exception: {0}")]
    Exception(String),

    #[error("Response out of sync: {0}")]
    OutOfSync(String),

    #[error("Transaction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("No open session")]
    NotConnected,
}

impl ProtocolError {
    pub fn kind(&self) -> PollErrorKind {
        match self {
            ProtocolError::Exception(_) | ProtocolError::NotConnected => PollErrorKind::Other,
            ProtocolError::OutOfSync(_) => PollErrorKind::ProtocolOutOfSync,
            ProtocolError::Timeout(_) => PollErrorKind::Timeout,
            ProtocolError::Transport(e) if e.kind() == io::ErrorKind::TimedOut => {
                PollErrorKind::Timeout
            }
            ProtocolError::Transport(_) => PollErrorKind::Unreachable,
        }
    }
}

/// Malformed register payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Expected {expected} bytes of register data, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// A classified polling failure.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct PollError {
    pub kind: PollErrorKind,
    pub message: String,
}

impl From<ConnectError> for PollError {
    fn from(err: ConnectError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<ProtocolError> for PollError {
    fn from(err: ProtocolError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<DecodeError> for PollError {
    fn from(err: DecodeError) -> Self {
        Self {
            kind: PollErrorKind::ProtocolOutOfSync,
            message: err.to_string(),
        }
    }
}

/// Failure on the write path. Writes are never retried.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Write dropped: device link is backing off")]
    Suspended,

    #[error("Write has no values")]
    Empty,

    #[error("Write failed to connect: {0}")]
    Connect(#[from] ConnectError),

    #[error("Write failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Rejected or failed inbound subscriber message.
#[derive(Debug, Error)]
pub enum InboundError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Write(#[from] WriteError),
}
