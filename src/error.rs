//! Error taxonomy for session commands, provider outcomes and dispatch.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::ConnectionState;

/// A caller command, named for error messages and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartScanning,
    StopScanning,
    Connect,
    Disconnect,
    StartStreaming,
    StopStreaming,
    Reset,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::StartScanning => "start scanning",
            Operation::StopScanning => "stop scanning",
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::StartStreaming => "start streaming",
            Operation::StopStreaming => "stop streaming",
            Operation::Reset => "reset",
        })
    }
}

/// Errors surfaced by the session and the dispatcher.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    /// The command is not allowed in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidStateTransition {
        operation: Operation,
        state: ConnectionState,
    },

    /// No connect confirmation arrived in time.
    #[error("connection to {address} timed out after {timeout:?}")]
    ConnectionTimeout { address: String, timeout: Duration },

    /// The provider reported that the connect attempt failed.
    #[error("connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// The link dropped without a caller request.
    #[error("link to {address} dropped unexpectedly")]
    UnexpectedDisconnect { address: String },

    /// A provider frame could not be decoded into a sample.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A listener callback returned an error or panicked.
    #[error("listener failed: {0}")]
    ListenerFailure(String),

    /// `connect_to` was given an address not discovered in this session.
    #[error("unknown device {0}")]
    UnknownDevice(String),

    /// A state or stream label that does not name any variant.
    #[error("unknown label {0:?}")]
    UnknownLabel(String),

    /// A provider primitive (discovery, stream control) failed.
    #[error("radio link provider error: {0}")]
    Provider(String),

    /// The session worker has stopped.
    #[error("session worker has shut down")]
    Closed,
}

impl SessionError {
    pub(crate) fn invalid(operation: Operation, state: ConnectionState) -> Self {
        SessionError::InvalidStateTransition { operation, state }
    }

    /// `true` for [`SessionError::InvalidStateTransition`].
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, SessionError::InvalidStateTransition { .. })
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
