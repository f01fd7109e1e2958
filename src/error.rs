//! Error taxonomy shared by every protocol in the crate.
//!
//! Errors raised inside a remote handler travel back to the caller as a
//! [`RemoteFault`] inside the reply frame and are re-raised locally as
//! [`Error::RemoteFault`], keeping the category and message the origin peer
//! produced.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proto::PeerAddress;

/// Convenience alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Category of an [`Error`], stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectFailure,
    Timeout,
    Conflict,
    NotFound,
    Io,
    Protocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ConnectFailure => "connect failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not found",
            ErrorKind::Io => "i/o error",
            ErrorKind::Protocol => "protocol error",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// RemoteFault
// ---------------------------------------------------------------------------

/// Error payload carried in a reply frame when a remote handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    /// The peer whose handler raised the error first.
    pub origin: PeerAddress,
    /// Category at the origin.
    pub kind: ErrorKind,
    /// Message at the origin, including any step context added there.
    pub message: String,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The endpoint could not be reached. Never retried automatically.
    #[error("cannot connect to {addr}: {reason}")]
    ConnectFailure { addr: PeerAddress, reason: String },

    /// A bounded wait elapsed. What it means depends on the call site.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An explicit group rank is already held by another address.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown group, member, or no saturation in progress.
    #[error("not found: {0}")]
    NotFound(String),

    /// A peer's handler failed; re-raised here with its original category.
    #[error("remote fault from {}: {}: {}", .0.origin, .0.kind, .0.message)]
    RemoteFault(RemoteFault),

    #[error("i/o error: {0}")]
    Io(String),

    /// Malformed frame, unregistered message type, or closed socket.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Category of this error. Remote faults report the category raised at
    /// their origin.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConnectFailure { .. } => ErrorKind::ConnectFailure,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::RemoteFault(fault) => fault.kind,
            Error::Io(_) => ErrorKind::Io,
            Error::Protocol(_) => ErrorKind::Protocol,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Error::RemoteFault(_))
    }

    pub fn timeout(what: impl fmt::Display) -> Self {
        Error::Timeout(what.to_string())
    }

    pub fn protocol(what: impl fmt::Display) -> Self {
        Error::Protocol(what.to_string())
    }

    /// Prefix the message with the protocol step that failed, keeping the
    /// category unchanged.
    pub fn context(self, step: impl fmt::Display) -> Self {
        match self {
            Error::ConnectFailure { addr, reason } => Error::ConnectFailure {
                addr,
                reason: format!("{step}: {reason}"),
            },
            Error::Timeout(m) => Error::Timeout(format!("{step}: {m}")),
            Error::Conflict(m) => Error::Conflict(format!("{step}: {m}")),
            Error::NotFound(m) => Error::NotFound(format!("{step}: {m}")),
            Error::RemoteFault(mut fault) => {
                fault.message = format!("{step}: {}", fault.message);
                Error::RemoteFault(fault)
            }
            Error::Io(m) => Error::Io(format!("{step}: {m}")),
            Error::Protocol(m) => Error::Protocol(format!("{step}: {m}")),
        }
    }

    /// Convert into the payload sent back to an RPC caller.
    ///
    /// A fault that was itself received from another peer keeps its origin,
    /// so forwarded chains report the peer that actually failed.
    pub fn into_remote(self, local: &PeerAddress) -> RemoteFault {
        match self {
            Error::RemoteFault(fault) => fault,
            other => RemoteFault {
                origin: local.clone(),
                kind: other.kind(),
                message: other.message(),
            },
        }
    }

    /// Message without the category prefix.
    fn message(&self) -> String {
        match self {
            Error::ConnectFailure { addr, reason } => format!("{addr}: {reason}"),
            Error::Timeout(m)
            | Error::Conflict(m)
            | Error::NotFound(m)
            | Error::Io(m)
            | Error::Protocol(m) => m.clone(),
            Error::RemoteFault(fault) => fault.message.clone(),
        }
    }
}

impl From<RemoteFault> for Error {
    fn from(fault: RemoteFault) -> Self {
        Error::RemoteFault(fault)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Error::Timeout(e.to_string()),
            _ => Error::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(format!("malformed payload: {e}"))
    }
}

/// Attach step context to any `Result` carrying an [`Error`].
pub trait ResultExt<T> {
    fn step(self, step: impl fmt::Display) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn step(self, step: impl fmt::Display) -> Result<T> {
        self.map_err(|e| e.into().context(step))
    }
}
