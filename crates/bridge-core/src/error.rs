//! Error taxonomy for the bridge engine.
//!
//! Every remote failure carries the server's numeric code (the HTTP status,
//! or `0` when no response was received) and its message, so callers can log
//! them in one place without knowing which transport produced them.

use std::path::PathBuf;

use thiserror::Error;

/// A rejection reported by the homeserver (or the connection to it).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: u16,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A failure that never produced an HTTP response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }
}

/// Login rejected, either by token or by password.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("login rejected ({code}): {message}")]
pub struct AuthError {
    pub code: u16,
    pub message: String,
}

impl AuthError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn missing_password() -> Self {
        Self::new(0, "no password configured for password login")
    }
}

impl From<RemoteError> for AuthError {
    fn from(err: RemoteError) -> Self {
        Self::new(err.code, err.message)
    }
}

/// A single room could not be joined or resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not join room {room} ({code}): {message}")]
pub struct RoomJoinError {
    pub room: String,
    pub code: u16,
    pub message: String,
}

impl RoomJoinError {
    pub fn new(room: impl Into<String>, err: RemoteError) -> Self {
        Self {
            room: room.into(),
            code: err.code,
            message: err.message,
        }
    }
}

/// A message could not be delivered to one target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unable to deliver message to room '{target}' ({code}): {message}")]
pub struct SendError {
    pub target: String,
    pub code: u16,
    pub message: String,
}

impl SendError {
    pub fn new(target: impl Into<String>, err: RemoteError) -> Self {
        Self {
            target: target.into(),
            code: err.code,
            message: err.message,
        }
    }
}

impl From<RoomJoinError> for SendError {
    fn from(err: RoomJoinError) -> Self {
        Self {
            target: err.room,
            code: err.code,
            message: err.message,
        }
    }
}

/// The token file could not be read or written.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("token file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("token file '{path}' is not a JSON object of strings: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
