//! Error types shared by the server and client halves of a session.

use thiserror::Error;

use crate::stroke::StrokeError;

/// Everything that can go wrong inside a drawing session.
///
/// Every variant except [`Error::CorruptState`] is scoped to a single
/// connection: the connection that hit it is rejected or closed and the rest
/// of the session carries on.
#[derive(Debug, Error)]
pub enum Error {
    /// A submitted stroke failed validation. Only that submission is dropped.
    #[error("invalid stroke: {0}")]
    InvalidStroke(#[from] StrokeError),

    /// The passphrase did not match the session secret.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A saved stroke log could not be loaded. Fatal at startup.
    #[error("corrupt session state: {0}")]
    CorruptState(String),

    /// The log already holds the largest possible stroke id.
    #[error("stroke ids are exhausted after {0}")]
    IdsExhausted(u64),

    /// The session is shutting down and takes no more changes.
    #[error("session is shutting down")]
    SessionClosed,

    /// The peer sent something out of order or undecodable.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The transport failed or closed underneath us.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The session secret cannot be used, e.g. it is empty or too long.
    #[error("unusable passphrase: {0}")]
    Passphrase(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
