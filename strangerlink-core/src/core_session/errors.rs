//! Error types for the session layer

use thiserror::Error;

use super::media::MediaError;
use crate::core_rendezvous::TransportError;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Messaging requires a connected partner
    #[error("Not connected to a partner")]
    NotConnected,

    /// No participant yet; call `start_search` first
    #[error("Session not started")]
    NotStarted,

    /// A search is already running or a session is live
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Message is empty")]
    EmptyMessage,

    /// Fatal to starting a session
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The controller task has stopped
    #[error("Session controller closed")]
    ControllerClosed,
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}
