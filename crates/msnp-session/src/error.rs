//! Error types for the session crate.

use thiserror::Error;

use msnp_core::{CoreError, DisconnectReason, Failure, NetworkFailure};
use msnp_roster::RosterError;

/// Errors raised by connections, channels and transfers.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Framing failed.
    #[error("framing error: {0}")]
    Core(#[from] CoreError),

    /// A failure from the client-wide taxonomy.
    #[error("{0}")]
    Failure(#[from] Failure),

    /// Roster bookkeeping failed.
    #[error("roster error: {0}")]
    Roster(#[from] RosterError),

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// A login sequence is already running on this connection.
    #[error("login already in progress")]
    LoginInProgress,

    /// An operation was refused before anything was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No invitation is outstanding under this cookie.
    #[error("unknown invitation cookie {0}")]
    UnknownCookie(u32),

    /// The task owning the socket has gone away.
    #[error("channel task stopped")]
    TaskStopped,

    /// I/O error outside framing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Why a channel that hit this error has to close.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            SessionError::Failure(Failure::Auth(failure)) => DisconnectReason::Auth(*failure),
            SessionError::Failure(Failure::Network(failure)) => (*failure).into(),
            SessionError::Failure(Failure::Protocol(_)) => DisconnectReason::Protocol,
            SessionError::Closed | SessionError::Io(_) | SessionError::Core(CoreError::Io(_)) => {
                DisconnectReason::Reset
            }
            _ => DisconnectReason::Protocol,
        }
    }
}

impl From<NetworkFailure> for SessionError {
    fn from(failure: NetworkFailure) -> Self {
        SessionError::Failure(failure.into())
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
