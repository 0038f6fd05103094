//! Error types for the client API.

use thiserror::Error;

use msnp_core::{AuthFailure, Failure, NetworkFailure, ProtocolError, SyncConflict, TransferFailure};
use msnp_roster::RosterError;
use msnp_session::SessionError;

/// Errors returned by [`Account`](crate::Account) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Login was refused. Re-prompting for credentials may help.
    #[error("authentication failed: {0}")]
    Auth(AuthFailure),

    /// The server could not be reached or the connection dropped.
    /// Retrying later may help.
    #[error("network failure: {0}")]
    Network(NetworkFailure),

    /// The server sent something we could not follow.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("sync conflict: {0}")]
    Sync(SyncConflict),

    #[error("transfer failed: {0}")]
    Transfer(TransferFailure),

    /// Request rejected by the session layer.
    #[error("session error: {0}")]
    Session(SessionError),

    /// Roster persistence failed.
    #[error("roster store error: {0}")]
    Roster(#[from] RosterError),

    /// The account was configured incorrectly.
    #[error("configuration error: {0}")]
    Config(String),

    /// The account is no longer connected.
    #[error("account disconnected")]
    Disconnected,
}

impl From<Failure> for ClientError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Auth(f) => ClientError::Auth(f),
            Failure::Network(f) => ClientError::Network(f),
            Failure::Protocol(f) => ClientError::Protocol(f),
            Failure::Sync(f) => ClientError::Sync(f),
            Failure::Transfer(f) => ClientError::Transfer(f),
        }
    }
}

impl From<SessionError> for ClientError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Failure(failure) => failure.into(),
            SessionError::Roster(e) => ClientError::Roster(e),
            SessionError::Closed => ClientError::Network(NetworkFailure::Reset),
            SessionError::TaskStopped => ClientError::Disconnected,
            other => ClientError::Session(other),
        }
    }
}

impl ClientError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::Sync(_))
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
