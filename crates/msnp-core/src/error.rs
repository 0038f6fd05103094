//! Error types for the core crate, and the client-wide failure taxonomy.
//!
//! Every failure the client can surface falls into one of five families.
//! Numeric server codes are folded into these families by
//! [`crate::codes::classify`]; the raw code is kept for diagnostics.

use thiserror::Error;

/// Low-level errors raised while framing or parsing.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed line: {0}")]
    MalformedLine(String),

    #[error("chunk of {0} bytes does not fit a 16-bit length field")]
    ChunkTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Authentication failures. All are terminal for the login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("bad password")]
    BadPassword,

    #[error("bad or expired ticket")]
    BadTicket,

    #[error("account locked or unverified")]
    AccountLocked,
}

/// Protocol-level violations and unmapped server errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("server error {0}")]
    ServerError(u16),
}

/// Network failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetworkFailure {
    #[error("connect failed")]
    ConnectFailed,

    #[error("connection reset")]
    Reset,

    #[error("timed out")]
    Timeout,
}

/// Roster reconciliation conflicts. Logged and retried on the next trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncConflict {
    #[error("duplicate group or membership")]
    DuplicateGroup,

    #[error("stale reference to a contact or group")]
    StaleReference,

    #[error("contact is on the opposite allow/block list")]
    ListConflict,
}

/// Which side cancelled a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSide {
    Local,
    Remote,
}

/// File transfer failures. These terminate only the affected transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferFailure {
    #[error("transfer refused")]
    Refused,

    #[error("transfer cancelled ({0:?})")]
    Cancelled(CancelSide),

    #[error("transfer timed out")]
    Timeout,

    #[error("transfer failed: {0}")]
    Other(String),
}

/// Any failure in the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("authentication failure: {0}")]
    Auth(#[from] AuthFailure),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("network failure: {0}")]
    Network(#[from] NetworkFailure),

    #[error("sync conflict: {0}")]
    Sync(#[from] SyncConflict),

    #[error("transfer failure: {0}")]
    Transfer(#[from] TransferFailure),
}

impl Failure {
    /// Failures that end the notification channel.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Failure::Auth(_) | Failure::Network(NetworkFailure::Reset | NetworkFailure::ConnectFailed)
        )
    }
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed on our request.
    Requested,
    /// The peer closed the socket or a keep-alive went unanswered.
    Reset,
    /// A timeout elapsed while waiting for the peer.
    Timeout,
    /// The connection could not be established.
    ConnectFailed,
    /// The account signed in from another location (`OUT OTH`).
    OtherClient,
    /// The server is going down (`OUT SSD`).
    ServerShutdown,
    /// Authentication failed.
    Auth(AuthFailure),
    /// The peer violated the protocol.
    Protocol,
}

impl From<NetworkFailure> for DisconnectReason {
    fn from(failure: NetworkFailure) -> Self {
        match failure {
            NetworkFailure::ConnectFailed => DisconnectReason::ConnectFailed,
            NetworkFailure::Reset => DisconnectReason::Reset,
            NetworkFailure::Timeout => DisconnectReason::Timeout,
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
