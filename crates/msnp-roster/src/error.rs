//! Error types for the roster crate.

use thiserror::Error;

use msnp_core::GroupId;

/// Errors that can occur during roster operations.
#[derive(Debug, Error)]
pub enum RosterError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Group id list serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The default group cannot be deleted.
    #[error("the default group cannot be deleted")]
    DefaultGroup,

    /// Group not on the roster.
    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    /// A group with this name already exists.
    #[error("group already exists: {0}")]
    DuplicateGroup(String),

    /// Contact not on the roster.
    #[error("unknown contact: {0}")]
    UnknownContact(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Blocking task failed to complete.
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Result type for roster operations.
pub type Result<T> = std::result::Result<T, RosterError>;
