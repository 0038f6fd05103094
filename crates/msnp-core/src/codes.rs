//! Numeric server error codes.
//!
//! The server reports errors as `<code> <trid>`. Rather than handling each
//! of the ~30 codes individually, they are classified into a handful of
//! categories that map onto the failure taxonomy in [`crate::error`].

use crate::error::{AuthFailure, Failure, ProtocolError, SyncConflict};

/// What a numeric server code means to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeCategory {
    /// Login cannot succeed with these credentials.
    Auth(AuthFailure),
    /// The roster on the server disagrees with our view.
    Sync(SyncConflict),
    /// A server-side limit was hit (list full, too many groups, ...).
    /// Informational: the request is dropped.
    Capacity,
    /// The server is busy or unavailable; retrying later may work.
    Transient,
    /// Anything else.
    Unmapped,
}

/// A classified server error, keeping the raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    pub category: CodeCategory,
}

impl ServerError {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            category: classify(code),
        }
    }

    /// Fold into the failure taxonomy. Capacity, transient and unmapped
    /// codes all surface as `ProtocolError::ServerError(code)`.
    pub fn to_failure(&self) -> Failure {
        match self.category {
            CodeCategory::Auth(auth) => Failure::Auth(auth),
            CodeCategory::Sync(conflict) => Failure::Sync(conflict),
            CodeCategory::Capacity | CodeCategory::Transient | CodeCategory::Unmapped => {
                Failure::Protocol(ProtocolError::ServerError(self.code))
            }
        }
    }
}

/// Classify a numeric server code.
pub fn classify(code: u16) -> CodeCategory {
    match code {
        911 => CodeCategory::Auth(AuthFailure::BadPassword),
        928 => CodeCategory::Auth(AuthFailure::BadTicket),
        923 | 924 => CodeCategory::Auth(AuthFailure::AccountLocked),

        // Unknown handle, not on list, invalid group, not in group.
        205 | 208 | 216 | 224 | 225 | 231 => CodeCategory::Sync(SyncConflict::StaleReference),
        // Already on list, group name exists.
        215 | 228 => CodeCategory::Sync(SyncConflict::DuplicateGroup),
        219 => CodeCategory::Sync(SyncConflict::ListConflict),

        // List full, too many groups, too many sessions, changing too fast.
        210 | 223 | 229 | 712 | 713 | 714 | 800 => CodeCategory::Capacity,

        500..=605 | 910 | 912 | 914..=922 => CodeCategory::Transient,

        _ => CodeCategory::Unmapped,
    }
}

/// Short diagnostic name for a code. Meant for logs, not for display.
pub fn describe(code: u16) -> &'static str {
    match code {
        200 => "syntax error",
        201 => "invalid parameter",
        205 => "invalid user",
        206 => "domain name missing",
        207 => "already logged in",
        208 => "invalid username",
        209 => "invalid friendly name",
        210 => "list full",
        215 => "already on list",
        216 => "not on list",
        217 => "user not online",
        218 => "already in mode",
        219 => "user in opposite list",
        223 => "too many groups",
        224 => "invalid group",
        225 => "user not in group",
        228 => "group name exists",
        229 => "group name too long",
        230 => "cannot remove group zero",
        231 => "invalid group",
        280 => "switchboard failed",
        281 => "transfer to switchboard failed",
        300 => "required field missing",
        302 => "not logged in",
        500 => "internal server error",
        501 => "database server error",
        502 => "command disabled",
        510 => "file operation failed",
        520 => "memory allocation failed",
        540 => "challenge response failed",
        600 => "server busy",
        601 => "server unavailable",
        602 => "peer notification server down",
        603 => "database connect failed",
        604 => "server going down",
        605 => "server unavailable",
        707 => "could not create connection",
        710 => "bad CVR parameters",
        711 => "write is blocking",
        712 => "session overload",
        713 => "calling too rapidly",
        714 => "too many sessions",
        715 => "not expected",
        717 => "bad friend file",
        731 => "not expected",
        800 => "changing too rapidly",
        910 | 912 | 918 | 919 | 921 | 922 => "server too busy",
        911 => "authentication failed",
        913 => "not allowed when offline",
        915..=917 => "server unavailable",
        920 => "not accepting new users",
        923 => "kids passport without consent",
        924 => "passport account not verified",
        928 => "bad ticket",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_codes() {
        assert_eq!(classify(911), CodeCategory::Auth(AuthFailure::BadPassword));
        assert_eq!(classify(928), CodeCategory::Auth(AuthFailure::BadTicket));
        assert_eq!(classify(924), CodeCategory::Auth(AuthFailure::AccountLocked));
    }

    #[test]
    fn test_not_found_codes_are_sync_conflicts() {
        for code in [205, 216, 224, 225] {
            assert_eq!(classify(code), CodeCategory::Sync(SyncConflict::StaleReference), "{code}");
        }
        assert_eq!(classify(215), CodeCategory::Sync(SyncConflict::DuplicateGroup));
    }

    #[test]
    fn test_list_codes_are_not_group_conflicts() {
        assert_eq!(classify(219), CodeCategory::Sync(SyncConflict::ListConflict));
        assert_eq!(classify(218), CodeCategory::Unmapped);
        assert_eq!(
            ServerError::new(218).to_failure(),
            Failure::Protocol(ProtocolError::ServerError(218))
        );
    }

    #[test]
    fn test_capacity_codes() {
        assert_eq!(classify(210), CodeCategory::Capacity);
        assert_eq!(classify(223), CodeCategory::Capacity);
    }

    #[test]
    fn test_unmapped_code_preserved() {
        let err = ServerError::new(717);
        assert_eq!(err.category, CodeCategory::Unmapped);
        assert_eq!(err.to_failure(), Failure::Protocol(ProtocolError::ServerError(717)));
    }

    #[test]
    fn test_describe_never_empty() {
        for code in 200..1000 {
            assert!(!describe(code).is_empty());
        }
    }
}
