//! Core identifier types.
//!
//! These are the fundamental value types shared by every layer of the client.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A passport handle (`user@example.com`), normalised to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(String);

impl Handle {
    /// Create a handle, lowercasing and trimming the input.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    /// A handle is usable on the wire when it has a local part and a domain
    /// and contains no whitespace.
    pub fn is_valid(&self) -> bool {
        match self.0.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && domain.contains('.')
                    && !self.0.chars().any(char::is_whitespace)
            }
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Server-assigned group identifier.
///
/// Group 0 is the permanent default group; it always exists and can never be
/// deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl GroupId {
    /// The default group.
    pub const DEFAULT: GroupId = GroupId(0);

    pub const fn is_default(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the four server-side contact lists (plus the pending list).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum List {
    /// Forward list: people I watch.
    Forward,
    /// Allow list: people allowed to see me.
    Allow,
    /// Block list: people blocked from seeing me.
    Block,
    /// Reverse list: people who have me on their forward list.
    Reverse,
    /// Pending list: reverse-list additions not yet acknowledged.
    Pending,
}

impl List {
    /// Wire token for this list.
    pub const fn token(&self) -> &'static str {
        match self {
            List::Forward => "FL",
            List::Allow => "AL",
            List::Block => "BL",
            List::Reverse => "RL",
            List::Pending => "PL",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "FL" => Some(List::Forward),
            "AL" => Some(List::Allow),
            "BL" => Some(List::Block),
            "RL" => Some(List::Reverse),
            "PL" => Some(List::Pending),
            _ => None,
        }
    }

    /// Bit for this list inside a [`ListFlags`] mask.
    pub const fn bit(&self) -> u8 {
        match self {
            List::Forward => 1,
            List::Allow => 2,
            List::Block => 4,
            List::Reverse => 8,
            List::Pending => 16,
        }
    }
}

/// Bitmask of list memberships as carried by `LST`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListFlags(pub u8);

impl ListFlags {
    pub const NONE: ListFlags = ListFlags(0);

    pub const fn contains(&self, list: List) -> bool {
        self.0 & list.bit() != 0
    }

    pub fn insert(&mut self, list: List) {
        self.0 |= list.bit();
    }

    pub fn remove(&mut self, list: List) {
        self.0 &= !list.bit();
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x1f)
    }

    /// Someone has us on their list but we have not decided about them.
    pub const fn is_unacknowledged_reverse(&self) -> bool {
        self.contains(List::Reverse)
            && !self.contains(List::Forward)
            && !self.contains(List::Allow)
            && !self.contains(List::Block)
    }
}

impl From<List> for ListFlags {
    fn from(list: List) -> Self {
        ListFlags(list.bit())
    }
}

/// Invitation cookie, chosen by the inviter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cookie(pub u32);

impl Cookie {
    /// Generate a random non-zero cookie.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen_range(1..=u32::MAX >> 1))
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
