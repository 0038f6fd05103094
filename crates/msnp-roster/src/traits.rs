//! RosterStore trait: the abstract interface for roster persistence.
//!
//! The account layer keeps a local copy of the roster so that a matching
//! pair of sync tokens lets login skip the full server push. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use msnp_core::{GroupId, Handle, ListFlags};

use crate::error::Result;
use crate::model::{Contact, Group, Roster, SyncTokens};

/// The persisted form of one contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub handle: Handle,
    pub display_name: String,
    pub groups: Vec<GroupId>,
    pub lists: ListFlags,
}

/// Everything needed to rebuild a roster without asking the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    pub contacts: Vec<ContactRecord>,
    pub groups: Vec<Group>,
    pub tokens: SyncTokens,
}

impl ContactRecord {
    /// The server-confirmed part of a contact.
    pub fn from_contact(contact: &Contact) -> Self {
        Self {
            handle: contact.handle.clone(),
            display_name: contact.display_name.clone(),
            groups: contact.server_groups.iter().copied().collect(),
            lists: contact.lists,
        }
    }
}

impl RosterSnapshot {
    /// Capture the server-confirmed state of a roster.
    pub fn from_roster(roster: &Roster) -> Self {
        let mut contacts: Vec<ContactRecord> = roster.contacts().map(ContactRecord::from_contact).collect();
        contacts.sort_by(|a, b| a.handle.cmp(&b.handle));

        Self {
            contacts,
            groups: roster.groups().cloned().collect(),
            tokens: roster.tokens().clone(),
        }
    }

    /// Rebuild a roster. Local groups start out equal to server groups.
    pub fn into_roster(self) -> Roster {
        let mut roster = Roster::new();
        for group in self.groups {
            roster.upsert_group(group.id, group.name);
        }
        for record in self.contacts {
            roster.apply_listing(&record.handle, &record.display_name, record.lists, &record.groups);
        }
        roster.set_tokens(self.tokens);
        roster
    }
}

/// The RosterStore trait: async interface for roster persistence.
///
/// # Design Notes
///
/// - **Whole-roster saves**: `save` replaces everything, including tokens.
/// - **Incremental edits**: `upsert_contact`/`remove_contact` apply single
///   changes pushed by the server between full syncs.
/// - Tokens are only meaningful together with the contacts they describe;
///   callers update both in one `save` after a full push.
#[async_trait]
pub trait RosterStore: Send + Sync {
    /// Load the stored roster (empty snapshot with initial tokens if none).
    async fn load(&self) -> Result<RosterSnapshot>;

    /// Replace the stored roster.
    async fn save(&self, snapshot: &RosterSnapshot) -> Result<()>;

    /// Insert or update one contact.
    async fn upsert_contact(&self, record: &ContactRecord) -> Result<()>;

    /// Remove one contact.
    async fn remove_contact(&self, handle: &Handle) -> Result<()>;

    /// Insert or rename one group.
    async fn upsert_group(&self, group: &Group) -> Result<()>;

    /// Remove one group.
    async fn remove_group(&self, id: GroupId) -> Result<()>;

    /// Stored sync tokens.
    async fn sync_tokens(&self) -> Result<SyncTokens>;

    /// Update the stored sync tokens.
    async fn set_sync_tokens(&self, tokens: &SyncTokens) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_round_trip_keeps_memberships() {
        let mut roster = Roster::new();
        roster.upsert_group(GroupId(3), "Work");
        let bob = Handle::new("bob@example.com");
        roster.apply_listing(&bob, "Bob", ListFlags(11), &[GroupId(3)]);
        roster.set_tokens(SyncTokens::new("2024-01-01T00:00:00", "42"));

        let rebuilt = RosterSnapshot::from_roster(&roster).into_roster();
        let contact = rebuilt.contact(&bob).unwrap();
        assert_eq!(contact.display_name, "Bob");
        assert!(contact.local_groups.contains("Work"));
        assert_eq!(rebuilt.tokens().last_sync, "42");
    }
}
