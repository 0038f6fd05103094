//! Roster model: contacts, groups and the opaque sync tokens.
//!
//! The roster holds two views of each contact's group membership:
//!
//! - **local groups**: the container groups the user placed the contact in,
//!   by display name
//! - **server groups**: the group ids the server has confirmed
//!
//! The [`Synchronizer`](crate::sync::Synchronizer) reconciles the two.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use msnp_core::{GroupId, Handle, List, ListFlags, Presence};

/// Display name of the default group.
pub const DEFAULT_GROUP_NAME: &str = "~";

/// Opaque version markers used to skip a full roster download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTokens {
    pub last_change: String,
    pub last_sync: String,
}

impl SyncTokens {
    pub fn new(last_change: impl Into<String>, last_sync: impl Into<String>) -> Self {
        Self {
            last_change: last_change.into(),
            last_sync: last_sync.into(),
        }
    }

    /// Tokens used by a client that has never synced.
    pub fn initial() -> Self {
        Self::new("0", "0")
    }
}

/// A server-side contact group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.id.is_default()
    }
}

/// One change of a synchronization pass the server has not answered yet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PendingChange {
    /// Waiting for the named group to be created.
    Create(String),
    Add(GroupId),
    Remove(GroupId),
}

/// A removal an earlier pass held back, and the local groups it was held for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeferredRemoval {
    pub(crate) group: GroupId,
    pub(crate) local_groups: BTreeSet<String>,
}

/// A remote identity on the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub handle: Handle,
    pub display_name: String,
    pub lists: ListFlags,
    /// Container groups the user wants this contact in, by display name.
    pub local_groups: BTreeSet<String>,
    /// Group ids the server has confirmed.
    pub server_groups: BTreeSet<GroupId>,
    pub presence: Presence,
    /// Set while a synchronization pass for this contact is outstanding.
    pub moving: bool,
    /// Changes of the current pass not yet acknowledged.
    pub(crate) outstanding: BTreeSet<PendingChange>,
    /// Last-group removal kept back until the local groups change.
    pub(crate) deferred: Option<DeferredRemoval>,
}

impl Contact {
    pub fn new(handle: Handle, display_name: impl Into<String>) -> Self {
        Self {
            handle,
            display_name: display_name.into(),
            lists: ListFlags::NONE,
            local_groups: BTreeSet::new(),
            server_groups: BTreeSet::new(),
            presence: Presence::Offline,
            moving: false,
            outstanding: BTreeSet::new(),
            deferred: None,
        }
    }

    pub fn is_on(&self, list: List) -> bool {
        self.lists.contains(list)
    }

    pub fn is_blocked(&self) -> bool {
        self.lists.contains(List::Block)
    }

    /// Number of adds/removes still awaiting acknowledgment.
    pub fn pending_ops(&self) -> usize {
        self.outstanding.len()
    }

    /// The group a previous pass left in place to keep the contact grouped.
    pub fn deferred_removal(&self) -> Option<GroupId> {
        self.deferred.as_ref().map(|deferred| deferred.group)
    }

    pub(crate) fn begin(&mut self, change: PendingChange) {
        self.outstanding.insert(change);
        self.moving = true;
    }

    /// Mark `change` answered. Returns false if the pass never issued it.
    pub(crate) fn settle(&mut self, change: &PendingChange) -> bool {
        let known = self.outstanding.remove(change);
        self.moving = !self.outstanding.is_empty();
        known
    }
}

/// The account's roster.
#[derive(Debug, Clone)]
pub struct Roster {
    contacts: HashMap<Handle, Contact>,
    groups: BTreeMap<GroupId, Group>,
    tokens: SyncTokens,
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

impl Roster {
    /// An empty roster containing only the default group.
    pub fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(GroupId::DEFAULT, Group::new(GroupId::DEFAULT, DEFAULT_GROUP_NAME));
        Self {
            contacts: HashMap::new(),
            groups,
            tokens: SyncTokens::initial(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tokens
    // ─────────────────────────────────────────────────────────────────────────

    pub fn tokens(&self) -> &SyncTokens {
        &self.tokens
    }

    pub fn set_tokens(&mut self, tokens: SyncTokens) {
        self.tokens = tokens;
    }

    /// Drop all contacts and non-default groups ahead of a full push.
    pub fn clear_for_full_sync(&mut self) {
        self.contacts.clear();
        self.groups.retain(|id, _| id.is_default());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Server id of the group with this display name.
    pub fn group_id_by_name(&self, name: &str) -> Option<GroupId> {
        self.groups
            .values()
            .find(|group| group.name == name)
            .map(|group| group.id)
    }

    /// Record a group the server reported or confirmed.
    ///
    /// The default group keeps its id but may be renamed by the server.
    pub fn upsert_group(&mut self, id: GroupId, name: impl Into<String>) {
        let name = name.into();
        match self.groups.get_mut(&id) {
            Some(group) => {
                if group.name != name {
                    let old = std::mem::replace(&mut group.name, name.clone());
                    for contact in self.contacts.values_mut() {
                        if contact.local_groups.remove(&old) {
                            contact.local_groups.insert(name.clone());
                        }
                        if let Some(deferred) = contact.deferred.as_mut() {
                            if deferred.local_groups.remove(&old) {
                                deferred.local_groups.insert(name.clone());
                            }
                        }
                    }
                }
            }
            None => {
                self.groups.insert(id, Group::new(id, name));
            }
        }
    }

    /// Forget a group after the server deleted it. The default group is
    /// never removed.
    pub fn remove_group(&mut self, id: GroupId) -> Option<Group> {
        if id.is_default() {
            return None;
        }
        let removed = self.groups.remove(&id)?;
        for contact in self.contacts.values_mut() {
            contact.server_groups.remove(&id);
            contact.local_groups.remove(&removed.name);
        }
        Some(removed)
    }

    /// Display name of the default group.
    pub fn default_group_name(&self) -> String {
        self.groups
            .get(&GroupId::DEFAULT)
            .map_or_else(|| DEFAULT_GROUP_NAME.to_string(), |group| group.name.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Contacts
    // ─────────────────────────────────────────────────────────────────────────

    pub fn contact(&self, handle: &Handle) -> Option<&Contact> {
        self.contacts.get(handle)
    }

    pub fn contact_mut(&mut self, handle: &Handle) -> Option<&mut Contact> {
        self.contacts.get_mut(handle)
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Get or create the contact for `handle`.
    pub fn entry(&mut self, handle: &Handle) -> &mut Contact {
        self.contacts
            .entry(handle.clone())
            .or_insert_with(|| Contact::new(handle.clone(), handle.as_str()))
    }

    /// Apply an `LST` line: list flags and server group ids.
    ///
    /// Local groups are seeded from the server groups, so a freshly pushed
    /// roster starts out in agreement with itself.
    pub fn apply_listing(
        &mut self,
        handle: &Handle,
        display_name: &str,
        lists: ListFlags,
        groups: &[GroupId],
    ) {
        let names: Vec<String> = groups
            .iter()
            .filter_map(|id| self.groups.get(id).map(|group| group.name.clone()))
            .collect();

        let contact = self.entry(handle);
        contact.display_name = display_name.to_string();
        contact.lists = lists;
        contact.server_groups = groups.iter().copied().collect();
        contact.local_groups = names.into_iter().collect();
    }

    /// Remove a contact entirely.
    pub fn remove_contact(&mut self, handle: &Handle) -> Option<Contact> {
        self.contacts.remove(handle)
    }

    /// Contacts whose only server group is `id`.
    pub fn sole_members_of(&self, id: GroupId) -> Vec<Handle> {
        self.contacts
            .values()
            .filter(|contact| contact.server_groups.len() == 1 && contact.server_groups.contains(&id))
            .map(|contact| contact.handle.clone())
            .collect()
    }

    /// Set the presence of a contact, creating it if unseen.
    pub fn set_presence(&mut self, handle: &Handle, presence: Presence) {
        self.entry(handle).presence = presence;
    }

    /// Set every contact offline (after our own disconnect).
    pub fn reset_presence(&mut self) {
        for contact in self.contacts.values_mut() {
            contact.presence = Presence::Offline;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(s: &str) -> Handle {
        Handle::new(s)
    }

    #[test]
    fn test_default_group_always_present() {
        let mut roster = Roster::new();
        assert_eq!(roster.group_id_by_name(DEFAULT_GROUP_NAME), Some(GroupId::DEFAULT));
        assert!(roster.remove_group(GroupId::DEFAULT).is_none());
        roster.clear_for_full_sync();
        assert!(roster.group(GroupId::DEFAULT).is_some());
    }

    #[test]
    fn test_apply_listing_seeds_local_groups() {
        let mut roster = Roster::new();
        roster.upsert_group(GroupId(2), "Work");
        roster.apply_listing(&handle("x@example.com"), "X", ListFlags(3), &[GroupId(2)]);

        let contact = roster.contact(&handle("x@example.com")).unwrap();
        assert!(contact.local_groups.contains("Work"));
        assert!(contact.server_groups.contains(&GroupId(2)));
        assert!(contact.is_on(List::Allow));
    }

    #[test]
    fn test_rename_group_follows_local_membership() {
        let mut roster = Roster::new();
        roster.upsert_group(GroupId(1), "Friends");
        roster.apply_listing(&handle("a@b.com"), "A", ListFlags(1), &[GroupId(1)]);
        roster.upsert_group(GroupId(1), "Pals");

        let contact = roster.contact(&handle("a@b.com")).unwrap();
        assert!(contact.local_groups.contains("Pals"));
        assert!(!contact.local_groups.contains("Friends"));
    }

    #[test]
    fn test_remove_group_strips_memberships() {
        let mut roster = Roster::new();
        roster.upsert_group(GroupId(4), "Old");
        roster.apply_listing(&handle("a@b.com"), "A", ListFlags(1), &[GroupId(4), GroupId(0)]);
        roster.remove_group(GroupId(4));

        let contact = roster.contact(&handle("a@b.com")).unwrap();
        assert_eq!(contact.server_groups.len(), 1);
        assert!(!contact.local_groups.contains("Old"));
    }

    #[test]
    fn test_sole_members() {
        let mut roster = Roster::new();
        roster.upsert_group(GroupId(5), "G");
        roster.apply_listing(&handle("only@b.com"), "O", ListFlags(1), &[GroupId(5)]);
        roster.apply_listing(&handle("both@b.com"), "B", ListFlags(1), &[GroupId(5), GroupId(0)]);
        assert_eq!(roster.sole_members_of(GroupId(5)), vec![handle("only@b.com")]);
    }
}
