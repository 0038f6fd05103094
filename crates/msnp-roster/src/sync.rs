//! Group membership synchronizer.
//!
//! Reconciles each contact's local container groups against the group ids
//! the server has recorded, producing the roster commands that close the
//! gap. The synchronizer never talks to the network itself: it returns
//! [`RosterOp`]s for the notification channel to send, and is told about
//! acknowledgments through its `added_to_group` / `op_failed` family.
//!
//! ## Algorithm
//!
//! For one contact:
//!
//! 1. For each local group: if the group has no server id yet, request its
//!    creation and queue the contact-add behind it; otherwise, if the
//!    server has not recorded the contact in it, add it.
//! 2. For each server group absent from the local set, remove the contact,
//!    but never let the recorded membership reach zero: the last removal
//!    is deferred, and stays deferred until the local groups change.
//! 3. If the contact has no groups at all, put it in the default group.
//!
//! While a pass is outstanding the contact is `moving`, and further
//! triggers for it are dropped (not queued). A rapid sequence of moves can
//! therefore leave the server behind until the next trigger fires.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use msnp_core::{GroupId, Handle, List};

use crate::error::{Result, RosterError};
use crate::model::{DeferredRemoval, PendingChange, Roster};

/// A roster mutation to send to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterOp {
    /// Create a group with this display name.
    CreateGroup { name: String },
    /// Record the contact as a member of the group.
    AddToGroup { handle: Handle, group: GroupId },
    /// Drop the contact's membership in the group.
    RemoveFromGroup { handle: Handle, group: GroupId },
    /// Delete a (non-default) group.
    DeleteGroup { group: GroupId },
    /// Rename a group.
    RenameGroup { group: GroupId, name: String },
}

/// Per-account synchronizer state.
#[derive(Debug, Default)]
pub struct Synchronizer {
    /// Contacts waiting for a group to be created, by group name.
    awaiting_group: BTreeMap<String, BTreeSet<Handle>>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group names whose creation has been requested but not acknowledged.
    pub fn groups_in_creation(&self) -> impl Iterator<Item = &str> {
        self.awaiting_group.keys().map(String::as_str)
    }

    /// Run a pass for one contact.
    ///
    /// Returns no ops when the contact is unknown, not on the forward list,
    /// already in agreement with the server, or already `moving`. A removal
    /// deferred by an earlier pass stays deferred until the local groups
    /// change.
    pub fn sync_contact(&mut self, roster: &mut Roster, handle: &Handle) -> Vec<RosterOp> {
        let (local, server, held) = match roster.contact(handle) {
            Some(contact) if contact.moving => {
                debug!(%handle, "sync suppressed: pass already outstanding");
                return Vec::new();
            }
            Some(contact) if contact.is_on(List::Forward) => {
                let held = contact
                    .deferred
                    .as_ref()
                    .filter(|deferred| deferred.local_groups == contact.local_groups)
                    .map(|deferred| deferred.group);
                (contact.local_groups.clone(), contact.server_groups.clone(), held)
            }
            _ => return Vec::new(),
        };

        let mut ops = Vec::new();
        let mut changes = Vec::new();
        let mut wanted = BTreeSet::new();

        // Step one: add to every local group.
        for name in &local {
            match roster.group_id_by_name(name) {
                Some(id) => {
                    wanted.insert(id);
                    if !server.contains(&id) {
                        ops.push(RosterOp::AddToGroup {
                            handle: handle.clone(),
                            group: id,
                        });
                        changes.push(PendingChange::Add(id));
                    }
                }
                None => {
                    let waiting = self.awaiting_group.entry(name.clone()).or_default();
                    if waiting.is_empty() {
                        ops.push(RosterOp::CreateGroup { name: name.clone() });
                    }
                    waiting.insert(handle.clone());
                    changes.push(PendingChange::Create(name.clone()));
                }
            }
        }

        // Step two: remove from stale groups, keeping at least one.
        let mut remaining = server.len();
        let mut deferred = None;
        for id in &server {
            if wanted.contains(id) {
                continue;
            }
            if held == Some(*id) {
                deferred = Some(*id);
                continue;
            }
            if remaining > 1 {
                ops.push(RosterOp::RemoveFromGroup {
                    handle: handle.clone(),
                    group: *id,
                });
                changes.push(PendingChange::Remove(*id));
                remaining -= 1;
            } else {
                debug!(%handle, group = %id, "deferring last group removal");
                deferred = Some(*id);
            }
        }

        // Step three: never leave a contact groupless.
        let default_name = roster.default_group_name();
        if local.is_empty() && server.is_empty() && changes.is_empty() {
            ops.push(RosterOp::AddToGroup {
                handle: handle.clone(),
                group: GroupId::DEFAULT,
            });
            changes.push(PendingChange::Add(GroupId::DEFAULT));
        }

        if let Some(contact) = roster.contact_mut(handle) {
            if contact.local_groups.is_empty() && contact.server_groups.is_empty() {
                contact.local_groups.insert(default_name);
            }
            contact.deferred = deferred.map(|group| DeferredRemoval {
                group,
                local_groups: local,
            });
            for change in changes {
                contact.begin(change);
            }
        }

        ops
    }

    /// Run a pass for every contact, e.g. after a fresh roster arrives.
    pub fn sync_all(&mut self, roster: &mut Roster) -> Vec<RosterOp> {
        let mut handles: Vec<Handle> = roster.contacts().map(|c| c.handle.clone()).collect();
        handles.sort();
        handles
            .iter()
            .flat_map(|handle| self.sync_contact(roster, handle))
            .collect()
    }

    /// Move a contact from one local group to another and sync it.
    pub fn move_contact(
        &mut self,
        roster: &mut Roster,
        handle: &Handle,
        from: Option<&str>,
        to: &str,
    ) -> Result<Vec<RosterOp>> {
        let contact = roster
            .contact_mut(handle)
            .ok_or_else(|| RosterError::UnknownContact(handle.to_string()))?;
        if let Some(from) = from {
            contact.local_groups.remove(from);
        }
        contact.local_groups.insert(to.to_string());
        Ok(self.sync_contact(roster, handle))
    }

    /// Replace a contact's local groups wholesale and sync it.
    pub fn set_local_groups<I, S>(
        &mut self,
        roster: &mut Roster,
        handle: &Handle,
        groups: I,
    ) -> Result<Vec<RosterOp>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let contact = roster
            .contact_mut(handle)
            .ok_or_else(|| RosterError::UnknownContact(handle.to_string()))?;
        contact.local_groups = groups.into_iter().map(Into::into).collect();
        Ok(self.sync_contact(roster, handle))
    }

    /// Plan deletion of a group.
    ///
    /// Contacts whose only membership is this group are first migrated to
    /// the default group.
    pub fn delete_group(&mut self, roster: &mut Roster, id: GroupId) -> Result<Vec<RosterOp>> {
        if id.is_default() {
            return Err(RosterError::DefaultGroup);
        }
        let name = roster
            .group(id)
            .map(|group| group.name.clone())
            .ok_or(RosterError::UnknownGroup(id))?;
        let default_name = roster.default_group_name();

        let mut ops = Vec::new();
        for handle in roster.sole_members_of(id) {
            ops.push(RosterOp::AddToGroup {
                handle: handle.clone(),
                group: GroupId::DEFAULT,
            });
            if let Some(contact) = roster.contact_mut(&handle) {
                contact.local_groups.insert(default_name.clone());
                contact.begin(PendingChange::Add(GroupId::DEFAULT));
            }
        }
        for contact in roster_contacts_in(roster, &name) {
            if let Some(contact) = roster.contact_mut(&contact) {
                contact.local_groups.remove(&name);
            }
        }

        ops.push(RosterOp::DeleteGroup { group: id });
        Ok(ops)
    }

    /// Plan renaming a group.
    pub fn rename_group(&self, roster: &Roster, id: GroupId, name: &str) -> Result<RosterOp> {
        if roster.group(id).is_none() {
            return Err(RosterError::UnknownGroup(id));
        }
        if roster.group_id_by_name(name).is_some() {
            return Err(RosterError::DuplicateGroup(name.to_string()));
        }
        Ok(RosterOp::RenameGroup {
            group: id,
            name: name.to_string(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Acknowledgments
    // ─────────────────────────────────────────────────────────────────────────

    /// The server created a group. Issues the adds queued behind it.
    pub fn group_created(&mut self, roster: &mut Roster, name: &str, id: GroupId) -> Vec<RosterOp> {
        roster.upsert_group(id, name);

        let waiting = self.awaiting_group.remove(name).unwrap_or_default();
        let mut ops = Vec::new();
        for handle in waiting {
            let Some(contact) = roster.contact_mut(&handle) else {
                continue;
            };
            contact.settle(&PendingChange::Create(name.to_string()));
            if contact.local_groups.contains(name) && !contact.server_groups.contains(&id) {
                contact.begin(PendingChange::Add(id));
                ops.push(RosterOp::AddToGroup { handle, group: id });
            }
        }
        ops
    }

    /// Group creation failed. Contacts queued behind it give up their share
    /// of the pass.
    pub fn group_creation_failed(&mut self, roster: &mut Roster, name: &str) {
        warn!(group = name, "group creation failed");
        for handle in self.awaiting_group.remove(name).unwrap_or_default() {
            if let Some(contact) = roster.contact_mut(&handle) {
                contact.settle(&PendingChange::Create(name.to_string()));
            }
        }
    }

    /// The server recorded `handle` in `group`.
    ///
    /// Only an add issued by the contact's own pass counts toward that pass;
    /// a server-initiated add just updates the membership.
    pub fn added_to_group(&mut self, roster: &mut Roster, handle: &Handle, group: GroupId) {
        let contact = roster.entry(handle);
        contact.server_groups.insert(group);
        if !contact.settle(&PendingChange::Add(group)) {
            debug!(%handle, %group, "group add not issued by a pass");
        }
    }

    /// The server dropped `handle` from `group`.
    pub fn removed_from_group(&mut self, roster: &mut Roster, handle: &Handle, group: GroupId) {
        if let Some(contact) = roster.contact_mut(handle) {
            contact.server_groups.remove(&group);
            if !contact.settle(&PendingChange::Remove(group)) {
                debug!(%handle, %group, "group removal not issued by a pass");
            }
        }
    }

    /// The server rejected an add or remove issued by a pass.
    pub fn op_failed(&mut self, roster: &mut Roster, op: &RosterOp) {
        let (handle, change) = match op {
            RosterOp::AddToGroup { handle, group } => (handle, PendingChange::Add(*group)),
            RosterOp::RemoveFromGroup { handle, group } => (handle, PendingChange::Remove(*group)),
            _ => return,
        };
        if let Some(contact) = roster.contact_mut(handle) {
            contact.settle(&change);
        }
    }
}

fn roster_contacts_in(roster: &Roster, name: &str) -> Vec<Handle> {
    roster
        .contacts()
        .filter(|c| c.local_groups.contains(name))
        .map(|c| c.handle.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use msnp_core::ListFlags;

    fn handle(s: &str) -> Handle {
        Handle::new(s)
    }

    fn roster_with_groups() -> Roster {
        let mut roster = Roster::new();
        roster.upsert_group(GroupId(1), "G1");
        roster.upsert_group(GroupId(2), "G2");
        roster.upsert_group(GroupId(3), "G3");
        roster
    }

    /// Apply the server's acknowledgments for `ops`.
    fn ack_all(sync: &mut Synchronizer, roster: &mut Roster, ops: &[RosterOp]) {
        for op in ops {
            match op {
                RosterOp::AddToGroup { handle, group } => sync.added_to_group(roster, handle, *group),
                RosterOp::RemoveFromGroup { handle, group } => {
                    sync.removed_from_group(roster, handle, *group)
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_scenario_defers_last_removal() {
        let mut roster = roster_with_groups();
        let x = handle("x@example.com");
        roster.apply_listing(&x, "X", ListFlags(1), &[GroupId(2), GroupId(3)]);
        roster.contact_mut(&x).unwrap().local_groups = ["G1".to_string()].into();

        let mut sync = Synchronizer::new();
        let ops = sync.sync_contact(&mut roster, &x);

        assert_eq!(
            ops,
            vec![
                RosterOp::AddToGroup { handle: x.clone(), group: GroupId(1) },
                RosterOp::RemoveFromGroup { handle: x.clone(), group: GroupId(2) },
            ]
        );
        assert!(roster.contact(&x).unwrap().moving);

        ack_all(&mut sync, &mut roster, &ops);
        let contact = roster.contact(&x).unwrap();
        assert!(!contact.moving);
        assert_eq!(contact.server_groups, BTreeSet::from([GroupId(1), GroupId(3)]));
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let mut roster = roster_with_groups();
        let x = handle("x@example.com");
        roster.apply_listing(&x, "X", ListFlags(1), &[GroupId(2)]);
        roster.contact_mut(&x).unwrap().local_groups = ["G1".to_string(), "G2".to_string()].into();

        let mut sync = Synchronizer::new();
        let ops = sync.sync_contact(&mut roster, &x);
        assert_eq!(ops.len(), 1);
        ack_all(&mut sync, &mut roster, &ops);

        assert!(sync.sync_contact(&mut roster, &x).is_empty());
    }

    #[test]
    fn test_deferred_removal_survives_later_passes() {
        let mut roster = roster_with_groups();
        let x = handle("x@example.com");
        roster.apply_listing(&x, "X", ListFlags(1), &[GroupId(2), GroupId(3)]);
        roster.contact_mut(&x).unwrap().local_groups = ["G1".to_string()].into();

        let mut sync = Synchronizer::new();
        let ops = sync.sync_contact(&mut roster, &x);
        ack_all(&mut sync, &mut roster, &ops);
        assert_eq!(roster.contact(&x).unwrap().deferred_removal(), Some(GroupId(3)));

        assert!(sync.sync_contact(&mut roster, &x).is_empty());
        assert!(sync.sync_all(&mut roster).is_empty());
        let contact = roster.contact(&x).unwrap();
        assert_eq!(contact.server_groups, BTreeSet::from([GroupId(1), GroupId(3)]));
        assert!(!contact.moving);
    }

    #[test]
    fn test_local_change_releases_deferred_removal() {
        let mut roster = roster_with_groups();
        let x = handle("x@example.com");
        roster.apply_listing(&x, "X", ListFlags(1), &[GroupId(2), GroupId(3)]);
        roster.contact_mut(&x).unwrap().local_groups = ["G1".to_string()].into();

        let mut sync = Synchronizer::new();
        let ops = sync.sync_contact(&mut roster, &x);
        ack_all(&mut sync, &mut roster, &ops);

        let ops = sync.move_contact(&mut roster, &x, None, "G2").unwrap();
        assert_eq!(
            ops,
            vec![
                RosterOp::AddToGroup { handle: x.clone(), group: GroupId(2) },
                RosterOp::RemoveFromGroup { handle: x.clone(), group: GroupId(3) },
            ]
        );
        ack_all(&mut sync, &mut roster, &ops);
        let contact = roster.contact(&x).unwrap();
        assert_eq!(contact.server_groups, BTreeSet::from([GroupId(1), GroupId(2)]));
        assert_eq!(contact.deferred_removal(), None);
    }

    #[test]
    fn test_server_initiated_add_leaves_pass_outstanding() {
        let mut roster = roster_with_groups();
        let x = handle("x@example.com");
        roster.apply_listing(&x, "X", ListFlags(1), &[GroupId(2)]);
        roster.contact_mut(&x).unwrap().local_groups = ["G1".to_string(), "G2".to_string()].into();

        let mut sync = Synchronizer::new();
        let ops = sync.sync_contact(&mut roster, &x);
        assert_eq!(ops, vec![RosterOp::AddToGroup { handle: x.clone(), group: GroupId(1) }]);

        // Another client put the contact in G3 meanwhile.
        sync.added_to_group(&mut roster, &x, GroupId(3));
        let contact = roster.contact(&x).unwrap();
        assert!(contact.moving);
        assert_eq!(contact.pending_ops(), 1);
        assert!(contact.server_groups.contains(&GroupId(3)));

        ack_all(&mut sync, &mut roster, &ops);
        assert!(!roster.contact(&x).unwrap().moving);
    }

    #[test]
    fn test_guard_suppresses_reentrant_pass() {
        let mut roster = roster_with_groups();
        let x = handle("x@example.com");
        roster.apply_listing(&x, "X", ListFlags(1), &[GroupId(2)]);
        roster.contact_mut(&x).unwrap().local_groups = ["G1".to_string()].into();

        let mut sync = Synchronizer::new();
        assert!(!sync.sync_contact(&mut roster, &x).is_empty());
        // Moved again before the server answered: dropped, not queued.
        roster.contact_mut(&x).unwrap().local_groups.insert("G3".to_string());
        assert!(sync.sync_contact(&mut roster, &x).is_empty());
    }

    #[test]
    fn test_missing_group_is_created_first() {
        let mut roster = roster_with_groups();
        let x = handle("x@example.com");
        let y = handle("y@example.com");
        roster.apply_listing(&x, "X", ListFlags(1), &[GroupId(1)]);
        roster.apply_listing(&y, "Y", ListFlags(1), &[GroupId(1)]);
        roster.contact_mut(&x).unwrap().local_groups.insert("New".to_string());
        roster.contact_mut(&y).unwrap().local_groups.insert("New".to_string());

        let mut sync = Synchronizer::new();
        let ops_x = sync.sync_contact(&mut roster, &x);
        let ops_y = sync.sync_contact(&mut roster, &y);
        assert_eq!(ops_x, vec![RosterOp::CreateGroup { name: "New".into() }]);
        assert!(ops_y.is_empty(), "creation requested only once");

        let queued = sync.group_created(&mut roster, "New", GroupId(9));
        assert_eq!(queued.len(), 2);
        ack_all(&mut sync, &mut roster, &queued);
        assert!(!roster.contact(&x).unwrap().moving);
        assert!(roster.contact(&y).unwrap().server_groups.contains(&GroupId(9)));
    }

    #[test]
    fn test_groupless_contact_goes_to_default() {
        let mut roster = Roster::new();
        let x = handle("x@example.com");
        roster.apply_listing(&x, "X", ListFlags(1), &[]);

        let mut sync = Synchronizer::new();
        let ops = sync.sync_contact(&mut roster, &x);
        assert_eq!(ops, vec![RosterOp::AddToGroup { handle: x.clone(), group: GroupId::DEFAULT }]);
        ack_all(&mut sync, &mut roster, &ops);
        assert!(sync.sync_contact(&mut roster, &x).is_empty());
    }

    #[test]
    fn test_failed_op_clears_guard() {
        let mut roster = roster_with_groups();
        let x = handle("x@example.com");
        roster.apply_listing(&x, "X", ListFlags(1), &[GroupId(2)]);
        roster.contact_mut(&x).unwrap().local_groups.insert("G1".to_string());

        let mut sync = Synchronizer::new();
        let ops = sync.sync_contact(&mut roster, &x);
        assert_eq!(ops, vec![RosterOp::AddToGroup { handle: x.clone(), group: GroupId(1) }]);
        sync.op_failed(&mut roster, &ops[0]);
        assert!(!roster.contact(&x).unwrap().moving);
    }

    #[test]
    fn test_delete_default_group_rejected() {
        let mut roster = Roster::new();
        let mut sync = Synchronizer::new();
        assert!(matches!(
            sync.delete_group(&mut roster, GroupId::DEFAULT),
            Err(RosterError::DefaultGroup)
        ));
    }

    #[test]
    fn test_delete_group_migrates_sole_members() {
        let mut roster = roster_with_groups();
        let only = handle("only@example.com");
        let both = handle("both@example.com");
        roster.apply_listing(&only, "O", ListFlags(1), &[GroupId(2)]);
        roster.apply_listing(&both, "B", ListFlags(1), &[GroupId(1), GroupId(2)]);

        let mut sync = Synchronizer::new();
        let ops = sync.delete_group(&mut roster, GroupId(2)).unwrap();
        assert_eq!(
            ops,
            vec![
                RosterOp::AddToGroup { handle: only.clone(), group: GroupId::DEFAULT },
                RosterOp::DeleteGroup { group: GroupId(2) },
            ]
        );
        assert!(!roster.contact(&both).unwrap().local_groups.contains("G2"));
    }

    #[test]
    fn test_rename_to_existing_name_rejected() {
        let roster = roster_with_groups();
        let sync = Synchronizer::new();
        assert!(sync.rename_group(&roster, GroupId(1), "G2").is_err());
        assert!(sync.rename_group(&roster, GroupId(1), "Renamed").is_ok());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use msnp_core::ListFlags;
    use proptest::prelude::*;

    proptest! {
        /// After a pass and its acknowledgments, a contact is never groupless,
        /// every server group it sits in is either wanted locally or the
        /// single deferred leftover, and another pass has nothing to send.
        #[test]
        fn membership_never_empty(
            server in prop::collection::btree_set(0u32..6, 0..4),
            local in prop::collection::btree_set(0u32..6, 0..4),
        ) {
            let mut roster = Roster::new();
            for id in 1..6 {
                roster.upsert_group(GroupId(id), format!("G{id}"));
            }
            let x = Handle::new("x@example.com");
            let server_ids: Vec<GroupId> = server.iter().map(|id| GroupId(*id)).collect();
            roster.apply_listing(&x, "X", ListFlags(1), &server_ids);
            roster.contact_mut(&x).unwrap().local_groups =
                local.iter().map(|id| roster_name(*id)).collect();

            let mut sync = Synchronizer::new();
            let ops = sync.sync_contact(&mut roster, &x);
            for op in &ops {
                match op {
                    RosterOp::AddToGroup { handle, group } => sync.added_to_group(&mut roster, handle, *group),
                    RosterOp::RemoveFromGroup { handle, group } => sync.removed_from_group(&mut roster, handle, *group),
                    _ => {}
                }
            }

            let contact = roster.contact(&x).unwrap();
            prop_assert!(!contact.moving);
            prop_assert!(!contact.server_groups.is_empty());
            let wanted: BTreeSet<GroupId> = local.iter().map(|id| GroupId(*id)).collect();
            let stray = contact.server_groups.difference(&wanted).count();
            prop_assert!(stray <= 1);

            let again = sync.sync_contact(&mut roster, &x);
            prop_assert!(again.is_empty(), "second pass issued {:?}", again);
        }
    }

    fn roster_name(id: u32) -> String {
        if id == 0 { crate::model::DEFAULT_GROUP_NAME.to_string() } else { format!("G{id}") }
    }
}
