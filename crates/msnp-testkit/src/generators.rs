//! Proptest generators for property-based testing.

use std::collections::BTreeSet;

use proptest::prelude::*;

use msnp_core::command::VERBS_WITHOUT_TRID;
use msnp_core::{Command, GroupId, Handle, ListFlags, Presence};
use msnp_roster::{ContactRecord, Group, RosterSnapshot, SyncTokens};

/// Generate a valid handle.
pub fn handle() -> impl Strategy<Value = Handle> {
    ("[a-z][a-z0-9._]{0,15}", "[a-z]{2,10}", "(com|net|org)")
        .prop_map(|(local, domain, tld)| Handle::new(format!("{local}@{domain}.{tld}")))
}

/// Generate a display name, spaces and non-ASCII included.
pub fn display_name() -> impl Strategy<Value = String> {
    "\\PC{0,24}".prop_map(String::from)
}

/// Generate a group name.
pub fn group_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9 ]{0,15}".prop_map(String::from)
}

/// Generate list membership bits (forward, allow, block, reverse).
pub fn list_flags() -> impl Strategy<Value = ListFlags> {
    (0u8..16).prop_map(ListFlags)
}

/// Generate a presence state.
pub fn presence() -> impl Strategy<Value = Presence> {
    prop_oneof![
        Just(Presence::Online),
        Just(Presence::Busy),
        Just(Presence::Idle),
        Just(Presence::BeRightBack),
        Just(Presence::Away),
        Just(Presence::OnThePhone),
        Just(Presence::OutToLunch),
        Just(Presence::Invisible),
        Just(Presence::Offline),
    ]
}

/// Generate a payload-less command that carries a transaction id.
pub fn command() -> impl Strategy<Value = Command> {
    (
        "[A-Z]{3}".prop_filter("verb never carries an id", |verb| {
            !VERBS_WITHOUT_TRID.contains(&verb.as_str())
        }),
        1u32..=u32::MAX,
        prop::collection::vec("[a-zA-Z@.=,%][a-zA-Z0-9@.=,%]{0,11}", 0..5),
    )
        .prop_map(|(verb, trid, args)| Command::new(verb).with_trid(trid).args(args))
}

/// Parameters for generating a stored roster.
#[derive(Debug, Clone)]
pub struct RosterParams {
    pub groups: Vec<Group>,
    pub contacts: Vec<ContactRecord>,
    pub tokens: SyncTokens,
}

impl RosterParams {
    /// The snapshot a store would hold, contacts ordered by handle.
    pub fn snapshot(&self) -> RosterSnapshot {
        let mut contacts = self.contacts.clone();
        contacts.sort_by(|a, b| a.handle.cmp(&b.handle));
        RosterSnapshot {
            contacts,
            groups: self.groups.clone(),
            tokens: self.tokens.clone(),
        }
    }
}

impl Arbitrary for RosterParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            prop::collection::btree_map(1u32..64, group_name(), 0..6),
            prop::collection::btree_map(handle(), (display_name(), list_flags(), any::<u64>()), 0..12),
            "[0-9]{1,6}",
            "[0-9]{1,6}",
        )
            .prop_map(|(groups, contacts, last_change, last_sync)| {
                let groups: Vec<Group> = groups
                    .into_iter()
                    .map(|(id, name)| Group::new(GroupId(id), name))
                    .collect();
                let contacts = contacts
                    .into_iter()
                    .map(|(handle, (display_name, lists, pick))| {
                        // one bit of `pick` per group decides membership
                        let chosen: BTreeSet<GroupId> = groups
                            .iter()
                            .enumerate()
                            .filter(|(i, _)| pick & (1 << i) != 0)
                            .map(|(_, group)| group.id)
                            .collect();
                        ContactRecord {
                            handle,
                            display_name,
                            groups: chosen.into_iter().collect(),
                            lists,
                        }
                    })
                    .collect();
                RosterParams {
                    groups,
                    contacts,
                    tokens: SyncTokens::new(last_change, last_sync),
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msnp_core::{parse_line, url_decode, url_encode};

    proptest! {
        #[test]
        fn test_header_line_parses_back(command in command()) {
            let parsed = parse_line(&command.header_line()).unwrap();
            prop_assert_eq!(parsed, command);
        }

        #[test]
        fn test_encoded_names_are_single_tokens(name in display_name()) {
            let encoded = url_encode(&name);
            prop_assert!(!encoded.chars().any(char::is_whitespace));
            prop_assert_eq!(url_decode(&encoded), name);
        }

        #[test]
        fn test_stored_roster_rebuilds_unchanged(params: RosterParams) {
            let snapshot = params.snapshot();
            let rebuilt = RosterSnapshot::from_roster(&snapshot.clone().into_roster());

            prop_assert_eq!(rebuilt.contacts, snapshot.contacts);
            prop_assert_eq!(rebuilt.tokens, snapshot.tokens);
            for group in &snapshot.groups {
                prop_assert!(rebuilt.groups.contains(group));
            }
        }

        #[test]
        fn test_generated_handles_are_valid(handle in handle()) {
            prop_assert!(handle.is_valid());
        }
    }
}
