//! Typed events delivered to the account's owner.

use bytes::Bytes;

use msnp_core::{
    Cookie, DisconnectReason, GroupId, Handle, List, Presence, ServerError, SyncConflict,
    TransferFailure,
};

use crate::invitation::Application;
use crate::session::SessionId;

/// Everything the client reports upward, over one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    // Connection
    Connected { display_name: String },
    Disconnected { reason: DisconnectReason },

    // Roster
    RosterSynced { contacts: usize, groups: usize, full: bool },
    SelfPresenceChanged { presence: Presence },
    DisplayNameChanged { handle: Handle, display_name: String },
    PresenceChanged { handle: Handle, presence: Presence, display_name: String },
    ContactAdded { handle: Handle, list: List },
    ContactRemoved { handle: Handle, list: List },
    /// Someone put us on their list and we have not decided about them.
    ContactRequest { handle: Handle, display_name: String },
    GroupMembershipChanged { handle: Handle, groups: Vec<GroupId> },
    GroupAdded { id: GroupId, name: String },
    GroupRenamed { id: GroupId, name: String },
    GroupRemoved { id: GroupId },
    SyncConflict { conflict: SyncConflict, code: u16 },
    /// A non-fatal server error (capacity, transient, unmapped).
    ServerError { error: ServerError },

    // Chat sessions
    SessionOpened { session: SessionId, participants: Vec<Handle> },
    SessionClosed { session: SessionId },
    ParticipantJoined { session: SessionId, handle: Handle },
    ParticipantLeft { session: SessionId, handle: Handle },
    MessageReceived { session: SessionId, from: Handle, text: String },
    MessageUndelivered { session: SessionId },
    TypingNotification { session: SessionId, from: Handle },

    // Invitations and transfers
    InvitationReceived { session: SessionId, cookie: Cookie, from: Handle, application: Application },
    InvitationAccepted { session: SessionId, cookie: Cookie },
    InvitationFailed { session: SessionId, cookie: Cookie, failure: TransferFailure },
    TransferProgress { cookie: Cookie, transferred: u64, total: u64, percent: u8 },
    /// A transfer finished. Received files carry their contents.
    TransferDone { cookie: Cookie, received: Option<Bytes> },
    TransferFailed { cookie: Cookie, failure: TransferFailure },
}
