//! Chat sessions and their switchboards.
//!
//! A session is keyed by its participant set and owns at most one
//! switchboard. Messages submitted before the switchboard is up wait in the
//! session's queue and are handed over in submission order once a grant
//! arrives.
//!
//! ```text
//! Idle ──send──▶ Requesting ──grant──▶ Connecting ──joined──▶ Active ──▶ Closed
//!                    │                                            ▲
//!                    └──────────────refused───────────────────────┘
//! ```
//!
//! Like the other state machines here, [`SessionManager`] performs no I/O.
//! The driver asks the notification channel for a switchboard when told to
//! and reports grants, refusals and switchboard lifecycle back.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use msnp_core::Handle;

use crate::error::{Result, SessionError};
use crate::invitation::{Invitation, InvitationFields, InvitationManager};
use crate::message::ChatMessage;
use crate::notification::Ring;

/// Identifier of a chat session within one account.
pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No switchboard and none requested.
    Idle,
    /// Waiting for the server to grant a switchboard.
    Requesting,
    /// Switchboard granted; identifying and inviting.
    Connecting,
    Active,
    Closed,
}

/// One conversation.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    participants: BTreeSet<Handle>,
    state: SessionState,
    queue: VecDeque<ChatMessage>,
    invitations: InvitationManager,
}

impl Session {
    fn new(id: SessionId, participants: BTreeSet<Handle>, invitation_timeout: Duration) -> Self {
        Self {
            id,
            participants,
            state: SessionState::Idle,
            queue: VecDeque::new(),
            invitations: InvitationManager::new(invitation_timeout),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn participants(&self) -> &BTreeSet<Handle> {
        &self.participants
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Messages waiting for the switchboard.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn invitations(&self) -> &InvitationManager {
        &self.invitations
    }

    pub fn invitations_mut(&mut self) -> &mut InvitationManager {
        &mut self.invitations
    }

    fn is_live(&self) -> bool {
        self.state != SessionState::Closed
    }
}

/// What the driver has to do for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Ask the notification channel for a switchboard, then report the
    /// request id through [`SessionManager::requested`].
    RequestSwitchboard(SessionId),
    /// Hand a message to the session's switchboard.
    Deliver { session: SessionId, message: ChatMessage },
    /// Connect to a granted switchboard, identify and invite `targets`.
    /// `queued` goes out first, in order, once someone joins.
    Dial {
        session: SessionId,
        addr: String,
        token: String,
        targets: Vec<Handle>,
        queued: Vec<ChatMessage>,
    },
    /// Connect to a switchboard we were invited to.
    Answer { session: SessionId, ring: Ring },
}

/// All chat sessions of one account.
#[derive(Debug)]
pub struct SessionManager {
    next_id: SessionId,
    sessions: BTreeMap<SessionId, Session>,
    /// Outstanding switchboard requests by request id.
    requests: HashMap<u32, SessionId>,
    invitation_timeout: Duration,
}

impl SessionManager {
    pub fn new(invitation_timeout: Duration) -> Self {
        Self {
            next_id: 1,
            sessions: BTreeMap::new(),
            requests: HashMap::new(),
            invitation_timeout,
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The live session with exactly these participants.
    pub fn find(&self, participants: &BTreeSet<Handle>) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.is_live() && &s.participants == participants)
            .map(|s| s.id)
    }

    /// Get or create the session for a participant set.
    pub fn open<I>(&mut self, participants: I) -> Result<SessionId>
    where
        I: IntoIterator<Item = Handle>,
    {
        let participants: BTreeSet<Handle> = participants.into_iter().collect();
        if participants.is_empty() {
            return Err(SessionError::InvalidRequest("a session needs a participant".into()));
        }
        if let Some(bad) = participants.iter().find(|h| !h.is_valid()) {
            return Err(SessionError::InvalidRequest(format!("invalid handle {bad}")));
        }
        if let Some(id) = self.find(&participants) {
            return Ok(id);
        }
        Ok(self.insert(participants, SessionState::Idle))
    }

    fn insert(&mut self, participants: BTreeSet<Handle>, state: SessionState) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        let mut session = Session::new(id, participants, self.invitation_timeout);
        session.state = state;
        debug!(session = id, "session created");
        self.sessions.insert(id, session);
        id
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| SessionError::InvalidRequest(format!("no session {id}")))
    }

    /// Submit a message.
    ///
    /// Without a switchboard the message is queued; the first message on an
    /// idle session asks for one. Further submissions while a request is
    /// outstanding only queue.
    pub fn send(&mut self, id: SessionId, message: ChatMessage) -> Result<Option<SessionAction>> {
        let session = self.session_mut(id)?;
        match session.state {
            SessionState::Connecting | SessionState::Active => {
                Ok(Some(SessionAction::Deliver { session: id, message }))
            }
            SessionState::Requesting => {
                session.queue.push_back(message);
                Ok(None)
            }
            SessionState::Idle => {
                session.queue.push_back(message);
                session.state = SessionState::Requesting;
                Ok(Some(SessionAction::RequestSwitchboard(id)))
            }
            SessionState::Closed => {
                // A closed session is reopened on demand.
                session.queue.push_back(message);
                session.state = SessionState::Requesting;
                Ok(Some(SessionAction::RequestSwitchboard(id)))
            }
        }
    }

    /// Record the id of the `XFR SB` sent for a session.
    pub fn requested(&mut self, id: SessionId, trid: u32) {
        self.requests.insert(trid, id);
    }

    /// The server granted the switchboard requested with `trid`.
    pub fn granted(&mut self, trid: u32, addr: &str, token: &str) -> Option<SessionAction> {
        let id = self.requests.remove(&trid)?;
        let session = self.sessions.get_mut(&id)?;
        if session.state != SessionState::Requesting {
            warn!(session = id, state = ?session.state, "grant for a session not requesting");
            return None;
        }
        session.state = SessionState::Connecting;
        info!(session = id, %addr, "switchboard granted");
        Some(SessionAction::Dial {
            session: id,
            addr: addr.to_string(),
            token: token.to_string(),
            targets: session.participants.iter().cloned().collect(),
            queued: session.queue.drain(..).collect(),
        })
    }

    /// The switchboard request `trid` failed. Returns the session and the
    /// messages that can no longer be delivered.
    pub fn refused(&mut self, trid: u32) -> Option<(SessionId, Vec<ChatMessage>)> {
        let id = self.requests.remove(&trid)?;
        let session = self.sessions.get_mut(&id)?;
        session.state = SessionState::Closed;
        Some((id, session.queue.drain(..).collect()))
    }

    /// We were invited to a switchboard.
    ///
    /// A ring from someone we already have an active one-to-one session
    /// with is not answered; the existing switchboard carries on.
    pub fn ringing(&mut self, ring: Ring) -> Option<SessionAction> {
        let participants: BTreeSet<Handle> = [ring.inviter.clone()].into_iter().collect();
        if let Some(id) = self.find(&participants) {
            let session = self.sessions.get_mut(&id)?;
            match session.state {
                SessionState::Active | SessionState::Connecting => {
                    debug!(session = id, inviter = %ring.inviter, "ring for a session already connected");
                    return None;
                }
                SessionState::Idle | SessionState::Requesting => {
                    // Take the peer's switchboard; our queue rides on it.
                    session.state = SessionState::Connecting;
                    self.requests.retain(|_, session| *session != id);
                    return Some(SessionAction::Answer { session: id, ring });
                }
                SessionState::Closed => {}
            }
        }
        let id = self.insert(participants, SessionState::Connecting);
        Some(SessionAction::Answer { session: id, ring })
    }

    /// Messages queued before an answered switchboard came up.
    pub fn take_queue(&mut self, id: SessionId) -> Vec<ChatMessage> {
        self.sessions
            .get_mut(&id)
            .map(|s| s.queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// The switchboard is up and someone joined.
    pub fn activated(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.state = SessionState::Active;
        }
    }

    pub fn joined(&mut self, id: SessionId, handle: Handle) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.participants.insert(handle);
        }
    }

    /// A participant left. The set never becomes empty; a session whose
    /// last peer left is closed by the switchboard instead.
    pub fn left(&mut self, id: SessionId, handle: &Handle) {
        if let Some(session) = self.sessions.get_mut(&id) {
            if session.participants.len() > 1 {
                session.participants.remove(handle);
            }
        }
    }

    /// The switchboard is gone. Returns messages that were never handed
    /// over.
    pub fn closed(&mut self, id: SessionId) -> Vec<ChatMessage> {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.state = SessionState::Closed;
                session.queue.drain(..).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop closed sessions with no outstanding invitations.
    pub fn prune(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.is_live() || !s.invitations.is_empty() || !s.queue.is_empty());
        before - self.sessions.len()
    }

    /// Earliest invitation timeout across sessions.
    pub fn next_invitation_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|s| s.invitations.next_deadline())
            .min()
    }

    /// Time out overdue invitations. Each comes with the `CANCEL` fields to
    /// send on its session.
    pub fn expire_invitations(&mut self, now: Instant) -> Vec<(SessionId, Invitation, InvitationFields)> {
        self.sessions
            .iter_mut()
            .flat_map(|(id, s)| {
                s.invitations
                    .expire(now)
                    .into_iter()
                    .map(move |(invitation, fields)| (*id, invitation, fields))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invitation::Application;
    use msnp_core::Cookie;

    fn bob() -> Handle {
        Handle::new("bob@example.com")
    }

    fn manager() -> SessionManager {
        SessionManager::new(Duration::from_secs(600))
    }

    #[test]
    fn test_open_is_keyed_by_participants() {
        let mut sm = manager();
        let a = sm.open([bob()]).unwrap();
        let b = sm.open([bob()]).unwrap();
        let c = sm.open([bob(), Handle::new("carol@example.com")]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(sm.open(Vec::<Handle>::new()).is_err());
    }

    #[test]
    fn test_queue_flushes_in_order_on_grant() {
        let mut sm = manager();
        let id = sm.open([bob()]).unwrap();

        let first = sm.send(id, ChatMessage::text("one")).unwrap();
        assert_eq!(first, Some(SessionAction::RequestSwitchboard(id)));
        // Coalesced: no second request.
        assert_eq!(sm.send(id, ChatMessage::text("two")).unwrap(), None);
        assert_eq!(sm.send(id, ChatMessage::text("three")).unwrap(), None);
        sm.requested(id, 7);

        match sm.granted(7, "10.0.0.1:1863", "tok") {
            Some(SessionAction::Dial { session, targets, queued, .. }) => {
                assert_eq!(session, id);
                assert_eq!(targets, vec![bob()]);
                assert_eq!(
                    queued,
                    vec![ChatMessage::text("one"), ChatMessage::text("two"), ChatMessage::text("three")]
                );
            }
            other => panic!("unexpected {:?}", other),
        }

        // Now messages go straight to the switchboard.
        assert!(matches!(
            sm.send(id, ChatMessage::text("four")).unwrap(),
            Some(SessionAction::Deliver { .. })
        ));
    }

    #[test]
    fn test_refusal_returns_undelivered() {
        let mut sm = manager();
        let id = sm.open([bob()]).unwrap();
        sm.send(id, ChatMessage::text("hi")).unwrap();
        sm.requested(id, 3);
        let (session, lost) = sm.refused(3).unwrap();
        assert_eq!(session, id);
        assert_eq!(lost, vec![ChatMessage::text("hi")]);
        assert_eq!(sm.get(id).unwrap().state(), &SessionState::Closed);
        assert!(sm.granted(3, "x:1", "t").is_none());
    }

    #[test]
    fn test_ring_reuses_active_session() {
        let mut sm = manager();
        let id = sm.open([bob()]).unwrap();
        sm.send(id, ChatMessage::text("hi")).unwrap();
        sm.requested(id, 1);
        sm.granted(1, "a:1", "t");
        sm.activated(id);

        let ring = Ring {
            session_id: "99".into(),
            addr: "b:2".into(),
            token: "t2".into(),
            inviter: bob(),
            nick: "Bob".into(),
        };
        assert_eq!(sm.ringing(ring.clone()), None);
        assert_eq!(sm.len(), 1);

        let mut ring = ring;
        ring.inviter = Handle::new("carol@example.com");
        assert!(matches!(sm.ringing(ring), Some(SessionAction::Answer { .. })));
        assert_eq!(sm.len(), 2);
    }

    #[test]
    fn test_prune_drops_closed_sessions() {
        let mut sm = manager();
        let id = sm.open([bob()]).unwrap();
        sm.closed(id);
        assert_eq!(sm.prune(), 1);
        assert!(sm.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecided_invitation_does_not_pin_closed_session() {
        let mut sm = manager();
        let id = sm.open([bob()]).unwrap();
        let invite = InvitationFields::invite(&Application::Webcam, Cookie(7));
        sm.get_mut(id).unwrap().invitations_mut().on_fields(&bob(), &invite);
        sm.closed(id);
        assert_eq!(sm.prune(), 0);

        tokio::time::advance(Duration::from_secs(600)).await;
        let expired = sm.expire_invitations(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(sm.prune(), 1);
        assert!(sm.is_empty());
    }

    #[test]
    fn test_last_participant_kept() {
        let mut sm = manager();
        let id = sm.open([bob()]).unwrap();
        sm.joined(id, Handle::new("carol@example.com"));
        sm.left(id, &bob());
        sm.left(id, &Handle::new("carol@example.com"));
        assert_eq!(sm.get(id).unwrap().participants().len(), 1);
    }
}
