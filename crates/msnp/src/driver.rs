//! The account task.
//!
//! One task owns the notification socket, the roster and the session
//! manager. Switchboards and file transfers run in child tasks and report
//! back over channels; the [`Account`](crate::Account) handle talks to the
//! task with [`AccountCommand`]s.
//!
//! Teardown runs children before parents: transfers first, then
//! switchboards, then the notification socket.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use msnp_core::{
    CancelSide, CommandCodec, Cookie, DisconnectReason, GroupId, Handle, List, Presence,
    TransferFailure,
};
use msnp_roster::{ContactRecord, Roster, RosterSnapshot, RosterStore};
use msnp_session::invitation::cancel_code;
use msnp_session::switchboard;
use msnp_session::{
    connect_and_login, AccountEvent, Application, AuthNegotiator, ChannelOutput, ChannelState,
    ChatMessage, Connector, Direction, FileReceiver, FileSender, InvitationEvent,
    InvitationFields, NotificationChannel, Role, SessionAction, SessionError, SessionId,
    SessionManager, Switchboard, SwitchboardCommand, SwitchboardEvent, SwitchboardOutput,
    TicketService, TransferAcceptor, TransferEvent, Transport,
};

use crate::config::AccountConfig;

/// Buffered requests per switchboard task.
const SWITCHBOARD_QUEUE: usize = 32;
/// Buffered events from all child tasks.
const CHILD_EVENTS: usize = 256;
/// How long teardown waits for child tasks before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Reply<T> = oneshot::Sender<msnp_session::Result<T>>;

/// Requests from the [`Account`](crate::Account) handle.
#[derive(Debug)]
pub(crate) enum AccountCommand {
    SetPresence { presence: Presence, reply: Reply<()> },
    AddContact { handle: Handle, list: List, reply: Reply<()> },
    RemoveContact { handle: Handle, list: List, reply: Reply<()> },
    Block { handle: Handle, reply: Reply<()> },
    Unblock { handle: Handle, reply: Reply<()> },
    Rename { display_name: String, reply: Reply<()> },
    AddGroup { name: String, reply: Reply<()> },
    RenameGroup { id: GroupId, name: String, reply: Reply<()> },
    RemoveGroup { id: GroupId, reply: Reply<()> },
    MoveContact { handle: Handle, from: Option<String>, to: String, reply: Reply<()> },
    SetContactGroups { handle: Handle, groups: Vec<String>, reply: Reply<()> },
    Roster { reply: oneshot::Sender<Roster> },
    OpenSession { participants: Vec<Handle>, reply: Reply<SessionId> },
    SendMessage { session: SessionId, message: ChatMessage, reply: Reply<()> },
    InviteParticipant { session: SessionId, handle: Handle, reply: Reply<()> },
    LeaveSession { session: SessionId, reply: Reply<()> },
    Invite { session: SessionId, application: Application, data: Option<Bytes>, reply: Reply<Cookie> },
    AcceptInvitation { session: SessionId, cookie: Cookie, reply: Reply<()> },
    DeclineInvitation { session: SessionId, cookie: Cookie, reply: Reply<()> },
    CancelInvitation { session: SessionId, cookie: Cookie, reply: Reply<()> },
    CancelTransfer { cookie: Cookie, reply: Reply<()> },
    SignOut { reply: oneshot::Sender<()> },
}

/// What woke the account task.
enum Wake {
    Inbound(msnp_session::Result<msnp_core::Inbound>),
    KeepAlive,
    InvitationDeadline,
    Switchboard(SwitchboardEvent),
    Transfer(Cookie, TransferEvent),
    Command(Option<AccountCommand>),
    Reaped,
}

/// The collaborators an account task is built from.
pub(crate) struct Parts {
    pub config: AccountConfig,
    pub connector: Arc<dyn Connector>,
    pub tickets: Arc<dyn TicketService>,
    pub store: Arc<dyn RosterStore>,
    pub negotiator: AuthNegotiator,
    pub transport: Box<dyn Transport>,
    pub channel: NotificationChannel,
}

pub(crate) struct Driver {
    config: AccountConfig,
    connector: Arc<dyn Connector>,
    tickets: Arc<dyn TicketService>,
    store: Arc<dyn RosterStore>,
    negotiator: AuthNegotiator,
    transport: Box<dyn Transport>,
    channel: NotificationChannel,
    sessions: SessionManager,

    switchboards: HashMap<SessionId, mpsc::Sender<SwitchboardCommand>>,
    switchboard_tasks: JoinSet<()>,
    switchboard_tx: mpsc::Sender<SwitchboardEvent>,
    switchboard_rx: mpsc::Receiver<SwitchboardEvent>,

    /// Contents of offered files, until the peer accepts.
    outgoing_files: HashMap<Cookie, Bytes>,
    transfers: HashMap<Cookie, CancellationToken>,
    transfer_tasks: JoinSet<()>,
    transfer_tx: mpsc::Sender<(Cookie, TransferEvent)>,
    transfer_rx: mpsc::Receiver<(Cookie, TransferEvent)>,

    events: mpsc::Sender<AccountEvent>,
    commands: mpsc::Receiver<AccountCommand>,
    sign_out_reply: Option<oneshot::Sender<()>>,
    /// Set once the notification channel is lost or signed out.
    ended: Option<DisconnectReason>,
}

impl Driver {
    pub(crate) fn new(
        parts: Parts,
        events: mpsc::Sender<AccountEvent>,
        commands: mpsc::Receiver<AccountCommand>,
    ) -> Self {
        let (switchboard_tx, switchboard_rx) = mpsc::channel(CHILD_EVENTS);
        let (transfer_tx, transfer_rx) = mpsc::channel(CHILD_EVENTS);
        Self {
            sessions: SessionManager::new(parts.config.timeouts.invitation),
            config: parts.config,
            connector: parts.connector,
            tickets: parts.tickets,
            store: parts.store,
            negotiator: parts.negotiator,
            transport: parts.transport,
            channel: parts.channel,
            switchboards: HashMap::new(),
            switchboard_tasks: JoinSet::new(),
            switchboard_tx,
            switchboard_rx,
            outgoing_files: HashMap::new(),
            transfers: HashMap::new(),
            transfer_tasks: JoinSet::new(),
            transfer_tx,
            transfer_rx,
            events,
            commands,
            sign_out_reply: None,
            ended: None,
        }
    }

    /// Run until the notification channel closes.
    pub(crate) async fn run(mut self) {
        let outputs = self.channel.start();
        self.apply(outputs).await;

        while self.ended.is_none() {
            let keepalive = self.channel.keepalive_deadline();
            let invitation = self.sessions.next_invitation_deadline();

            let wake = tokio::select! {
                item = self.transport.recv() => Wake::Inbound(item),
                _ = tokio::time::sleep_until(keepalive) => Wake::KeepAlive,
                _ = sleep_until_some(invitation) => Wake::InvitationDeadline,
                Some(event) = self.switchboard_rx.recv() => Wake::Switchboard(event),
                Some((cookie, event)) = self.transfer_rx.recv() => Wake::Transfer(cookie, event),
                command = self.commands.recv() => Wake::Command(command),
                Some(joined) = self.switchboard_tasks.join_next() => {
                    log_join(joined);
                    Wake::Reaped
                }
                Some(joined) = self.transfer_tasks.join_next() => {
                    log_join(joined);
                    Wake::Reaped
                }
            };

            match wake {
                Wake::Inbound(Ok(item)) => {
                    let outputs = self.channel.on_inbound(item);
                    self.apply(outputs).await;
                }
                Wake::Inbound(Err(e)) => {
                    warn!(error = %e, "notification socket lost");
                    self.end(e.disconnect_reason());
                }
                Wake::KeepAlive => {
                    let outputs = self.channel.on_keepalive_tick(Instant::now());
                    self.apply(outputs).await;
                }
                Wake::InvitationDeadline => self.expire_invitations().await,
                Wake::Switchboard(event) => self.on_switchboard(event).await,
                Wake::Transfer(cookie, event) => self.on_transfer(cookie, event).await,
                Wake::Command(Some(command)) => self.on_command(command).await,
                Wake::Command(None) => {
                    info!("account handle dropped, signing out");
                    self.end(DisconnectReason::Requested);
                }
                Wake::Reaped => {}
            }
        }

        let reason = self.ended.unwrap_or(DisconnectReason::Requested);
        self.shutdown(reason).await;
    }

    fn end(&mut self, reason: DisconnectReason) {
        if self.ended.is_none() {
            self.ended = Some(reason);
        }
    }

    async fn emit(&self, event: AccountEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notification channel
    // ─────────────────────────────────────────────────────────────────────────

    /// Carry out channel outputs in order. Outputs of a re-login are
    /// appended to the same queue.
    async fn apply(&mut self, outputs: Vec<ChannelOutput>) {
        let mut queue: VecDeque<ChannelOutput> = outputs.into();
        while let Some(output) = queue.pop_front() {
            if self.ended.is_some() {
                return;
            }
            match output {
                ChannelOutput::Send(command) => {
                    if let Err(e) = self.transport.send(command).await {
                        warn!(error = %e, "notification write failed");
                        self.end(e.disconnect_reason());
                    }
                }
                ChannelOutput::Event(event) => self.on_account_event(event).await,
                ChannelOutput::SwitchboardGranted { trid, addr, token } => {
                    if let Some(action) = self.sessions.granted(trid, &addr, &token) {
                        self.perform(action).await;
                    }
                }
                ChannelOutput::SwitchboardRefused { trid, code } => {
                    if let Some((session, lost)) = self.sessions.refused(trid) {
                        warn!(session, code, "switchboard refused");
                        if !lost.is_empty() {
                            self.emit(AccountEvent::MessageUndelivered { session }).await;
                        }
                        self.emit(AccountEvent::SessionClosed { session }).await;
                    }
                }
                ChannelOutput::Ringing(ring) => {
                    if let Some(action) = self.sessions.ringing(ring) {
                        self.perform(action).await;
                    }
                }
                ChannelOutput::Reauthenticate => match self.reauthenticate().await {
                    Ok(outputs) => queue.extend(outputs),
                    Err(e) => {
                        error!(error = %e, "re-login failed");
                        self.end(e.disconnect_reason());
                    }
                },
                ChannelOutput::Disconnect(reason) => self.end(reason),
            }
        }
    }

    /// Log in again on a fresh socket after the server rejected our ticket.
    async fn reauthenticate(&mut self) -> msnp_session::Result<Vec<ChannelOutput>> {
        info!("ticket rejected, logging in again");
        let _ = self.transport.close().await;
        let logged_in = connect_and_login(
            self.connector.as_ref(),
            &self.config.server,
            &mut self.negotiator,
            self.tickets.as_ref(),
            self.config.timeouts.reply_quiescence,
            self.config.timeouts.login_reply,
        )
        .await?;
        self.transport = logged_in.transport;
        Ok(self.channel.resume(logged_in.conn))
    }

    /// Persist what an event changed, then pass it on.
    async fn on_account_event(&mut self, event: AccountEvent) {
        match &event {
            AccountEvent::RosterSynced { .. } => self.save_roster().await,
            AccountEvent::ContactAdded { handle, .. }
            | AccountEvent::ContactRemoved { handle, .. }
            | AccountEvent::GroupMembershipChanged { handle, .. }
            | AccountEvent::DisplayNameChanged { handle, .. }
                if self.channel.state() == ChannelState::Online && handle != self.channel.handle() =>
            {
                self.persist_contact(handle).await;
            }
            AccountEvent::GroupAdded { id, .. } | AccountEvent::GroupRenamed { id, .. }
                if self.channel.state() == ChannelState::Online =>
            {
                if let Some(group) = self.channel.roster().group(*id).cloned() {
                    if let Err(e) = self.store.upsert_group(&group).await {
                        warn!(error = %e, "could not store group");
                    }
                }
                self.persist_tokens().await;
            }
            AccountEvent::GroupRemoved { id } if self.channel.state() == ChannelState::Online => {
                if let Err(e) = self.store.remove_group(*id).await {
                    warn!(error = %e, "could not remove stored group");
                }
                self.persist_tokens().await;
            }
            AccountEvent::SyncConflict { conflict, code } => {
                warn!(%conflict, code, "roster change rejected");
            }
            _ => {}
        }
        self.emit(event).await;
    }

    async fn save_roster(&self) {
        let snapshot = RosterSnapshot::from_roster(self.channel.roster());
        match self.store.save(&snapshot).await {
            Ok(()) => debug!(contacts = snapshot.contacts.len(), "roster saved"),
            Err(e) => warn!(error = %e, "could not save roster"),
        }
    }

    async fn persist_contact(&self, handle: &Handle) {
        let result = match self.channel.roster().contact(handle) {
            Some(contact) => self.store.upsert_contact(&ContactRecord::from_contact(contact)).await,
            None => self.store.remove_contact(handle).await,
        };
        if let Err(e) = result {
            warn!(%handle, error = %e, "could not store contact");
        }
        self.persist_tokens().await;
    }

    async fn persist_tokens(&self) {
        if let Err(e) = self.store.set_sync_tokens(self.channel.roster().tokens()).await {
            warn!(error = %e, "could not store sync tokens");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    async fn perform(&mut self, action: SessionAction) {
        match action {
            SessionAction::RequestSwitchboard(session) => {
                let (trid, xfr) = self.channel.request_switchboard();
                self.sessions.requested(session, trid);
                if let Err(e) = self.transport.send(xfr).await {
                    warn!(error = %e, "notification write failed");
                    self.end(e.disconnect_reason());
                }
            }
            SessionAction::Deliver { session, message } => {
                if !self.send_to_switchboard(session, SwitchboardCommand::Send(message)).await {
                    self.emit(AccountEvent::MessageUndelivered { session }).await;
                }
            }
            SessionAction::Dial {
                session,
                addr,
                token,
                targets,
                queued,
            } => {
                let switchboard = Switchboard::new(
                    self.channel.handle().clone(),
                    token,
                    Role::Caller { targets },
                    self.config.timeouts.reply_quiescence,
                )
                .with_queue(queued);
                self.spawn_switchboard(session, addr, switchboard);
            }
            SessionAction::Answer { session, ring } => {
                let queued = self.sessions.take_queue(session);
                let switchboard = Switchboard::new(
                    self.channel.handle().clone(),
                    ring.token,
                    Role::Answerer {
                        session_id: ring.session_id,
                    },
                    self.config.timeouts.reply_quiescence,
                )
                .with_queue(queued);
                self.spawn_switchboard(session, ring.addr, switchboard);
            }
        }
    }

    fn spawn_switchboard(&mut self, session: SessionId, addr: String, switchboard: Switchboard) {
        let (tx, rx) = mpsc::channel(SWITCHBOARD_QUEUE);
        self.switchboards.insert(session, tx);
        let connector = Arc::clone(&self.connector);
        let events = self.switchboard_tx.clone();

        self.switchboard_tasks.spawn(async move {
            match connector.connect(&addr, CommandCodec::switchboard()).await {
                Ok(transport) => switchboard::run(session, switchboard, transport, rx, events).await,
                Err(e) => {
                    warn!(session, %addr, error = %e, "switchboard connect failed");
                    if switchboard.queued() > 0 {
                        let undelivered = SwitchboardEvent {
                            session,
                            output: SwitchboardOutput::Undelivered,
                        };
                        let _ = events.send(undelivered).await;
                    }
                    let closed = SwitchboardEvent {
                        session,
                        output: SwitchboardOutput::Closed,
                    };
                    let _ = events.send(closed).await;
                }
            }
        });
    }

    /// Hand a request to a running switchboard. False when there is none.
    async fn send_to_switchboard(&self, session: SessionId, command: SwitchboardCommand) -> bool {
        match self.switchboards.get(&session) {
            Some(tx) => tx.send(command).await.is_ok(),
            None => false,
        }
    }

    /// Submit a message, asking for a switchboard if needed.
    async fn deliver(&mut self, session: SessionId, message: ChatMessage) -> msnp_session::Result<()> {
        if let Some(action) = self.sessions.send(session, message)? {
            self.perform(action).await;
        }
        Ok(())
    }

    async fn on_switchboard(&mut self, event: SwitchboardEvent) {
        let SwitchboardEvent { session, output } = event;
        match output {
            SwitchboardOutput::Send(_) => {}
            SwitchboardOutput::Ready => {
                self.sessions.activated(session);
                let participants = self
                    .sessions
                    .get(session)
                    .map(|s| s.participants().iter().cloned().collect())
                    .unwrap_or_default();
                self.emit(AccountEvent::SessionOpened { session, participants }).await;
            }
            SwitchboardOutput::Joined(handle) => {
                self.sessions.joined(session, handle.clone());
                self.emit(AccountEvent::ParticipantJoined { session, handle }).await;
            }
            SwitchboardOutput::Left(handle) => {
                self.sessions.left(session, &handle);
                self.emit(AccountEvent::ParticipantLeft { session, handle }).await;
            }
            SwitchboardOutput::Message { from, message } => match message {
                ChatMessage::Text { text, .. } => {
                    self.emit(AccountEvent::MessageReceived { session, from, text }).await;
                }
                ChatMessage::Typing { .. } => {
                    self.emit(AccountEvent::TypingNotification { session, from }).await;
                }
                ChatMessage::Invitation(fields) => self.on_invitation_fields(session, from, fields).await,
                ChatMessage::Other { content_type } => {
                    debug!(session, %content_type, "ignoring message");
                }
            },
            SwitchboardOutput::Undelivered => {
                self.emit(AccountEvent::MessageUndelivered { session }).await;
            }
            SwitchboardOutput::Closed => {
                self.switchboards.remove(&session);
                let lost = self.sessions.closed(session);
                if !lost.is_empty() {
                    self.emit(AccountEvent::MessageUndelivered { session }).await;
                }
                self.emit(AccountEvent::SessionClosed { session }).await;
                self.sessions.prune();
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invitations
    // ─────────────────────────────────────────────────────────────────────────

    async fn on_invitation_fields(&mut self, session: SessionId, from: Handle, fields: InvitationFields) {
        let Some(record) = self.sessions.get_mut(session) else {
            return;
        };
        let Some(event) = record.invitations_mut().on_fields(&from, &fields) else {
            return;
        };

        match event {
            InvitationEvent::Received {
                cookie,
                from,
                application,
            } => {
                self.emit(AccountEvent::InvitationReceived {
                    session,
                    cookie,
                    from,
                    application,
                })
                .await;
            }
            InvitationEvent::Accepted { cookie, fields } => {
                self.on_invitation_accepted(session, cookie, fields).await;
            }
            InvitationEvent::Cancelled { cookie, code } => {
                self.outgoing_files.remove(&cookie);
                self.emit(AccountEvent::InvitationFailed {
                    session,
                    cookie,
                    failure: cancel_failure(&code),
                })
                .await;
            }
        }
    }

    async fn on_invitation_accepted(&mut self, session: SessionId, cookie: Cookie, fields: InvitationFields) {
        let Some(invitation) = self
            .sessions
            .get(session)
            .and_then(|s| s.invitations().get(cookie))
            .cloned()
        else {
            return;
        };

        match invitation.direction {
            Direction::Outgoing => match self.outgoing_files.remove(&cookie) {
                Some(data) => self.offer_file(session, cookie, invitation.peer, data).await,
                None => {
                    self.complete_invitation(session, cookie);
                    self.emit(AccountEvent::InvitationAccepted { session, cookie }).await;
                }
            },
            Direction::Incoming => {
                self.complete_invitation(session, cookie);
                match (fields.peer_address(), fields.auth_cookie) {
                    (Some(addr), Some(auth_cookie)) if invitation.application.is_file_transfer() => {
                        self.emit(AccountEvent::InvitationAccepted { session, cookie }).await;
                        self.spawn_receiver(cookie, addr, Cookie(auth_cookie));
                    }
                    _ if invitation.application.is_file_transfer() => {
                        warn!(%cookie, "ACCEPT without connection parameters");
                        self.emit(AccountEvent::InvitationFailed {
                            session,
                            cookie,
                            failure: TransferFailure::Other("missing connection parameters".into()),
                        })
                        .await;
                    }
                    _ => self.emit(AccountEvent::InvitationAccepted { session, cookie }).await,
                }
            }
        }
    }

    fn complete_invitation(&mut self, session: SessionId, cookie: Cookie) {
        if let Some(record) = self.sessions.get_mut(session) {
            record.invitations_mut().complete(cookie);
        }
    }

    /// The peer accepted our file: listen, tell them where, and upload.
    async fn offer_file(&mut self, session: SessionId, cookie: Cookie, peer: Handle, data: Bytes) {
        let acceptor = match self.connector.listen_transfer(self.config.transfer.ports()).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                warn!(%cookie, error = %e, "cannot listen for transfer");
                let cancel = self
                    .sessions
                    .get_mut(session)
                    .and_then(|s| s.invitations_mut().cancel(cookie, cancel_code::FAIL).ok());
                if let Some(fields) = cancel {
                    let _ = self.deliver(session, ChatMessage::Invitation(fields)).await;
                }
                self.emit(AccountEvent::InvitationFailed {
                    session,
                    cookie,
                    failure: TransferFailure::Other(e.to_string()),
                })
                .await;
                return;
            }
        };

        let auth_cookie = Cookie::random();
        let mut reply = InvitationFields::accept(cookie);
        reply.ip_address = Some(self.advertised_address());
        reply.port = Some(acceptor.port());
        reply.auth_cookie = Some(auth_cookie.0);
        reply.sender_connect = Some("TRUE".into());
        reply.launch_application = Some("FALSE".into());

        if let Err(e) = self.deliver(session, ChatMessage::Invitation(reply)).await {
            warn!(%cookie, error = %e, "could not send transfer parameters");
            return;
        }
        self.complete_invitation(session, cookie);
        self.emit(AccountEvent::InvitationAccepted { session, cookie }).await;
        self.spawn_sender(cookie, peer, auth_cookie, data, acceptor);
    }

    fn advertised_address(&self) -> String {
        self.config
            .transfer
            .advertise_address
            .clone()
            .or_else(|| self.channel.external_ip().map(str::to_string))
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    async fn expire_invitations(&mut self) {
        for (session, invitation, fields) in self.sessions.expire_invitations(Instant::now()) {
            let cookie = invitation.cookie;
            info!(session, %cookie, "invitation timed out");
            self.outgoing_files.remove(&cookie);
            if !self
                .send_to_switchboard(session, SwitchboardCommand::Send(ChatMessage::Invitation(fields)))
                .await
            {
                debug!(session, %cookie, "no switchboard for CANCEL");
            }
            self.emit(AccountEvent::InvitationFailed {
                session,
                cookie,
                failure: TransferFailure::Timeout,
            })
            .await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transfers
    // ─────────────────────────────────────────────────────────────────────────

    fn spawn_sender(
        &mut self,
        cookie: Cookie,
        peer: Handle,
        auth_cookie: Cookie,
        data: Bytes,
        mut acceptor: Box<dyn TransferAcceptor>,
    ) {
        let cancel = CancellationToken::new();
        self.transfers.insert(cookie, cancel.clone());
        let events = self.transfer_tx.clone();
        let settings = self.config.transfer_settings();

        self.transfer_tasks.spawn(async move {
            let idle = settings.idle_timeout;
            let sender = FileSender::new(peer, auth_cookie, data, settings);
            let result = async {
                let mut link = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TransferFailure::Cancelled(CancelSide::Local)),
                    accepted = tokio::time::timeout(idle, acceptor.accept()) => match accepted {
                        Ok(Ok(link)) => link,
                        Ok(Err(e)) => return Err(TransferFailure::Other(e.to_string())),
                        Err(_) => return Err(TransferFailure::Timeout),
                    },
                };
                forward_progress(cookie, &events, |progress| async move {
                    sender.run(link.as_mut(), &progress, &cancel).await
                })
                .await
            }
            .await;

            let done = match result {
                Ok(()) => TransferEvent::Done { received: None },
                Err(failure) => TransferEvent::Failed(failure),
            };
            let _ = events.send((cookie, done)).await;
        });
    }

    fn spawn_receiver(&mut self, cookie: Cookie, addr: String, auth_cookie: Cookie) {
        let cancel = CancellationToken::new();
        self.transfers.insert(cookie, cancel.clone());
        let events = self.transfer_tx.clone();
        let connector = Arc::clone(&self.connector);
        let receiver = FileReceiver::new(self.channel.handle().clone(), auth_cookie, self.config.transfer_settings());

        self.transfer_tasks.spawn(async move {
            let result = async {
                let mut link = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TransferFailure::Cancelled(CancelSide::Local)),
                    link = connector.connect_transfer(&addr) => match link {
                        Ok(link) => link,
                        Err(e) => {
                            warn!(%cookie, %addr, error = %e, "transfer connect failed");
                            return Err(TransferFailure::Other(e.to_string()));
                        }
                    },
                };
                forward_progress(cookie, &events, |progress| async move {
                    receiver.run(link.as_mut(), &progress, &cancel).await
                })
                .await
            }
            .await;

            let done = match result {
                Ok(data) => TransferEvent::Done { received: Some(data) },
                Err(failure) => TransferEvent::Failed(failure),
            };
            let _ = events.send((cookie, done)).await;
        });
    }

    async fn on_transfer(&mut self, cookie: Cookie, event: TransferEvent) {
        let event = match event {
            TransferEvent::Progress {
                transferred,
                total,
                percent,
            } => AccountEvent::TransferProgress {
                cookie,
                transferred,
                total,
                percent,
            },
            TransferEvent::Done { received } => {
                self.transfers.remove(&cookie);
                info!(%cookie, "transfer done");
                AccountEvent::TransferDone { cookie, received }
            }
            TransferEvent::Failed(failure) => {
                self.transfers.remove(&cookie);
                warn!(%cookie, %failure, "transfer failed");
                AccountEvent::TransferFailed { cookie, failure }
            }
        };
        self.emit(event).await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    async fn on_command(&mut self, command: AccountCommand) {
        match command {
            AccountCommand::SetPresence { presence, reply } => {
                let result = self.channel.set_presence(presence);
                self.channel_op(result, reply).await;
            }
            AccountCommand::AddContact { handle, list, reply } => {
                let result = self.channel.add_contact(&handle, list);
                self.channel_op(result, reply).await;
            }
            AccountCommand::RemoveContact { handle, list, reply } => {
                let result = self.channel.remove_contact(&handle, list);
                self.channel_op(result, reply).await;
            }
            AccountCommand::Block { handle, reply } => {
                let result = self.channel.block(&handle);
                self.channel_op(result, reply).await;
            }
            AccountCommand::Unblock { handle, reply } => {
                let result = self.channel.unblock(&handle);
                self.channel_op(result, reply).await;
            }
            AccountCommand::Rename { display_name, reply } => {
                let result = self.channel.rename_self(&display_name);
                self.channel_op(result, reply).await;
            }
            AccountCommand::AddGroup { name, reply } => {
                let result = self.channel.add_group(&name);
                self.channel_op(result, reply).await;
            }
            AccountCommand::RenameGroup { id, name, reply } => {
                let result = self.channel.rename_group(id, &name);
                self.channel_op(result, reply).await;
            }
            AccountCommand::RemoveGroup { id, reply } => {
                let result = self.channel.remove_group(id);
                self.channel_op(result, reply).await;
            }
            AccountCommand::MoveContact { handle, from, to, reply } => {
                let result = self.channel.move_contact(&handle, from.as_deref(), &to);
                self.channel_op(result, reply).await;
            }
            AccountCommand::SetContactGroups { handle, groups, reply } => {
                let result = self.channel.set_contact_groups(&handle, groups);
                self.channel_op(result, reply).await;
            }
            AccountCommand::Roster { reply } => {
                let _ = reply.send(self.channel.roster().clone());
            }
            AccountCommand::OpenSession { participants, reply } => {
                let _ = reply.send(self.sessions.open(participants));
            }
            AccountCommand::SendMessage { session, message, reply } => {
                let result = self.deliver(session, message).await;
                let _ = reply.send(result);
            }
            AccountCommand::InviteParticipant { session, handle, reply } => {
                let result = if !handle.is_valid() {
                    Err(SessionError::InvalidRequest(format!("invalid handle {handle}")))
                } else if self.send_to_switchboard(session, SwitchboardCommand::Invite(handle)).await {
                    Ok(())
                } else {
                    Err(SessionError::InvalidRequest(format!("session {session} has no switchboard")))
                };
                let _ = reply.send(result);
            }
            AccountCommand::LeaveSession { session, reply } => {
                if !self.send_to_switchboard(session, SwitchboardCommand::Leave).await {
                    self.sessions.closed(session);
                    self.sessions.prune();
                }
                let _ = reply.send(Ok(()));
            }
            AccountCommand::Invite {
                session,
                application,
                data,
                reply,
            } => {
                let result = self.invite(session, application, data).await;
                let _ = reply.send(result);
            }
            AccountCommand::AcceptInvitation { session, cookie, reply } => {
                let result = self
                    .answer_invitation(session, |s| s.invitations_mut().accept(cookie))
                    .await;
                let _ = reply.send(result);
            }
            AccountCommand::DeclineInvitation { session, cookie, reply } => {
                let result = self
                    .answer_invitation(session, |s| s.invitations_mut().decline(cookie))
                    .await;
                let _ = reply.send(result);
            }
            AccountCommand::CancelInvitation { session, cookie, reply } => {
                self.outgoing_files.remove(&cookie);
                let result = self
                    .answer_invitation(session, |s| {
                        s.invitations_mut().cancel(cookie, cancel_code::OUTBANDCANCEL)
                    })
                    .await;
                let _ = reply.send(result);
            }
            AccountCommand::CancelTransfer { cookie, reply } => {
                let result = match self.transfers.get(&cookie) {
                    Some(token) => {
                        info!(%cookie, "cancelling transfer");
                        token.cancel();
                        Ok(())
                    }
                    None => Err(SessionError::UnknownCookie(cookie.0)),
                };
                let _ = reply.send(result);
            }
            AccountCommand::SignOut { reply } => {
                self.sign_out_reply = Some(reply);
                self.end(DisconnectReason::Requested);
            }
        }
    }

    /// Answer the caller, then carry out what the channel asked for.
    async fn channel_op(&mut self, result: msnp_session::Result<Vec<ChannelOutput>>, reply: Reply<()>) {
        match result {
            Ok(outputs) => {
                let _ = reply.send(Ok(()));
                self.apply(outputs).await;
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn invite(
        &mut self,
        session: SessionId,
        application: Application,
        data: Option<Bytes>,
    ) -> msnp_session::Result<Cookie> {
        if application.is_file_transfer() && data.is_none() {
            return Err(SessionError::InvalidRequest("a file invitation needs the file".into()));
        }
        let record = self
            .sessions
            .get_mut(session)
            .ok_or_else(|| SessionError::InvalidRequest(format!("no session {session}")))?;
        let peer = record
            .participants()
            .iter()
            .next()
            .cloned()
            .ok_or_else(|| SessionError::InvalidRequest(format!("session {session} is empty")))?;

        let (cookie, fields) = record.invitations_mut().invite(peer, application);
        if let Some(data) = data {
            self.outgoing_files.insert(cookie, data);
        }
        self.deliver(session, ChatMessage::Invitation(fields)).await?;
        Ok(cookie)
    }

    async fn answer_invitation<F>(&mut self, session: SessionId, answer: F) -> msnp_session::Result<()>
    where
        F: FnOnce(&mut msnp_session::Session) -> msnp_session::Result<InvitationFields>,
    {
        let record = self
            .sessions
            .get_mut(session)
            .ok_or_else(|| SessionError::InvalidRequest(format!("no session {session}")))?;
        let fields = answer(record)?;
        self.deliver(session, ChatMessage::Invitation(fields)).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────────

    async fn shutdown(mut self, reason: DisconnectReason) {
        info!(?reason, "account shutting down");

        for token in self.transfers.values() {
            token.cancel();
        }
        self.drain_transfers().await;

        // Dropping the request senders makes every switchboard leave.
        self.switchboards.clear();
        self.drain_switchboards().await;

        if reason == DisconnectReason::Requested {
            let out = self.channel.sign_out();
            if let Err(e) = self.transport.send(out).await {
                debug!(error = %e, "OUT not delivered");
            }
        } else {
            self.channel.closed();
        }
        let _ = self.transport.close().await;

        self.save_roster().await;
        self.emit(AccountEvent::Disconnected { reason }).await;
        if let Some(reply) = self.sign_out_reply.take() {
            let _ = reply.send(());
        }
        info!("account stopped");
    }

    async fn drain_transfers(&mut self) {
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while !self.transfer_tasks.is_empty() {
                tokio::select! {
                    Some((cookie, event)) = self.transfer_rx.recv() => self.on_transfer(cookie, event).await,
                    Some(joined) = self.transfer_tasks.join_next() => log_join(joined),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("aborting transfers still running");
            self.transfer_tasks.abort_all();
        }
        while let Ok((cookie, event)) = self.transfer_rx.try_recv() {
            self.on_transfer(cookie, event).await;
        }
    }

    async fn drain_switchboards(&mut self) {
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while !self.switchboard_tasks.is_empty() {
                tokio::select! {
                    Some(event) = self.switchboard_rx.recv() => self.on_closing_switchboard(event).await,
                    Some(joined) = self.switchboard_tasks.join_next() => log_join(joined),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("aborting switchboards still running");
            self.switchboard_tasks.abort_all();
        }
        while let Ok(event) = self.switchboard_rx.try_recv() {
            self.on_closing_switchboard(event).await;
        }
    }

    /// Switchboard events during teardown: report closures and late
    /// messages, start nothing new.
    async fn on_closing_switchboard(&mut self, event: SwitchboardEvent) {
        match event.output {
            SwitchboardOutput::Message { .. }
            | SwitchboardOutput::Undelivered
            | SwitchboardOutput::Closed => self.on_switchboard(event).await,
            _ => {}
        }
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!(error = %e, "child task failed");
        }
    }
}

/// Run a transfer while relaying its progress, tagged with `cookie`.
async fn forward_progress<W, F, T>(cookie: Cookie, events: &mpsc::Sender<(Cookie, TransferEvent)>, work: W) -> T
where
    W: FnOnce(mpsc::Sender<TransferEvent>) -> F,
    F: Future<Output = T>,
{
    let (tx, mut rx) = mpsc::channel(CHILD_EVENTS);
    let work = work(tx);
    let relay = async {
        while let Some(event) = rx.recv().await {
            if events.send((cookie, event)).await.is_err() {
                break;
            }
        }
    };
    let (result, ()) = tokio::join!(work, relay);
    result
}

/// What a peer's `Cancel-Code` means for the invitation.
pub(crate) fn cancel_failure(code: &str) -> TransferFailure {
    match code {
        cancel_code::REJECT => TransferFailure::Refused,
        cancel_code::TIMEOUT | cancel_code::FTTIMEOUT => TransferFailure::Timeout,
        _ => TransferFailure::Cancelled(CancelSide::Remote),
    }
}
