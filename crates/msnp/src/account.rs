//! The Account: unified API for one signed-in identity.
//!
//! An [`Account`] is a cheap handle onto a background task that owns every
//! socket of the account. Operations are forwarded to the task and answered
//! once the request is on the wire; what the server does about it arrives
//! later as an [`AccountEvent`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use msnp_core::{Cookie, GroupId, Handle, List, Presence};
use msnp_roster::{MemoryRosterStore, Roster, RosterStore};
use msnp_session::{
    connect_and_login, AccountEvent, Application, AuthNegotiator, ChatMessage, Connector,
    NotificationChannel, SessionId, TcpConnector, TicketError, TicketService,
};

use crate::config::AccountConfig;
use crate::driver::{AccountCommand, Driver, Parts};
use crate::error::{ClientError, Result};

/// Buffered requests from account handles.
const COMMAND_QUEUE: usize = 64;
/// Buffered events for the owner.
const EVENT_QUEUE: usize = 256;

/// A signed-in account.
///
/// Dropping every clone of the handle signs the account out.
#[derive(Clone)]
pub struct Account {
    handle: Handle,
    commands: mpsc::Sender<AccountCommand>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account").field("handle", &self.handle).finish()
    }
}

impl Account {
    /// Start configuring an account.
    pub fn builder(handle: impl Into<String>, password: impl Into<String>) -> AccountBuilder {
        AccountBuilder::new(handle, password)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Whether the account task is still running.
    pub fn is_connected(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> AccountCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ClientError::Disconnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<msnp_session::Result<T>>) -> AccountCommand,
    ) -> Result<T> {
        self.request(make).await?.map_err(ClientError::from)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Presence and profile
    // ─────────────────────────────────────────────────────────────────────────

    /// Change our presence.
    ///
    /// `Offline` is rejected: sign out to go offline, or use `Invisible` to
    /// appear offline while staying connected.
    pub async fn set_presence(&self, presence: Presence) -> Result<()> {
        self.call(|reply| AccountCommand::SetPresence { presence, reply }).await
    }

    /// Change our display name.
    pub async fn rename(&self, display_name: impl Into<String>) -> Result<()> {
        let display_name = display_name.into();
        self.call(|reply| AccountCommand::Rename { display_name, reply }).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Roster
    // ─────────────────────────────────────────────────────────────────────────

    /// A copy of the roster as it stands now.
    pub async fn roster(&self) -> Result<Roster> {
        self.request(|reply| AccountCommand::Roster { reply }).await
    }

    /// Put a contact on one of our lists.
    pub async fn add_contact(&self, handle: &str, list: List) -> Result<()> {
        let handle = valid_handle(handle)?;
        self.call(|reply| AccountCommand::AddContact { handle, list, reply }).await
    }

    pub async fn remove_contact(&self, handle: &str, list: List) -> Result<()> {
        let handle = valid_handle(handle)?;
        self.call(|reply| AccountCommand::RemoveContact { handle, list, reply }).await
    }

    /// Move a contact from the allow list to the block list.
    pub async fn block(&self, handle: &str) -> Result<()> {
        let handle = valid_handle(handle)?;
        self.call(|reply| AccountCommand::Block { handle, reply }).await
    }

    pub async fn unblock(&self, handle: &str) -> Result<()> {
        let handle = valid_handle(handle)?;
        self.call(|reply| AccountCommand::Unblock { handle, reply }).await
    }

    pub async fn add_group(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.call(|reply| AccountCommand::AddGroup { name, reply }).await
    }

    pub async fn rename_group(&self, id: GroupId, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.call(|reply| AccountCommand::RenameGroup { id, name, reply }).await
    }

    /// Delete a group. Contacts left without a group are moved to the
    /// default group first.
    pub async fn remove_group(&self, id: GroupId) -> Result<()> {
        self.call(|reply| AccountCommand::RemoveGroup { id, reply }).await
    }

    /// Move a contact between groups by display name. `from: None` adds
    /// the contact to `to` without leaving anything.
    pub async fn move_contact(&self, handle: &str, from: Option<&str>, to: &str) -> Result<()> {
        let handle = valid_handle(handle)?;
        let from = from.map(str::to_string);
        let to = to.to_string();
        self.call(|reply| AccountCommand::MoveContact { handle, from, to, reply }).await
    }

    /// Replace the groups a contact belongs to. Missing groups are created.
    pub async fn set_contact_groups<I, S>(&self, handle: &str, groups: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let handle = valid_handle(handle)?;
        let groups = groups.into_iter().map(Into::into).collect();
        self.call(|reply| AccountCommand::SetContactGroups { handle, groups, reply }).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Chat sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// The session with exactly these participants, created if needed.
    /// No switchboard is requested until the first message.
    pub async fn open_session<I, S>(&self, participants: I) -> Result<SessionId>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let participants = participants
            .into_iter()
            .map(|h| Handle::new(h.as_ref()))
            .collect();
        self.call(|reply| AccountCommand::OpenSession { participants, reply }).await
    }

    /// Send a text message. Messages sent before the switchboard is up are
    /// queued and delivered in order.
    pub async fn send_message(&self, session: SessionId, text: impl Into<String>) -> Result<()> {
        let message = ChatMessage::text(text);
        self.call(|reply| AccountCommand::SendMessage { session, message, reply }).await
    }

    /// Tell the session we are typing.
    pub async fn send_typing(&self, session: SessionId) -> Result<()> {
        let message = ChatMessage::Typing {
            user: self.handle.clone(),
        };
        self.call(|reply| AccountCommand::SendMessage { session, message, reply }).await
    }

    /// Ask another contact into a running conversation.
    pub async fn invite_participant(&self, session: SessionId, handle: &str) -> Result<()> {
        let handle = valid_handle(handle)?;
        self.call(|reply| AccountCommand::InviteParticipant { session, handle, reply }).await
    }

    /// Leave a conversation.
    pub async fn leave_session(&self, session: SessionId) -> Result<()> {
        self.call(|reply| AccountCommand::LeaveSession { session, reply }).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invitations and transfers
    // ─────────────────────────────────────────────────────────────────────────

    /// Offer a file. The transfer starts once the peer accepts; the returned
    /// cookie identifies it in later events.
    pub async fn send_file(&self, session: SessionId, file_name: impl Into<String>, data: Bytes) -> Result<Cookie> {
        let application = Application::FileTransfer {
            file_name: file_name.into(),
            file_size: data.len() as u64,
        };
        let data = Some(data);
        self.call(|reply| AccountCommand::Invite {
            session,
            application,
            data,
            reply,
        })
        .await
    }

    /// Invite the session to an application that needs no transfer socket.
    pub async fn invite(&self, session: SessionId, application: Application) -> Result<Cookie> {
        self.call(|reply| AccountCommand::Invite {
            session,
            application,
            data: None,
            reply,
        })
        .await
    }

    pub async fn accept_invitation(&self, session: SessionId, cookie: Cookie) -> Result<()> {
        self.call(|reply| AccountCommand::AcceptInvitation { session, cookie, reply }).await
    }

    pub async fn decline_invitation(&self, session: SessionId, cookie: Cookie) -> Result<()> {
        self.call(|reply| AccountCommand::DeclineInvitation { session, cookie, reply }).await
    }

    /// Withdraw an invitation we sent.
    pub async fn cancel_invitation(&self, session: SessionId, cookie: Cookie) -> Result<()> {
        self.call(|reply| AccountCommand::CancelInvitation { session, cookie, reply }).await
    }

    /// Abort a running transfer. The peer is told before the socket closes.
    pub async fn cancel_transfer(&self, cookie: Cookie) -> Result<()> {
        self.call(|reply| AccountCommand::CancelTransfer { cookie, reply }).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Sign out and wait for every socket to close.
    pub async fn sign_out(self) -> Result<()> {
        if self.request(|reply| AccountCommand::SignOut { reply }).await.is_err() {
            // Already gone.
            return Ok(());
        }
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            task.await.map_err(|_| ClientError::Disconnected)?;
        }
        Ok(())
    }
}

fn valid_handle(handle: &str) -> Result<Handle> {
    let handle = Handle::new(handle);
    if handle.is_valid() {
        Ok(handle)
    } else {
        Err(ClientError::Config(format!("invalid handle {handle}")))
    }
}

/// Ticket service used when none is configured: every request fails.
#[cfg_attr(feature = "passport", allow(dead_code))]
struct NoTicketService;

#[async_trait]
impl TicketService for NoTicketService {
    async fn request_ticket(
        &self,
        _handle: &Handle,
        _password: &str,
        _challenge: &str,
    ) -> std::result::Result<String, TicketError> {
        Err(TicketError::Network("no ticket service configured".into()))
    }
}

/// Configures and signs in an [`Account`].
pub struct AccountBuilder {
    handle: String,
    password: String,
    config: AccountConfig,
    connector: Option<Arc<dyn Connector>>,
    tickets: Option<Arc<dyn TicketService>>,
    store: Option<Arc<dyn RosterStore>>,
}

impl AccountBuilder {
    pub fn new(handle: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            password: password.into(),
            config: AccountConfig::default(),
            connector: None,
            tickets: None,
            store: None,
        }
    }

    pub fn config(mut self, config: AccountConfig) -> Self {
        self.config = config;
        self
    }

    /// Socket factory. Defaults to TCP.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Ticket service for `TWN` logins.
    pub fn ticket_service(mut self, tickets: Arc<dyn TicketService>) -> Self {
        self.tickets = Some(tickets);
        self
    }

    /// Where the roster is cached between sessions. Defaults to memory.
    pub fn roster_store(mut self, store: Arc<dyn RosterStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn default_tickets() -> Result<Arc<dyn TicketService>> {
        #[cfg(feature = "passport")]
        {
            let service = msnp_session::PassportTicketService::new()
                .map_err(|e| ClientError::Config(e.to_string()))?;
            Ok(Arc::new(service))
        }
        #[cfg(not(feature = "passport"))]
        {
            Ok(Arc::new(NoTicketService))
        }
    }

    /// Log in, start the account task and return the handle with its event
    /// stream. The first event is [`AccountEvent::Connected`].
    pub async fn connect(self) -> Result<(Account, mpsc::Receiver<AccountEvent>)> {
        let handle = valid_handle(&self.handle)?;
        let config = self.config;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(config.timeouts.connect)));
        let tickets = match self.tickets {
            Some(tickets) => tickets,
            None => Self::default_tickets()?,
        };
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryRosterStore::new()));

        let roster = store.load().await?.into_roster();
        let mut negotiator = AuthNegotiator::new(
            handle.clone(),
            self.password,
            config.client.clone(),
            config.auth_method,
        );
        let logged_in = connect_and_login(
            connector.as_ref(),
            &config.server,
            &mut negotiator,
            tickets.as_ref(),
            config.timeouts.reply_quiescence,
            config.timeouts.login_reply,
        )
        .await?;
        info!(%handle, server = %logged_in.server, "signed in");

        let channel = NotificationChannel::new(
            handle.clone(),
            logged_in.display_name.clone(),
            config.client.clone(),
            logged_in.conn,
            roster,
            config.channel_settings(),
        );

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        event_tx
            .send(AccountEvent::Connected {
                display_name: logged_in.display_name,
            })
            .await
            .map_err(|_| ClientError::Disconnected)?;

        let driver = Driver::new(
            Parts {
                config,
                connector,
                tickets,
                store,
                negotiator,
                transport: logged_in.transport,
                channel,
            },
            event_tx,
            command_rx,
        );
        let task = tokio::spawn(driver.run());

        let account = Account {
            handle,
            commands: command_tx,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        };
        Ok((account, event_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle_rejected() {
        assert!(valid_handle("alice@example.com").is_ok());
        assert!(matches!(valid_handle("not a handle"), Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_builder_rejects_bad_handle_before_connecting() {
        let err = Account::builder("nobody", "pw").connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_ticket_service_fails_request() {
        let err = NoTicketService
            .request_ticket(&Handle::new("a@b.com"), "pw", "lc=1033")
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::Network(_)));
    }
}
