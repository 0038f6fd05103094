//! Authentication negotiator.
//!
//! Login runs on a freshly opened notification socket:
//!
//! ```text
//! Client                                   Server
//!   |-- VER 1 MSNP8 CVR0 ------------------->|
//!   |<------------------ VER 1 MSNP8 CVR0 ---|
//!   |-- CVR 2 <client info> <handle> ------->|
//!   |<-------------------- CVR 2 <versions> -|
//!   |-- USR 3 TWN I <handle> --------------->|
//!   |<------------------ XFR 3 NS host:port -|   redirect: reconnect, start over
//!   |<----------------- USR 3 TWN S <chal> --|   or: challenge
//!   |   ... ticket service ...               |
//!   |-- USR 4 TWN S <ticket> --------------->|
//!   |<------------ USR 4 OK <handle> <nick> -|
//! ```
//!
//! The negotiator is a pure state machine; [`login`] and
//! [`connect_and_login`] drive it over a [`Transport`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use msnp_core::{
    classify, md5_login_hash, url_decode, AuthFailure, CodeCategory, Command, CommandCodec,
    Failure, Handle, Inbound, NetworkFailure, ProtocolError,
};

use crate::connection::Connection;
use crate::error::{Result, SessionError};
use crate::transport::{Connector, Transport};

/// Maximum `XFR NS` redirects followed during one login.
pub const MAX_REDIRECTS: usize = 3;

/// Identification the client presents in `VER`/`CVR` and uses to answer
/// client-integrity challenges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientInfo {
    pub locale_id: String,
    pub os_type: String,
    pub os_version: String,
    pub arch: String,
    pub client_name: String,
    pub client_version: String,
    /// Protocol versions offered in `VER`, most preferred first.
    pub protocols: Vec<String>,
    pub product_id: String,
    pub product_key: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            locale_id: "0x0409".into(),
            os_type: "win".into(),
            os_version: "4.10".into(),
            arch: "i386".into(),
            client_name: "MSNMSGR".into(),
            client_version: "5.0.0544".into(),
            protocols: vec!["MSNP8".into(), "CVR0".into()],
            product_id: "msmsgs@msnmsgr.com".into(),
            product_key: "Q1P7W2E4J9R8U3S5".into(),
        }
    }
}

/// Credential exchange method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    /// Ticket from an out-of-band secure ticket service.
    #[default]
    Twn,
    /// Legacy salted MD5 of the password.
    Md5,
}

impl AuthMethod {
    pub fn token(&self) -> &'static str {
        match self {
            AuthMethod::Twn => "TWN",
            AuthMethod::Md5 => "MD5",
        }
    }
}

/// Negotiator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Init,
    /// `VER` sent, waiting for the server's version choice.
    VersionSent,
    VersionNegotiated,
    ChallengeReceived,
    TicketRequested,
    TicketGranted,
    Authenticated,
    Failed,
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStep {
    /// Write this command.
    Send(Command),
    /// Ask the ticket service for a ticket for this challenge, then call
    /// [`AuthNegotiator::ticket_granted`] or [`AuthNegotiator::ticket_failed`].
    RequestTicket(String),
    /// Reconnect to this notification server and start over.
    Redirect(String),
    /// Login complete.
    Authenticated { display_name: String },
    /// Login cannot complete.
    Failed(Failure),
    /// Nothing to do for this line.
    Pending,
}

/// Ticket service errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TicketError {
    #[error("ticket service rejected the password")]
    BadPassword,

    #[error("ticket service host is invalid: {0}")]
    InvalidHost(String),

    #[error("ticket service unreachable: {0}")]
    Network(String),
}

impl From<TicketError> for Failure {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::BadPassword => Failure::Auth(AuthFailure::BadPassword),
            TicketError::InvalidHost(_) => Failure::Auth(AuthFailure::BadTicket),
            TicketError::Network(_) => Failure::Network(NetworkFailure::ConnectFailed),
        }
    }
}

/// Exchanges credentials and a login challenge for a ticket.
#[async_trait]
pub trait TicketService: Send + Sync {
    async fn request_ticket(
        &self,
        handle: &Handle,
        password: &str,
        challenge: &str,
    ) -> std::result::Result<String, TicketError>;
}

/// Login state machine for one notification socket.
#[derive(Debug)]
pub struct AuthNegotiator {
    state: AuthState,
    method: AuthMethod,
    handle: Handle,
    password: String,
    client: ClientInfo,
}

impl AuthNegotiator {
    pub fn new(handle: Handle, password: impl Into<String>, client: ClientInfo, method: AuthMethod) -> Self {
        Self {
            state: AuthState::Init,
            method,
            handle,
            password: password.into(),
            client,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Return to `Init`, e.g. after a redirect.
    pub fn reset(&mut self) {
        self.state = AuthState::Init;
    }

    /// Begin login with `VER`.
    pub fn start(&mut self, conn: &mut Connection) -> Result<Command> {
        if self.state != AuthState::Init {
            return Err(SessionError::LoginInProgress);
        }
        let (_, command) = conn.send_command("VER", self.client.protocols.clone(), true, None);
        self.state = AuthState::VersionSent;
        Ok(command)
    }

    /// Advance on one inbound command.
    pub fn on_command(&mut self, conn: &mut Connection, command: &Command) -> LoginStep {
        if let Some(trid) = command.trid {
            conn.acknowledge(trid);
        }

        if let Some(code) = command.error_code() {
            self.state = AuthState::Failed;
            let failure = match classify(code) {
                CodeCategory::Auth(failure) => Failure::Auth(failure),
                _ => Failure::Protocol(ProtocolError::ServerError(code)),
            };
            warn!(code, %failure, "login rejected");
            return LoginStep::Failed(failure);
        }

        match (self.state, command.verb.as_str()) {
            (AuthState::VersionSent, "VER") => {
                let offered = self.client.protocols.iter().filter(|p| p.as_str() != "CVR0");
                let mut agreed = offered.filter(|p| command.args.iter().any(|a| a == *p));
                match agreed.next() {
                    Some(version) => {
                        debug!(%version, "protocol version agreed");
                        self.state = AuthState::VersionNegotiated;
                        LoginStep::Send(self.cvr(conn))
                    }
                    None => {
                        self.state = AuthState::Failed;
                        LoginStep::Failed(Failure::Protocol(ProtocolError::MalformedFrame(format!(
                            "no common protocol version in {}",
                            command
                        ))))
                    }
                }
            }
            (AuthState::VersionNegotiated, "CVR") => {
                let (_, usr) = conn.send_command(
                    "USR",
                    [self.method.token(), "I", self.handle.as_str()],
                    true,
                    None,
                );
                LoginStep::Send(usr)
            }
            (_, "XFR") if command.get(0) == Some("NS") => match command.get(1) {
                Some(addr) => {
                    info!(%addr, "redirected to another notification server");
                    self.state = AuthState::Init;
                    LoginStep::Redirect(addr.to_string())
                }
                None => self.malformed(command),
            },
            (_, "USR") => self.on_usr(conn, command),
            _ => {
                debug!(%command, "ignored during login");
                LoginStep::Pending
            }
        }
    }

    fn on_usr(&mut self, conn: &mut Connection, command: &Command) -> LoginStep {
        match (command.get(0), command.get(1)) {
            (Some("OK"), _) => {
                self.state = AuthState::Authenticated;
                let display_name = command
                    .get(2)
                    .map(url_decode)
                    .unwrap_or_else(|| self.handle.to_string());
                info!(handle = %self.handle, "authenticated");
                LoginStep::Authenticated { display_name }
            }
            (Some("TWN"), Some("S")) => match command.get(2) {
                Some(challenge) => {
                    self.state = AuthState::TicketRequested;
                    LoginStep::RequestTicket(challenge.to_string())
                }
                None => self.malformed(command),
            },
            (Some("MD5"), Some("S")) => match command.get(2) {
                Some(salt) => {
                    self.state = AuthState::ChallengeReceived;
                    let hash = md5_login_hash(salt, &self.password);
                    let (_, usr) = conn.send_command("USR", ["MD5", "S", hash.as_str()], true, None);
                    LoginStep::Send(usr)
                }
                None => self.malformed(command),
            },
            _ => self.malformed(command),
        }
    }

    /// The ticket service granted a ticket.
    pub fn ticket_granted(&mut self, conn: &mut Connection, ticket: &str) -> Command {
        self.state = AuthState::TicketGranted;
        let (_, usr) = conn.send_command("USR", ["TWN", "S", ticket], true, None);
        usr
    }

    /// The ticket service failed. Always terminal for this attempt.
    pub fn ticket_failed(&mut self, err: TicketError) -> Failure {
        self.state = AuthState::Failed;
        warn!(error = %err, "ticket exchange failed");
        err.into()
    }

    fn cvr(&self, conn: &mut Connection) -> Command {
        let c = &self.client;
        let (_, command) = conn.send_command(
            "CVR",
            [
                c.locale_id.as_str(),
                c.os_type.as_str(),
                c.os_version.as_str(),
                c.arch.as_str(),
                c.client_name.as_str(),
                c.client_version.as_str(),
                "MSMSGS",
                self.handle.as_str(),
            ],
            true,
            None,
        );
        command
    }

    fn malformed(&mut self, command: &Command) -> LoginStep {
        self.state = AuthState::Failed;
        LoginStep::Failed(Failure::Protocol(ProtocolError::MalformedFrame(command.to_string())))
    }
}

/// How a login attempt on one socket ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated { display_name: String },
    Redirect(String),
}

/// Drive `negotiator` over `transport` until it authenticates, redirects or
/// fails. Each reply must arrive within `reply_timeout`.
pub async fn login(
    transport: &dyn Transport,
    conn: &mut Connection,
    negotiator: &mut AuthNegotiator,
    tickets: &dyn TicketService,
    reply_timeout: Duration,
) -> Result<LoginOutcome> {
    transport.send(negotiator.start(conn)?).await?;

    loop {
        let command = match transport.recv_timeout(reply_timeout).await? {
            Some(Inbound::Command(command)) => command,
            Some(Inbound::Malformed(line)) => {
                warn!(%line, "malformed line during login");
                continue;
            }
            None => return Err(NetworkFailure::Timeout.into()),
        };

        match negotiator.on_command(conn, &command) {
            LoginStep::Send(reply) => transport.send(reply).await?,
            LoginStep::RequestTicket(challenge) => {
                let ticket = tickets
                    .request_ticket(negotiator.handle(), &negotiator.password, &challenge)
                    .await;
                match ticket {
                    Ok(ticket) => {
                        let usr = negotiator.ticket_granted(conn, &ticket);
                        transport.send(usr).await?;
                    }
                    Err(err) => return Err(negotiator.ticket_failed(err).into()),
                }
            }
            LoginStep::Redirect(addr) => return Ok(LoginOutcome::Redirect(addr)),
            LoginStep::Authenticated { display_name } => {
                return Ok(LoginOutcome::Authenticated { display_name })
            }
            LoginStep::Failed(failure) => return Err(failure.into()),
            LoginStep::Pending => {}
        }
    }
}

/// An authenticated notification socket.
pub struct LoggedIn {
    pub transport: Box<dyn Transport>,
    pub conn: Connection,
    pub display_name: String,
    /// Address of the server that accepted the login.
    pub server: String,
}

/// Connect to the dispatch server and log in, following redirects.
pub async fn connect_and_login(
    connector: &dyn Connector,
    server: &str,
    negotiator: &mut AuthNegotiator,
    tickets: &dyn TicketService,
    quiescence: Duration,
    reply_timeout: Duration,
) -> Result<LoggedIn> {
    let mut addr = server.to_string();

    for _ in 0..=MAX_REDIRECTS {
        let transport = connector.connect(&addr, CommandCodec::notification()).await?;
        let mut conn = Connection::new(quiescence);
        negotiator.reset();

        match login(transport.as_ref(), &mut conn, negotiator, tickets, reply_timeout).await? {
            LoginOutcome::Authenticated { display_name } => {
                return Ok(LoggedIn {
                    transport,
                    conn,
                    display_name,
                    server: addr,
                });
            }
            LoginOutcome::Redirect(next) => {
                let _ = transport.close().await;
                addr = next;
            }
        }
    }

    Err(Failure::Protocol(ProtocolError::MalformedFrame("too many redirects".into())).into())
}
