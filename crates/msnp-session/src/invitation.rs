//! Invitation sub-protocol.
//!
//! Invitations ride inside ordinary chat payloads (`text/x-msmsgsinvite`)
//! as a block of header fields. The inviter picks a cookie; every later
//! ACCEPT or CANCEL names that cookie. Connection-oriented applications
//! carry the socket parameters in an ACCEPT, and exactly one side listens.
//!
//! ```text
//! inviter:  Created -> AwaitingAccept -> Accepted | Cancelled | TimedOut
//! invitee:  Created -> Pending        -> Accepted | Cancelled | TimedOut
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use msnp_core::{Cookie, Handle};

use crate::error::{Result, SessionError};
use crate::message::{parse_fields, render_fields};

pub const FILE_TRANSFER_GUID: &str = "{5D3E02AB-6190-11d3-BBBB-00C04F795683}";
pub const WEBCAM_GUID: &str = "{4BD96FC0-AB17-4425-A14A-439185962DC8}";

/// Invitation command carried in `Invitation-Command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationCommand {
    Invite,
    Accept,
    Cancel,
}

impl InvitationCommand {
    pub fn token(&self) -> &'static str {
        match self {
            InvitationCommand::Invite => "INVITE",
            InvitationCommand::Accept => "ACCEPT",
            InvitationCommand::Cancel => "CANCEL",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "INVITE" => Some(InvitationCommand::Invite),
            "ACCEPT" => Some(InvitationCommand::Accept),
            "CANCEL" => Some(InvitationCommand::Cancel),
            _ => None,
        }
    }
}

/// Reasons carried in `Cancel-Code`.
pub mod cancel_code {
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const REJECT: &str = "REJECT";
    pub const FTTIMEOUT: &str = "FTTIMEOUT";
    pub const OUTBANDCANCEL: &str = "OUTBANDCANCEL";
    pub const FAIL: &str = "FAIL";
}

/// What the invitation is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Application {
    FileTransfer { file_name: String, file_size: u64 },
    Webcam,
    /// Any other application, by name and GUID.
    External { name: String, guid: String },
}

impl Application {
    pub fn guid(&self) -> &str {
        match self {
            Application::FileTransfer { .. } => FILE_TRANSFER_GUID,
            Application::Webcam => WEBCAM_GUID,
            Application::External { guid, .. } => guid,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Application::FileTransfer { .. } => "File Transfer",
            Application::Webcam => "Webcam",
            Application::External { name, .. } => name,
        }
    }

    pub fn is_file_transfer(&self) -> bool {
        matches!(self, Application::FileTransfer { .. })
    }
}

/// The header block of one invitation message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvitationFields {
    pub application_name: Option<String>,
    pub application_guid: Option<String>,
    pub command: Option<String>,
    pub cookie: Option<u32>,
    pub cancel_code: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub ip_address: Option<String>,
    pub port: Option<u16>,
    pub auth_cookie: Option<u32>,
    pub sender_connect: Option<String>,
    pub launch_application: Option<String>,
    pub request_data: Option<String>,
    /// Fields not listed above, in order.
    pub extra: Vec<(String, String)>,
}

impl InvitationFields {
    fn with_command(command: InvitationCommand, cookie: Cookie) -> Self {
        Self {
            command: Some(command.token().to_string()),
            cookie: Some(cookie.0),
            ..Self::default()
        }
    }

    /// INVITE for `application`.
    pub fn invite(application: &Application, cookie: Cookie) -> Self {
        let mut fields = Self::with_command(InvitationCommand::Invite, cookie);
        fields.application_name = Some(application.name().to_string());
        fields.application_guid = Some(application.guid().to_string());
        if let Application::FileTransfer { file_name, file_size } = application {
            fields.launch_application = Some("FALSE".into());
            fields.application_file(file_name, *file_size);
        }
        fields
    }

    fn application_file(&mut self, name: &str, size: u64) {
        self.file_name = Some(name.to_string());
        self.file_size = Some(size);
    }

    pub fn accept(cookie: Cookie) -> Self {
        Self::with_command(InvitationCommand::Accept, cookie)
    }

    pub fn cancel(cookie: Cookie, code: &str) -> Self {
        let mut fields = Self::with_command(InvitationCommand::Cancel, cookie);
        fields.cancel_code = Some(code.to_string());
        fields
    }

    pub fn invitation_command(&self) -> Option<InvitationCommand> {
        self.command.as_deref().and_then(InvitationCommand::from_token)
    }

    pub fn invitation_cookie(&self) -> Option<Cookie> {
        self.cookie.map(Cookie)
    }

    /// The application an INVITE asks for.
    pub fn application(&self) -> Application {
        let guid = self.application_guid.clone().unwrap_or_default();
        if guid.eq_ignore_ascii_case(FILE_TRANSFER_GUID) {
            Application::FileTransfer {
                file_name: self.file_name.clone().unwrap_or_default(),
                file_size: self.file_size.unwrap_or(0),
            }
        } else if guid.eq_ignore_ascii_case(WEBCAM_GUID) {
            Application::Webcam
        } else {
            Application::External {
                name: self.application_name.clone().unwrap_or_default(),
                guid,
            }
        }
    }

    /// `host:port` of a listening peer, when the fields carry one.
    pub fn peer_address(&self) -> Option<String> {
        match (&self.ip_address, self.port) {
            (Some(ip), Some(port)) if !ip.is_empty() => Some(format!("{ip}:{port}")),
            _ => None,
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut fields = Self::default();
        for (name, value) in parse_fields(text) {
            match name.as_str() {
                "Application-Name" => fields.application_name = Some(value),
                "Application-GUID" => fields.application_guid = Some(value),
                "Invitation-Command" => fields.command = Some(value),
                "Invitation-Cookie" => fields.cookie = value.parse().ok(),
                "Cancel-Code" => fields.cancel_code = Some(value),
                "Application-File" => fields.file_name = Some(value),
                "Application-FileSize" => fields.file_size = value.parse().ok(),
                "IP-Address" => fields.ip_address = Some(value),
                "Port" => fields.port = value.parse().ok(),
                "AuthCookie" => fields.auth_cookie = value.parse().ok(),
                "Sender-Connect" => fields.sender_connect = Some(value),
                "Launch-Application" => fields.launch_application = Some(value),
                "Request-Data" => fields.request_data = Some(value),
                _ => fields.extra.push((name, value)),
            }
        }
        fields
    }

    pub fn render(&self) -> String {
        let mut out: Vec<(String, String)> = Vec::new();
        let mut push = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                out.push((name.to_string(), value));
            }
        };
        push("Application-Name", self.application_name.clone());
        push("Application-GUID", self.application_guid.clone());
        push("Invitation-Command", self.command.clone());
        push("Invitation-Cookie", self.cookie.map(|c| c.to_string()));
        push("Cancel-Code", self.cancel_code.clone());
        push("Launch-Application", self.launch_application.clone());
        push("Request-Data", self.request_data.clone());
        push("Application-File", self.file_name.clone());
        push("Application-FileSize", self.file_size.map(|s| s.to_string()));
        push("IP-Address", self.ip_address.clone());
        push("Port", self.port.map(|p| p.to_string()));
        push("AuthCookie", self.auth_cookie.map(|c| c.to_string()));
        push("Sender-Connect", self.sender_connect.clone());
        out.extend(self.extra.iter().cloned());
        render_fields(&out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationState {
    Created,
    /// Inviter: INVITE sent.
    AwaitingAccept,
    /// Invitee: waiting for the user to decide.
    Pending,
    Accepted,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct Invitation {
    pub cookie: Cookie,
    pub direction: Direction,
    pub peer: Handle,
    pub application: Application,
    pub state: InvitationState,
    /// When the invitation times out if nobody has answered it.
    pub deadline: Instant,
}

impl Invitation {
    /// Still waiting on the peer (outgoing) or on the user (incoming).
    pub fn is_unanswered(&self) -> bool {
        matches!(self.state, InvitationState::AwaitingAccept | InvitationState::Pending)
    }
}

/// What an inbound invitation message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitationEvent {
    /// A peer invited us.
    Received {
        cookie: Cookie,
        from: Handle,
        application: Application,
    },
    /// The peer accepted our invitation, or sent connection parameters for
    /// one we accepted.
    Accepted { cookie: Cookie, fields: InvitationFields },
    /// The peer cancelled or declined.
    Cancelled { cookie: Cookie, code: String },
}

/// Outstanding invitations of one chat session, keyed by cookie.
#[derive(Debug)]
pub struct InvitationManager {
    invitations: HashMap<Cookie, Invitation>,
    timeout: Duration,
}

impl InvitationManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            invitations: HashMap::new(),
            timeout,
        }
    }

    pub fn get(&self, cookie: Cookie) -> Option<&Invitation> {
        self.invitations.get(&cookie)
    }

    pub fn len(&self) -> usize {
        self.invitations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invitations.is_empty()
    }

    /// Start an outgoing invitation with a fresh cookie and return the
    /// INVITE to send.
    pub fn invite(&mut self, peer: Handle, application: Application) -> (Cookie, InvitationFields) {
        let mut cookie = Cookie::random();
        while self.invitations.contains_key(&cookie) {
            cookie = Cookie::random();
        }
        (cookie, self.record_outgoing(peer, application, cookie))
    }

    /// Start an outgoing invitation under a chosen cookie.
    pub fn invite_with_cookie(
        &mut self,
        peer: Handle,
        application: Application,
        cookie: Cookie,
    ) -> Result<InvitationFields> {
        if self.invitations.contains_key(&cookie) {
            return Err(SessionError::InvalidRequest(format!("cookie {cookie} already outstanding")));
        }
        Ok(self.record_outgoing(peer, application, cookie))
    }

    fn record_outgoing(&mut self, peer: Handle, application: Application, cookie: Cookie) -> InvitationFields {
        let fields = InvitationFields::invite(&application, cookie);
        debug!(%cookie, %peer, app = application.name(), "invitation sent");
        self.invitations.insert(
            cookie,
            Invitation {
                cookie,
                direction: Direction::Outgoing,
                peer,
                application,
                state: InvitationState::AwaitingAccept,
                deadline: Instant::now() + self.timeout,
            },
        );
        fields
    }

    /// Apply invitation fields received from `from`.
    ///
    /// ACCEPT and CANCEL naming an unknown cookie are ignored.
    pub fn on_fields(&mut self, from: &Handle, fields: &InvitationFields) -> Option<InvitationEvent> {
        let command = fields.invitation_command()?;
        let cookie = match fields.invitation_cookie() {
            Some(cookie) => cookie,
            None => {
                warn!(%from, "invitation without cookie");
                return None;
            }
        };

        match command {
            InvitationCommand::Invite => {
                if self.invitations.contains_key(&cookie) {
                    warn!(%cookie, "duplicate invitation cookie ignored");
                    return None;
                }
                let application = fields.application();
                info!(%cookie, %from, app = application.name(), "invitation received");
                self.invitations.insert(
                    cookie,
                    Invitation {
                        cookie,
                        direction: Direction::Incoming,
                        peer: from.clone(),
                        application: application.clone(),
                        state: InvitationState::Pending,
                        deadline: Instant::now() + self.timeout,
                    },
                );
                Some(InvitationEvent::Received {
                    cookie,
                    from: from.clone(),
                    application,
                })
            }
            InvitationCommand::Accept => {
                let invitation = match self.invitations.get_mut(&cookie) {
                    Some(invitation) => invitation,
                    None => {
                        warn!(%cookie, "ACCEPT for unknown cookie ignored");
                        return None;
                    }
                };
                match (invitation.direction, invitation.state) {
                    (Direction::Outgoing, InvitationState::AwaitingAccept)
                    | (Direction::Incoming, InvitationState::Accepted) => {
                        invitation.state = InvitationState::Accepted;
                        Some(InvitationEvent::Accepted {
                            cookie,
                            fields: fields.clone(),
                        })
                    }
                    (direction, state) => {
                        warn!(%cookie, ?direction, ?state, "ACCEPT out of sequence ignored");
                        None
                    }
                }
            }
            InvitationCommand::Cancel => match self.invitations.remove(&cookie) {
                Some(_) => {
                    let code = fields.cancel_code.clone().unwrap_or_default();
                    info!(%cookie, %code, "invitation cancelled by peer");
                    Some(InvitationEvent::Cancelled { cookie, code })
                }
                None => {
                    warn!(%cookie, "CANCEL for unknown cookie ignored");
                    None
                }
            },
        }
    }

    /// Accept an incoming invitation. Returns the ACCEPT to send.
    pub fn accept(&mut self, cookie: Cookie) -> Result<InvitationFields> {
        let invitation = self
            .invitations
            .get_mut(&cookie)
            .filter(|i| i.direction == Direction::Incoming && i.state == InvitationState::Pending)
            .ok_or(SessionError::UnknownCookie(cookie.0))?;
        invitation.state = InvitationState::Accepted;

        let mut fields = InvitationFields::accept(cookie);
        if invitation.application.is_file_transfer() {
            fields.request_data = Some("IP-Address:".into());
            fields.launch_application = Some("FALSE".into());
        }
        Ok(fields)
    }

    /// Decline an incoming invitation. Returns the CANCEL to send.
    pub fn decline(&mut self, cookie: Cookie) -> Result<InvitationFields> {
        match self.invitations.get(&cookie) {
            Some(i) if i.direction == Direction::Incoming && i.state == InvitationState::Pending => {
                self.invitations.remove(&cookie);
                Ok(InvitationFields::cancel(cookie, cancel_code::REJECT))
            }
            _ => Err(SessionError::UnknownCookie(cookie.0)),
        }
    }

    /// Withdraw an invitation in any live state. Returns the CANCEL to send.
    pub fn cancel(&mut self, cookie: Cookie, code: &str) -> Result<InvitationFields> {
        self.invitations
            .remove(&cookie)
            .map(|_| InvitationFields::cancel(cookie, code))
            .ok_or(SessionError::UnknownCookie(cookie.0))
    }

    /// The invitation handed off to its application; forget it.
    pub fn complete(&mut self, cookie: Cookie) -> Option<Invitation> {
        self.invitations.remove(&cookie)
    }

    /// Earliest timeout among unanswered invitations.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.invitations
            .values()
            .filter(|i| i.is_unanswered())
            .map(|i| i.deadline)
            .min()
    }

    /// Time out unanswered invitations, ours and the peer's alike. Each
    /// comes back in state `TimedOut` with the CANCEL to send.
    pub fn expire(&mut self, now: Instant) -> Vec<(Invitation, InvitationFields)> {
        let expired: Vec<Cookie> = self
            .invitations
            .values()
            .filter(|i| i.is_unanswered() && now >= i.deadline)
            .map(|i| i.cookie)
            .collect();

        let mut out = Vec::new();
        for cookie in expired {
            if let Some(mut invitation) = self.invitations.remove(&cookie) {
                info!(%cookie, "invitation timed out");
                invitation.state = InvitationState::TimedOut;
                out.push((invitation, InvitationFields::cancel(cookie, cancel_code::TIMEOUT)));
            }
        }
        out
    }
}
