//! Switchboard: the per-conversation socket.
//!
//! Caller side, after the notification channel granted a switchboard:
//!
//! ```text
//!   |-- USR 1 <handle> <token> ------------->|
//!   |<------------------- USR 1 OK <handle> -|
//!   |-- CAL 2 <target> --------------------->|
//!   |<---------------- CAL 2 RINGING <sid> --|
//!   |<----------------- JOI <target> <nick> -|   active: queued messages go out
//! ```
//!
//! Answer side, after a ring:
//!
//! ```text
//!   |-- ANS 1 <handle> <token> <sid> ------->|
//!   |<------- IRO 1 1 1 <inviter> <nick> ----|
//!   |<-------------------------- ANS 1 OK ---|
//! ```
//!
//! [`Switchboard`] is the state machine; [`run`] drives one over a
//! [`Transport`] as a task of its own.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use msnp_core::{url_decode, Command, Handle, Inbound};

use crate::connection::Connection;
use crate::message::{ChatMessage, MimeMessage};
use crate::session::SessionId;
use crate::transport::Transport;

/// How we came to be on this switchboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// We asked for it and will invite `targets`.
    Caller { targets: Vec<Handle> },
    /// We were rung; `session_id` comes from the `RNG`.
    Answerer { session_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchboardState {
    Identifying,
    /// Identified; waiting for the first invitee to join.
    Inviting,
    Active,
    Closed,
}

/// Something the owner of a switchboard must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchboardOutput {
    /// Write this command.
    Send(Command),
    /// The conversation is up; queued messages have been sent.
    Ready,
    Joined(Handle),
    Left(Handle),
    Message { from: Handle, message: ChatMessage },
    /// The server could not deliver a message.
    Undelivered,
    /// The switchboard is finished.
    Closed,
}

/// State of one switchboard connection.
#[derive(Debug)]
pub struct Switchboard {
    handle: Handle,
    token: String,
    role: Role,
    conn: Connection,
    state: SwitchboardState,
    participants: BTreeSet<Handle>,
    /// Invited, not yet joined.
    inviting: BTreeSet<Handle>,
    outbox: VecDeque<ChatMessage>,
}

impl Switchboard {
    pub fn new(handle: Handle, token: impl Into<String>, role: Role, quiescence: Duration) -> Self {
        Self {
            handle,
            token: token.into(),
            role,
            conn: Connection::new(quiescence),
            state: SwitchboardState::Identifying,
            participants: BTreeSet::new(),
            inviting: BTreeSet::new(),
            outbox: VecDeque::new(),
        }
    }

    /// Messages to send, in order, once the conversation is up.
    pub fn with_queue(mut self, queued: impl IntoIterator<Item = ChatMessage>) -> Self {
        self.outbox.extend(queued);
        self
    }

    pub fn state(&self) -> SwitchboardState {
        self.state
    }

    pub fn participants(&self) -> &BTreeSet<Handle> {
        &self.participants
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// The identify command that opens the exchange.
    pub fn start(&mut self) -> Command {
        let (_, command) = match &self.role {
            Role::Caller { .. } => self.conn.send_command(
                "USR",
                [self.handle.as_str(), self.token.as_str()],
                true,
                None,
            ),
            Role::Answerer { session_id } => self.conn.send_command(
                "ANS",
                [self.handle.as_str(), self.token.as_str(), session_id.as_str()],
                true,
                None,
            ),
        };
        command
    }

    /// Send a message now, or queue it until the conversation is up.
    pub fn send_message(&mut self, message: ChatMessage) -> Option<Command> {
        match self.state {
            SwitchboardState::Active => Some(self.message_command(&message)),
            SwitchboardState::Closed => {
                warn!("message dropped on closed switchboard");
                None
            }
            _ => {
                self.outbox.push_back(message);
                None
            }
        }
    }

    /// Invite someone else into the conversation.
    pub fn invite(&mut self, target: &Handle) -> Command {
        self.inviting.insert(target.clone());
        let (_, cal) = self.conn.send_command("CAL", [target.as_str()], true, None);
        cal
    }

    /// Leave the conversation.
    pub fn leave(&mut self) -> Command {
        self.state = SwitchboardState::Closed;
        Command::new("OUT")
    }

    fn message_command(&mut self, message: &ChatMessage) -> Command {
        let (_, command) = self.conn.send_command(
            "MSG",
            [message.ack_mode()],
            true,
            Some(message.to_mime().to_bytes()),
        );
        command
    }

    fn activate(&mut self) -> Vec<SwitchboardOutput> {
        self.state = SwitchboardState::Active;
        let queued: Vec<ChatMessage> = self.outbox.drain(..).collect();
        let mut out: Vec<SwitchboardOutput> = queued
            .iter()
            .map(|message| SwitchboardOutput::Send(self.message_command(message)))
            .collect();
        out.push(SwitchboardOutput::Ready);
        out
    }

    fn close(&mut self) -> Vec<SwitchboardOutput> {
        if self.state == SwitchboardState::Closed {
            return Vec::new();
        }
        self.state = SwitchboardState::Closed;
        vec![SwitchboardOutput::Closed]
    }

    pub fn on_inbound(&mut self, item: Inbound) -> Vec<SwitchboardOutput> {
        let command = match item {
            Inbound::Command(command) => command,
            Inbound::Malformed(line) => {
                warn!(%line, "malformed switchboard line dropped");
                return Vec::new();
            }
        };

        let pending = command
            .trid
            .and_then(|trid| self.conn.acknowledge(trid))
            .map(|p| p.command);

        if let Some(code) = command.error_code() {
            return self.on_error(code, pending);
        }

        match command.verb.as_str() {
            "USR" if command.get(0) == Some("OK") => {
                let targets = match &self.role {
                    Role::Caller { targets } => targets.clone(),
                    Role::Answerer { .. } => Vec::new(),
                };
                self.state = SwitchboardState::Inviting;
                targets
                    .iter()
                    .map(|target| SwitchboardOutput::Send(self.invite(target)))
                    .collect()
            }
            "CAL" => Vec::new(),
            "IRO" => {
                if let Some(handle) = command.get(2) {
                    self.participants.insert(Handle::new(handle));
                }
                Vec::new()
            }
            "ANS" if command.get(0) == Some("OK") => {
                info!(participants = self.participants.len(), "switchboard answered");
                self.activate()
            }
            "JOI" => {
                let Some(handle) = command.get(0).map(Handle::new) else {
                    return Vec::new();
                };
                self.inviting.remove(&handle);
                self.participants.insert(handle.clone());
                let mut out = vec![SwitchboardOutput::Joined(handle)];
                if self.state == SwitchboardState::Inviting {
                    out.extend(self.activate());
                }
                out
            }
            "BYE" => {
                let Some(handle) = command.get(0).map(Handle::new) else {
                    return Vec::new();
                };
                self.participants.remove(&handle);
                let mut out = vec![SwitchboardOutput::Left(handle)];
                if self.participants.is_empty() && self.inviting.is_empty() {
                    out.extend(self.close());
                }
                out
            }
            "MSG" => self.on_msg(&command),
            "ACK" => Vec::new(),
            "NAK" => vec![SwitchboardOutput::Undelivered],
            "OUT" => self.close(),
            verb => {
                warn!(%verb, "unknown switchboard command dropped");
                Vec::new()
            }
        }
    }

    fn on_msg(&mut self, command: &Command) -> Vec<SwitchboardOutput> {
        let (Some(from), Some(payload)) = (command.get(0), &command.payload) else {
            warn!(%command, "MSG without sender or body");
            return Vec::new();
        };
        match MimeMessage::parse(payload) {
            Ok(mime) => {
                let from = Handle::new(from);
                if let Some(nick) = command.get(1) {
                    debug!(%from, nick = %url_decode(nick), "message");
                }
                vec![SwitchboardOutput::Message {
                    from,
                    message: ChatMessage::from_mime(&mime),
                }]
            }
            Err(e) => {
                warn!(error = %e, "malformed chat payload");
                Vec::new()
            }
        }
    }

    fn on_error(&mut self, code: u16, pending: Option<Command>) -> Vec<SwitchboardOutput> {
        let verb = pending.as_ref().map(|c| c.verb.as_str()).unwrap_or_default();
        warn!(code, reason = msnp_core::describe(code), verb, "switchboard error");
        match verb {
            "USR" | "ANS" => self.close(),
            "CAL" => {
                if let Some(target) = pending.as_ref().and_then(|c| c.get(0)) {
                    self.inviting.remove(&Handle::new(target));
                }
                if self.state == SwitchboardState::Inviting && self.inviting.is_empty() && self.participants.is_empty() {
                    let mut out: Vec<SwitchboardOutput> = self
                        .outbox
                        .drain(..)
                        .map(|_| SwitchboardOutput::Undelivered)
                        .collect();
                    out.extend(self.close());
                    out
                } else {
                    Vec::new()
                }
            }
            "MSG" => vec![SwitchboardOutput::Undelivered],
            _ => Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────────────────────────

/// Requests to a running switchboard task.
#[derive(Debug)]
pub enum SwitchboardCommand {
    Send(ChatMessage),
    Invite(Handle),
    Leave,
}

/// An output of a running switchboard task, tagged with its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchboardEvent {
    pub session: SessionId,
    pub output: SwitchboardOutput,
}

/// Drive a switchboard until it closes.
///
/// Always reports [`SwitchboardOutput::Closed`] exactly once before
/// returning.
pub async fn run(
    session: SessionId,
    mut switchboard: Switchboard,
    transport: Box<dyn Transport>,
    mut commands: mpsc::Receiver<SwitchboardCommand>,
    events: mpsc::Sender<SwitchboardEvent>,
) {
    let emit = |output: SwitchboardOutput| {
        let events = events.clone();
        async move {
            // The owner going away ends the conversation anyway.
            let _ = events.send(SwitchboardEvent { session, output }).await;
        }
    };

    let start = switchboard.start();
    if let Err(e) = transport.send(start).await {
        warn!(session, error = %e, "switchboard identify failed");
        emit(SwitchboardOutput::Closed).await;
        return;
    }

    let mut closed_reported = false;
    'conversation: loop {
        let outputs = tokio::select! {
            item = transport.recv() => match item {
                Ok(item) => switchboard.on_inbound(item),
                Err(e) => {
                    debug!(session, error = %e, "switchboard socket closed");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(SwitchboardCommand::Send(message)) => switchboard
                    .send_message(message)
                    .map(SwitchboardOutput::Send)
                    .into_iter()
                    .collect(),
                Some(SwitchboardCommand::Invite(target)) => {
                    vec![SwitchboardOutput::Send(switchboard.invite(&target))]
                }
                Some(SwitchboardCommand::Leave) | None => {
                    let out = switchboard.leave();
                    if let Err(e) = transport.send(out).await {
                        debug!(session, error = %e, "OUT not delivered");
                    }
                    break;
                }
            },
        };

        for output in outputs {
            match output {
                SwitchboardOutput::Send(command) => {
                    if let Err(e) = transport.send(command).await {
                        warn!(session, error = %e, "switchboard write failed");
                        break 'conversation;
                    }
                }
                SwitchboardOutput::Closed => {
                    closed_reported = true;
                    emit(SwitchboardOutput::Closed).await;
                }
                other => emit(other).await,
            }
        }

        if switchboard.state() == SwitchboardState::Closed {
            break;
        }
    }

    let _ = transport.close().await;
    if !closed_reported {
        emit(SwitchboardOutput::Closed).await;
    }
    info!(session, "switchboard finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use msnp_core::{parse_line, CommandCodec};

    fn caller() -> Switchboard {
        Switchboard::new(
            Handle::new("alice@example.com"),
            "tok",
            Role::Caller {
                targets: vec![Handle::new("bob@example.com")],
            },
            Duration::from_secs(300),
        )
    }

    fn feed(sb: &mut Switchboard, line: &str) -> Vec<SwitchboardOutput> {
        sb.on_inbound(Inbound::Command(parse_line(line).unwrap()))
    }

    fn bodies(outputs: &[SwitchboardOutput]) -> Vec<String> {
        outputs
            .iter()
            .filter_map(|o| match o {
                SwitchboardOutput::Send(c) if c.verb == "MSG" => {
                    let mime = MimeMessage::parse(c.payload.as_ref().unwrap()).unwrap();
                    Some(mime.body().to_string())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_caller_flushes_queue_after_join() {
        let mut sb = caller().with_queue([ChatMessage::text("one"), ChatMessage::text("two")]);
        assert_eq!(sb.start().header_line(), "USR 1 alice@example.com tok");

        let out = feed(&mut sb, "USR 1 OK alice@example.com Alice");
        match out.as_slice() {
            [SwitchboardOutput::Send(cal)] => assert_eq!(cal.header_line(), "CAL 2 bob@example.com"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(feed(&mut sb, "CAL 2 RINGING 11752013").is_empty());

        // Queued while inviting.
        assert!(sb.send_message(ChatMessage::text("three")).is_none());

        let out = feed(&mut sb, "JOI bob@example.com Bob");
        assert_eq!(out[0], SwitchboardOutput::Joined(Handle::new("bob@example.com")));
        assert_eq!(bodies(&out), vec!["one", "two", "three"]);
        assert_eq!(out.last(), Some(&SwitchboardOutput::Ready));
        assert_eq!(sb.state(), SwitchboardState::Active);
    }

    #[test]
    fn test_answerer_activates_on_ans_ok() {
        let mut sb = Switchboard::new(
            Handle::new("alice@example.com"),
            "tok",
            Role::Answerer {
                session_id: "11752013".into(),
            },
            Duration::from_secs(300),
        );
        assert_eq!(sb.start().header_line(), "ANS 1 alice@example.com tok 11752013");
        feed(&mut sb, "IRO 1 1 1 bob@example.com Bob");
        let out = feed(&mut sb, "ANS 1 OK");
        assert_eq!(out, vec![SwitchboardOutput::Ready]);
        assert!(sb.participants().contains(&Handle::new("bob@example.com")));
    }

    #[test]
    fn test_last_bye_closes() {
        let mut sb = caller();
        sb.start();
        feed(&mut sb, "USR 1 OK alice@example.com Alice");
        feed(&mut sb, "JOI bob@example.com Bob");
        let out = feed(&mut sb, "BYE bob@example.com");
        assert_eq!(
            out,
            vec![
                SwitchboardOutput::Left(Handle::new("bob@example.com")),
                SwitchboardOutput::Closed
            ]
        );
    }

    #[test]
    fn test_offline_target_fails_queue() {
        let mut sb = caller().with_queue([ChatMessage::text("hello")]);
        sb.start();
        feed(&mut sb, "USR 1 OK alice@example.com Alice");
        let out = feed(&mut sb, "217 2");
        assert_eq!(out, vec![SwitchboardOutput::Undelivered, SwitchboardOutput::Closed]);
    }

    #[test]
    fn test_incoming_message_decoded() {
        let mut sb = caller();
        sb.start();
        feed(&mut sb, "USR 1 OK alice@example.com Alice");
        feed(&mut sb, "JOI bob@example.com Bob");
        let command = Command::new("MSG")
            .args(["bob@example.com", "Bob"])
            .with_payload(ChatMessage::text("hi alice").to_mime().to_bytes());
        let out = sb.on_inbound(Inbound::Command(command));
        assert_eq!(
            out,
            vec![SwitchboardOutput::Message {
                from: Handle::new("bob@example.com"),
                message: ChatMessage::text("hi alice"),
            }]
        );
    }

    #[tokio::test]
    async fn test_run_over_memory_transport() {
        let (client, server) = memory::pair(CommandCodec::switchboard(), "sb");
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (ev_tx, mut ev_rx) = mpsc::channel(8);
        let sb = caller().with_queue([ChatMessage::text("queued")]);
        let task = tokio::spawn(run(7, sb, Box::new(client), cmd_rx, ev_tx));

        let usr = match server.recv().await.unwrap() {
            Inbound::Command(c) => c,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(usr.header_line(), "USR 1 alice@example.com tok");
        server.send(parse_line("USR 1 OK alice@example.com Alice").unwrap()).await.unwrap();

        let cal = match server.recv().await.unwrap() {
            Inbound::Command(c) => c,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(cal.verb, "CAL");
        server.send(parse_line("JOI bob@example.com Bob").unwrap()).await.unwrap();

        let msg = match server.recv().await.unwrap() {
            Inbound::Command(c) => c,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(msg.verb, "MSG");
        assert_eq!(msg.get(0), Some("A"));

        assert_eq!(
            ev_rx.recv().await.unwrap().output,
            SwitchboardOutput::Joined(Handle::new("bob@example.com"))
        );
        assert_eq!(ev_rx.recv().await.unwrap().output, SwitchboardOutput::Ready);

        cmd_tx.send(SwitchboardCommand::Leave).await.unwrap();
        let out = match server.recv().await.unwrap() {
            Inbound::Command(c) => c,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(out.verb, "OUT");

        let last = ev_rx.recv().await.unwrap();
        assert_eq!(last, SwitchboardEvent { session: 7, output: SwitchboardOutput::Closed });
        task.await.unwrap();
    }
}
