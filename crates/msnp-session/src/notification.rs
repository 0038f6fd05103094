//! The notification channel.
//!
//! One always-on control connection per account. After login it requests
//! the roster with the cached sync tokens, keeps presence in step, applies
//! roster edits, answers client-integrity challenges, hands out switchboard
//! grants and runs the keep-alive.
//!
//! [`NotificationChannel`] performs no I/O: every input returns the
//! [`ChannelOutput`]s the driver must act on. The channel owns the roster,
//! so roster mutation happens only while processing this channel's input.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use msnp_core::{
    challenge_response, url_decode, url_encode, AuthFailure, CodeCategory, Command,
    DisconnectReason, GroupId, Handle, Inbound, List, ListFlags, Presence, ServerError,
};
use msnp_roster::{Roster, RosterError, RosterOp, SyncTokens, Synchronizer};

use crate::auth::ClientInfo;
use crate::connection::Connection;
use crate::error::{Result, SessionError};
use crate::events::AccountEvent;
use crate::keepalive::{KeepAlive, KeepAliveAction};
use crate::message::{MimeMessage, CONTENT_PROFILE};

/// Wire token for a presence state.
pub fn presence_token(presence: Presence) -> &'static str {
    match presence {
        Presence::Online => "NLN",
        Presence::Busy => "BSY",
        Presence::Idle => "IDL",
        Presence::BeRightBack => "BRB",
        Presence::Away => "AWY",
        Presence::OnThePhone => "PHN",
        Presence::OutToLunch => "LUN",
        Presence::Invisible => "HDN",
        Presence::Offline => "FLN",
    }
}

/// Presence state for a wire token.
pub fn parse_presence(token: &str) -> Option<Presence> {
    Some(match token {
        "NLN" => Presence::Online,
        "BSY" => Presence::Busy,
        "IDL" => Presence::Idle,
        "BRB" => Presence::BeRightBack,
        "AWY" => Presence::Away,
        "PHN" => Presence::OnThePhone,
        "LUN" => Presence::OutToLunch,
        "HDN" => Presence::Invisible,
        "FLN" => Presence::Offline,
        _ => return None,
    })
}

/// An incoming switchboard invitation (`RNG`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    pub session_id: String,
    pub addr: String,
    pub token: String,
    pub inviter: Handle,
    pub nick: String,
}

/// What the driver must do after feeding the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutput {
    /// Write this command.
    Send(Command),
    /// Report upward.
    Event(AccountEvent),
    /// The server granted the switchboard requested with `trid`.
    SwitchboardGranted { trid: u32, addr: String, token: String },
    /// The switchboard request `trid` failed.
    SwitchboardRefused { trid: u32, code: u16 },
    /// Someone invited us to a switchboard.
    Ringing(Ring),
    /// The ticket expired mid-session; log in again once.
    Reauthenticate,
    /// Close the channel.
    Disconnect(DisconnectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the roster.
    Syncing,
    Online,
    Closed,
}

/// Settings the channel needs beyond its socket.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub keepalive_interval: Duration,
    /// Presence set once the roster has arrived.
    pub initial_presence: Presence,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(50),
            initial_presence: Presence::Online,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PushProgress {
    contacts: usize,
    groups: usize,
    contacts_seen: usize,
    groups_seen: usize,
}

impl PushProgress {
    fn is_complete(&self) -> bool {
        self.contacts_seen >= self.contacts && self.groups_seen >= self.groups
    }
}

/// State of the notification connection.
#[derive(Debug)]
pub struct NotificationChannel {
    handle: Handle,
    display_name: String,
    client: ClientInfo,
    conn: Connection,
    roster: Roster,
    sync: Synchronizer,
    keepalive: KeepAlive,
    state: ChannelState,
    presence: Presence,
    wanted_presence: Presence,
    privacy: Option<String>,
    push: Option<PushProgress>,
    reauth_attempted: bool,
    external_ip: Option<String>,
}

impl NotificationChannel {
    /// Wrap an authenticated connection.
    pub fn new(
        handle: Handle,
        display_name: impl Into<String>,
        client: ClientInfo,
        conn: Connection,
        roster: Roster,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            handle,
            display_name: display_name.into(),
            client,
            conn,
            roster,
            sync: Synchronizer::new(),
            keepalive: KeepAlive::new(settings.keepalive_interval, Instant::now()),
            state: ChannelState::Syncing,
            presence: Presence::Offline,
            wanted_presence: settings.initial_presence,
            privacy: None,
            push: None,
            reauth_attempted: false,
            external_ip: None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// `AL` or `BL`: what happens to people on neither list.
    pub fn privacy(&self) -> Option<&str> {
        self.privacy.as_deref()
    }

    /// Our address as seen by the server.
    pub fn external_ip(&self) -> Option<&str> {
        self.external_ip.as_deref()
    }

    pub fn keepalive_deadline(&self) -> Instant {
        self.keepalive.deadline()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Request the roster with the cached tokens.
    pub fn start(&mut self) -> Vec<ChannelOutput> {
        let tokens = self.roster.tokens().clone();
        info!(handle = %self.handle, last_change = %tokens.last_change, "requesting roster");
        self.state = ChannelState::Syncing;
        let (_, syn) = self.conn.send_command(
            "SYN",
            [tokens.last_change.as_str(), tokens.last_sync.as_str()],
            true,
            None,
        );
        vec![ChannelOutput::Send(syn)]
    }

    /// Continue on a freshly authenticated socket after re-login.
    pub fn resume(&mut self, conn: Connection) -> Vec<ChannelOutput> {
        self.conn = conn;
        self.keepalive = KeepAlive::new(self.keepalive.interval(), Instant::now());
        self.start()
    }

    /// Sign out: the `OUT` to send. The channel is closed afterwards.
    pub fn sign_out(&mut self) -> Command {
        self.state = ChannelState::Closed;
        self.presence = Presence::Offline;
        self.roster.reset_presence();
        Command::new("OUT")
    }

    /// The socket is gone.
    pub fn closed(&mut self) {
        self.state = ChannelState::Closed;
        self.presence = Presence::Offline;
        self.roster.reset_presence();
    }

    pub fn on_keepalive_tick(&mut self, now: Instant) -> Vec<ChannelOutput> {
        match self.keepalive.poll(now) {
            Some(KeepAliveAction::Probe) => vec![ChannelOutput::Send(Command::new("PNG"))],
            Some(KeepAliveAction::Expired) => {
                error!("keep-alive probe unanswered, connection reset");
                self.closed();
                vec![ChannelOutput::Disconnect(DisconnectReason::Reset)]
            }
            None => Vec::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // User operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_presence(&mut self, presence: Presence) -> Result<Vec<ChannelOutput>> {
        if presence == Presence::Offline {
            return Err(SessionError::InvalidRequest("sign out to go offline".into()));
        }
        self.wanted_presence = presence;
        let (_, chg) = self.conn.send_command("CHG", [presence_token(presence), "0"], true, None);
        Ok(vec![ChannelOutput::Send(chg)])
    }

    /// Add `handle` to a list. Forward-list additions land in the default
    /// group.
    pub fn add_contact(&mut self, handle: &Handle, list: List) -> Result<Vec<ChannelOutput>> {
        check_handle(handle)?;
        let token = editable_list(list)?;
        let command = if list == List::Forward {
            let default_name = self.roster.default_group_name();
            let contact = self.roster.entry(handle);
            if contact.local_groups.is_empty() {
                contact.local_groups.insert(default_name);
            }
            let (_, add) = self.conn.send_command(
                "ADD",
                [token, handle.as_str(), handle.as_str(), "0"],
                true,
                None,
            );
            add
        } else {
            let (_, add) = self
                .conn
                .send_command("ADD", [token, handle.as_str(), handle.as_str()], true, None);
            add
        };
        Ok(vec![ChannelOutput::Send(command)])
    }

    /// Remove `handle` from a list entirely.
    pub fn remove_contact(&mut self, handle: &Handle, list: List) -> Result<Vec<ChannelOutput>> {
        check_handle(handle)?;
        let token = editable_list(list)?;
        let (_, rem) = self.conn.send_command("REM", [token, handle.as_str()], true, None);
        Ok(vec![ChannelOutput::Send(rem)])
    }

    /// Move `handle` from the allow list to the block list.
    pub fn block(&mut self, handle: &Handle) -> Result<Vec<ChannelOutput>> {
        self.swap_lists(handle, List::Allow, List::Block)
    }

    /// Move `handle` from the block list to the allow list.
    pub fn unblock(&mut self, handle: &Handle) -> Result<Vec<ChannelOutput>> {
        self.swap_lists(handle, List::Block, List::Allow)
    }

    fn swap_lists(&mut self, handle: &Handle, from: List, to: List) -> Result<Vec<ChannelOutput>> {
        check_handle(handle)?;
        let mut out = Vec::new();
        if self.roster.contact(handle).map_or(false, |c| c.is_on(from)) {
            out.extend(self.remove_contact(handle, from)?);
        }
        out.extend(self.add_contact(handle, to)?);
        Ok(out)
    }

    /// Change our own display name.
    pub fn rename_self(&mut self, display_name: &str) -> Result<Vec<ChannelOutput>> {
        if display_name.trim().is_empty() {
            return Err(SessionError::InvalidRequest("empty display name".into()));
        }
        let encoded = url_encode(display_name);
        let (_, rea) = self
            .conn
            .send_command("REA", [self.handle.as_str(), encoded.as_str()], true, None);
        Ok(vec![ChannelOutput::Send(rea)])
    }

    pub fn add_group(&mut self, name: &str) -> Result<Vec<ChannelOutput>> {
        if self.roster.group_id_by_name(name).is_some() {
            return Err(RosterError::DuplicateGroup(name.to_string()).into());
        }
        Ok(self.ops_to_outputs(vec![RosterOp::CreateGroup { name: name.to_string() }]))
    }

    pub fn rename_group(&mut self, id: GroupId, name: &str) -> Result<Vec<ChannelOutput>> {
        let op = self.sync.rename_group(&self.roster, id, name)?;
        Ok(self.ops_to_outputs(vec![op]))
    }

    /// Delete a group, first moving contacts that are only in it to the
    /// default group.
    pub fn remove_group(&mut self, id: GroupId) -> Result<Vec<ChannelOutput>> {
        let ops = self.sync.delete_group(&mut self.roster, id)?;
        Ok(self.ops_to_outputs(ops))
    }

    /// Move a contact between container groups.
    pub fn move_contact(&mut self, handle: &Handle, from: Option<&str>, to: &str) -> Result<Vec<ChannelOutput>> {
        let ops = self.sync.move_contact(&mut self.roster, handle, from, to)?;
        Ok(self.ops_to_outputs(ops))
    }

    /// Replace the container groups of a contact.
    pub fn set_contact_groups(&mut self, handle: &Handle, groups: Vec<String>) -> Result<Vec<ChannelOutput>> {
        let ops = self.sync.set_local_groups(&mut self.roster, handle, groups)?;
        Ok(self.ops_to_outputs(ops))
    }

    /// Ask for a new switchboard. Returns the request id and the command.
    pub fn request_switchboard(&mut self) -> (u32, Command) {
        self.conn.send_command("XFR", ["SB"], true, None)
    }

    fn ops_to_outputs(&mut self, ops: Vec<RosterOp>) -> Vec<ChannelOutput> {
        ops.into_iter()
            .map(|op| ChannelOutput::Send(self.op_command(op)))
            .collect()
    }

    fn op_command(&mut self, op: RosterOp) -> Command {
        let (_, command) = match op {
            RosterOp::CreateGroup { name } => {
                self.conn
                    .send_command("ADG", [url_encode(&name), "0".to_string()], true, None)
            }
            RosterOp::AddToGroup { handle, group } => {
                let nick = self
                    .roster
                    .contact(&handle)
                    .map(|c| url_encode(&c.display_name))
                    .unwrap_or_else(|| handle.to_string());
                self.conn.send_command(
                    "ADD",
                    [
                        "FL".to_string(),
                        handle.to_string(),
                        nick,
                        group.to_string(),
                    ],
                    true,
                    None,
                )
            }
            RosterOp::RemoveFromGroup { handle, group } => self.conn.send_command(
                "REM",
                ["FL".to_string(), handle.to_string(), group.to_string()],
                true,
                None,
            ),
            RosterOp::DeleteGroup { group } => {
                self.conn.send_command("RMG", [group.to_string()], true, None)
            }
            RosterOp::RenameGroup { group, name } => self.conn.send_command(
                "REG",
                [group.to_string(), url_encode(&name), "0".to_string()],
                true,
                None,
            ),
        };
        command
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    pub fn on_inbound(&mut self, item: Inbound) -> Vec<ChannelOutput> {
        match item {
            Inbound::Command(command) => self.on_command(command),
            Inbound::Malformed(line) => {
                warn!(%line, "malformed line dropped");
                Vec::new()
            }
        }
    }

    fn on_command(&mut self, command: Command) -> Vec<ChannelOutput> {
        let pending = command
            .trid
            .filter(|trid| *trid != 0)
            .and_then(|trid| self.conn.acknowledge(trid))
            .map(|pending| pending.command);

        if let Some(code) = command.error_code() {
            return self.on_error(code, pending);
        }

        match command.verb.as_str() {
            "SYN" => self.on_syn(&command),
            "LSG" => self.on_lsg(&command),
            "LST" => self.on_lst(&command),
            "BLP" => {
                self.privacy = command.args.last().cloned();
                Vec::new()
            }
            "GTC" | "PRP" | "BPR" => {
                debug!(%command, "ignored roster attribute");
                Vec::new()
            }
            "ILN" | "NLN" => self.on_online(&command),
            "FLN" => self.on_offline(&command),
            "CHG" => self.on_chg(&command),
            "ADD" => self.on_add(&command),
            "REM" => self.on_rem(&command),
            "ADG" => self.on_adg(&command),
            "RMG" => self.on_rmg(&command),
            "REG" => self.on_reg(&command),
            "REA" => self.on_rea(&command),
            "CHL" => self.on_chl(&command),
            "QRY" => Vec::new(),
            "QNG" => {
                let interval = command
                    .get(0)
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs);
                self.keepalive.acknowledged(Instant::now(), interval);
                Vec::new()
            }
            "XFR" => self.on_xfr(&command),
            "RNG" => self.on_rng(&command),
            "OUT" => {
                let reason = match command.get(0) {
                    Some("OTH") => DisconnectReason::OtherClient,
                    Some("SSD") => DisconnectReason::ServerShutdown,
                    _ => DisconnectReason::Requested,
                };
                info!(?reason, "server closed the session");
                self.closed();
                vec![ChannelOutput::Disconnect(reason)]
            }
            "MSG" => {
                self.on_msg(&command);
                Vec::new()
            }
            "NOT" | "IPG" | "UBX" | "GCF" | "URL" | "SBS" => {
                debug!(verb = %command.verb, "ignored notification");
                Vec::new()
            }
            verb => {
                warn!(%verb, "unknown command dropped");
                Vec::new()
            }
        }
    }

    fn on_error(&mut self, code: u16, pending: Option<Command>) -> Vec<ChannelOutput> {
        let error = ServerError::new(code);
        let mut out = Vec::new();
        if let Some(failed) = &pending {
            self.release_failed(failed, code, &mut out);
        }

        match error.category {
            CodeCategory::Auth(AuthFailure::BadTicket) if !self.reauth_attempted => {
                warn!("ticket rejected mid-session, logging in again");
                self.reauth_attempted = true;
                out.push(ChannelOutput::Reauthenticate);
            }
            CodeCategory::Auth(failure) => {
                error!(code, %failure, "authentication failure");
                self.closed();
                out.push(ChannelOutput::Disconnect(DisconnectReason::Auth(failure)));
            }
            CodeCategory::Sync(conflict) => {
                warn!(code, %conflict, "roster conflict");
                out.push(ChannelOutput::Event(AccountEvent::SyncConflict { conflict, code }));
            }
            CodeCategory::Capacity | CodeCategory::Transient | CodeCategory::Unmapped => {
                warn!(code, reason = msnp_core::describe(code), "server error");
                out.push(ChannelOutput::Event(AccountEvent::ServerError { error }));
            }
        }
        out
    }

    /// Undo the bookkeeping of a command the server rejected.
    fn release_failed(&mut self, failed: &Command, code: u16, out: &mut Vec<ChannelOutput>) {
        match failed.verb.as_str() {
            "ADD" if failed.get(0) == Some("FL") && failed.args.len() >= 4 => {
                if let (Some(handle), Some(group)) = (failed.get(1), parse_group(failed.get(3))) {
                    let op = RosterOp::AddToGroup { handle: Handle::new(handle), group };
                    self.sync.op_failed(&mut self.roster, &op);
                }
            }
            "REM" if failed.get(0) == Some("FL") && failed.args.len() >= 3 => {
                if let (Some(handle), Some(group)) = (failed.get(1), parse_group(failed.get(2))) {
                    let op = RosterOp::RemoveFromGroup { handle: Handle::new(handle), group };
                    self.sync.op_failed(&mut self.roster, &op);
                }
            }
            "ADG" => {
                if let Some(name) = failed.get(0) {
                    self.sync.group_creation_failed(&mut self.roster, &url_decode(name));
                }
            }
            "XFR" => {
                if let Some(trid) = failed.trid {
                    out.push(ChannelOutput::SwitchboardRefused { trid, code });
                }
            }
            _ => {}
        }
    }

    fn on_syn(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let tokens = match (command.get(0), command.get(1)) {
            (Some(last_change), Some(last_sync)) => SyncTokens::new(last_change, last_sync),
            _ => {
                warn!(%command, "SYN reply without tokens");
                return Vec::new();
            }
        };
        let counts = (
            command.get(2).and_then(|s| s.parse::<usize>().ok()),
            command.get(3).and_then(|s| s.parse::<usize>().ok()),
        );

        match counts {
            (Some(contacts), Some(groups)) => {
                info!(contacts, groups, "full roster push");
                self.roster.clear_for_full_sync();
                self.roster.set_tokens(tokens);
                let push = PushProgress {
                    contacts,
                    groups,
                    contacts_seen: 0,
                    groups_seen: 0,
                };
                self.push = Some(push);
                if push.is_complete() {
                    return self.finish_sync(true);
                }
                Vec::new()
            }
            _ => {
                info!("roster unchanged since last sync");
                self.roster.set_tokens(tokens);
                self.finish_sync(false)
            }
        }
    }

    fn on_lsg(&mut self, command: &Command) -> Vec<ChannelOutput> {
        match (command.get(0).and_then(|s| s.parse::<u32>().ok()), command.get(1)) {
            (Some(id), Some(name)) => self.roster.upsert_group(GroupId(id), url_decode(name)),
            _ => warn!(%command, "malformed group listing"),
        }
        if let Some(push) = &mut self.push {
            push.groups_seen += 1;
        }
        self.check_push_complete()
    }

    fn on_lst(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let mut out = Vec::new();
        let parsed = (
            command.get(0),
            command.get(1),
            command.get(2).and_then(|s| s.parse::<u8>().ok()),
        );
        match parsed {
            (Some(handle), Some(nick), Some(lists)) => {
                let handle = Handle::new(handle);
                let display_name = url_decode(nick);
                let flags = ListFlags::from_bits(lists);
                let groups: Vec<GroupId> = command
                    .get(3)
                    .map(|list| {
                        list.split(',')
                            .filter_map(|id| id.parse().ok())
                            .map(GroupId)
                            .collect()
                    })
                    .unwrap_or_default();
                self.roster.apply_listing(&handle, &display_name, flags, &groups);
                if flags.is_unacknowledged_reverse() {
                    out.push(ChannelOutput::Event(AccountEvent::ContactRequest { handle, display_name }));
                }
            }
            _ => warn!(%command, "malformed contact listing"),
        }
        if let Some(push) = &mut self.push {
            push.contacts_seen += 1;
        }
        out.extend(self.check_push_complete());
        out
    }

    fn check_push_complete(&mut self) -> Vec<ChannelOutput> {
        match self.push {
            Some(push) if push.is_complete() => self.finish_sync(true),
            _ => Vec::new(),
        }
    }

    fn finish_sync(&mut self, full: bool) -> Vec<ChannelOutput> {
        self.push = None;
        self.state = ChannelState::Online;

        let mut out = vec![ChannelOutput::Event(AccountEvent::RosterSynced {
            contacts: self.roster.len(),
            groups: self.roster.groups().count(),
            full,
        })];

        let ops = self.sync.sync_all(&mut self.roster);
        if !ops.is_empty() {
            debug!(count = ops.len(), "reconciling groups after sync");
        }
        out.extend(self.ops_to_outputs(ops));

        let (_, chg) = self
            .conn
            .send_command("CHG", [presence_token(self.wanted_presence), "0"], true, None);
        out.push(ChannelOutput::Send(chg));
        out
    }

    fn on_online(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let (status, handle, nick) = match (command.get(0), command.get(1), command.get(2)) {
            (Some(status), Some(handle), nick) => (status, Handle::new(handle), nick),
            _ => {
                warn!(%command, "malformed presence");
                return Vec::new();
            }
        };
        let presence = match parse_presence(status) {
            Some(presence) => presence,
            None => {
                warn!(%status, "unknown status token");
                return Vec::new();
            }
        };

        self.roster.set_presence(&handle, presence);
        let contact = self.roster.entry(&handle);
        if let Some(nick) = nick {
            contact.display_name = url_decode(nick);
        }
        vec![ChannelOutput::Event(AccountEvent::PresenceChanged {
            handle,
            presence,
            display_name: contact.display_name.clone(),
        })]
    }

    fn on_offline(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let Some(handle) = command.get(0).map(Handle::new) else {
            return Vec::new();
        };
        self.roster.set_presence(&handle, Presence::Offline);
        let display_name = self
            .roster
            .contact(&handle)
            .map(|c| c.display_name.clone())
            .unwrap_or_else(|| handle.to_string());
        vec![ChannelOutput::Event(AccountEvent::PresenceChanged {
            handle,
            presence: Presence::Offline,
            display_name,
        })]
    }

    fn on_chg(&mut self, command: &Command) -> Vec<ChannelOutput> {
        match command.get(0).and_then(parse_presence) {
            Some(presence) => {
                self.presence = presence;
                vec![ChannelOutput::Event(AccountEvent::SelfPresenceChanged { presence })]
            }
            None => Vec::new(),
        }
    }

    fn bump_serial(&mut self, serial: Option<&str>) {
        if let Some(serial) = serial {
            let last_sync = self.roster.tokens().last_sync.clone();
            self.roster.set_tokens(SyncTokens::new(serial, last_sync));
        }
    }

    fn on_add(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let (list, handle) = match (command.get(0).and_then(List::from_token), command.get(2)) {
            (Some(list), Some(handle)) => (list, Handle::new(handle)),
            _ => {
                warn!(%command, "malformed ADD");
                return Vec::new();
            }
        };
        self.bump_serial(command.get(1));

        let contact = self.roster.entry(&handle);
        let was_on = contact.is_on(list);
        contact.lists.insert(list);
        if let Some(nick) = command.get(3) {
            contact.display_name = url_decode(nick);
        }
        let display_name = contact.display_name.clone();
        let lists = contact.lists;

        let group = parse_group(command.get(4));
        let mut out = Vec::new();
        match group {
            Some(group) if list == List::Forward => {
                self.sync.added_to_group(&mut self.roster, &handle, group);
                if was_on {
                    out.push(self.membership_event(&handle));
                } else {
                    out.push(ChannelOutput::Event(AccountEvent::ContactAdded {
                        handle: handle.clone(),
                        list,
                    }));
                }
            }
            _ => out.push(ChannelOutput::Event(AccountEvent::ContactAdded {
                handle: handle.clone(),
                list,
            })),
        }

        if list == List::Reverse && lists.is_unacknowledged_reverse() {
            out.push(ChannelOutput::Event(AccountEvent::ContactRequest { handle, display_name }));
        }
        out
    }

    fn on_rem(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let (list, handle) = match (command.get(0).and_then(List::from_token), command.get(2)) {
            (Some(list), Some(handle)) => (list, Handle::new(handle)),
            _ => {
                warn!(%command, "malformed REM");
                return Vec::new();
            }
        };
        self.bump_serial(command.get(1));

        let group = parse_group(command.get(3));
        if let (List::Forward, Some(group)) = (list, group) {
            self.sync.removed_from_group(&mut self.roster, &handle, group);
            return vec![self.membership_event(&handle)];
        }

        let emptied = match self.roster.contact_mut(&handle) {
            Some(contact) => {
                contact.lists.remove(list);
                if list == List::Forward {
                    contact.server_groups.clear();
                    contact.local_groups.clear();
                }
                contact.lists.is_empty()
            }
            None => false,
        };
        if emptied {
            self.roster.remove_contact(&handle);
        }
        vec![ChannelOutput::Event(AccountEvent::ContactRemoved { handle, list })]
    }

    fn membership_event(&self, handle: &Handle) -> ChannelOutput {
        let groups = self
            .roster
            .contact(handle)
            .map(|c| c.server_groups.iter().copied().collect())
            .unwrap_or_default();
        ChannelOutput::Event(AccountEvent::GroupMembershipChanged {
            handle: handle.clone(),
            groups,
        })
    }

    fn on_adg(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let (name, id) = match (command.get(1), command.get(2).and_then(|s| s.parse::<u32>().ok())) {
            (Some(name), Some(id)) => (url_decode(name), GroupId(id)),
            _ => {
                warn!(%command, "malformed ADG");
                return Vec::new();
            }
        };
        self.bump_serial(command.get(0));
        let ops = self.sync.group_created(&mut self.roster, &name, id);
        let mut out = vec![ChannelOutput::Event(AccountEvent::GroupAdded { id, name })];
        out.extend(self.ops_to_outputs(ops));
        out
    }

    fn on_rmg(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let Some(id) = parse_group(command.get(1)) else {
            warn!(%command, "malformed RMG");
            return Vec::new();
        };
        self.bump_serial(command.get(0));
        self.roster.remove_group(id);
        vec![ChannelOutput::Event(AccountEvent::GroupRemoved { id })]
    }

    fn on_reg(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let (id, name) = match (command.get(1).and_then(|s| s.parse::<u32>().ok()), command.get(2)) {
            (Some(id), Some(name)) => (GroupId(id), url_decode(name)),
            _ => {
                warn!(%command, "malformed REG");
                return Vec::new();
            }
        };
        self.bump_serial(command.get(0));
        self.roster.upsert_group(id, name.clone());
        vec![ChannelOutput::Event(AccountEvent::GroupRenamed { id, name })]
    }

    fn on_rea(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let (handle, display_name) = match (command.get(1), command.get(2)) {
            (Some(handle), Some(name)) => (Handle::new(handle), url_decode(name)),
            _ => return Vec::new(),
        };
        if handle == self.handle {
            self.display_name = display_name.clone();
        } else if let Some(contact) = self.roster.contact_mut(&handle) {
            contact.display_name = display_name.clone();
        }
        vec![ChannelOutput::Event(AccountEvent::DisplayNameChanged { handle, display_name })]
    }

    fn on_chl(&mut self, command: &Command) -> Vec<ChannelOutput> {
        let Some(challenge) = command.get(0) else {
            warn!(%command, "challenge without payload");
            return Vec::new();
        };
        let digest = challenge_response(challenge, &self.client.product_key);
        let (_, qry) = self.conn.send_command(
            "QRY",
            [self.client.product_id.as_str()],
            true,
            Some(Bytes::from(digest)),
        );
        vec![ChannelOutput::Send(qry)]
    }

    fn on_xfr(&mut self, command: &Command) -> Vec<ChannelOutput> {
        match (command.trid, command.get(0), command.get(1), command.get(3)) {
            (Some(trid), Some("SB"), Some(addr), Some(token)) => {
                vec![ChannelOutput::SwitchboardGranted {
                    trid,
                    addr: addr.to_string(),
                    token: token.to_string(),
                }]
            }
            _ => {
                warn!(%command, "unexpected XFR");
                Vec::new()
            }
        }
    }

    fn on_rng(&mut self, command: &Command) -> Vec<ChannelOutput> {
        match (command.get(0), command.get(1), command.get(3), command.get(4)) {
            (Some(session_id), Some(addr), Some(token), Some(inviter)) => {
                vec![ChannelOutput::Ringing(Ring {
                    session_id: session_id.to_string(),
                    addr: addr.to_string(),
                    token: token.to_string(),
                    inviter: Handle::new(inviter),
                    nick: command.get(5).map(url_decode).unwrap_or_default(),
                })]
            }
            _ => {
                warn!(%command, "malformed RNG");
                Vec::new()
            }
        }
    }

    fn on_msg(&mut self, command: &Command) {
        let Some(payload) = &command.payload else {
            return;
        };
        match MimeMessage::parse(payload) {
            Ok(mime) if mime.content_type().as_deref() == Some(CONTENT_PROFILE) => {
                self.external_ip = mime.header("ClientIP").map(str::to_string);
                debug!(ip = ?self.external_ip, "profile received");
            }
            Ok(mime) => debug!(content_type = ?mime.content_type(), "ignored server message"),
            Err(e) => warn!(error = %e, "malformed server message"),
        }
    }
}

fn parse_group(token: Option<&str>) -> Option<GroupId> {
    token.and_then(|s| s.parse::<u32>().ok()).map(GroupId)
}

fn check_handle(handle: &Handle) -> Result<()> {
    if handle.is_valid() {
        Ok(())
    } else {
        Err(SessionError::InvalidRequest(format!("invalid handle {handle}")))
    }
}

fn editable_list(list: List) -> Result<&'static str> {
    match list {
        List::Forward | List::Allow | List::Block => Ok(list.token()),
        List::Reverse | List::Pending => Err(SessionError::InvalidRequest(format!(
            "{} is maintained by the server",
            list.token()
        ))),
    }
}
