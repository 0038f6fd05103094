//! Test fixtures and helpers.
//!
//! A [`FakeNetwork`] stands in for the internet: every socket the client
//! opens through its [`FakeConnector`] shows up on the test side as a
//! [`FakeServer`] (command channels) or a raw transfer end, so a test can
//! script the server half of a conversation line by line.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;

use msnp_core::{Command, CommandCodec, Handle, Inbound, TransferCodec};
use msnp_session::transport::memory::{self, MemoryTransport};
use msnp_session::{
    Connector, SessionError, TicketError, TicketService, TransferAcceptor, TransferLink, Transport,
};

/// How long a scripted server waits for the client.
pub const REPLY_WAIT: Duration = Duration::from_secs(5);

/// The test's end of a transfer socket.
pub type TransferEnd = Framed<DuplexStream, TransferCodec>;

// ─────────────────────────────────────────────────────────────────────────────
// Network
// ─────────────────────────────────────────────────────────────────────────────

type Listeners = Arc<Mutex<HashMap<u16, mpsc::UnboundedSender<Box<dyn TransferLink>>>>>;

/// The test side of a fake network.
pub struct FakeNetwork {
    connections: mpsc::UnboundedReceiver<FakeServer>,
    transfers: mpsc::UnboundedReceiver<(String, TransferEnd)>,
    listeners: Listeners,
}

/// The client side of a fake network.
pub struct FakeConnector {
    connections: mpsc::UnboundedSender<FakeServer>,
    transfers: mpsc::UnboundedSender<(String, TransferEnd)>,
    listeners: Listeners,
    refused: Mutex<Vec<String>>,
}

impl FakeNetwork {
    /// A network and the connector to hand to the client.
    pub fn new() -> (Self, Arc<FakeConnector>) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (xfer_tx, xfer_rx) = mpsc::unbounded_channel();
        let listeners = Listeners::default();
        let network = Self {
            connections: conn_rx,
            transfers: xfer_rx,
            listeners: Arc::clone(&listeners),
        };
        let connector = FakeConnector {
            connections: conn_tx,
            transfers: xfer_tx,
            listeners,
            refused: Mutex::new(Vec::new()),
        };
        (network, Arc::new(connector))
    }

    /// The next command channel the client opened.
    pub async fn accept(&mut self) -> anyhow::Result<FakeServer> {
        tokio::time::timeout(REPLY_WAIT, self.connections.recv())
            .await
            .context("no connection within the wait")?
            .ok_or_else(|| anyhow!("connector dropped"))
    }

    /// The next transfer socket the client dialed, with the address it used.
    pub async fn accept_transfer(&mut self) -> anyhow::Result<(String, TransferEnd)> {
        tokio::time::timeout(REPLY_WAIT, self.transfers.recv())
            .await
            .context("no transfer connection within the wait")?
            .ok_or_else(|| anyhow!("connector dropped"))
    }

    /// Connect to a transfer port the client is listening on.
    pub async fn dial_transfer(&self, port: u16) -> anyhow::Result<TransferEnd> {
        let listeners = self.listeners.lock().await;
        let listener = listeners
            .get(&port)
            .ok_or_else(|| anyhow!("nothing listening on port {port}"))?;
        let (client, test) = memory::transfer_pair();
        listener
            .send(Box::new(client))
            .map_err(|_| anyhow!("listener on port {port} is gone"))?;
        Ok(test)
    }
}

impl FakeConnector {
    /// Fail every future connection attempt to `addr`.
    pub async fn refuse(&self, addr: impl Into<String>) {
        self.refused.lock().await.push(addr.into());
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, addr: &str, codec: CommandCodec) -> msnp_session::Result<Box<dyn Transport>> {
        if self.refused.lock().await.iter().any(|a| a == addr) {
            return Err(msnp_core::NetworkFailure::ConnectFailed.into());
        }
        let (client, server) = memory::pair(codec, addr);
        let server = FakeServer {
            addr: addr.to_string(),
            transport: server,
        };
        self.connections.send(server).map_err(|_| SessionError::Closed)?;
        Ok(Box::new(client))
    }

    async fn connect_transfer(&self, addr: &str) -> msnp_session::Result<Box<dyn TransferLink>> {
        let (client, test) = memory::transfer_pair();
        self.transfers
            .send((addr.to_string(), test))
            .map_err(|_| SessionError::Closed)?;
        Ok(Box::new(client))
    }

    async fn listen_transfer(&self, ports: RangeInclusive<u16>) -> msnp_session::Result<Box<dyn TransferAcceptor>> {
        let mut listeners = self.listeners.lock().await;
        let port = ports
            .clone()
            .find(|port| !listeners.contains_key(port))
            .ok_or_else(|| SessionError::InvalidRequest("no free transfer port".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(port, tx);
        Ok(Box::new(FakeAcceptor { port, incoming: rx }))
    }
}

struct FakeAcceptor {
    port: u16,
    incoming: mpsc::UnboundedReceiver<Box<dyn TransferLink>>,
}

#[async_trait]
impl TransferAcceptor for FakeAcceptor {
    fn port(&self) -> u16 {
        self.port
    }

    async fn accept(&mut self) -> msnp_session::Result<Box<dyn TransferLink>> {
        self.incoming.recv().await.ok_or(SessionError::Closed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted server
// ─────────────────────────────────────────────────────────────────────────────

/// The server end of one command channel.
pub struct FakeServer {
    /// Address the client dialed.
    pub addr: String,
    transport: MemoryTransport,
}

impl FakeServer {
    /// Next command from the client.
    pub async fn recv(&self) -> anyhow::Result<Command> {
        match self.transport.recv_timeout(REPLY_WAIT).await? {
            Some(Inbound::Command(command)) => Ok(command),
            Some(Inbound::Malformed(line)) => bail!("client sent a malformed line: {line}"),
            None => bail!("client sent nothing on {}", self.addr),
        }
    }

    /// Next command, which must be `verb`. Keep-alive probes are skipped.
    pub async fn expect(&self, verb: &str) -> anyhow::Result<Command> {
        loop {
            let command = self.recv().await?;
            if command.verb == "PNG" && verb != "PNG" {
                continue;
            }
            if command.verb != verb {
                bail!("expected {verb} on {}, got {command}", self.addr);
            }
            return Ok(command);
        }
    }

    /// The client closes its end without sending anything else.
    pub async fn expect_closed(&self) -> anyhow::Result<()> {
        match self.transport.recv_timeout(REPLY_WAIT).await {
            Err(SessionError::Closed) => Ok(()),
            Ok(Some(Inbound::Command(command))) => bail!("expected close on {}, got {command}", self.addr),
            Ok(Some(Inbound::Malformed(line))) => bail!("expected close on {}, got {line}", self.addr),
            Ok(None) => bail!("{} is still open", self.addr),
            Err(e) => Err(e.into()),
        }
    }

    /// Send one line, CRLF added.
    pub async fn send_line(&self, line: &str) -> anyhow::Result<()> {
        self.transport.send_raw(format!("{line}\r\n").as_bytes()).await?;
        Ok(())
    }

    pub async fn send(&self, command: Command) -> anyhow::Result<()> {
        self.transport.send(command).await?;
        Ok(())
    }

    /// Answer `to` with the same verb and id: `<VERB> <trid> <rest>`.
    pub async fn reply(&self, to: &Command, rest: &str) -> anyhow::Result<()> {
        let trid = to.trid.ok_or_else(|| anyhow!("{to} carries no id"))?;
        let line = if rest.is_empty() {
            format!("{} {}", to.verb, trid)
        } else {
            format!("{} {} {}", to.verb, trid, rest)
        };
        self.send_line(&line).await
    }

    /// Answer `to` with a numeric error.
    pub async fn reply_error(&self, to: &Command, code: u16) -> anyhow::Result<()> {
        let trid = to.trid.ok_or_else(|| anyhow!("{to} carries no id"))?;
        self.send_line(&format!("{code} {trid}")).await
    }

    /// Walk the client through `VER`, `CVR` and the first `USR`. Returns
    /// that `USR`.
    pub async fn negotiate(&self) -> anyhow::Result<Command> {
        let ver = self.expect("VER").await?;
        self.reply(&ver, "MSNP8 CVR0").await?;
        let cvr = self.expect("CVR").await?;
        self.reply(&cvr, "5.0.0544 5.0.0544 1.0.0000 http://download.example/msn http://www.example/msn")
            .await?;
        self.expect("USR").await
    }

    /// Send the client to another notification server.
    pub async fn redirect(&self, to: &str) -> anyhow::Result<()> {
        let usr = self.negotiate().await?;
        self.reply_as("XFR", &usr, &format!("NS {to} 0 {}", self.addr)).await
    }

    /// A complete ticket login. Returns the ticket the client presented.
    pub async fn login(&self, handle: &str, display_name: &str) -> anyhow::Result<String> {
        let usr = self.negotiate().await?;
        self.reply(&usr, "TWN S lc=1033,id=507,tw=40,fs=1,ru=http%3A%2F%2Fmessenger%2Emsn%2Ecom,ct=1062764229,kpp=1,kv=5,ver=2.1.0173.1,tpf=43f8a4c8ed940c04e3740be46c4d1619")
            .await?;
        let usr = self.expect("USR").await?;
        let ticket = usr
            .get(2)
            .ok_or_else(|| anyhow!("USR without ticket: {usr}"))?
            .to_string();
        self.reply(&usr, &format!("OK {handle} {} 1 0", msnp_core::url_encode(display_name)))
            .await?;
        Ok(ticket)
    }

    /// Answer the client's `SYN` with a full roster push, then its initial
    /// `CHG`. Groups are `(id, name)`; contacts are
    /// `(handle, nick, list bits, "group,ids")`.
    pub async fn push_roster(
        &self,
        tokens: (&str, &str),
        groups: &[(u32, &str)],
        contacts: &[(&str, &str, u8, &str)],
    ) -> anyhow::Result<Command> {
        let syn = self.expect("SYN").await?;
        self.reply(
            &syn,
            &format!("{} {} {} {}", tokens.0, tokens.1, contacts.len(), groups.len()),
        )
        .await?;
        for (id, name) in groups {
            self.send_line(&format!("LSG {id} {} 0", msnp_core::url_encode(name))).await?;
        }
        for (handle, nick, lists, group_ids) in contacts {
            let line = if group_ids.is_empty() {
                format!("LST {handle} {} {lists}", msnp_core::url_encode(nick))
            } else {
                format!("LST {handle} {} {lists} {group_ids}", msnp_core::url_encode(nick))
            };
            self.send_line(&line).await?;
        }
        self.accept_presence().await
    }

    /// Answer the client's `SYN` with its own tokens: nothing changed.
    pub async fn confirm_roster(&self) -> anyhow::Result<Command> {
        let syn = self.expect("SYN").await?;
        let tokens = syn.args.join(" ");
        self.reply(&syn, &tokens).await?;
        self.accept_presence().await
    }

    /// Echo the client's next `CHG`.
    pub async fn accept_presence(&self) -> anyhow::Result<Command> {
        let chg = self.expect("CHG").await?;
        let status = chg.get(0).unwrap_or("NLN").to_string();
        self.reply(&chg, &format!("{status} 0")).await?;
        Ok(chg)
    }

    /// Answer `to` with a different verb and its id.
    pub async fn reply_as(&self, verb: &str, to: &Command, rest: &str) -> anyhow::Result<()> {
        let trid = to.trid.ok_or_else(|| anyhow!("{to} carries no id"))?;
        self.send_line(&format!("{verb} {trid} {rest}")).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ticket services
// ─────────────────────────────────────────────────────────────────────────────

/// Grants the same ticket to everyone.
pub struct FixedTicketService(pub String);

impl Default for FixedTicketService {
    fn default() -> Self {
        Self("t=fixed-ticket&p=fixed-profile".into())
    }
}

#[async_trait]
impl TicketService for FixedTicketService {
    async fn request_ticket(
        &self,
        _handle: &Handle,
        _password: &str,
        _challenge: &str,
    ) -> Result<String, TicketError> {
        Ok(self.0.clone())
    }
}

/// Fails every request with the given error.
pub struct FailingTicketService(pub TicketError);

#[async_trait]
impl TicketService for FailingTicketService {
    async fn request_ticket(
        &self,
        _handle: &Handle,
        _password: &str,
        _challenge: &str,
    ) -> Result<String, TicketError> {
        Err(self.0.clone())
    }
}
