//! Per-socket command bookkeeping: the transaction id sequence and the map
//! of commands still awaiting a numbered reply.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;

use msnp_core::Command;

/// An outgoing command awaiting its reply.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command: Command,
    pub sent_at: Instant,
}

/// Transaction state of one socket.
///
/// Ids start at 1 and increase by one per command. Entries older than the
/// quiescence window are dropped on the next send, so a server that never
/// answers cannot grow the map without bound.
#[derive(Debug)]
pub struct Connection {
    next_trid: u32,
    pending: HashMap<u32, PendingCommand>,
    quiescence: Duration,
}

impl Connection {
    pub fn new(quiescence: Duration) -> Self {
        Self {
            next_trid: 1,
            pending: HashMap::new(),
            quiescence,
        }
    }

    /// Build an outgoing command.
    ///
    /// With `wants_id` the command gets the next id and is recorded as
    /// pending; the id is returned. Without, it goes out bare and the
    /// returned id is 0.
    pub fn send_command<I, S>(
        &mut self,
        verb: &str,
        args: I,
        wants_id: bool,
        body: Option<Bytes>,
    ) -> (u32, Command)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = Command::new(verb).args(args);
        if let Some(body) = body {
            command = command.with_payload(body);
        }
        if wants_id {
            self.assign(command)
        } else {
            (0, command)
        }
    }

    /// Assign the next id to an already built command and record it.
    pub fn assign(&mut self, mut command: Command) -> (u32, Command) {
        self.purge_stale();

        let trid = self.next_trid;
        self.next_trid = self.next_trid.wrapping_add(1).max(1);
        command.trid = Some(trid);
        self.pending.insert(
            trid,
            PendingCommand {
                command: command.clone(),
                sent_at: Instant::now(),
            },
        );
        (trid, command)
    }

    /// Remove and return the command a reply with this id answers.
    pub fn acknowledge(&mut self, trid: u32) -> Option<PendingCommand> {
        self.pending.remove(&trid)
    }

    pub fn pending(&self, trid: u32) -> Option<&PendingCommand> {
        self.pending.get(&trid)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Id the next command will get.
    pub fn peek_trid(&self) -> u32 {
        self.next_trid
    }

    /// Drop entries older than the quiescence window.
    pub fn purge_stale(&mut self) -> usize {
        let now = Instant::now();
        let quiescence = self.quiescence;
        let before = self.pending.len();
        self.pending.retain(|trid, entry| {
            let keep = now.duration_since(entry.sent_at) < quiescence;
            if !keep {
                trace!(trid, verb = %entry.command.verb, "purging unanswered command");
            }
            keep
        });
        before - self.pending.len()
    }
}
