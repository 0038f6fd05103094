//! MSNFTP: the dedicated file-transfer socket.
//!
//! The receiver connects to the port the sender advertised in its
//! `ACCEPT` and proves itself with the auth cookie:
//!
//! ```text
//! Receiver                               Sender
//!   |-- VER MSNFTP ------------------------->|
//!   |<------------------------- VER MSNFTP --|
//!   |-- USR <handle> <auth cookie> --------->|
//!   |<------------------------- FIL <size> --|
//!   |-- TFR -------------------------------->|
//!   |<--- [0][len lo][len hi] data ... ------|   repeated
//!   |-- BYE 16777989 ----------------------->|
//! ```
//!
//! A chunk with status 1 is the sender aborting; `CCL` is the receiver (or
//! the sender, before data flows) aborting.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use msnp_core::{
    CancelSide, ChunkHeader, Command, Cookie, Handle, TransferFailure, TransferFrame, MAX_CHUNK_LEN,
};

use crate::transport::TransferLink;

/// Protocol version token.
pub const PROTOCOL_VERSION: &str = "MSNFTP";

/// Argument of the receiver's final `BYE` after a complete transfer.
pub const BYE_COMPLETE: &str = "16777989";

/// Outgoing chunk size used by the stock client.
pub const DEFAULT_CHUNK_SIZE: usize = 2045;

/// Progress and outcome of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { transferred: u64, total: u64, percent: u8 },
    /// Finished. A receiver carries the file contents.
    Done { received: Option<Bytes> },
    Failed(TransferFailure),
}

/// Whole-number percentage of `total`. An empty file is complete.
pub fn percent(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (transferred.saturating_mul(100) / total).min(100) as u8
}

/// Transfer tuning.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Abort when nothing arrives for this long.
    pub idle_timeout: Duration,
    /// Size of outgoing data chunks.
    pub chunk_size: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(180),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

enum Step {
    Frame(TransferFrame),
    Cancelled,
    Idle,
    Closed,
}

/// One side of an open transfer socket.
struct Peer<'a> {
    link: &'a mut dyn TransferLink,
    idle: Duration,
    cancel: &'a CancellationToken,
}

impl Peer<'_> {
    async fn send(&mut self, command: Command) -> Result<(), TransferFailure> {
        self.link
            .send_frame(TransferFrame::Command(command))
            .await
            .map_err(|e| TransferFailure::Other(e.to_string()))
    }

    async fn next(&mut self) -> Result<Step, TransferFailure> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Ok(Step::Cancelled),
            frame = tokio::time::timeout(self.idle, self.link.recv_frame()) => match frame {
                Err(_) => Ok(Step::Idle),
                Ok(Ok(Some(frame))) => Ok(Step::Frame(frame)),
                Ok(Ok(None)) => Ok(Step::Closed),
                Ok(Err(e)) => Err(TransferFailure::Other(e.to_string())),
            },
        }
    }

    /// Abort with `CCL`, reporting `failure`.
    async fn abort(&mut self, failure: TransferFailure) -> TransferFailure {
        if let Err(e) = self.send(Command::new("CCL")).await {
            debug!(error = %e, "CCL not delivered");
        }
        failure
    }

    /// Wait for a negotiation command.
    async fn expect(&mut self, verb: &str) -> Result<Command, TransferFailure> {
        loop {
            match self.next().await? {
                Step::Frame(TransferFrame::Command(command)) if command.verb == verb => return Ok(command),
                Step::Frame(TransferFrame::Command(command)) if command.verb == "CCL" => {
                    info!("transfer cancelled by peer");
                    return Err(TransferFailure::Cancelled(CancelSide::Remote));
                }
                Step::Frame(TransferFrame::Command(command)) => {
                    let failure = TransferFailure::Other(format!("expected {verb}, got {}", command.verb));
                    return Err(self.abort(failure).await);
                }
                Step::Frame(TransferFrame::Malformed(line)) => {
                    warn!(%line, "malformed transfer line dropped");
                }
                Step::Frame(TransferFrame::Chunk { .. }) => {
                    return Err(TransferFailure::Other(format!("data while expecting {verb}")));
                }
                Step::Cancelled => return Err(self.abort(TransferFailure::Cancelled(CancelSide::Local)).await),
                Step::Idle => return Err(self.abort(TransferFailure::Timeout).await),
                Step::Closed => return Err(TransferFailure::Other("peer closed the socket".into())),
            }
        }
    }
}

async fn report(progress: &mpsc::Sender<TransferEvent>, transferred: u64, total: u64) {
    let event = TransferEvent::Progress {
        transferred,
        total,
        percent: percent(transferred, total),
    };
    if progress.send(event).await.is_err() {
        debug!("progress receiver gone");
    }
}

/// The connecting side: proves the cookie and downloads.
#[derive(Debug, Clone)]
pub struct FileReceiver {
    handle: Handle,
    auth_cookie: Cookie,
    settings: TransferSettings,
}

impl FileReceiver {
    pub fn new(handle: Handle, auth_cookie: Cookie, settings: TransferSettings) -> Self {
        Self {
            handle,
            auth_cookie,
            settings,
        }
    }

    /// Download the file. Progress is reported on `progress` after every
    /// chunk.
    pub async fn run(
        self,
        link: &mut dyn TransferLink,
        progress: &mpsc::Sender<TransferEvent>,
        cancel: &CancellationToken,
    ) -> Result<Bytes, TransferFailure> {
        let mut peer = Peer {
            link,
            idle: self.settings.idle_timeout,
            cancel,
        };

        peer.send(Command::new("VER").arg(PROTOCOL_VERSION)).await?;
        let ver = peer.expect("VER").await?;
        if !ver.args.iter().any(|v| v == PROTOCOL_VERSION) {
            return Err(peer.abort(TransferFailure::Other("no common protocol version".into())).await);
        }

        peer.send(
            Command::new("USR")
                .arg(self.handle.as_str())
                .arg(self.auth_cookie.to_string()),
        )
        .await?;
        let fil = peer.expect("FIL").await?;
        let total = match fil.get(0).and_then(|s| s.parse::<u64>().ok()) {
            Some(total) => total,
            None => return Err(peer.abort(TransferFailure::Other("bad FIL size".into())).await),
        };
        info!(total, "receiving file");

        peer.send(Command::new("TFR")).await?;
        peer.link.enter_data_mode();

        let mut data = BytesMut::with_capacity(total.min(MAX_CHUNK_LEN as u64 * 64) as usize);
        let mut transferred = 0u64;
        while transferred < total {
            match peer.next().await? {
                Step::Frame(TransferFrame::Chunk { status: ChunkHeader::DATA, data: chunk }) => {
                    transferred += chunk.len() as u64;
                    data.extend_from_slice(&chunk);
                    report(progress, transferred, total).await;
                }
                Step::Frame(TransferFrame::Chunk { status, .. }) => {
                    info!(status, "sender aborted the transfer");
                    return Err(TransferFailure::Cancelled(CancelSide::Remote));
                }
                Step::Frame(other) => {
                    warn!(?other, "unexpected frame in data mode");
                }
                Step::Cancelled => return Err(peer.abort(TransferFailure::Cancelled(CancelSide::Local)).await),
                Step::Idle => return Err(peer.abort(TransferFailure::Timeout).await),
                Step::Closed => return Err(TransferFailure::Other("peer closed mid-transfer".into())),
            }
        }
        if total == 0 {
            report(progress, 0, 0).await;
        }

        peer.send(Command::new("BYE").arg(BYE_COMPLETE)).await?;
        info!(transferred, "file received");
        Ok(data.freeze())
    }
}

/// The listening side: checks the cookie and uploads.
#[derive(Debug, Clone)]
pub struct FileSender {
    peer: Handle,
    auth_cookie: Cookie,
    data: Bytes,
    settings: TransferSettings,
}

impl FileSender {
    pub fn new(peer: Handle, auth_cookie: Cookie, data: Bytes, settings: TransferSettings) -> Self {
        Self {
            peer,
            auth_cookie,
            data,
            settings,
        }
    }

    /// Upload the file once the receiver has connected.
    pub async fn run(
        self,
        link: &mut dyn TransferLink,
        progress: &mpsc::Sender<TransferEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferFailure> {
        let mut peer = Peer {
            link,
            idle: self.settings.idle_timeout,
            cancel,
        };

        let ver = peer.expect("VER").await?;
        if !ver.args.iter().any(|v| v == PROTOCOL_VERSION) {
            return Err(peer.abort(TransferFailure::Other("no common protocol version".into())).await);
        }
        peer.send(Command::new("VER").arg(PROTOCOL_VERSION)).await?;

        let usr = peer.expect("USR").await?;
        let handle = usr.get(0).map(Handle::new);
        let cookie = usr.get(1).and_then(|s| s.parse::<u32>().ok()).map(Cookie);
        if handle.as_ref() != Some(&self.peer) || cookie != Some(self.auth_cookie) {
            warn!(?handle, "transfer peer failed authentication");
            return Err(peer.abort(TransferFailure::Refused).await);
        }

        let total = self.data.len() as u64;
        peer.send(Command::new("FIL").arg(total.to_string())).await?;
        peer.expect("TFR").await?;
        info!(total, "sending file");

        let chunk_size = self.settings.chunk_size.clamp(1, MAX_CHUNK_LEN);
        let mut transferred = 0u64;
        for chunk in self.data.chunks(chunk_size) {
            if cancel.is_cancelled() {
                let abort = TransferFrame::Chunk {
                    status: ChunkHeader::ABORT,
                    data: Bytes::new(),
                };
                if let Err(e) = peer.link.send_frame(abort).await {
                    debug!(error = %e, "abort chunk not delivered");
                }
                return Err(TransferFailure::Cancelled(CancelSide::Local));
            }
            let frame = TransferFrame::Chunk {
                status: ChunkHeader::DATA,
                data: self.data.slice_ref(chunk),
            };
            peer.link
                .send_frame(frame)
                .await
                .map_err(|e| TransferFailure::Other(e.to_string()))?;
            transferred += chunk.len() as u64;
            report(progress, transferred, total).await;
        }

        let bye = peer.expect("BYE").await?;
        if bye.get(0) != Some(BYE_COMPLETE) {
            debug!(?bye, "receiver ended with an unusual BYE");
        }
        info!(transferred, "file sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use msnp_core::parse_line;

    fn settings(chunk_size: usize) -> TransferSettings {
        TransferSettings {
            idle_timeout: Duration::from_secs(180),
            chunk_size,
        }
    }

    fn bob() -> Handle {
        Handle::new("bob@example.com")
    }

    fn line(s: &str) -> TransferFrame {
        TransferFrame::Command(parse_line(s).unwrap())
    }

    async fn expect_line(link: &mut dyn TransferLink) -> String {
        match link.recv_frame().await.unwrap() {
            Some(TransferFrame::Command(c)) => c.header_line(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 1000), 0);
        assert_eq!(percent(250, 1000), 25);
        assert_eq!(percent(1000, 1000), 100);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(5, 3), 100);
    }

    #[tokio::test]
    async fn test_four_chunks_report_quarters() {
        let (mut recv_end, mut send_end) = memory::transfer_pair();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let sender = tokio::spawn(async move {
            // Scripted sender: 1000 bytes as four 250-byte chunks.
            let send_end: &mut dyn TransferLink = &mut send_end;
            assert_eq!(expect_line(send_end).await, "VER MSNFTP");
            send_end.send_frame(line("VER MSNFTP")).await.unwrap();
            assert_eq!(expect_line(send_end).await, "USR bob@example.com 555");
            send_end.send_frame(line("FIL 1000")).await.unwrap();
            assert_eq!(expect_line(send_end).await, "TFR");
            for i in 0..4u8 {
                let data = Bytes::from(vec![i; 250]);
                send_end
                    .send_frame(TransferFrame::Chunk { status: 0, data })
                    .await
                    .unwrap();
            }
            expect_line(send_end).await
        });

        let receiver = FileReceiver::new(bob(), Cookie(555), settings(2045));
        let data = receiver.run(&mut recv_end, &tx, &cancel).await.unwrap();
        assert_eq!(data.len(), 1000);
        assert_eq!(data[999], 3);

        let mut percents = Vec::new();
        while let Ok(TransferEvent::Progress { percent, .. }) = rx.try_recv() {
            percents.push(percent);
        }
        assert_eq!(percents, vec![25, 50, 75, 100]);
        assert_eq!(sender.await.unwrap(), "BYE 16777989");
    }

    #[tokio::test]
    async fn test_sender_and_receiver_end_to_end() {
        let (mut recv_end, mut send_end) = memory::transfer_pair();
        let payload = Bytes::from((0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>());
        let cancel = CancellationToken::new();

        let sender = FileSender::new(bob(), Cookie(42), payload.clone(), settings(2045));
        let send_cancel = cancel.clone();
        let send_task = tokio::spawn(async move {
            let (tx, _rx) = mpsc::channel(16);
            sender.run(&mut send_end, &tx, &send_cancel).await
        });

        let (tx, _rx) = mpsc::channel(16);
        let received = FileReceiver::new(bob(), Cookie(42), settings(2045))
            .run(&mut recv_end, &tx, &cancel)
            .await
            .unwrap();
        assert_eq!(received, payload);
        assert_eq!(send_task.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_wrong_cookie_refused() {
        let (mut recv_end, mut send_end) = memory::transfer_pair();
        let cancel = CancellationToken::new();
        let sender = FileSender::new(bob(), Cookie(42), Bytes::from_static(b"x"), settings(2045));
        let send_cancel = cancel.clone();
        let send_task = tokio::spawn(async move {
            let (tx, _rx) = mpsc::channel(4);
            sender.run(&mut send_end, &tx, &send_cancel).await
        });

        let (tx, _rx) = mpsc::channel(4);
        let result = FileReceiver::new(bob(), Cookie(41), settings(2045))
            .run(&mut recv_end, &tx, &cancel)
            .await;
        assert_eq!(result, Err(TransferFailure::Cancelled(CancelSide::Remote)));
        assert_eq!(send_task.await.unwrap(), Err(TransferFailure::Refused));
    }

    #[tokio::test]
    async fn test_abort_chunk_is_remote_cancel() {
        let (mut recv_end, mut send_end) = memory::transfer_pair();
        let cancel = CancellationToken::new();
        let script = tokio::spawn(async move {
            let send_end: &mut dyn TransferLink = &mut send_end;
            expect_line(send_end).await;
            send_end.send_frame(line("VER MSNFTP")).await.unwrap();
            expect_line(send_end).await;
            send_end.send_frame(line("FIL 10")).await.unwrap();
            expect_line(send_end).await;
            send_end
                .send_frame(TransferFrame::Chunk {
                    status: ChunkHeader::ABORT,
                    data: Bytes::new(),
                })
                .await
                .unwrap();
        });

        let (tx, _rx) = mpsc::channel(4);
        let result = FileReceiver::new(bob(), Cookie(1), settings(2045))
            .run(&mut recv_end, &tx, &cancel)
            .await;
        assert_eq!(result, Err(TransferFailure::Cancelled(CancelSide::Remote)));
        script.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_sends_ccl() {
        let (mut recv_end, mut send_end) = memory::transfer_pair();
        let cancel = CancellationToken::new();
        let script = tokio::spawn(async move {
            let send_end: &mut dyn TransferLink = &mut send_end;
            expect_line(send_end).await;
            // Never answer; expect the receiver to give up.
            expect_line(send_end).await
        });

        let (tx, _rx) = mpsc::channel(4);
        let result = FileReceiver::new(bob(), Cookie(1), settings(2045))
            .run(&mut recv_end, &tx, &cancel)
            .await;
        assert_eq!(result, Err(TransferFailure::Timeout));
        assert_eq!(script.await.unwrap(), "CCL");
    }

    #[tokio::test]
    async fn test_local_cancel_sends_ccl() {
        let (mut recv_end, mut send_end) = memory::transfer_pair();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(4);
        let result = FileReceiver::new(bob(), Cookie(1), settings(2045))
            .run(&mut recv_end, &tx, &cancel)
            .await;
        assert_eq!(result, Err(TransferFailure::Cancelled(CancelSide::Local)));

        let send_end: &mut dyn TransferLink = &mut send_end;
        assert_eq!(expect_line(send_end).await, "VER MSNFTP");
        assert_eq!(expect_line(send_end).await, "CCL");
    }
}
