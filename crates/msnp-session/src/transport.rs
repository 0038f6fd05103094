//! Transport abstraction for the command channels and transfer sockets.
//!
//! A [`Transport`] moves [`Command`]s over one socket. The notification
//! channel and every switchboard own one each; [`Connector`] opens new
//! ones, so tests can substitute in-memory pipes for TCP.

use std::ops::RangeInclusive;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tracing::{debug, trace};

use msnp_core::{Command, CommandCodec, Inbound, NetworkFailure, TransferCodec, TransferFrame};

use crate::error::{Result, SessionError};

/// Command transport for one socket.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one command.
    async fn send(&self, command: Command) -> Result<()>;

    /// Receive the next decoded item.
    ///
    /// Returns [`SessionError::Closed`] once the peer has closed the socket.
    async fn recv(&self) -> Result<Inbound>;

    /// Receive with timeout.
    ///
    /// Returns None if timeout expires before anything arrives.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Inbound>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(item) => item.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Close the write side.
    async fn close(&self) -> Result<()>;

    /// Peer description for logs.
    fn peer(&self) -> &str;
}

/// [`Transport`] over any byte stream, framed by a [`CommandCodec`].
pub struct StreamTransport<S> {
    reader: Mutex<FramedRead<ReadHalf<S>, CommandCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, CommandCodec>>,
    peer: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: S, codec: CommandCodec, peer: impl Into<String>) -> Self {
        let (read, write) = tokio::io::split(io);
        Self {
            reader: Mutex::new(FramedRead::new(read, codec.clone())),
            writer: Mutex::new(FramedWrite::new(write, codec)),
            peer: peer.into(),
        }
    }

    /// Write raw bytes, bypassing the encoder.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let io = writer.get_mut();
        io.write_all(bytes).await?;
        io.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, command: Command) -> Result<()> {
        debug!(peer = %self.peer, ">> {}", command);
        self.writer.lock().await.send(command).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Inbound> {
        match self.reader.lock().await.next().await {
            Some(Ok(item)) => {
                if let Inbound::Command(command) = &item {
                    debug!(peer = %self.peer, "<< {}", command);
                }
                Ok(item)
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(SessionError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        SinkExt::<Command>::close(&mut *writer).await?;
        Ok(())
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File transfer sockets
// ─────────────────────────────────────────────────────────────────────────────

/// Frame-level access to a file-transfer socket.
#[async_trait]
pub trait TransferLink: Send {
    async fn send_frame(&mut self, frame: TransferFrame) -> Result<()>;

    /// Next frame, or None once the peer has closed the socket.
    async fn recv_frame(&mut self) -> Result<Option<TransferFrame>>;

    /// Switch the decoder to length-prefixed chunks.
    fn enter_data_mode(&mut self);
}

#[async_trait]
impl<S> TransferLink for Framed<S, TransferCodec>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn send_frame(&mut self, frame: TransferFrame) -> Result<()> {
        if let TransferFrame::Command(command) = &frame {
            debug!(">> {}", command);
        }
        SinkExt::send(self, frame).await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Option<TransferFrame>> {
        match StreamExt::next(self).await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    fn enter_data_mode(&mut self) {
        self.codec_mut().enter_data_mode();
    }
}

/// A listening transfer socket waiting for the peer to connect.
#[async_trait]
pub trait TransferAcceptor: Send {
    /// Port the peer should connect to.
    fn port(&self) -> u16;

    async fn accept(&mut self) -> Result<Box<dyn TransferLink>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Connectors
// ─────────────────────────────────────────────────────────────────────────────

/// Opens sockets on behalf of the client.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect a command channel to `addr` (`host:port`).
    async fn connect(&self, addr: &str, codec: CommandCodec) -> Result<Box<dyn Transport>>;

    /// Connect to a peer's transfer socket.
    async fn connect_transfer(&self, addr: &str) -> Result<Box<dyn TransferLink>>;

    /// Listen for a peer's transfer connection on the first free port.
    async fn listen_transfer(&self, ports: RangeInclusive<u16>) -> Result<Box<dyn TransferAcceptor>>;
}

/// TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => {
                debug!(addr, error = %e, "connect failed");
                Err(NetworkFailure::ConnectFailed.into())
            }
            Err(_) => {
                debug!(addr, "connect timed out");
                Err(NetworkFailure::ConnectFailed.into())
            }
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str, codec: CommandCodec) -> Result<Box<dyn Transport>> {
        let stream = self.dial(addr).await?;
        Ok(Box::new(StreamTransport::new(stream, codec, addr)))
    }

    async fn connect_transfer(&self, addr: &str) -> Result<Box<dyn TransferLink>> {
        let stream = self.dial(addr).await?;
        Ok(Box::new(Framed::new(stream, TransferCodec::new())))
    }

    async fn listen_transfer(&self, ports: RangeInclusive<u16>) -> Result<Box<dyn TransferAcceptor>> {
        for port in ports.clone() {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => return Ok(Box::new(TcpTransferAcceptor { listener, port })),
                Err(e) => trace!(port, error = %e, "transfer port busy"),
            }
        }
        Err(SessionError::InvalidRequest(format!(
            "no free transfer port in {}..={}",
            ports.start(),
            ports.end()
        )))
    }
}

struct TcpTransferAcceptor {
    listener: TcpListener,
    port: u16,
}

#[async_trait]
impl TransferAcceptor for TcpTransferAcceptor {
    fn port(&self) -> u16 {
        self.port
    }

    async fn accept(&mut self) -> Result<Box<dyn TransferLink>> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(%peer, "transfer peer connected");
        Ok(Box::new(Framed::new(stream, TransferCodec::new())))
    }
}

/// In-memory transports over `tokio::io::duplex`, for testing.
pub mod memory {
    use super::*;
    use tokio::io::DuplexStream;

    /// Buffer size of each in-memory pipe.
    pub const PIPE_CAPACITY: usize = 64 * 1024;

    /// In-memory command transport.
    pub type MemoryTransport = StreamTransport<DuplexStream>;

    /// Codec for the server end of a pipe: decodes what clients send.
    pub fn server_codec() -> CommandCodec {
        CommandCodec::new(["MSG", "QRY"])
    }

    /// A connected (client, server) pair. The client end decodes with
    /// `client_codec`.
    pub fn pair(client_codec: CommandCodec, label: &str) -> (MemoryTransport, MemoryTransport) {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        (
            StreamTransport::new(client, client_codec, label),
            StreamTransport::new(server, server_codec(), format!("{label} (server end)")),
        )
    }

    /// A connected pair of transfer sockets.
    pub fn transfer_pair() -> (Framed<DuplexStream, TransferCodec>, Framed<DuplexStream, TransferCodec>) {
        let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
        (
            Framed::new(a, TransferCodec::new()),
            Framed::new(b, TransferCodec::new()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::memory;
    use super::*;
    use bytes::Bytes;
    use msnp_core::ChunkHeader;

    #[tokio::test]
    async fn test_memory_pair_send_recv() {
        let (client, server) = memory::pair(CommandCodec::notification(), "test");

        client.send(Command::new("VER").with_trid(1).args(["MSNP8", "CVR0"])).await.unwrap();
        match server.recv().await.unwrap() {
            Inbound::Command(cmd) => {
                assert_eq!(cmd.verb, "VER");
                assert_eq!(cmd.trid, Some(1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_payload_crosses_pipe() {
        let (client, server) = memory::pair(CommandCodec::switchboard(), "sb");
        let body = Bytes::from_static(b"MIME-Version: 1.0\r\n\r\nhi");
        server
            .send(Command::new("MSG").args(["bob@example.com", "Bob"]).with_payload(body.clone()))
            .await
            .unwrap();

        match client.recv().await.unwrap() {
            Inbound::Command(cmd) => assert_eq!(cmd.payload, Some(body)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_raw_garbage_is_malformed_not_fatal() {
        let (client, server) = memory::pair(CommandCodec::notification(), "ns");
        server.send_raw(b"this is not a command\r\nQNG 50\r\n").await.unwrap();

        assert!(matches!(client.recv().await.unwrap(), Inbound::Malformed(_)));
        assert!(matches!(client.recv().await.unwrap(), Inbound::Command(ref c) if c.verb == "QNG"));
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let (client, server) = memory::pair(CommandCodec::notification(), "ns");
        server.close().await.unwrap();
        drop(server);
        assert!(matches!(client.recv().await, Err(SessionError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout_expires() {
        let (client, _server) = memory::pair(CommandCodec::notification(), "ns");
        let item = client.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn test_transfer_pair_chunks() {
        let (mut a, mut b) = memory::transfer_pair();
        b.enter_data_mode();
        a.send_frame(TransferFrame::Chunk {
            status: ChunkHeader::DATA,
            data: Bytes::from_static(b"abc"),
        })
        .await
        .unwrap();

        match b.recv_frame().await.unwrap() {
            Some(TransferFrame::Chunk { status, data }) => {
                assert_eq!(status, ChunkHeader::DATA);
                assert_eq!(&data[..], b"abc");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
