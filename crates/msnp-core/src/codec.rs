//! Framing codecs.
//!
//! [`CommandCodec`] splits a byte stream into [`Command`]s. It runs in line
//! mode until a header announces a trailing binary block, then switches to
//! reading exactly that many bytes before resuming line mode.
//!
//! [`TransferCodec`] frames the dedicated file-transfer socket: the same
//! line protocol during negotiation, then length-prefixed data chunks once
//! [`TransferCodec::enter_data_mode`] is called.

use std::collections::HashSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::{parse_line, Command};
use crate::error::CoreError;

/// Longest header line accepted before the buffer is declared garbage.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Largest binary block accepted after a command header.
pub const MAX_PAYLOAD_LEN: usize = 65_536;

/// Size of the file-transfer chunk header: status byte + little-endian u16.
pub const CHUNK_HEADER_LEN: usize = 3;

/// A chunk length field is 16 bits wide.
pub const MAX_CHUNK_LEN: usize = u16::MAX as usize;

/// Item produced by the decoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed command.
    Command(Command),
    /// A line that could not be parsed. The connection survives it.
    Malformed(String),
}

#[derive(Debug, Clone)]
enum DecodeState {
    Line,
    Payload { header: Command, len: usize },
}

/// Line-oriented command codec with a binary-block mode.
#[derive(Debug, Clone)]
pub struct CommandCodec {
    payload_verbs: HashSet<String>,
    max_payload_len: usize,
    state: DecodeState,
}

impl CommandCodec {
    /// Create a codec where the given verbs carry a trailing binary block.
    pub fn new<I, S>(payload_verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            payload_verbs: payload_verbs.into_iter().map(Into::into).collect(),
            max_payload_len: MAX_PAYLOAD_LEN,
            state: DecodeState::Line,
        }
    }

    /// Codec for the notification channel.
    pub fn notification() -> Self {
        Self::new(["MSG", "NOT", "IPG", "UBX", "GCF"])
    }

    /// Codec for switchboard sockets.
    pub fn switchboard() -> Self {
        Self::new(["MSG"])
    }

    #[must_use]
    pub fn with_max_payload_len(mut self, max: usize) -> Self {
        self.max_payload_len = max;
        self
    }

    /// `true` while the codec is waiting for the bytes of a binary block.
    pub fn in_payload(&self) -> bool {
        matches!(self.state, DecodeState::Payload { .. })
    }

    fn carries_payload(&self, verb: &str) -> bool {
        self.payload_verbs.contains(verb)
    }
}

impl Decoder for CommandCodec {
    type Item = Inbound;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Line) {
                DecodeState::Payload { header, len } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        self.state = DecodeState::Payload { header, len };
                        return Ok(None);
                    }
                    let payload = src.split_to(len).freeze();
                    return Ok(Some(Inbound::Command(header.with_payload(payload))));
                }
                DecodeState::Line => {
                    let line = match take_line(src)? {
                        LineResult::Line(line) => line,
                        LineResult::Incomplete => return Ok(None),
                        LineResult::Overflow(garbage) => return Ok(Some(Inbound::Malformed(garbage))),
                    };
                    if line.trim().is_empty() {
                        continue;
                    }

                    let mut command = match parse_line(&line) {
                        Ok(command) => command,
                        Err(_) => return Ok(Some(Inbound::Malformed(line))),
                    };

                    if !self.carries_payload(&command.verb) {
                        return Ok(Some(Inbound::Command(command)));
                    }

                    let len = match command.args.last().and_then(|s| s.parse::<usize>().ok()) {
                        Some(len) => len,
                        None => return Ok(Some(Inbound::Malformed(line))),
                    };
                    command.args.pop();

                    if len > self.max_payload_len {
                        return Ok(Some(Inbound::Malformed(line)));
                    }
                    if len == 0 {
                        return Ok(Some(Inbound::Command(command.with_payload(Bytes::new()))));
                    }
                    self.state = DecodeState::Payload { header: command, len };
                }
            }
        }
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = CoreError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}

enum LineResult {
    Line(String),
    Incomplete,
    Overflow(String),
}

/// Split one CRLF (or bare LF) terminated line off the buffer.
fn take_line(src: &mut BytesMut) -> Result<LineResult, CoreError> {
    match src.iter().position(|b| *b == b'\n') {
        Some(pos) => {
            let raw = src.split_to(pos + 1);
            let mut end = raw.len() - 1;
            if end > 0 && raw[end - 1] == b'\r' {
                end -= 1;
            }
            Ok(LineResult::Line(String::from_utf8_lossy(&raw[..end]).into_owned()))
        }
        None if src.len() > MAX_LINE_LEN => {
            let garbage = src.split_to(src.len());
            Ok(LineResult::Overflow(
                String::from_utf8_lossy(&garbage[..64.min(garbage.len())]).into_owned(),
            ))
        }
        None => Ok(LineResult::Incomplete),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File transfer framing
// ─────────────────────────────────────────────────────────────────────────────

/// Header preceding every file-transfer data chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// 0 for data, 1 for a sender-side abort.
    pub status: u8,
    /// Number of data bytes following the header.
    pub len: u16,
}

impl ChunkHeader {
    pub const DATA: u8 = 0;
    pub const ABORT: u8 = 1;

    pub fn data(len: u16) -> Self {
        Self { status: Self::DATA, len }
    }

    pub fn abort() -> Self {
        Self { status: Self::ABORT, len: 0 }
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let [lo, hi] = self.len.to_le_bytes();
        [self.status, lo, hi]
    }

    pub fn decode(bytes: [u8; CHUNK_HEADER_LEN]) -> Self {
        Self {
            status: bytes[0],
            len: u16::from_le_bytes([bytes[1], bytes[2]]),
        }
    }
}

/// Frame on the file-transfer socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    /// A negotiation command (`VER`, `USR`, `FIL`, `TFR`, `BYE`, `CCL`).
    Command(Command),
    /// An unparseable negotiation line.
    Malformed(String),
    /// A data chunk.
    Chunk { status: u8, data: Bytes },
}

/// Codec for the file-transfer socket.
///
/// Starts in line mode. The receiving side switches to data mode after it
/// sends `TFR`; the encoder always accepts both commands and chunks.
#[derive(Debug, Clone, Default)]
pub struct TransferCodec {
    data_mode: bool,
}

impl TransferCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start decoding length-prefixed chunks instead of lines.
    pub fn enter_data_mode(&mut self) {
        self.data_mode = true;
    }

    /// Go back to decoding lines (used after the last chunk).
    pub fn leave_data_mode(&mut self) {
        self.data_mode = false;
    }

    pub fn in_data_mode(&self) -> bool {
        self.data_mode
    }
}

impl Decoder for TransferCodec {
    type Item = TransferFrame;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.data_mode {
            if src.len() < CHUNK_HEADER_LEN {
                return Ok(None);
            }
            let header = ChunkHeader::decode([src[0], src[1], src[2]]);
            let total = CHUNK_HEADER_LEN + header.len as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            src.advance(CHUNK_HEADER_LEN);
            let data = src.split_to(header.len as usize).freeze();
            return Ok(Some(TransferFrame::Chunk {
                status: header.status,
                data,
            }));
        }

        loop {
            let line = match take_line(src)? {
                LineResult::Line(line) => line,
                LineResult::Incomplete => return Ok(None),
                LineResult::Overflow(garbage) => return Ok(Some(TransferFrame::Malformed(garbage))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(match parse_line(&line) {
                Ok(command) => TransferFrame::Command(command),
                Err(_) => TransferFrame::Malformed(line),
            }));
        }
    }
}

impl Encoder<TransferFrame> for TransferCodec {
    type Error = CoreError;

    fn encode(&mut self, item: TransferFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            TransferFrame::Command(command) => dst.extend_from_slice(&command.to_bytes()),
            TransferFrame::Malformed(line) => {
                dst.extend_from_slice(line.as_bytes());
                dst.extend_from_slice(b"\r\n");
            }
            TransferFrame::Chunk { status, data } => {
                let len = u16::try_from(data.len()).map_err(|_| CoreError::ChunkTooLarge(data.len()))?;
                dst.reserve(CHUNK_HEADER_LEN + data.len());
                dst.put_slice(&ChunkHeader { status, len }.encode());
                dst.put_slice(&data);
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn decoder_never_panics(input in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut codec = CommandCodec::notification();
            let mut buf = BytesMut::from(&input[..]);
            while let Ok(Some(_)) = codec.decode(&mut buf) {}
        }

        #[test]
        fn trid_survives_encoding(trid in 1u32..u32::MAX, arg in "[A-Za-z]{1,12}") {
            let command = Command::new("ADG").with_trid(trid).arg(arg.clone()).arg("0");
            let mut codec = CommandCodec::notification();
            let mut buf = BytesMut::new();
            codec.encode(command.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap();
            prop_assert_eq!(decoded, Some(Inbound::Command(command)));
        }
    }
}
