//! # msnp-core
//!
//! Wire primitives shared by every layer of the msnp client.
//!
//! ## Overview
//!
//! - [`Command`]: one line of the text protocol, optionally followed by a
//!   binary block
//! - [`CommandCodec`]: line framing with an explicit "read N bytes" mode
//! - [`TransferCodec`]: framing for the dedicated file-transfer socket
//! - [`Handle`], [`GroupId`], [`ListFlags`], [`Cookie`]: identifiers
//! - [`Presence`]: the internal availability model
//! - [`Failure`] and its families: the client-wide error taxonomy
//! - [`codes`]: the numeric server code side table
//!
//! ## Wire Format
//!
//! ```text
//! VER 1 MSNP8 CVR0\r\n                 client command with trid 1
//! 911 3\r\n                            error reply to trid 3
//! MSG bob@example.com Bob 12\r\n      header announcing 12 payload bytes
//! hello world!                         payload (no terminator)
//! ```

pub mod codec;
pub mod codes;
pub mod command;
pub mod digest;
pub mod escape;
pub mod error;
pub mod presence;
pub mod types;

pub use codec::{
    ChunkHeader, CommandCodec, Inbound, TransferCodec, TransferFrame, CHUNK_HEADER_LEN,
    MAX_CHUNK_LEN, MAX_PAYLOAD_LEN,
};
pub use codes::{classify, describe, CodeCategory, ServerError};
pub use command::{parse_line, Command};
pub use digest::{challenge_response, md5_login_hash};
pub use escape::{url_decode, url_encode};
pub use error::{
    AuthFailure, CancelSide, CoreError, DisconnectReason, Failure, NetworkFailure, ProtocolError,
    Result, SyncConflict, TransferFailure,
};
pub use presence::Presence;
pub use types::{Cookie, GroupId, Handle, List, ListFlags};
