//! # msnp
//!
//! A client engine for the MSNP8 instant-messaging protocol: presence,
//! roster with group synchronization, chat sessions, and file transfer.
//!
//! ## Overview
//!
//! An [`Account`] is one signed-in identity. Everything it does happens on
//! a background task that owns the sockets:
//!
//! - **Notification channel**: login, presence, roster, switchboard grants
//! - **Switchboards**: one socket per conversation, opened on demand
//! - **Transfer sockets**: one per accepted file invitation
//!
//! The owner drives the account through async methods and learns what
//! happened from a stream of [`AccountEvent`]s.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use msnp::{Account, AccountConfig, AccountEvent};
//!
//! async fn example() -> msnp::Result<()> {
//!     let (account, mut events) = Account::builder("alice@example.com", "secret")
//!         .config(AccountConfig::default())
//!         .connect()
//!         .await?;
//!
//!     let session = account.open_session(["bob@example.com"]).await?;
//!     account.send_message(session, "hi").await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let AccountEvent::MessageReceived { text, .. } = event {
//!             println!("{text}");
//!             break;
//!         }
//!     }
//!     account.sign_out().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `msnp::core` - wire types, identifiers and the failure taxonomy
//! - `msnp::roster` - roster model, synchronizer and stores
//! - `msnp::session` - sockets, state machines and drivers

pub mod account;
pub mod config;
mod driver;
pub mod error;

// Re-export component crates
pub use msnp_core as core;
pub use msnp_roster as roster;
pub use msnp_session as session;

// Re-export main types for convenience
pub use account::{Account, AccountBuilder};
pub use config::{AccountConfig, Timeouts, TransferConfig};
pub use error::{ClientError, Result};

// Re-export commonly used types
pub use msnp_core::{
    AuthFailure, CancelSide, Cookie, DisconnectReason, GroupId, Handle, List, NetworkFailure,
    Presence, ProtocolError, SyncConflict, TransferFailure,
};
pub use msnp_roster::{Contact, Group, Roster, RosterStore, SqliteRosterStore};
pub use msnp_session::{AccountEvent, Application, AuthMethod, ClientInfo, SessionId};
