//! # msnp-roster
//!
//! The roster: contacts, groups, and the machinery that keeps the server's
//! view of group membership in line with the user's.
//!
//! ## Key Types
//!
//! - [`Roster`] - contacts and groups of one account, plus sync tokens
//! - [`Synchronizer`] - turns membership differences into [`RosterOp`]s
//! - [`RosterStore`] - async persistence trait
//! - [`SqliteRosterStore`] / [`MemoryRosterStore`] - store implementations
//!
//! ## Design Notes
//!
//! - **Group 0 is permanent**: it is always present and never deletable
//! - **Never groupless**: a synchronized contact always keeps at least one
//!   server group; the last removal of a pass is deferred
//! - **One pass at a time**: a contact with an outstanding pass is `moving`
//!   and further triggers are dropped until the server answers

pub mod error;
pub mod memory;
pub mod migration;
pub mod model;
pub mod sqlite;
pub mod sync;
pub mod traits;

pub use error::{Result, RosterError};
pub use memory::MemoryRosterStore;
pub use model::{Contact, Group, Roster, SyncTokens, DEFAULT_GROUP_NAME};
pub use sqlite::SqliteRosterStore;
pub use sync::{RosterOp, Synchronizer};
pub use traits::{ContactRecord, RosterSnapshot, RosterStore};
