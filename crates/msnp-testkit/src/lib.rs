//! # msnp Testkit
//!
//! Testing utilities for the msnp client.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: an in-memory network whose server side is scripted by the
//!   test, plus canned ticket services
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Scripted Servers
//!
//! Hand the [`FakeConnector`] to the client and play the server from the
//! [`FakeNetwork`]:
//!
//! ```rust,ignore
//! use msnp_testkit::{FakeNetwork, FixedTicketService};
//!
//! let (mut network, connector) = FakeNetwork::new();
//! let client = msnp::Account::builder("alice@example.com", "secret")
//!     .connector(connector)
//!     .ticket_service(Arc::new(FixedTicketService::default()))
//!     .connect();
//! let server = async {
//!     let ns = network.accept().await?;
//!     ns.login("alice@example.com", "Alice").await?;
//!     ns.push_roster(("1", "1"), &[], &[]).await?;
//!     anyhow::Ok(ns)
//! };
//! let (client, ns) = tokio::join!(client, server);
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use msnp_testkit::generators::RosterParams;
//!
//! proptest! {
//!     #[test]
//!     fn snapshot_is_sorted(params: RosterParams) {
//!         let snapshot = params.snapshot();
//!         prop_assert!(snapshot.contacts.windows(2).all(|w| w[0].handle < w[1].handle));
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    FailingTicketService, FakeConnector, FakeNetwork, FakeServer, FixedTicketService, TransferEnd,
    REPLY_WAIT,
};
pub use generators::RosterParams;
