//! # msnp-session
//!
//! Everything that happens on a socket: login, the notification channel,
//! switchboard sessions, invitations and file transfers.
//!
//! ## Overview
//!
//! Each protocol role is a state machine that takes decoded commands and
//! returns what to send and what to report. None of them touch a socket;
//! small async drivers ([`auth::login`], [`switchboard::run`],
//! [`transfer::FileReceiver::run`]) move their output over a [`Transport`].
//!
//! | state machine           | socket                  |
//! |-------------------------|-------------------------|
//! | [`AuthNegotiator`]      | notification (login)    |
//! | [`NotificationChannel`] | notification            |
//! | [`Switchboard`]         | one per conversation    |
//! | [`SessionManager`]      | none, owns the sessions |
//! | [`InvitationManager`]   | rides on a switchboard  |
//! | [`FileReceiver`] / [`FileSender`] | transfer socket |
//!
//! ## Connections
//!
//! ```text
//! Account
//!   └── Notification channel        (one, always on)
//!         └── Switchboard           (zero or more, on demand)
//!               └── Transfer socket (zero or more, per accepted invitation)
//! ```
//!
//! Each socket owns its own id sequence and pending-command map.

pub mod auth;
pub mod connection;
pub mod error;
pub mod events;
pub mod invitation;
pub mod keepalive;
pub mod message;
pub mod notification;
#[cfg(feature = "passport")]
pub mod passport;
pub mod session;
pub mod switchboard;
pub mod transfer;
pub mod transport;

pub use auth::{
    connect_and_login, login, AuthMethod, AuthNegotiator, AuthState, ClientInfo, LoggedIn,
    LoginOutcome, LoginStep, TicketError, TicketService,
};
pub use connection::{Connection, PendingCommand};
pub use error::{Result, SessionError};
pub use events::AccountEvent;
pub use invitation::{
    Application, Direction, Invitation, InvitationCommand, InvitationEvent, InvitationFields,
    InvitationManager, InvitationState,
};
pub use keepalive::{KeepAlive, KeepAliveAction};
pub use message::{ChatMessage, MimeMessage};
pub use notification::{ChannelOutput, ChannelSettings, ChannelState, NotificationChannel, Ring};
#[cfg(feature = "passport")]
pub use passport::PassportTicketService;
pub use session::{Session, SessionAction, SessionId, SessionManager, SessionState};
pub use switchboard::{Role, Switchboard, SwitchboardCommand, SwitchboardEvent, SwitchboardOutput};
pub use transfer::{FileReceiver, FileSender, TransferEvent, TransferSettings};
pub use transport::{
    memory::MemoryTransport, Connector, StreamTransport, TcpConnector, TransferAcceptor,
    TransferLink, Transport,
};
