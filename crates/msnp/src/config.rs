//! Account configuration.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use msnp_core::Presence;
use msnp_session::{AuthMethod, ChannelSettings, ClientInfo, TransferSettings};

/// Default dispatch server.
pub const DEFAULT_SERVER: &str = "messenger.hotmail.com:1863";

/// Configuration for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Dispatch server, `host:port`.
    pub server: String,
    /// Identification sent during login and used for challenges.
    pub client: ClientInfo,
    pub auth_method: AuthMethod,
    /// Presence set once the roster has arrived.
    pub initial_presence: Presence,
    pub timeouts: Timeouts,
    pub transfer: TransferConfig,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            client: ClientInfo::default(),
            auth_method: AuthMethod::default(),
            initial_presence: Presence::Online,
            timeouts: Timeouts::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl AccountConfig {
    pub(crate) fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            keepalive_interval: self.timeouts.keepalive,
            initial_presence: self.initial_presence,
        }
    }

    pub(crate) fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            idle_timeout: self.timeouts.transfer_idle,
            chunk_size: self.transfer.chunk_size,
        }
    }
}

/// Timeouts and intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Establishing any socket.
    pub connect: Duration,
    /// Each reply during login.
    pub login_reply: Duration,
    /// Unanswered commands are forgotten after this long.
    pub reply_quiescence: Duration,
    /// Unanswered outgoing invitations are cancelled after this long.
    pub invitation: Duration,
    /// A transfer with no traffic for this long is aborted.
    pub transfer_idle: Duration,
    /// Keep-alive interval until the server names one.
    pub keepalive: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            login_reply: Duration::from_secs(60),
            reply_quiescence: Duration::from_secs(5 * 60),
            invitation: Duration::from_secs(10 * 60),
            transfer_idle: Duration::from_secs(3 * 60),
            keepalive: Duration::from_secs(50),
        }
    }
}

/// File transfer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// First and last port tried when listening for a receiver.
    pub port_range: (u16, u16),
    /// Size of outgoing data chunks.
    pub chunk_size: usize,
    /// Address advertised to receivers. Defaults to the address the
    /// server reports for us.
    pub advertise_address: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            port_range: (6891, 6900),
            chunk_size: msnp_session::transfer::DEFAULT_CHUNK_SIZE,
            advertise_address: None,
        }
    }
}

impl TransferConfig {
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.port_range.0..=self.port_range.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AccountConfig::default();
        assert_eq!(config.server, DEFAULT_SERVER);
        assert_eq!(config.timeouts.invitation, Duration::from_secs(600));
        assert_eq!(config.transfer.ports(), 6891..=6900);
        assert_eq!(config.transfer.chunk_size, 2045);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AccountConfig = serde_json::from_str(r#"{"server": "127.0.0.1:1863"}"#).unwrap();
        assert_eq!(config.server, "127.0.0.1:1863");
        assert_eq!(config.client, ClientInfo::default());
        assert_eq!(config.timeouts, Timeouts::default());
    }

    #[test]
    fn test_round_trip_json() {
        let mut config = AccountConfig::default();
        config.auth_method = AuthMethod::Md5;
        config.transfer.advertise_address = Some("192.0.2.7".into());
        let json = serde_json::to_string(&config).unwrap();
        let back: AccountConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
