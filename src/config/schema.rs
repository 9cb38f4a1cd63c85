//! Configuration schema.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration, read from `~/.checkin/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path the configuration was loaded from. Not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub responder: ResponderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `mqtt://host:port`, `mqtts://host:port` or bare `host[:port]`.
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Which envelope opens a publish-then-await exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// `{stage: nonce_submit, nonce}`; the device answers.
    #[default]
    NonceSubmit,
    /// A plain check-in result carrying the nonce; the other side answers.
    CheckinResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Bound on reaching the broker. Separate from the verification deadline.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on the broker acknowledging a fire-and-forget publish.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Default deadline for publish-then-await, counted from subscribe.
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    #[serde(default)]
    pub challenge: ChallengeKind,
    #[serde(default = "default_nonce_client_prefix")]
    pub nonce_client_prefix: String,
    #[serde(default = "default_checkin_client_prefix")]
    pub checkin_client_prefix: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
            challenge: ChallengeKind::default(),
            nonce_client_prefix: default_nonce_client_prefix(),
            checkin_client_prefix: default_checkin_client_prefix(),
        }
    }
}

impl HandshakeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

/// Device-side responder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    #[serde(default = "default_responder_client_prefix")]
    pub client_prefix: String,
    /// How long an answered nonce is remembered for duplicate suppression.
    #[serde(default = "default_seen_ttl_secs")]
    pub seen_ttl_secs: u64,
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
    /// Reject challenges whose timestamp is older than this. 0 disables.
    #[serde(default)]
    pub max_challenge_age_secs: u64,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            client_prefix: default_responder_client_prefix(),
            seen_ttl_secs: default_seen_ttl_secs(),
            seen_capacity: default_seen_capacity(),
            max_challenge_age_secs: 0,
        }
    }
}

fn default_broker_url() -> String {
    "mqtt://127.0.0.1:1883".into()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_ack_timeout_ms() -> u64 {
    15_000
}

fn default_verify_timeout_ms() -> u64 {
    15_000
}

fn default_nonce_client_prefix() -> String {
    "liff-nonce".into()
}

fn default_checkin_client_prefix() -> String {
    "liff-auth".into()
}

fn default_responder_client_prefix() -> String {
    "device-auth".into()
}

fn default_seen_ttl_secs() -> u64 {
    300
}

fn default_seen_capacity() -> usize {
    1024
}
