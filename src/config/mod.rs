//! Configuration loading.
//!
//! Resolution order: built-in defaults, then `~/.checkin/config.toml`
//! (or the explicit path), then `CHECKIN_BROKER_*` environment variables.

pub mod schema;

pub use schema::{BrokerConfig, ChallengeKind, Config, HandshakeConfig, ResponderConfig};

use anyhow::Context;
use std::path::{Path, PathBuf};

impl Config {
    /// Default location: `~/.checkin/config.toml`.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        use directories::UserDirs;

        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".checkin").join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    /// A missing default file yields the built-in defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    tracing::debug!(path = %path.display(), "no config file, using defaults");
                    Self {
                        config_path: path,
                        ..Self::default()
                    }
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Apply `CHECKIN_BROKER_URL`, `CHECKIN_BROKER_USERNAME` and
    /// `CHECKIN_BROKER_PASSWORD` through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("CHECKIN_BROKER_URL").filter(|v| !v.trim().is_empty()) {
            self.broker.url = url;
        }
        if let Some(user) = lookup("CHECKIN_BROKER_USERNAME") {
            self.broker.username = Some(user);
        }
        if let Some(pass) = lookup("CHECKIN_BROKER_PASSWORD") {
            self.broker.password = Some(pass);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.broker
            .url
            .parse::<crate::transport::mqtt::BrokerAddress>()
            .with_context(|| format!("broker.url '{}' is not usable", self.broker.url))?;

        let hs = &self.handshake;
        for (name, value) in [
            ("handshake.connect_timeout_ms", hs.connect_timeout_ms),
            ("handshake.ack_timeout_ms", hs.ack_timeout_ms),
            ("handshake.verify_timeout_ms", hs.verify_timeout_ms),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        for (name, value) in [
            ("handshake.nonce_client_prefix", &hs.nonce_client_prefix),
            ("handshake.checkin_client_prefix", &hs.checkin_client_prefix),
            ("responder.client_prefix", &self.responder.client_prefix),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{name} cannot be empty");
            }
        }
        if self.responder.seen_capacity == 0 {
            anyhow::bail!("responder.seen_capacity must be greater than zero");
        }
        Ok(())
    }
}
