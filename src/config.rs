//! Server configuration.
//!
//! One source of truth for the listener's settings, loadable from
//! environment variables with validation. The binary layers CLI flags on
//! top; tests construct the struct directly.

use std::path::PathBuf;

use snafu::Snafu;

use crate::clientconn::Mode;
use crate::wire::MAX_MESSAGE_LEN;

/// Configuration errors.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// An environment variable held an unusable value.
    #[snafu(display("invalid value {value:?} for {key}: {reason}"))]
    InvalidValue {
        /// The variable name.
        key: &'static str,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A mode other than `normal` was configured without an upstream.
    #[snafu(display("mode {mode} requires a proxy address"))]
    ProxyAddrRequired {
        /// The configured mode.
        mode: Mode,
    },
}

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind, `host:port`.
    pub listen_addr: String,
    /// Operation mode.
    pub mode: Mode,
    /// Upstream address for mirrored modes.
    pub proxy_addr: Option<String>,
    /// Directory for raw traffic recordings; disabled when `None`.
    pub record_dir: Option<PathBuf>,
    /// Upper bound on a message's declared length, in bytes.
    pub max_message_len: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:27017".to_owned(),
            mode: Mode::Normal,
            proxy_addr: None,
            record_dir: None,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

impl ServerConfig {
    /// Load from `LARCH_*` environment variables, with defaults for
    /// anything unset.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("LARCH_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(mode) = std::env::var("LARCH_MODE") {
            config.mode = mode.parse().map_err(|err| ConfigError::InvalidValue {
                key: "LARCH_MODE",
                value: mode.clone(),
                reason: format!("{err}"),
            })?;
        }

        if let Ok(addr) = std::env::var("LARCH_PROXY_ADDR") {
            if !addr.is_empty() {
                config.proxy_addr = Some(addr);
            }
        }

        if let Ok(dir) = std::env::var("LARCH_RECORD_DIR") {
            if !dir.is_empty() {
                config.record_dir = Some(PathBuf::from(dir));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode.proxies() && self.proxy_addr.is_none() {
            return Err(ConfigError::ProxyAddrRequired { mode: self.mode });
        }
        Ok(())
    }
}
