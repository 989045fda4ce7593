//! Runtime configuration.
//!
//! Loaded once at process start from an optional TOML file. Every field has a
//! default, so an empty file (or no file) yields a working configuration.
//! Durations are written as integer milliseconds.
//!
//! ```toml
//! endpoint = "tandem.control"
//!
//! [engine]
//! stale_threshold_ms = 5000
//! force_wake_ms = 1000
//! remote_send_timeout_ms = 500
//!
//! [channel]
//! connect_timeout_ms = 2000
//! retry_interval_ms = 1000
//!
//! [policy]
//! heartbeat_interval_ms = 1000
//! watchdog_timeout_ms = 3000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::ipc::endpoint::{EndpointName, InvalidEndpoint};

/// Default endpoint name shared by both processes.
pub const DEFAULT_ENDPOINT: &str = "tandem.control";

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config `{}`", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`RuntimeConfig`].
    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
    /// The configured endpoint name cannot be used.
    #[error(transparent)]
    InvalidEndpoint(#[from] InvalidEndpoint),
}

/// Engine loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Received records at least this old are dropped.
    pub stale_threshold_ms: u64,
    /// Safety-net delay after which `Engine::wait` forces the loop awake.
    pub force_wake_ms: u64,
    /// Default timeout for [`Engine::notify_remote`](crate::Engine::notify_remote) callers.
    pub remote_send_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: 5000,
            force_wake_ms: 1000,
            remote_send_timeout_ms: 500,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    #[must_use]
    pub const fn force_wake(&self) -> Duration {
        Duration::from_millis(self.force_wake_ms)
    }

    #[must_use]
    pub const fn remote_send_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_send_timeout_ms)
    }
}

/// Channel connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// Upper bound on waiting for a peer inside a blocking write.
    pub connect_timeout_ms: u64,
    /// Back-off between failed attempts to create or open the transport.
    pub retry_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            retry_interval_ms: 1000,
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Settings for the bundled policy handlers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Period of the service heartbeat while a peer is connected.
    pub heartbeat_interval_ms: u64,
    /// Silence after which the control side marks the service unresponsive.
    pub watchdog_timeout_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            watchdog_timeout_ms: 3000,
        }
    }
}

impl PolicyConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Abstract socket name both processes agree on.
    pub endpoint: String,
    pub engine: EngineConfig,
    pub channel: ChannelConfig,
    pub policy: PolicyConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            engine: EngineConfig::default(),
            channel: ChannelConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or unknown keys, and
    /// [`ConfigError::InvalidEndpoint`] if the endpoint name is unusable.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.endpoint_name()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise
    /// the errors of [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Validated endpoint name.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEndpoint`] if the name is empty, too long or contains NUL.
    pub fn endpoint_name(&self) -> Result<EndpointName, InvalidEndpoint> {
        EndpointName::new(&self.endpoint)
    }
}
