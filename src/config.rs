// Ambient configuration for the tunnel server: where to listen, how long a
// session may sit idle, and how verbose to log. Loaded from an optional
// TOML file and overridable by CLI flags; the core tunnel/session code only
// ever sees the resulting `Config` value.

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

fn default_server_address() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_server_port() -> u16 {
    1080
}

fn default_local_address() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn default_local_port() -> u16 {
    1080
}

fn default_timeout_ms() -> u64 {
    60_000
}

/// Server configuration, deserializable from a TOML file on disk.
///
/// Field names match the on-disk config file; `idle_timeout` is derived
/// from `timeout_ms` for convenient use by the session state machine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_server_address")]
    pub server_address: IpAddr,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_local_address")]
    pub local_address: IpAddr,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub verbose: bool,

    /// Not present in the TOML schema; derived from `timeout_ms` after
    /// loading so the rest of the crate can work with a `Duration`
    /// directly. Skipped during deserialization and recomputed in
    /// `Config::finalize`.
    #[serde(skip, default = "default_idle_timeout")]
    pub idle_timeout: Duration,
}

fn default_idle_timeout() -> Duration {
    Duration::from_millis(default_timeout_ms())
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_address: default_server_address(),
            server_port: default_server_port(),
            local_address: default_local_address(),
            local_port: default_local_port(),
            timeout_ms: default_timeout_ms(),
            verbose: false,
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Error loading or parsing a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Load a config from a TOML file, then recompute derived fields.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mut config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.finalize();
        Ok(config)
    }

    /// Recompute fields derived from others (`idle_timeout` from
    /// `timeout_ms`). Call after manually overriding `timeout_ms`.
    pub fn finalize(&mut self) {
        self.idle_timeout = Duration::from_millis(self.timeout_ms);
    }
}
