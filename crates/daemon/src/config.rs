// Daemon configuration.
//
// Sources, lowest precedence first: built-in defaults, an optional TOML file
// (`modelsyncd --config <path>`), then `MODELSYNC_*` environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{RegistrySettings, DEFAULT_LISTEN_TTL, DEFAULT_LOCK_TIMEOUT};

const STATE_DIR_NAME: &str = ".modelsync";
const SOCKET_NAME: &str = "daemon.sock";
const DEFAULT_HTTP_PORT: u16 = 7420;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value `{value}` for {name}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket the registry owner answers JSON-RPC on.
    pub socket_path: PathBuf,
    /// Address of the health check and session push gateway.
    pub http_addr: SocketAddr,
    /// Listener list time-to-live, refreshed on every write.
    pub listen_ttl_secs: u64,
    /// How long a listen/deafen waits for the key lock.
    pub lock_timeout_ms: u64,
    /// Expired-list sweep period.
    pub sweep_interval_secs: u64,
    /// When set, session listen/deafen calls go to the registry owner on
    /// this socket instead of the in-process one.
    pub upstream_socket: Option<PathBuf>,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            http_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_HTTP_PORT)),
            listen_ttl_secs: DEFAULT_LISTEN_TTL.as_secs(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            upstream_socket: None,
            log_filter: "info".to_string(),
        }
    }
}

/// `~/.modelsync/daemon.sock`, or under the temp dir when there is no home.
pub fn default_socket_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(STATE_DIR_NAME)
        .join(SOCKET_NAME)
}

impl DaemonConfig {
    /// Defaults, overlaid by `path` when given, overlaid by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::default(),
        };
        base.with_env_fn(|key| std::env::var(key))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Overlay `MODELSYNC_*` variables looked up through `env`.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `MODELSYNC_SOCKET_PATH` | `socket_path` |
    /// | `MODELSYNC_HTTP_ADDR` | `http_addr` |
    /// | `MODELSYNC_LISTEN_TTL_SECS` | `listen_ttl_secs` |
    /// | `MODELSYNC_LOCK_TIMEOUT_MS` | `lock_timeout_ms` |
    /// | `MODELSYNC_UPSTREAM_SOCKET` | `upstream_socket` |
    /// | `MODELSYNC_LOG_FILTER` | `log_filter` |
    pub fn with_env_fn<F>(mut self, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        if let Ok(value) = env("MODELSYNC_SOCKET_PATH") {
            self.socket_path = PathBuf::from(value);
        }
        if let Ok(value) = env("MODELSYNC_HTTP_ADDR") {
            self.http_addr = parse_var("MODELSYNC_HTTP_ADDR", value)?;
        }
        if let Ok(value) = env("MODELSYNC_LISTEN_TTL_SECS") {
            self.listen_ttl_secs = parse_var("MODELSYNC_LISTEN_TTL_SECS", value)?;
        }
        if let Ok(value) = env("MODELSYNC_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = parse_var("MODELSYNC_LOCK_TIMEOUT_MS", value)?;
        }
        if let Ok(value) = env("MODELSYNC_UPSTREAM_SOCKET") {
            self.upstream_socket = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        if let Ok(value) = env("MODELSYNC_LOG_FILTER") {
            self.log_filter = value;
        }
        Ok(self)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            ttl: Duration::from_secs(self.listen_ttl_secs),
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue { name, value })
}
