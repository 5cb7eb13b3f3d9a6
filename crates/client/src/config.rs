// Client tuning, overridable from `MODELSYNC_*` environment variables.

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_EVICTION_GRACE: Duration = Duration::from_millis(5_000);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1_000);

#[derive(Debug, Error)]
#[error("invalid value `{value}` for {name}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long a record with no viewers stays subscribed before teardown.
    pub eviction_grace: Duration,
    /// Upper bound on one request/response round trip.
    pub call_timeout: Duration,
    /// Pause between websocket reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            eviction_grace: DEFAULT_EVICTION_GRACE,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// | Variable | Field |
    /// |---|---|
    /// | `MODELSYNC_EVICTION_GRACE_MS` | `eviction_grace` |
    /// | `MODELSYNC_CALL_TIMEOUT_MS` | `call_timeout` |
    /// | `MODELSYNC_RECONNECT_DELAY_MS` | `reconnect_delay` |
    pub fn from_env_fn<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let mut config = Self::default();
        if let Ok(value) = env("MODELSYNC_EVICTION_GRACE_MS") {
            config.eviction_grace = parse_millis("MODELSYNC_EVICTION_GRACE_MS", value)?;
        }
        if let Ok(value) = env("MODELSYNC_CALL_TIMEOUT_MS") {
            config.call_timeout = parse_millis("MODELSYNC_CALL_TIMEOUT_MS", value)?;
        }
        if let Ok(value) = env("MODELSYNC_RECONNECT_DELAY_MS") {
            config.reconnect_delay = parse_millis("MODELSYNC_RECONNECT_DELAY_MS", value)?;
        }
        Ok(config)
    }

    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace = grace;
        self
    }
}

fn parse_millis(name: &'static str, value: String) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError { name, value })
}
