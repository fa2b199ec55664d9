use std::path::PathBuf;
use std::time::Duration;

use citypulse_core::alert_log::DEFAULT_ALERT_CAPACITY;
use citypulse_core::cache::DEFAULT_CACHE_TTL;
use citypulse_core::store::DEFAULT_READING_CAPACITY;
use citypulse_events::bus::DEFAULT_QUEUE_CAPACITY;

/// Longest accepted `CACHE_TTL_SECS` (one day).
pub const MAX_CACHE_TTL_SECS: u64 = 86_400;
/// Longest accepted `HEARTBEAT_INTERVAL_SECS` and `REPLAY_INTERVAL_SECS` (one hour).
pub const MAX_INTERVAL_SECS: u64 = 3_600;

/// Configuration value that could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },

    #[error("Cannot load {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Hub configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// Readings retained per sensor (default: `1000`).
    pub reading_buffer_capacity: usize,
    /// Alerts retained in the global log (default: `50`).
    pub alert_log_capacity: usize,
    /// Lifetime of cached query results (default: 30 s).
    pub cache_ttl: Duration,
    /// Outbound queue length per WebSocket connection (default: `256`).
    pub subscriber_queue_capacity: usize,
    /// Interval between WebSocket pings (default: 30 s).
    pub heartbeat_interval: Duration,
    /// Peer hub WebSocket URL to relay events from. Unset disables the bridge.
    pub bridge_upstream_url: Option<String>,
    /// JSON file of raw payloads replayed by scheduled producers.
    pub replay_file: Option<PathBuf>,
    /// Interval between replayed payloads per sensor (default: 5 s).
    pub replay_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            cors_origins: vec!["http://localhost:5173".into()],
            reading_buffer_capacity: DEFAULT_READING_CAPACITY,
            alert_log_capacity: DEFAULT_ALERT_CAPACITY,
            cache_ttl: DEFAULT_CACHE_TTL,
            subscriber_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            heartbeat_interval: Duration::from_secs(30),
            bridge_upstream_url: None,
            replay_file: None,
            replay_interval: Duration::from_secs(5),
        }
    }
}

impl HubConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                 |
    /// |-----------------------------|-------------------------|
    /// | `HOST`                      | `0.0.0.0`               |
    /// | `PORT`                      | `3000`                  |
    /// | `CORS_ORIGINS`              | `http://localhost:5173` |
    /// | `READING_BUFFER_CAPACITY`   | `1000`                  |
    /// | `ALERT_LOG_CAPACITY`        | `50`                    |
    /// | `CACHE_TTL_SECS`            | `30`                    |
    /// | `SUBSCRIBER_QUEUE_CAPACITY` | `256`                   |
    /// | `HEARTBEAT_INTERVAL_SECS`   | `30`                    |
    /// | `BRIDGE_UPSTREAM_URL`       | unset                   |
    /// | `REPLAY_FILE`               | unset                   |
    /// | `REPLAY_INTERVAL_SECS`      | `5`                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);
        let port = parse_var(&lookup, "PORT", defaults.port)?;

        let cors_origins = match lookup("CORS_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.cors_origins,
        };

        let reading_buffer_capacity = parse_nonzero(
            &lookup,
            "READING_BUFFER_CAPACITY",
            defaults.reading_buffer_capacity,
        )?;
        let alert_log_capacity =
            parse_nonzero(&lookup, "ALERT_LOG_CAPACITY", defaults.alert_log_capacity)?;
        let subscriber_queue_capacity = parse_nonzero(
            &lookup,
            "SUBSCRIBER_QUEUE_CAPACITY",
            defaults.subscriber_queue_capacity,
        )?;

        let cache_ttl = Duration::from_secs(at_most(
            &lookup,
            "CACHE_TTL_SECS",
            parse_var(&lookup, "CACHE_TTL_SECS", defaults.cache_ttl.as_secs())?,
            MAX_CACHE_TTL_SECS,
        )?);
        let heartbeat_interval = Duration::from_secs(at_most(
            &lookup,
            "HEARTBEAT_INTERVAL_SECS",
            parse_nonzero(
                &lookup,
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )?,
            MAX_INTERVAL_SECS,
        )?);

        let bridge_upstream_url = lookup("BRIDGE_UPSTREAM_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let replay_file = lookup("REPLAY_FILE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let replay_interval = Duration::from_secs(at_most(
            &lookup,
            "REPLAY_INTERVAL_SECS",
            parse_nonzero(
                &lookup,
                "REPLAY_INTERVAL_SECS",
                defaults.replay_interval.as_secs(),
            )?,
            MAX_INTERVAL_SECS,
        )?);

        Ok(Self {
            host,
            port,
            cors_origins,
            reading_buffer_capacity,
            alert_log_capacity,
            cache_ttl,
            subscriber_queue_capacity,
            heartbeat_interval,
            bridge_upstream_url,
            replay_file,
            replay_interval,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

fn parse_nonzero<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let value = parse_var(lookup, var, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: lookup(var).unwrap_or_default(),
        });
    }
    Ok(value)
}

fn at_most(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    value: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    if value > max {
        return Err(ConfigError::Invalid {
            var,
            value: lookup(var).unwrap_or_default(),
        });
    }
    Ok(value)
}
