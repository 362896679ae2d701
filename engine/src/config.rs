//! Engine configuration loaded from environment variables.

use crate::realtime::DEFAULT_RECONNECT_DELAY;
use crate::sync::DEFAULT_PUSH_DEBOUNCE;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Base URL of the REST API
    pub server_url: Url,
    /// WebSocket endpoint for invalidations
    pub realtime_url: Url,
    /// Quiet period before local changes are pushed
    pub push_debounce: Duration,
    /// Wait between realtime reconnect attempts
    pub reconnect_delay: Duration,
    /// Directory for the file-backed store; in-memory when unset
    pub data_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Configuration pointing at `server_url`, with every other value at its
    /// default.
    pub fn for_server(server_url: Url) -> Result<Self, ConfigError> {
        let realtime_url = realtime_url_for(&server_url)?;
        Ok(Self {
            server_url,
            realtime_url,
            push_debounce: DEFAULT_PUSH_DEBOUNCE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            data_dir: None,
        })
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable                     | Default                   |
    /// |------------------------------|---------------------------|
    /// | `TABSYNC_SERVER_URL`         | `http://127.0.0.1:3000`   |
    /// | `TABSYNC_REALTIME_URL`       | server URL + `/ws`        |
    /// | `TABSYNC_PUSH_DEBOUNCE_MS`   | `500`                     |
    /// | `TABSYNC_RECONNECT_DELAY_MS` | `3000`                    |
    /// | `TABSYNC_DATA_DIR`           | unset (in-memory store)   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_url = parse_url(
            "TABSYNC_SERVER_URL",
            lookup("TABSYNC_SERVER_URL").as_deref().unwrap_or(DEFAULT_SERVER_URL),
        )?;
        let mut config = Self::for_server(server_url)?;

        if let Some(raw) = lookup("TABSYNC_REALTIME_URL") {
            config.realtime_url = parse_url("TABSYNC_REALTIME_URL", &raw)?;
        }
        if let Some(raw) = lookup("TABSYNC_PUSH_DEBOUNCE_MS") {
            config.push_debounce = parse_millis("TABSYNC_PUSH_DEBOUNCE_MS", &raw)?;
        }
        if let Some(raw) = lookup("TABSYNC_RECONNECT_DELAY_MS") {
            config.reconnect_delay = parse_millis("TABSYNC_RECONNECT_DELAY_MS", &raw)?;
        }
        config.data_dir = lookup("TABSYNC_DATA_DIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        Ok(config)
    }
}

/// Derive the WebSocket endpoint from the REST base: `http` becomes `ws`,
/// `https` becomes `wss`, and the path becomes `/ws`.
pub fn realtime_url_for(server_url: &Url) -> Result<Url, ConfigError> {
    let scheme = match server_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    let mut url = server_url.clone();
    url.set_scheme(scheme)
        .map_err(|()| ConfigError::UnsupportedScheme(scheme.to_string()))?;
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn parse_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        var,
        reason: e.to_string(),
    })
}

fn parse_millis(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidDuration(var))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid URL in {var}: {reason}")]
    InvalidUrl { var: &'static str, reason: String },

    #[error("Invalid millisecond value in {0}")]
    InvalidDuration(&'static str),

    #[error("Unsupported server URL scheme: {0}")]
    UnsupportedScheme(String),
}

impl From<ConfigError> for crate::Error {
    fn from(e: ConfigError) -> Self {
        crate::Error::Config(e.to_string())
    }
}
