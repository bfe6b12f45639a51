//! Client configuration
//!
//! Every setting has a default; `from_env()` overrides from:
//! - `VENUE_API_URL` - REST base URL
//! - `VENUE_WS_URL` - WebSocket URL
//! - `VENUE_TOKEN` - bearer token sent in AUTH frames and REST headers
//! - `VENUE_ADMIN_TOKEN` - admin credential; enables the `admin:markets` topic
//! - `VENUE_RECONNECT_BASE_MS` / `VENUE_RECONNECT_MAX_MS` - backoff bounds

use std::env;
use std::time::Duration;

use url::Url;

use crate::backoff::ReconnectPolicy;

const DEFAULT_API_URL: &str = "http://localhost:3001/api";
const DEFAULT_WS_URL: &str = "ws://localhost:3001/ws";

/// Ping interval for the shared socket
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// REST request timeout
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Locally held credentials
#[derive(Clone, Default)]
pub struct Credentials {
    pub bearer_token: Option<String>,
    pub admin_token: Option<String>,
}

impl Credentials {
    pub fn has_admin(&self) -> bool {
        self.admin_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Configuration shared by the REST client and the subscription manager
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub ws_url: String,
    pub credentials: Credentials,
    pub reconnect: ReconnectPolicy,
    pub ping_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            credentials: Credentials::default(),
            reconnect: ReconnectPolicy::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(api_url) = lookup("VENUE_API_URL") {
            config.api_base_url = parse_url("VENUE_API_URL", &api_url)?;
        }
        if let Some(ws_url) = lookup("VENUE_WS_URL") {
            config.ws_url = parse_url("VENUE_WS_URL", &ws_url)?;
        }

        config.credentials = Credentials {
            bearer_token: lookup("VENUE_TOKEN").filter(|t| !t.is_empty()),
            admin_token: lookup("VENUE_ADMIN_TOKEN").filter(|t| !t.is_empty()),
        };

        if let Some(base) = lookup("VENUE_RECONNECT_BASE_MS") {
            config.reconnect.base = parse_millis("VENUE_RECONNECT_BASE_MS", &base)?;
        }
        if let Some(max) = lookup("VENUE_RECONNECT_MAX_MS") {
            config.reconnect.max = parse_millis("VENUE_RECONNECT_MAX_MS", &max)?;
        }
        if config.reconnect.max < config.reconnect.base {
            return Err(ConfigError::InvalidBackoff {
                base_ms: config.reconnect.base.as_millis() as u64,
                max_ms: config.reconnect.max.as_millis() as u64,
            });
        }

        Ok(config)
    }
}

fn parse_url(field: &str, value: &str) -> Result<String, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field: field.to_string(),
        error: e.to_string(),
    })?;
    Ok(value.trim_end_matches('/').to_string())
}

fn parse_millis(field: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::InvalidNumber {
            field: field.to_string(),
            error: e.to_string(),
        })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid URL in {field}: {error}")]
    InvalidUrl { field: String, error: String },

    #[error("Invalid number in {field}: {error}")]
    InvalidNumber { field: String, error: String },

    #[error("Reconnect cap ({max_ms}ms) is below the base interval ({base_ms}ms)")]
    InvalidBackoff { base_ms: u64, max_ms: u64 },
}
