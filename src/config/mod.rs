//! Configuration loaded from environment: the dispatcher server and the client broker.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::BrokerError;

/// Default WebSocket endpoint used by clients when none is configured.
pub const DEFAULT_WS_URL: &str = "ws://localhost:1738";
/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3000;
/// Default cap on consecutive reconnect attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Default bound on one connection attempt, TCP connect and WebSocket handshake together.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Server configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g. `0.0.0.0:1738`).
    pub server_addr: SocketAddr,
    /// Key required in `x-app-key` for the publishing endpoints.
    pub app_key: String,
    /// PostgreSQL connection URL. In-memory store when unset.
    pub database_url: Option<String>,
    /// Redis URL for cross-node fan-out. Single-node delivery when unset.
    pub redis_url: Option<String>,
    /// Shared secret of the identity provider's tokens. Tokens are ignored when unset.
    pub identity_jwt_secret: Option<String>,
    /// Endpoint of the notification delivery service. Log-only when unset.
    pub notify_url: Option<String>,
    /// Period of the trip/reservation watcher.
    pub poll_interval: Duration,
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let server_addr =
            std::env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:1738".to_string());
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|_| ConfigLoadError::InvalidServerAddr)?;

        let app_key = std::env::var("APP_KEY").unwrap_or_else(|_| "fleetcast_key".to_string());
        let database_url = optional_var("DATABASE_URL");
        let redis_url = optional_var("REDIS_URL");
        let identity_jwt_secret = optional_var("IDENTITY_JWT_SECRET");
        let notify_url = optional_var("NOTIFY_URL");
        let poll_interval_ms = match optional_var("POLL_INTERVAL_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| ConfigLoadError::InvalidNumber("POLL_INTERVAL_MS"))?,
            None => 5000,
        };
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            server_addr,
            app_key,
            database_url,
            redis_url,
            identity_jwt_secret,
            notify_url,
            poll_interval: Duration::from_millis(poll_interval_ms),
            log_level,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Invalid SERVER_ADDR")]
    InvalidServerAddr,
    #[error("Invalid number in {0}")]
    InvalidNumber(&'static str),
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn number_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, BrokerError> {
    match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| BrokerError::InvalidNumber { name, value: raw }),
        None => Ok(default),
    }
}

/// Client-side broker configuration.
///
/// Only the first configuration handed to [`crate::client::BrokerRegistry::get_instance`]
/// takes effect, so processes should agree on these values through the environment
/// rather than per call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// WebSocket endpoint of the dispatcher.
    pub url: String,
    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Consecutive reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Bound on a single attempt; an attempt that runs past it counts as failed.
    pub connect_timeout: Duration,
    /// Base URL of the HTTP API (for `/api/setup-trip-webhook`).
    pub api_url: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            api_url: None,
        }
    }
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_reconnect(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.reconnect_interval = interval;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = Some(api_url.into());
        self
    }

    /// Load from `FLEETCAST_*` variables.
    ///
    /// An unset `FLEETCAST_WS_URL` falls back to [`DEFAULT_WS_URL`]; a variable that is
    /// present but empty is a configuration error and disables the feature. Numeric
    /// variables fall back to their defaults only when unset; a value that does not
    /// parse is an error.
    pub fn from_env() -> Result<Self, BrokerError> {
        let url = match std::env::var("FLEETCAST_WS_URL") {
            Ok(v) if v.trim().is_empty() => return Err(BrokerError::MissingUrl),
            Ok(v) => v.trim().to_string(),
            Err(_) => DEFAULT_WS_URL.to_string(),
        };
        let reconnect_interval_ms =
            number_var("FLEETCAST_RECONNECT_INTERVAL_MS", DEFAULT_RECONNECT_INTERVAL_MS)?;
        let max_reconnect_attempts =
            number_var("FLEETCAST_MAX_RECONNECT_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS)?;
        let connect_timeout_ms =
            number_var("FLEETCAST_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)?;
        let api_url = optional_var("FLEETCAST_API_URL");

        let config = Self {
            url,
            reconnect_interval: Duration::from_millis(reconnect_interval_ms),
            max_reconnect_attempts,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            api_url,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that can never produce a connection.
    pub fn validate(&self) -> Result<(), BrokerError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(BrokerError::MissingUrl);
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(BrokerError::InvalidUrl(url.to_string()));
        }
        Ok(())
    }
}
