//! Configuration for the sync engine.

use std::time::Duration;

use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::presence::Participant;

/// Default WebSocket endpoint of the session relay.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8080/ws";

/// Default base URL of the session REST collaborator.
pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";

/// Configuration for one client session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket endpoint; session and participant are appended as query parameters.
    pub server_url: String,
    /// REST base used by session bootstrap (`/sessions`, `/sessions/{id}`).
    pub api_url: String,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Timeout for bootstrap requests.
    pub request_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration for the given endpoints with default backoff.
    pub fn new(server_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_url: api_url.into(),
            backoff: BackoffConfig::default(),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Reads the configuration from the environment.
    ///
    /// - `CODESTREAM_WS_URL`
    /// - `CODESTREAM_API_URL`
    /// - `CODESTREAM_BACKOFF_INITIAL_MS`
    /// - `CODESTREAM_BACKOFF_MAX_MS`
    ///
    /// Unset variables fall back to the defaults.
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("CODESTREAM_WS_URL") {
            config.server_url = url;
        }
        if let Ok(url) = std::env::var("CODESTREAM_API_URL") {
            config.api_url = url;
        }
        if let Some(ms) = env_millis("CODESTREAM_BACKOFF_INITIAL_MS")? {
            config.backoff.initial_delay = ms;
        }
        if let Some(ms) = env_millis("CODESTREAM_BACKOFF_MAX_MS")? {
            config.backoff.max_delay = ms;
        }
        Ok(config)
    }

    /// Sets the WebSocket endpoint.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    /// Sets the REST base URL.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the bootstrap request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builds the transport URL for a session membership.
    ///
    /// The participant descriptor travels as query parameters. They are
    /// informational only; authorization happens upstream.
    pub fn session_url(&self, session_id: &str, participant: &Participant) -> SyncResult<Url> {
        let mut url = Url::parse(&self.server_url)?;
        url.query_pairs_mut()
            .append_pair("session", session_id)
            .append_pair("user_id", &participant.id)
            .append_pair("user_name", &participant.name)
            .append_pair("user_email", &participant.email)
            .append_pair("user_color", &participant.color)
            .append_pair("user_image", &participant.image_url);
        Ok(url)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_URL, DEFAULT_API_URL)
    }
}

/// Reconnect backoff: `min(initial * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    /// Delay to wait before reconnect attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(10_000))
    }
}

fn env_millis(name: &str) -> SyncResult<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| SyncError::Config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
