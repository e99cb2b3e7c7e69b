//! Engine configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the engine can run against a
//! local backend with zero configuration.

use std::time::Duration;

use parlor_shared::constants::{
    DEFAULT_PAGE_SIZE, POLL_INTERVAL_SECS, POLL_WINDOW_SIZE, RECONNECT_DELAY_SECS, TYPING_TTL_SECS,
};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the HTTP API.
    /// Env: `PARLOR_API_URL`
    /// Default: `http://localhost:8080`
    pub api_url: String,

    /// WebSocket URL of the push channel.
    /// Env: `PARLOR_PUSH_URL`
    /// Default: `ws://localhost:8080/ws/chat`
    pub push_url: String,

    /// Bearer token presented to both the HTTP API and the push channel.
    /// Env: `PARLOR_TOKEN`
    /// Default: none (unauthenticated, requests fail locally).
    pub token: Option<String>,

    /// Messages fetched per history page.
    /// Env: `PARLOR_PAGE_SIZE`
    /// Default: `50`
    pub page_size: u32,

    /// Messages fetched per fallback poll pass.
    pub poll_window: u32,

    /// Delay between fallback poll passes for the active chat.
    /// Env: `PARLOR_POLL_INTERVAL_SECS`
    /// Default: `10`
    pub poll_interval: Duration,

    /// Fixed delay before a push channel reconnect attempt.
    pub reconnect_delay: Duration,

    /// How long a typing indicator stays live without a refresh.
    pub typing_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            push_url: "ws://localhost:8080/ws/chat".to_string(),
            token: None,
            page_size: DEFAULT_PAGE_SIZE,
            poll_window: POLL_WINDOW_SIZE,
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            typing_ttl: Duration::from_secs(TYPING_TTL_SECS),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PARLOR_API_URL") {
            config.api_url = url;
        }

        if let Ok(url) = std::env::var("PARLOR_PUSH_URL") {
            config.push_url = url;
        }

        if let Ok(token) = std::env::var("PARLOR_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }

        if let Ok(val) = std::env::var("PARLOR_PAGE_SIZE") {
            if let Ok(n) = val.parse::<u32>() {
                config.page_size = n;
            } else {
                tracing::warn!(value = %val, "Invalid PARLOR_PAGE_SIZE, using default");
            }
        }

        if let Ok(val) = std::env::var("PARLOR_POLL_INTERVAL_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.poll_interval = Duration::from_secs(n);
            } else {
                tracing::warn!(value = %val, "Invalid PARLOR_POLL_INTERVAL_SECS, using default");
            }
        }

        // RUST_LOG goes straight to the EnvFilter in init_tracing and is
        // not part of this struct.

        config
    }
}
