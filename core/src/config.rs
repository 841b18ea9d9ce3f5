//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stream::Framing;

pub const DEFAULT_BASE_URL: &str = "https://api.twitter.com/1.1";
pub const DEFAULT_STREAM_URL: &str = "https://stream.twitter.com/1.1";

/// Settings for a `Client`. Every field has a default, so a partial JSON or
/// TOML document deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Base URL for streaming endpoints.
    pub stream_url: String,
    /// Appended to every endpoint path, e.g. `.json`.
    pub format_suffix: String,
    pub user_agent: String,
    /// Size of the async worker pool.
    pub workers: usize,
    pub connect_timeout_ms: u64,
    /// Deadline for one-shot exchanges. Streams have none.
    pub request_timeout_ms: u64,
    /// Sleep between polls of a blocking stream iterator.
    pub stream_poll_ms: u64,
    pub framing: Framing,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
            format_suffix: ".json".to_string(),
            user_agent: concat!("chirp/", env!("CARGO_PKG_VERSION")).to_string(),
            workers: 2,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            stream_poll_ms: 50,
            framing: Framing::Lines,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `CHIRP_BASE_URL`, `CHIRP_STREAM_URL` and
    /// `CHIRP_WORKERS` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("CHIRP_BASE_URL") {
            config = config.with_base_url(url);
        }
        if let Ok(url) = std::env::var("CHIRP_STREAM_URL") {
            config = config.with_stream_url(url);
        }
        if let Some(workers) = std::env::var("CHIRP_WORKERS")
            .ok()
            .and_then(|w| w.trim().parse().ok())
        {
            config = config.with_workers(workers);
        }
        config
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_format_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.format_suffix = suffix.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_stream_poll(mut self, interval: Duration) -> Self {
        self.stream_poll_ms = interval.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stream_poll(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms.max(1))
    }
}
