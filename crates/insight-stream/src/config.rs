use std::time::Duration;

use crate::errors::StreamError;

const DEFAULT_CHAT_PATH: &str = "/api/chat/";

/// Configuration for the HTTP report client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Backend origin, also used to resolve relative media paths.
    pub base_url: String,
    /// Path of the chat/report endpoint.
    pub chat_path: String,
    /// Bearer token for the `Authorization` header.
    pub bearer_token: Option<String>,
    /// Upper bound for establishing the TCP/TLS connection.
    pub connect_timeout: Duration,
    /// Optional upper bound for receiving response headers.
    ///
    /// Never applies once the body started streaming.
    pub response_timeout: Option<Duration>,
    pub user_agent: String,
}

impl ClientConfig {
    /// Creates a config for `base_url` with defaults for everything else.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            chat_path: DEFAULT_CHAT_PATH.to_string(),
            bearer_token: None,
            connect_timeout: Duration::from_secs(10),
            response_timeout: None,
            user_agent: format!("insight-stream/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Builds a config from the environment.
    ///
    /// - `INSIGHT_API_BASE_URL` (required)
    /// - `INSIGHT_API_TOKEN`
    /// - `INSIGHT_CHAT_PATH`
    /// - `INSIGHT_CONNECT_TIMEOUT_SECS`
    /// - `INSIGHT_RESPONSE_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, StreamError> {
        let base_url = std::env::var("INSIGHT_API_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(StreamError::Config(
                "missing INSIGHT_API_BASE_URL for report client".into(),
            ));
        }
        let mut config = Self::new(base_url.trim());
        if let Some(token) = non_empty_env("INSIGHT_API_TOKEN") {
            config = config.bearer_token(token);
        }
        if let Some(path) = non_empty_env("INSIGHT_CHAT_PATH") {
            config = config.chat_path(path);
        }
        if let Some(secs) = secs_env("INSIGHT_CONNECT_TIMEOUT_SECS")? {
            config = config.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = secs_env("INSIGHT_RESPONSE_TIMEOUT_SECS")? {
            config = config.response_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn chat_path(mut self, chat_path: impl Into<String>) -> Self {
        self.chat_path = chat_path.into();
        self
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Base URL without a trailing slash.
    pub fn media_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub(crate) fn chat_url(&self) -> String {
        let path = self.chat_path.trim_start_matches('/');
        format!("{}/{path}", self.media_base_url())
    }

    pub(crate) fn validate(&self) -> Result<(), StreamError> {
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(StreamError::Config(format!(
                "base_url must be an http(s) URL, got {base:?}"
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(StreamError::Config(
                "connect_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs_env(key: &str) -> Result<Option<u64>, StreamError> {
    match non_empty_env(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| StreamError::Config(format!("invalid {key}={raw:?}: {e}"))),
        None => Ok(None),
    }
}
