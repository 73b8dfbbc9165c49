use futures::StreamExt as _;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::StreamError;
use crate::request::ReportRequest;
use crate::source::{ByteStream, ReportSource, SourceResponse};

const HTTP_SOURCE: &str = "http";
const ERROR_EXCERPT_CHARS: usize = 200;

/// `ReportSource` that POSTs the request to the chat endpoint and streams the
/// response body.
pub struct HttpReportSource {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpReportSource {
    /// Creates a source from explicit client configuration.
    ///
    /// Only connection setup is bounded by a timeout; an open stream is read
    /// for as long as the backend keeps it open.
    pub fn new(config: ClientConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a source using `ClientConfig::from_env`.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn send(&self, request: &ReportRequest) -> Result<reqwest::Response, StreamError> {
        let mut http_req = self
            .client
            .post(self.config.chat_url())
            .header(ACCEPT, "text/event-stream, application/json")
            .json(request);
        if let Some(token) = self.config.bearer_token.as_deref() {
            http_req = http_req.bearer_auth(token);
        }

        let pending = http_req.send();
        let sent = match self.config.response_timeout {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                StreamError::connection(
                    format!("report request got no response within {limit:?}"),
                    None,
                )
            })?,
            None => pending.await,
        };
        sent.map_err(|e| {
            StreamError::connection(
                format!("report request failed: {e}"),
                e.status().map(|s| s.as_u16()),
            )
        })
    }
}

#[async_trait::async_trait]
impl ReportSource for HttpReportSource {
    fn name(&self) -> &str {
        HTTP_SOURCE
    }

    async fn open(&self, request: &ReportRequest) -> Result<SourceResponse, StreamError> {
        debug!(url = %self.config.chat_url(), company = ?request.company, "sending report request");
        let response = self.send(request).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            debug!(%status, %body, "report request rejected");
            return Err(StreamError::connection(
                format!(
                    "report request failed with status {status}: {}",
                    error_excerpt(&body)
                ),
                Some(status.as_u16()),
            ));
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.trim_start().starts_with("application/json"));
        if is_json {
            debug!(%status, "backend answered with a single JSON body");
            let body = response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| {
                    StreamError::connection(format!("report response body unreadable: {e}"), None)
                })?;
            return Ok(SourceResponse::Json(body));
        }

        let bytes: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| StreamError::read(format!("report stream read failed: {e}")))),
        );
        Ok(SourceResponse::EventStream(bytes))
    }

    fn media_base_url(&self) -> &str {
        self.config.media_base_url()
    }
}

/// Single-line prefix of an error body; the message ends up in the transcript.
fn error_excerpt(body: &str) -> String {
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(ERROR_EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}
