use std::pin::Pin;

use crate::errors::StreamError;
use crate::request::ReportRequest;

/// Raw response body chunks. Read failures are reported as
/// `StreamError::Read`.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, StreamError>> + Send + 'static>>;

/// Response body returned by a `ReportSource` once the request was accepted.
pub enum SourceResponse {
    /// Chunked `text/event-stream` body.
    EventStream(ByteStream),
    /// Single JSON answer from backends that do not stream.
    Json(serde_json::Value),
}

impl std::fmt::Debug for SourceResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EventStream(_) => f.write_str("EventStream(..)"),
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
        }
    }
}

/// Opens the response body for a report request.
///
/// Implementations return `StreamError::Connection` when the request fails
/// before the body starts (network error, non-2xx status, header deadline).
#[async_trait::async_trait]
pub trait ReportSource: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Sends the request and returns the response body.
    async fn open(&self, request: &ReportRequest) -> Result<SourceResponse, StreamError>;

    /// Base URL used to resolve relative media paths.
    fn media_base_url(&self) -> &str;
}
