use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::errors::StreamError;

/// Chat/report question sent to the backend.
///
/// Serializes to the JSON body the chat endpoint expects.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReportRequest {
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    pub period: String,
    pub metrics: Vec<String>,
    #[serde(rename = "chartType")]
    pub chart_type: String,
    /// Existing chat session to continue; `null` starts a new one.
    pub session_id: Option<String>,
    /// `data:` URLs of attached images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64_images: Option<Vec<String>>,
    /// `data:` URLs of attached documents (PDF, CSV, spreadsheets, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64_files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64_audios: Option<Vec<String>>,
}

impl ReportRequest {
    /// Creates a request for all periods with a line chart context.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            company: None,
            period: "ALL".to_string(),
            metrics: Vec::new(),
            chart_type: "line".to_string(),
            session_id: None,
            base64_images: None,
            base64_files: None,
            base64_audios: None,
        }
    }

    /// Sets the company ticker. Accepts `EXCHANGE:TICKER` search values.
    pub fn company(mut self, search_value: &str) -> Self {
        let ticker = search_value
            .rsplit(':')
            .next()
            .unwrap_or(search_value)
            .trim()
            .to_uppercase();
        self.company = (!ticker.is_empty()).then_some(ticker);
        self
    }

    pub fn period(mut self, period: impl Into<String>) -> Self {
        self.period = period.into();
        self
    }

    pub fn metric(mut self, metric: impl Into<String>) -> Self {
        self.metrics.push(metric.into());
        self
    }

    pub fn chart_type(mut self, chart_type: impl Into<String>) -> Self {
        self.chart_type = chart_type.into();
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attaches a file as a `data:` URL, filed under images, audios or
    /// documents by its MIME type.
    pub fn attach(self, mime_type: &str, contents: &[u8]) -> Self {
        let mime_type = mime_type.trim().to_ascii_lowercase();
        let data_url = format!("data:{mime_type};base64,{}", BASE64.encode(contents));
        self.attach_data_url(&mime_type, data_url)
    }

    /// Attaches an already encoded `data:` URL.
    pub fn attach_data_url(mut self, mime_type: &str, data_url: impl Into<String>) -> Self {
        let mime_type = mime_type.trim().to_ascii_lowercase();
        let bucket = if mime_type.starts_with("image/") {
            &mut self.base64_images
        } else if mime_type.starts_with("audio/") {
            &mut self.base64_audios
        } else {
            &mut self.base64_files
        };
        bucket.get_or_insert_with(Vec::new).push(data_url.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), StreamError> {
        if self.question.trim().is_empty() {
            return Err(StreamError::Validation(
                "question must not be empty".into(),
            ));
        }
        if self.period.trim().is_empty() {
            return Err(StreamError::Validation("period must not be empty".into()));
        }
        Ok(())
    }
}
