//! Classification of SSE payload shapes.
//!
//! Backends disagree on how they wrap text, figures and errors, so each
//! `RawEvent` is reduced to exactly one [`Payload`] by priority-ordered rules.

use serde_json::Value;

use crate::sse::RawEvent;

const DEFAULT_ALT: &str = "Report image";
const DEFAULT_ERROR: &str = "An error occurred";
const MEDIA_KINDS: [&str; 3] = ["image", "chart", "figure"];

/// Image, chart or figure announced out of band.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaPayload {
    /// Unresolved reference (`url ?? data ?? content`).
    pub reference: Option<String>,
    pub alt: String,
    /// Registry key (`key ?? id ?? alt ?? caption`).
    pub key: Option<String>,
}

/// Classified payload of one SSE event.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Session acknowledgement; never touches the transcript.
    Session { session_id: Option<String> },
    /// Incremental token fragment.
    Token(String),
    /// Text found by the untyped fallback rules.
    Text(String),
    Media(MediaPayload),
    /// In-band application error; the stream continues.
    Error(String),
    /// Unrecognized shape, kept for forward compatibility.
    Unknown(Value),
}

impl Payload {
    /// Classifies an event. The first matching rule wins.
    pub fn classify(event: &RawEvent) -> Self {
        let payload = &event.payload;
        let event_type = event.event_type.as_deref();
        let payload_type = payload.get("type").and_then(Value::as_str);

        if event.is_session() {
            return Self::Session {
                session_id: text_field(payload, "session_id"),
            };
        }

        if (event_type == Some("token") || payload_type == Some("token"))
            && let Some(content) = non_empty_str(payload, "content")
        {
            return Self::Token(content.to_string());
        }

        let is_media = [event_type, payload_type]
            .into_iter()
            .flatten()
            .any(|kind| MEDIA_KINDS.contains(&kind));
        let is_typed_error = event_type == Some("error") || payload_type == Some("error");

        if !is_media
            && !is_typed_error
            && let Some(text) = fallback_text(payload)
        {
            return Self::Text(text.to_string());
        }

        if is_media {
            return Self::Media(media_payload(payload));
        }

        if is_typed_error || is_error_shaped(payload) {
            return Self::Error(error_message(payload));
        }

        Self::Unknown(payload.clone())
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::Token(_) => "token",
            Self::Text(_) => "text",
            Self::Media(_) => "media",
            Self::Error(_) => "error",
            Self::Unknown(_) => "unknown",
        }
    }
}

const NO_ANSWER: &str = "Sorry, I didn't get a proper response from the server.";

/// Extracts the answer from a non-streamed JSON response body.
pub fn final_answer(body: &Value) -> String {
    if let Some(text) = body.as_str().filter(|t| !t.is_empty()) {
        return text.to_string();
    }
    body.get("data")
        .and_then(|data| non_empty_str(data, "final_text_answer"))
        .or_else(|| {
            ["answer", "data", "result", "message", "error"]
                .into_iter()
                .find_map(|field| non_empty_str(body, field))
        })
        .unwrap_or(NO_ANSWER)
        .to_string()
}

fn fallback_text(payload: &Value) -> Option<&str> {
    if let Some(text) = payload.as_str() {
        return (!text.is_empty()).then_some(text);
    }
    ["content", "answer", "data"]
        .into_iter()
        .find_map(|field| non_empty_str(payload, field))
}

fn media_payload(payload: &Value) -> MediaPayload {
    let reference = first_text(payload, &["url", "data", "content"]);
    let alt = first_text(payload, &["alt", "caption", "id", "key"])
        .unwrap_or_else(|| DEFAULT_ALT.to_string());
    let key = first_text(payload, &["key", "id", "alt", "caption"]);
    MediaPayload {
        reference,
        alt,
        key,
    }
}

fn is_error_shaped(payload: &Value) -> bool {
    if payload.get("error").is_some_and(is_truthy) {
        return true;
    }
    let success = payload.get("success").is_some_and(is_truthy);
    !success && payload.get("detail").is_some_and(is_truthy)
}

fn error_message(payload: &Value) -> String {
    let error = payload.get("error");
    let detail = payload.get("detail");
    error
        .and_then(Value::as_str)
        .or_else(|| error.and_then(|e| e.get("message")).and_then(Value::as_str))
        .or_else(|| detail.and_then(|d| d.get("error")).and_then(Value::as_str))
        .or_else(|| detail.and_then(Value::as_str))
        .or_else(|| payload.get("message").and_then(Value::as_str))
        .filter(|message| !message.trim().is_empty())
        .unwrap_or(DEFAULT_ERROR)
        .to_string()
}

fn non_empty_str<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Strings and numbers (figure ids are sometimes numeric).
fn text_field(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_text(payload: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| text_field(payload, field))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
