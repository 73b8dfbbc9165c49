use tracing::{debug, warn};

use crate::errors::StreamError;
use crate::figure_key::MediaKey;
use crate::media::{MediaRegistry, resolve_media_uri};
use crate::payload::{MediaPayload, Payload};
use crate::sse::RawEvent;
use crate::transcript::Transcript;

/// Effects of dispatching one event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchEffects {
    /// The transcript content changed.
    pub content_changed: bool,
    /// Keys newly added to the media registry.
    pub registered: Vec<MediaKey>,
    /// Session acknowledged by this event, if any.
    pub session: Option<SessionAck>,
}

/// A session event, with the id when the backend sent one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionAck {
    pub session_id: Option<String>,
}

/// Applies classified events to the per-request transcript and registry.
#[derive(Clone, Debug)]
pub struct EventDispatcher {
    base_url: String,
}

impl EventDispatcher {
    /// Creates a dispatcher resolving relative media paths against `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Classifies and applies one event. Each event is dispatched exactly once.
    pub fn dispatch(
        &self,
        event: &RawEvent,
        transcript: &mut Transcript,
        registry: &mut MediaRegistry,
    ) -> Result<DispatchEffects, StreamError> {
        let payload = Payload::classify(event);
        debug!(kind = payload.kind(), event_type = ?event.event_type, "dispatching SSE event");
        self.apply(payload, transcript, registry)
    }

    /// Applies an already classified payload.
    pub fn apply(
        &self,
        payload: Payload,
        transcript: &mut Transcript,
        registry: &mut MediaRegistry,
    ) -> Result<DispatchEffects, StreamError> {
        let mut effects = DispatchEffects::default();
        match payload {
            Payload::Session { session_id } => {
                effects.session = Some(SessionAck { session_id });
            }
            Payload::Token(text) | Payload::Text(text) => {
                transcript.append_content(&text)?;
                effects.content_changed = true;
            }
            Payload::Media(media) => {
                self.apply_media(media, transcript, registry, &mut effects)?;
            }
            Payload::Error(message) => {
                warn!(%message, "backend reported an in-band error");
                transcript.append_content(&error_annotation(&message))?;
                effects.content_changed = true;
            }
            Payload::Unknown(raw) => {
                debug!(payload = %raw, "ignoring unrecognized SSE payload");
            }
        }
        Ok(effects)
    }

    fn apply_media(
        &self,
        media: MediaPayload,
        transcript: &mut Transcript,
        registry: &mut MediaRegistry,
        effects: &mut DispatchEffects,
    ) -> Result<(), StreamError> {
        let Some(uri) = resolve_media_uri(media.reference.as_deref(), &self.base_url) else {
            warn!(alt = %media.alt, "media event without a usable reference");
            return Ok(());
        };
        if let Some(key) = media.key.as_deref() {
            effects.registered = registry.register(key, &uri);
        }
        transcript.append_content(&format!("![{}]({uri})", media.alt))?;
        effects.content_changed = true;
        Ok(())
    }
}

/// Markdown fragment appended for errors, in-band or terminal.
pub fn error_annotation(message: &str) -> String {
    format!("\n\n**Error:** {message}")
}
