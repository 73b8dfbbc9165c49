//! Streaming response assembler for AI-generated chat and report answers.
//!
//! A report answer arrives as Server-Sent Events over a chunked HTTP body.
//! This crate frames the byte stream into events, classifies the payload
//! shapes different backends emit, grows the assistant message of a
//! conversation transcript, and resolves `[fig_description-KEY]` placeholders
//! against image events received out of band.
//!
//! # Streaming a report
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use insight_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let source = HttpReportSource::new(
//!     ClientConfig::new("https://api.example.com").bearer_token("token"),
//! )?;
//! let assembler = Assembler::new(Arc::new(source));
//!
//! let mut stream = assembler
//!     .request(ReportRequest::new("How did revenue grow?").company("NASDAQ:AAPL"))
//!     .start_stream()
//!     .await?;
//!
//! while let Some(event) = stream.next_event().await {
//!     if let AssemblyEvent::ContentUpdated { content, .. } = event {
//!         println!("{content}");
//!     }
//! }
//!
//! let outcome = stream.finish().await?;
//! println!("{}", outcome.rendered_content().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

/// Per-request run: state machine, event channel and cancellation.
pub mod assembly;
/// HTTP client configuration.
pub mod config;
/// Applies classified events to the transcript and media registry.
pub mod dispatch;
/// Public error types.
pub mod errors;
/// Figure key normalization and candidate generation.
pub mod figure_key;
/// reqwest-backed report source.
pub mod http;
/// Media URI resolution and the per-request media registry.
pub mod media;
/// Process-wide logging setup.
pub mod observability;
/// Payload shape classification.
pub mod payload;
/// Inline figure placeholder resolution.
pub mod placeholder;
/// Common imports for typical usage.
pub mod prelude;
/// Report request body.
pub mod request;
/// Source contract for opening response bodies.
pub mod source;
/// SSE framing.
pub mod sse;
/// Conversation transcript.
pub mod transcript;

pub use assembly::{
    AbortHandle, Assembler, AssemblyBuilder, AssemblyEvent, AssemblyOutcome, AssemblyStream,
    StreamState,
};
pub use config::ClientConfig;
pub use dispatch::{DispatchEffects, EventDispatcher, SessionAck};
pub use errors::{StreamError, StreamFailure};
pub use figure_key::{MediaKey, candidates, normalize};
pub use http::HttpReportSource;
pub use media::{MediaRegistry, resolve_media_uri};
pub use payload::{MediaPayload, Payload};
pub use placeholder::resolve_placeholders;
pub use request::ReportRequest;
pub use source::{ByteStream, ReportSource, SourceResponse};
pub use sse::{RawEvent, SseFramer, raw_event_stream};
pub use transcript::{Message, Role, THINKING_PLACEHOLDER, Transcript};
