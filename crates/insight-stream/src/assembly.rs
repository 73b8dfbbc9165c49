use std::fmt;
use std::sync::Arc;

use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::dispatch::{DispatchEffects, EventDispatcher, error_annotation};
use crate::errors::{StreamError, StreamFailure, failure_from_stream_error};
use crate::figure_key::MediaKey;
use crate::media::MediaRegistry;
use crate::payload;
use crate::placeholder::resolve_placeholders;
use crate::request::ReportRequest;
use crate::source::{ByteStream, ReportSource, SourceResponse};
use crate::sse::raw_event_stream;
use crate::transcript::{Message, Transcript};

const DEFAULT_EVENT_BUFFER: usize = 64;

/// Lifecycle of one generation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live updates published while a response is assembled.
#[derive(Clone, Debug, PartialEq)]
pub enum AssemblyEvent {
    StateChanged {
        request_id: uuid::Uuid,
        state: StreamState,
    },
    /// The backend acknowledged (or assigned) a chat session.
    SessionAcknowledged {
        request_id: uuid::Uuid,
        session_id: Option<String>,
    },
    /// Snapshot of the assistant message after a mutation.
    ContentUpdated {
        request_id: uuid::Uuid,
        seq: u64,
        content: String,
    },
    MediaRegistered {
        request_id: uuid::Uuid,
        key: MediaKey,
        uri: String,
    },
    /// Terminal success.
    Completed { request_id: uuid::Uuid },
    /// Terminal failure with a human-readable reason.
    Failed {
        request_id: uuid::Uuid,
        failure: StreamFailure,
    },
}

impl AssemblyEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Everything a request produced, handed to the caller once it reached
/// `Completed` or `Failed`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AssemblyOutcome {
    pub request_id: uuid::Uuid,
    pub state: StreamState,
    pub transcript: Transcript,
    pub media: MediaRegistry,
    pub session_id: Option<String>,
    pub failure: Option<StreamFailure>,
}

impl AssemblyOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == StreamState::Completed
    }

    /// Raw assistant markdown, placeholders untouched.
    pub fn content(&self) -> Option<&str> {
        self.transcript.assistant_content()
    }

    /// Assistant markdown with every resolvable figure placeholder replaced.
    pub fn rendered_content(&self) -> Option<String> {
        self.content()
            .map(|content| resolve_placeholders(content, &self.media).into_owned())
    }
}

/// Handle used to abandon a running request.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// The run releases the response body and ends with
    /// `StreamFailure::Cancelled`.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Entry point that runs report requests against one source.
#[derive(Clone)]
pub struct Assembler {
    source: Arc<dyn ReportSource>,
}

impl Assembler {
    pub fn new(source: Arc<dyn ReportSource>) -> Self {
        Self { source }
    }

    /// Starts building an assembly for `request`.
    pub fn request(&self, request: ReportRequest) -> AssemblyBuilder {
        AssemblyBuilder {
            source: self.source.clone(),
            request,
            history: Vec::new(),
            event_buffer_capacity: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Builder for a single streamed request.
pub struct AssemblyBuilder {
    source: Arc<dyn ReportSource>,
    request: ReportRequest,
    history: Vec<Message>,
    event_buffer_capacity: usize,
}

impl AssemblyBuilder {
    /// Earlier conversation placed ahead of the new question.
    pub fn history(mut self, messages: Vec<Message>) -> Self {
        self.history = messages;
        self
    }

    /// Sets the bounded buffer between the run task and the consumer.
    pub fn event_buffer_capacity(mut self, capacity: usize) -> Self {
        self.event_buffer_capacity = capacity;
        self
    }

    /// Validates the request and starts the run task.
    pub async fn start_stream(self) -> Result<AssemblyStream, StreamError> {
        self.request.validate()?;
        if self.event_buffer_capacity == 0 {
            return Err(StreamError::Validation(
                "event_buffer_capacity must be greater than 0".into(),
            ));
        }

        let mut transcript = Transcript::from_messages(self.history);
        transcript.begin_turn(self.request.question.clone());

        let request_id = uuid::Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.event_buffer_capacity);
        let (final_tx, final_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = watch::channel(false);

        let run = Run {
            request_id,
            state: StreamState::Idle,
            transcript,
            registry: MediaRegistry::new(),
            session_id: self.request.session_id.clone(),
            seq: 0,
            tx,
        };
        tokio::spawn(assembly_task(
            self.source,
            self.request,
            run,
            final_tx,
            abort_rx,
        ));

        Ok(AssemblyStream {
            request_id,
            rx,
            final_rx,
            abort_handle: AbortHandle { tx: abort_tx },
            saw_terminal: false,
        })
    }

    /// Runs to a terminal state and returns the outcome.
    pub async fn collect(self) -> Result<AssemblyOutcome, StreamError> {
        self.start_stream().await?.finish().await
    }
}

/// Streaming handle returned by `AssemblyBuilder::start_stream`.
///
/// Dropping it abandons the request; the response body is released either way.
pub struct AssemblyStream {
    request_id: uuid::Uuid,
    rx: mpsc::Receiver<AssemblyEvent>,
    final_rx: oneshot::Receiver<Result<AssemblyOutcome, StreamError>>,
    abort_handle: AbortHandle,
    saw_terminal: bool,
}

impl AssemblyStream {
    pub fn request_id(&self) -> uuid::Uuid {
        self.request_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Waits for the next event. Returns `None` once the channel closed.
    pub async fn next_event(&mut self) -> Option<AssemblyEvent> {
        let event = self.rx.recv().await;
        if event.as_ref().is_some_and(AssemblyEvent::is_terminal) {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events and returns the outcome.
    ///
    /// `Ok` is returned for both `Completed` and `Failed` runs so partial
    /// transcripts can be persisted; check `AssemblyOutcome::failure`.
    pub async fn finish(mut self) -> Result<AssemblyOutcome, StreamError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(event) if event.is_terminal() => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }

        match self.final_rx.await {
            Ok(result) => result,
            Err(_) => Err(StreamError::protocol_msg(format!(
                "assembly task ended without an outcome (request_id={})",
                self.request_id
            ))),
        }
    }
}

/// Per-request state owned by the run task.
struct Run {
    request_id: uuid::Uuid,
    state: StreamState,
    transcript: Transcript,
    registry: MediaRegistry,
    session_id: Option<String>,
    seq: u64,
    tx: mpsc::Sender<AssemblyEvent>,
}

/// The consumer dropped the stream.
struct ConsumerGone;

impl Run {
    async fn emit(&self, event: AssemblyEvent) -> Result<(), ConsumerGone> {
        self.tx.send(event).await.map_err(|_| ConsumerGone)
    }

    async fn transition(&mut self, state: StreamState) -> Result<(), ConsumerGone> {
        debug!(request_id = %self.request_id, from = %self.state, to = %state, "stream state transition");
        self.state = state;
        self.emit(AssemblyEvent::StateChanged {
            request_id: self.request_id,
            state,
        })
        .await
    }

    async fn publish(&mut self, effects: DispatchEffects) -> Result<(), ConsumerGone> {
        let request_id = self.request_id;
        if let Some(ack) = effects.session {
            if ack.session_id.is_some() {
                self.session_id = ack.session_id.clone();
            }
            self.emit(AssemblyEvent::SessionAcknowledged {
                request_id,
                session_id: ack.session_id,
            })
            .await?;
        }
        for key in effects.registered {
            let Some(uri) = self.registry.get(&key).map(ToOwned::to_owned) else {
                continue;
            };
            self.emit(AssemblyEvent::MediaRegistered {
                request_id,
                key,
                uri,
            })
            .await?;
        }
        if effects.content_changed {
            self.publish_content().await?;
        }
        Ok(())
    }

    async fn publish_content(&mut self) -> Result<(), ConsumerGone> {
        let content = self
            .transcript
            .assistant_content()
            .unwrap_or_default()
            .to_string();
        let seq = self.seq;
        self.seq = self.seq.saturating_add(1);
        debug!(request_id = %self.request_id, seq, content_len = content.len(), "assistant content updated");
        self.emit(AssemblyEvent::ContentUpdated {
            request_id: self.request_id,
            seq,
            content,
        })
        .await
    }

    async fn complete(mut self, final_tx: oneshot::Sender<Result<AssemblyOutcome, StreamError>>) {
        if self.transition(StreamState::Completed).await.is_err() {
            return;
        }
        let _ = self
            .emit(AssemblyEvent::Completed {
                request_id: self.request_id,
            })
            .await;
        let _ = final_tx.send(Ok(self.into_outcome(None)));
    }

    async fn fail(
        mut self,
        failure: StreamFailure,
        final_tx: oneshot::Sender<Result<AssemblyOutcome, StreamError>>,
    ) {
        warn!(request_id = %self.request_id, state = %self.state, reason = %failure, "report stream failed");
        if failure.annotates_transcript() {
            match self
                .transcript
                .append_content(&error_annotation(&failure.to_string()))
            {
                Ok(()) => {
                    let _ = self.publish_content().await;
                }
                Err(err) => warn!(request_id = %self.request_id, error = %err, "could not annotate transcript"),
            }
        }
        let _ = self.transition(StreamState::Failed).await;
        let _ = self
            .emit(AssemblyEvent::Failed {
                request_id: self.request_id,
                failure: failure.clone(),
            })
            .await;
        let _ = final_tx.send(Ok(self.into_outcome(Some(failure))));
    }

    fn into_outcome(self, failure: Option<StreamFailure>) -> AssemblyOutcome {
        AssemblyOutcome {
            request_id: self.request_id,
            state: self.state,
            transcript: self.transcript,
            media: self.registry,
            session_id: self.session_id,
            failure,
        }
    }
}

/// Resolves once the caller aborted or every abort handle was dropped.
///
/// A dropped `AssemblyStream` is noticed separately through the closed event
/// channel, since abort handles can outlive it.
async fn abandoned(abort_rx: &mut watch::Receiver<bool>) {
    let _ = abort_rx.wait_for(|aborted| *aborted).await;
}

async fn assembly_task(
    source: Arc<dyn ReportSource>,
    request: ReportRequest,
    mut run: Run,
    final_tx: oneshot::Sender<Result<AssemblyOutcome, StreamError>>,
    mut abort_rx: watch::Receiver<bool>,
) {
    if run.transition(StreamState::Connecting).await.is_err() {
        return;
    }
    debug!(request_id = %run.request_id, source = source.name(), "opening report stream");

    let opened = tokio::select! {
        biased;
        _ = abandoned(&mut abort_rx) => {
            run.fail(StreamFailure::Cancelled, final_tx).await;
            return;
        }
        _ = run.tx.closed() => {
            debug!(request_id = %run.request_id, "consumer dropped while connecting");
            return;
        }
        opened = source.open(&request) => opened,
    };

    let response = match opened {
        Ok(response) => response,
        Err(err) => {
            run.fail(failure_from_stream_error(&err), final_tx).await;
            return;
        }
    };
    if run.transition(StreamState::Streaming).await.is_err() {
        return;
    }

    let dispatcher = EventDispatcher::new(source.media_base_url());
    match response {
        SourceResponse::Json(body) => apply_json_answer(run, &body, final_tx).await,
        SourceResponse::EventStream(bytes) => {
            stream_events(run, &dispatcher, bytes, final_tx, abort_rx).await;
        }
    }
}

async fn stream_events(
    mut run: Run,
    dispatcher: &EventDispatcher,
    bytes: ByteStream,
    final_tx: oneshot::Sender<Result<AssemblyOutcome, StreamError>>,
    mut abort_rx: watch::Receiver<bool>,
) {
    let mut events = Box::pin(raw_event_stream(bytes));
    loop {
        tokio::select! {
            biased;
            _ = abandoned(&mut abort_rx) => {
                drop(events);
                run.fail(StreamFailure::Cancelled, final_tx).await;
                return;
            }
            _ = run.tx.closed() => {
                debug!(request_id = %run.request_id, "consumer dropped, releasing report stream");
                return;
            }
            next = events.next() => match next {
                Some(Ok(event)) => {
                    let effects = match dispatcher.dispatch(&event, &mut run.transcript, &mut run.registry) {
                        Ok(effects) => effects,
                        Err(err) => {
                            drop(events);
                            run.fail(failure_from_stream_error(&err), final_tx).await;
                            return;
                        }
                    };
                    if run.publish(effects).await.is_err() {
                        debug!(request_id = %run.request_id, "consumer dropped, releasing report stream");
                        return;
                    }
                }
                Some(Err(err)) => {
                    drop(events);
                    run.fail(failure_from_stream_error(&err), final_tx).await;
                    return;
                }
                None => {
                    drop(events);
                    run.complete(final_tx).await;
                    return;
                }
            }
        }
    }
}

async fn apply_json_answer(
    mut run: Run,
    body: &serde_json::Value,
    final_tx: oneshot::Sender<Result<AssemblyOutcome, StreamError>>,
) {
    let mut effects = DispatchEffects::default();
    if let Some(session_id) = body.get("session_id").and_then(serde_json::Value::as_str) {
        effects.session = Some(crate::dispatch::SessionAck {
            session_id: Some(session_id.to_string()),
        });
    }
    if let Err(err) = run.transcript.append_content(&payload::final_answer(body)) {
        run.fail(failure_from_stream_error(&err), final_tx).await;
        return;
    }
    effects.content_changed = true;
    if run.publish(effects).await.is_err() {
        return;
    }
    run.complete(final_tx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Role;
    use futures::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const BASE: &str = "https://api.example.com";

    enum FakeBehavior {
        ConnectError(StreamError),
        Chunks(Vec<Result<&'static [u8], StreamError>>),
        Json(serde_json::Value),
        Pending,
    }

    struct FakeSource {
        behavior: FakeBehavior,
        opens: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    impl FakeSource {
        fn new(behavior: FakeBehavior) -> Self {
            Self {
                behavior,
                opens: Arc::new(AtomicUsize::new(0)),
                released: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    /// Sets a flag when the body stream is dropped.
    struct ReleaseGuard(Arc<AtomicBool>);

    impl Drop for ReleaseGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl ReportSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn open(&self, _request: &ReportRequest) -> Result<SourceResponse, StreamError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let guard = ReleaseGuard(self.released.clone());
            match &self.behavior {
                FakeBehavior::ConnectError(err) => Err(err.clone()),
                FakeBehavior::Json(value) => Ok(SourceResponse::Json(value.clone())),
                FakeBehavior::Chunks(chunks) => {
                    let items: Vec<Result<bytes::Bytes, StreamError>> = chunks
                        .iter()
                        .map(|c| c.clone().map(bytes::Bytes::from_static))
                        .collect();
                    let body = stream::iter(items).map(move |item| {
                        let _held = &guard;
                        item
                    });
                    Ok(SourceResponse::EventStream(Box::pin(body)))
                }
                FakeBehavior::Pending => {
                    let body = stream::pending::<Result<bytes::Bytes, StreamError>>().map(
                        move |item| {
                            let _held = &guard;
                            item
                        },
                    );
                    Ok(SourceResponse::EventStream(Box::pin(body)))
                }
            }
        }

        fn media_base_url(&self) -> &str {
            BASE
        }
    }

    fn chunks(parts: &[&'static str]) -> FakeBehavior {
        FakeBehavior::Chunks(parts.iter().map(|p| Ok(p.as_bytes())).collect())
    }

    async fn collect(behavior: FakeBehavior) -> AssemblyOutcome {
        Assembler::new(Arc::new(FakeSource::new(behavior)))
            .request(ReportRequest::new("How is AAPL doing?"))
            .collect()
            .await
            .expect("outcome")
    }

    #[tokio::test]
    async fn token_stream_completes_with_concatenated_content() {
        let outcome = collect(chunks(&[
            "event: session\ndata: {\"session_id\":\"s-1\"}\n\n",
            "event: token\ndata: {\"type\":\"token\",\"content\":\"H\"}\n\nevent: token\ndata: {\"type\":\"to",
            "ken\",\"content\":\"e\"}\n\ndata: {\"type\":\"token\",\"content\":\"l\"}\n",
            "data: {\"type\":\"token\",\"content\":\"l\"}\ndata: {\"type\":\"token\",\"content\":\"o\"}\n\ndata: [DONE]\n\n",
        ]))
        .await;
        assert_eq!(outcome.state, StreamState::Completed);
        assert_eq!(outcome.content(), Some("Hello"));
        assert_eq!(outcome.session_id.as_deref(), Some("s-1"));
        assert_eq!(outcome.failure, None);
        assert_eq!(outcome.transcript.messages()[0].role, Role::User);
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_without_failing() {
        let outcome = collect(chunks(&["data: \"foo\"\ndata: {broken\ndata: \"bar\"\n"])).await;
        assert!(outcome.is_completed());
        assert_eq!(outcome.content(), Some("foobar"));
    }

    #[tokio::test]
    async fn image_event_resolves_later_placeholder() {
        let outcome = collect(chunks(&[
            "data: {\"type\":\"image\",\"url\":\"/charts/x.png\",\"key\":\"Fig A\"}\n\n",
            "data: {\"content\":\"\\n\\nAs shown in [fig_description-fig a].\"}\n\n",
        ]))
        .await;
        let raw = outcome.content().expect("content");
        assert!(raw.starts_with("![Fig A](https://api.example.com/charts/x.png)"));
        let rendered = outcome.rendered_content().expect("rendered");
        assert!(!rendered.contains("[fig_description-"));
        assert!(rendered.contains("![fig a](https://api.example.com/charts/x.png)"));
    }

    #[tokio::test]
    async fn in_band_error_on_placeholder_replaces_it_and_completes() {
        let outcome = collect(chunks(&["data: {\"error\":\"rate limited\"}\n\n"])).await;
        assert_eq!(outcome.state, StreamState::Completed);
        assert_eq!(outcome.content(), Some("\n\n**Error:** rate limited"));
    }

    #[tokio::test]
    async fn connection_error_fails_and_annotates() {
        let outcome = collect(FakeBehavior::ConnectError(StreamError::connection(
            "report request failed with status 503",
            Some(503),
        )))
        .await;
        assert_eq!(outcome.state, StreamState::Failed);
        assert!(matches!(
            outcome.failure,
            Some(StreamFailure::Connection {
                status_code: Some(503),
                ..
            })
        ));
        assert_eq!(
            outcome.content(),
            Some("\n\n**Error:** report request failed with status 503")
        );
    }

    #[tokio::test]
    async fn read_error_keeps_earlier_tokens() {
        let outcome = collect(FakeBehavior::Chunks(vec![
            Ok(b"data: {\"type\":\"token\",\"content\":\"partial\"}\n".as_slice()),
            Err(StreamError::read("connection reset")),
        ]))
        .await;
        assert_eq!(outcome.state, StreamState::Failed);
        assert_eq!(
            outcome.content(),
            Some("partial\n\n**Error:** connection reset")
        );
    }

    #[tokio::test]
    async fn json_fallback_appends_answer_and_completes() {
        let outcome = collect(FakeBehavior::Json(json!({
            "answer": "Revenue grew 8%.",
            "session_id": "s-2"
        })))
        .await;
        assert!(outcome.is_completed());
        assert_eq!(outcome.content(), Some("Revenue grew 8%."));
        assert_eq!(outcome.session_id.as_deref(), Some("s-2"));
    }

    #[tokio::test]
    async fn events_follow_state_machine_order() {
        let mut stream = Assembler::new(Arc::new(FakeSource::new(chunks(&[
            "data: {\"type\":\"token\",\"content\":\"a\"}\n",
            "data: {\"type\":\"image\",\"url\":\"https://x/y.png\",\"key\":\"K\"}\n",
        ]))))
        .request(ReportRequest::new("q"))
        .start_stream()
        .await
        .expect("start");

        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        let id = stream.request_id();
        let states: Vec<StreamState> = events
            .iter()
            .filter_map(|e| match e {
                AssemblyEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                StreamState::Connecting,
                StreamState::Streaming,
                StreamState::Completed
            ]
        );
        let seqs: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                AssemblyEvent::ContentUpdated { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1]);
        assert!(events.iter().any(|e| matches!(
            e,
            AssemblyEvent::MediaRegistered { key, uri, .. }
                if key.as_str() == "k" && uri == "https://x/y.png"
        )));
        assert_eq!(events.last(), Some(&AssemblyEvent::Completed { request_id: id }));
        assert!(stream.finish().await.expect("finish").is_completed());
    }

    #[tokio::test]
    async fn abort_releases_body_and_fails_without_annotation() {
        let source = FakeSource::new(FakeBehavior::Pending);
        let released = source.released.clone();
        let mut stream = Assembler::new(Arc::new(source))
            .request(ReportRequest::new("q"))
            .start_stream()
            .await
            .expect("start");

        loop {
            match stream.next_event().await {
                Some(AssemblyEvent::StateChanged {
                    state: StreamState::Streaming,
                    ..
                }) => break,
                Some(_) => {}
                None => panic!("stream closed early"),
            }
        }
        stream.abort_handle().abort();

        let outcome = stream.finish().await.expect("finish");
        assert_eq!(outcome.state, StreamState::Failed);
        assert_eq!(outcome.failure, Some(StreamFailure::Cancelled));
        assert_eq!(outcome.content(), Some("Thinking..."));
        assert!(released.load(Ordering::SeqCst));
    }

    async fn wait_for_release(released: &AtomicBool) -> bool {
        for _ in 0..100 {
            if released.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        released.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn dropping_stream_releases_idle_body_while_abort_handle_lives() {
        let source = FakeSource::new(FakeBehavior::Pending);
        let released = source.released.clone();
        let mut stream = Assembler::new(Arc::new(source))
            .request(ReportRequest::new("q"))
            .start_stream()
            .await
            .expect("start");

        loop {
            match stream.next_event().await {
                Some(AssemblyEvent::StateChanged {
                    state: StreamState::Streaming,
                    ..
                }) => break,
                Some(_) => {}
                None => panic!("stream closed early"),
            }
        }
        let kept = stream.abort_handle();
        drop(stream);

        assert!(wait_for_release(&released).await);
        drop(kept);
    }

    struct NeverConnects {
        dropped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ReportSource for NeverConnects {
        fn name(&self) -> &str {
            "never"
        }

        async fn open(&self, _request: &ReportRequest) -> Result<SourceResponse, StreamError> {
            let _guard = ReleaseGuard(self.dropped.clone());
            futures::future::pending::<()>().await;
            Err(StreamError::protocol_msg("unreachable"))
        }

        fn media_base_url(&self) -> &str {
            BASE
        }
    }

    #[tokio::test]
    async fn dropping_stream_while_connecting_cancels_the_open() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut stream = Assembler::new(Arc::new(NeverConnects {
            dropped: dropped.clone(),
        }))
        .request(ReportRequest::new("q"))
        .start_stream()
        .await
        .expect("start");

        assert!(matches!(
            stream.next_event().await,
            Some(AssemblyEvent::StateChanged {
                state: StreamState::Connecting,
                ..
            })
        ));
        let kept = stream.abort_handle();
        drop(stream);

        assert!(wait_for_release(&dropped).await);
        drop(kept);
    }

    #[tokio::test]
    async fn blank_question_is_rejected_before_opening() {
        let source = FakeSource::new(chunks(&[]));
        let opens = source.opens.clone();
        let result = Assembler::new(Arc::new(source))
            .request(ReportRequest::new(" "))
            .start_stream()
            .await;
        assert!(matches!(result, Err(StreamError::Validation(_))));
        assert_eq!(opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_are_isolated() {
        let first = Assembler::new(Arc::new(FakeSource::new(chunks(&[
            "data: {\"type\":\"image\",\"url\":\"/a.png\",\"key\":\"Fig A\"}\ndata: \"one\"\n",
        ]))))
        .request(ReportRequest::new("first"))
        .collect();
        let second = Assembler::new(Arc::new(FakeSource::new(chunks(&[
            "data: \"two [fig_description-Fig A]\"\n",
        ]))))
        .request(ReportRequest::new("second"))
        .collect();

        let (first, second) = tokio::join!(first, second);
        let (first, second) = (first.expect("first"), second.expect("second"));
        assert_eq!(first.media.len(), 2);
        assert!(second.media.is_empty());
        assert_eq!(
            second.rendered_content().as_deref(),
            Some("two [fig_description-Fig A]")
        );
    }
}
