use std::collections::VecDeque;

use futures::StreamExt as _;
use futures::stream;
use tracing::{debug, warn};

use crate::errors::StreamError;
use crate::source::ByteStream;

const DONE_SENTINEL: &str = "[DONE]";

/// One logical SSE unit: the event-type context in effect plus a parsed
/// `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub event_type: Option<String>,
    pub payload: serde_json::Value,
}

impl RawEvent {
    pub fn new(event_type: Option<&str>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.map(ToOwned::to_owned),
            payload,
        }
    }

    /// Session acknowledgements carry no text and reset the event-type
    /// context once framed.
    pub fn is_session(&self) -> bool {
        self.event_type.as_deref() == Some("session")
            || self
                .payload
                .get("session_id")
                .is_some_and(|v| !v.is_null())
    }
}

/// Incremental SSE framer.
///
/// Bytes are decoded with a carry-over buffer so multi-byte characters split
/// across chunks survive, and lines are only processed once their `\n`
/// arrives. The emitted events do not depend on where the chunks split.
#[derive(Debug, Default)]
pub struct SseFramer {
    undecoded: Vec<u8>,
    partial_line: String,
    event_type: Option<String>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the events completed by it.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<RawEvent> {
        self.decode(chunk);
        let mut events = Vec::new();
        let Some(last_newline) = self.partial_line.rfind('\n') else {
            return events;
        };
        let rest = self.partial_line.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial_line, rest);
        for line in complete[..last_newline].split('\n') {
            self.process_line(line.trim_end_matches('\r'), &mut events);
        }
        events
    }

    /// Flushes undecodable trailing bytes and a final unterminated line.
    pub fn finish(&mut self) -> Vec<RawEvent> {
        if !self.undecoded.is_empty() {
            let tail = String::from_utf8_lossy(&self.undecoded).into_owned();
            self.partial_line.push_str(&tail);
            self.undecoded.clear();
        }
        let mut events = Vec::new();
        let line = std::mem::take(&mut self.partial_line);
        for line in line.split('\n').filter(|l| !l.is_empty()) {
            self.process_line(line.trim_end_matches('\r'), &mut events);
        }
        events
    }

    /// Current event-type context.
    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    fn decode(&mut self, chunk: &[u8]) {
        self.undecoded.extend_from_slice(chunk);
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.undecoded[start..]) {
                Ok(text) => {
                    self.partial_line.push_str(text);
                    start = self.undecoded.len();
                    break;
                }
                Err(err) => {
                    let valid_end = start + err.valid_up_to();
                    self.partial_line.push_str(
                        std::str::from_utf8(&self.undecoded[start..valid_end]).unwrap_or_default(),
                    );
                    match err.error_len() {
                        Some(len) => {
                            self.partial_line.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        // incomplete sequence at the end, wait for the next chunk
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.undecoded.drain(..start);
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<RawEvent>) {
        if line.is_empty() {
            self.event_type = None;
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            let event_type = field_value(rest).trim();
            self.event_type = (!event_type.is_empty()).then(|| event_type.to_string());
            return;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let data = field_value(rest);
            if data.trim() == DONE_SENTINEL {
                self.event_type = None;
                return;
            }
            match serde_json::from_str::<serde_json::Value>(data) {
                Ok(payload) => {
                    let event = RawEvent {
                        event_type: self.event_type.clone(),
                        payload,
                    };
                    if event.is_session() {
                        self.event_type = None;
                    }
                    events.push(event);
                }
                Err(err) => {
                    warn!(error = %err, data_len = data.len(), "skipping malformed SSE data line");
                }
            }
            return;
        }
        debug!(line_len = line.len(), "ignoring unrecognized SSE line");
    }
}

fn field_value(rest: &str) -> &str {
    rest.strip_prefix(' ').unwrap_or(rest)
}

/// Frames a byte stream into a lazy stream of `RawEvent`s.
///
/// The stream ends after end of input or after the first read error, which is
/// yielded as `StreamError::Read`.
pub fn raw_event_stream(
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<RawEvent, StreamError>> + Send {
    struct State {
        bytes_stream: ByteStream,
        framer: SseFramer,
        pending: VecDeque<RawEvent>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes_stream,
            framer: SseFramer::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.framer.push_chunk(&chunk));
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        state.pending.extend(state.framer.finish());
                        state.done = true;
                    }
                }
            }
        },
    )
}
