/// Errors returned by the public assembler API and by report sources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid request input to the builder API.
    #[error("validation error: {0}")]
    Validation(String),
    /// The request could not be established (network failure, non-2xx status
    /// or no response headers before the configured deadline).
    #[error("connection error: {message}")]
    Connection {
        message: String,
        status_code: Option<u16>,
    },
    /// The byte stream failed after the response started.
    #[error("stream read error: {0}")]
    Read(String),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StreamError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Connection {
            message: message.into(),
            status_code,
        }
    }

    /// Creates a mid-stream read error.
    pub fn read(message: impl Into<String>) -> Self {
        Self::Read(message.into())
    }

    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// Terminal failure reported through `AssemblyEvent::Failed` and
/// `AssemblyOutcome::failure`.
///
/// `Display` renders the human-readable reason shown to users.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum StreamFailure {
    /// Non-2xx status or network failure before the first byte.
    #[error("{message}")]
    Connection {
        message: String,
        status_code: Option<u16>,
    },
    /// The stream broke while waiting for the next chunk.
    #[error("{message}")]
    Read { message: String },
    /// The assembler detected an invariant violation.
    #[error("protocol failure: {message}")]
    Protocol { message: String },
    /// The caller abandoned the request.
    #[error("request cancelled")]
    Cancelled,
}

impl StreamFailure {
    /// Whether this failure should be written into the transcript.
    ///
    /// Caller-initiated cancellation is not annotated.
    pub fn annotates_transcript(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

pub(crate) fn failure_from_stream_error(err: &StreamError) -> StreamFailure {
    match err {
        StreamError::Connection {
            message,
            status_code,
        } => StreamFailure::Connection {
            message: message.clone(),
            status_code: *status_code,
        },
        StreamError::Read(message) => StreamFailure::Read {
            message: message.clone(),
        },
        StreamError::Config(message)
        | StreamError::Validation(message)
        | StreamError::Protocol(message) => StreamFailure::Protocol {
            message: message.clone(),
        },
    }
}
