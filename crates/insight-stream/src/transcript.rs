use crate::errors::StreamError;

/// Placeholder text shown in the assistant message until the first fragment
/// arrives.
pub const THINKING_PLACEHOLDER: &str = "Thinking...";

/// Author of a transcript message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One chat/report message.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered conversation being built for one request.
///
/// Only the last assistant message changes while a response streams in, and
/// only through [`Transcript::append_content`].
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transcript from earlier conversation history.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Appends the user's question followed by the assistant placeholder that
    /// streamed content will replace.
    pub fn begin_turn(&mut self, question: impl Into<String>) {
        self.messages.push(Message::user(question));
        self.messages.push(Message::assistant(THINKING_PLACEHOLDER));
    }

    /// Adds a streamed fragment to the last assistant message.
    ///
    /// The placeholder (or empty content) is replaced by the first fragment;
    /// later fragments are concatenated in arrival order.
    pub fn append_content(&mut self, text: &str) -> Result<(), StreamError> {
        let Some(last) = self.messages.last_mut() else {
            return Err(StreamError::protocol_msg(
                "transcript has no message to append to",
            ));
        };
        if last.role != Role::Assistant {
            return Err(StreamError::protocol_msg(
                "last transcript message is not an assistant message",
            ));
        }
        if last.content.is_empty() || last.content == THINKING_PLACEHOLDER {
            last.content = text.to_string();
        } else {
            last.content.push_str(text);
        }
        Ok(())
    }

    /// Whether the last message is an assistant message that can receive
    /// streamed content.
    pub fn ready_for_stream(&self) -> bool {
        self.messages
            .last()
            .is_some_and(|m| m.role == Role::Assistant)
    }

    /// Content of the last assistant message, if the transcript ends in one.
    pub fn assistant_content(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
