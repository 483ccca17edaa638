use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a message. The backend historically used `ai` for the
/// assistant role, so both spellings are accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    #[serde(alias = "ai")]
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn is_user(self) -> bool {
        self == MessageRole::User
    }

    pub fn is_assistant(self) -> bool {
        self == MessageRole::Assistant
    }

    fn assistant_default() -> Self {
        MessageRole::Assistant
    }
}

impl AsRef<str> for MessageRole {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Lifecycle state of a message.
///
/// Assistant messages move `Typing -> Streaming -> Received` on the streaming
/// path, or straight to `Received`/`Error` on the blocking path. `Received`,
/// `Error`, and `Cancelled` are terminal: nothing mutates a message once it
/// reaches one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// A user message that has been handed to the backend.
    Sent,
    /// Placeholder assistant message shown while waiting for the first chunk.
    Typing,
    /// Assistant message currently accumulating streamed chunks.
    Streaming,
    /// Terminal: the full reply has arrived.
    Received,
    /// Terminal: the request or stream failed.
    Error,
    /// Terminal: the user cancelled the stream; partial content is kept.
    Cancelled,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Received | MessageStatus::Error | MessageStatus::Cancelled
        )
    }

    /// True for the at-most-one in-flight assistant message of a conversation.
    pub fn is_active(self) -> bool {
        matches!(self, MessageStatus::Typing | MessageStatus::Streaming)
    }

    fn received_default() -> Self {
        MessageStatus::Received
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default = "MessageRole::assistant_default")]
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default, alias = "time")]
    pub timestamp: i64,
    #[serde(default = "MessageStatus::received_default")]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: next_message_id(),
            role: MessageRole::User,
            content: content.into(),
            timestamp: now_millis(),
            status: MessageStatus::Sent,
            error: None,
            model: None,
        }
    }

    /// Content-less assistant placeholder driving the typing indicator.
    pub fn typing_placeholder(model: &str) -> Self {
        Self {
            id: next_message_id(),
            role: MessageRole::Assistant,
            content: String::new(),
            timestamp: now_millis(),
            status: MessageStatus::Typing,
            error: None,
            model: Some(model.to_string()),
        }
    }

    /// Assistant message accumulating streamed chunks. Replaces the typing
    /// placeholder at the same index once the first chunk arrives.
    pub fn streaming(model: &str) -> Self {
        Self {
            id: next_message_id(),
            role: MessageRole::Assistant,
            content: String::new(),
            timestamp: now_millis(),
            status: MessageStatus::Streaming,
            error: None,
            model: Some(model.to_string()),
        }
    }

    pub fn received(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: next_message_id(),
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: now_millis(),
            status: MessageStatus::Received,
            error: None,
            model: Some(model.into()),
        }
    }

    /// Terminal assistant message carrying a short diagnostic string.
    pub fn failed(diagnostic: impl Into<String>, model: Option<String>) -> Self {
        Self {
            id: next_message_id(),
            role: MessageRole::Assistant,
            content: String::new(),
            timestamp: now_millis(),
            status: MessageStatus::Error,
            error: Some(diagnostic.into()),
            model,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role.is_user()
    }

    pub fn is_assistant(&self) -> bool {
        self.role.is_assistant()
    }
}

pub fn next_message_id() -> String {
    format!("msg-{}", Uuid::new_v4())
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
