//! Conversation state and the message lifecycle controller.
//!
//! [`ConversationController`] owns every conversation's message list and is
//! the only writer. Streaming sessions mutate state through callbacks keyed
//! by conversation id, so a stream keeps updating its own conversation even
//! while the user is looking at a different one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError, FileAttachment, SendMessageRequest};
use crate::core::chat_stream::{
    StreamCallbacks, StreamError, StreamHandle, StreamParams, StreamingSession,
};
use crate::core::message::{now_millis, Message, MessageStatus};
use crate::core::settings::{
    model_supports_streaming, qualify_model_name, NotificationSink, SettingsProvider, SoundPlayer,
};
use crate::core::sse::StreamEvent;

pub const DEFAULT_CHAT_TITLE: &str = "New chat";
const TITLE_MAX_CHARS: usize = 30;
const FALLBACK_EMPTY_REPLY: &str = "Sorry, no reply was received.";

/// Bounded auto-retry for the initial history load (on top of the per-request
/// retry policy, matching the original client's two layers).
const HISTORY_MAX_RETRIES: u32 = 10;
const HISTORY_RETRY_BASE: Duration = Duration::from_secs(3);
const HISTORY_BACKOFF_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub updated_at: i64,
    pub model: String,
    pub pinned: bool,
    pub has_unread_message: bool,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: DEFAULT_CHAT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: 0,
            updated_at: 0,
            model: String::new(),
            pinned: false,
            has_unread_message: false,
        }
    }
}

impl Conversation {
    /// Index of the at-most-one in-flight assistant message.
    fn active_index(&self) -> Option<usize> {
        self.messages.iter().position(|m| m.status.is_active())
    }

    fn index_with_status(&self, status: MessageStatus) -> Option<usize> {
        self.messages.iter().position(|m| m.status == status)
    }

    fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// Fill the gaps a loose backend payload may leave: empty titles,
    /// missing timestamps, messages without a model. Messages lacking a
    /// timestamp are spaced a second apart from the conversation's base time
    /// so a rendered history does not show one instant for everything.
    pub fn normalize(&mut self) {
        if self.title.is_empty() {
            self.title = DEFAULT_CHAT_TITLE.to_string();
        }
        let now = now_millis();
        if self.created_at == 0 {
            self.created_at = now;
        }
        if self.updated_at == 0 {
            self.updated_at = self.created_at;
        }
        let base = self.created_at;
        for (i, message) in self.messages.iter_mut().enumerate() {
            if message.timestamp == 0 {
                message.timestamp = base + (i as i64) * 1000;
            }
            if message.id.is_empty() {
                message.id = crate::core::message::next_message_id();
            }
            if message.model.is_none() && message.is_assistant() && !self.model.is_empty() {
                message.model = Some(self.model.clone());
            }
        }
    }
}

/// Per-send options beyond the message text and model.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub files: Vec<FileAttachment>,
    pub deep_thinking: bool,
}

#[derive(Debug)]
pub enum SendError {
    /// The message was empty or whitespace-only; nothing was mutated.
    EmptyMessage,
    /// No model was selected; nothing was mutated.
    NoModelSelected,
    UnknownConversation(String),
    /// The blocking send failed; an error message was recorded in the
    /// conversation.
    Api(ApiError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::EmptyMessage => write!(f, "message is empty"),
            SendError::NoModelSelected => write!(f, "no model selected"),
            SendError::UnknownConversation(id) => write!(f, "unknown conversation: {id}"),
            SendError::Api(e) => write!(f, "send failed: {e}"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Api(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Default)]
struct ChatState {
    conversations: Vec<Conversation>,
    current_chat_id: Option<String>,
    active_streams: HashMap<String, StreamHandle>,
}

impl ChatState {
    fn conversation_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    /// Pinned chats first, then most recently updated.
    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| match (a.pinned, b.pinned) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => b.updated_at.cmp(&a.updated_at),
            });
    }
}

/// Owns the conversation list and drives every message through its
/// lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConversationController {
    api: ApiClient,
    settings: Arc<dyn SettingsProvider>,
    notifier: Arc<dyn NotificationSink>,
    sound: Arc<dyn SoundPlayer>,
    state: Arc<Mutex<ChatState>>,
}

impl ConversationController {
    pub fn new(
        api: ApiClient,
        settings: Arc<dyn SettingsProvider>,
        notifier: Arc<dyn NotificationSink>,
        sound: Arc<dyn SoundPlayer>,
    ) -> Self {
        Self {
            api,
            settings,
            notifier,
            sound,
            state: Arc::new(Mutex::new(ChatState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChatState> {
        // Mutation never panics while holding the lock, but recover anyway.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of one conversation's messages, suitable for rendering.
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.state()
            .conversation(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.state().conversation(conversation_id).cloned()
    }

    /// All conversations, pinned first, then most recently updated.
    pub fn history(&self) -> Vec<Conversation> {
        let mut state = self.state();
        state.sort();
        state.conversations.clone()
    }

    pub fn current_chat_id(&self) -> Option<String> {
        self.state().current_chat_id.clone()
    }

    /// Focus a conversation and clear its unread flag. Returns false for an
    /// unknown id.
    pub fn select_chat(&self, conversation_id: &str) -> bool {
        let mut state = self.state();
        let Some(conversation) = state.conversation_mut(conversation_id) else {
            return false;
        };
        conversation.has_unread_message = false;
        state.current_chat_id = Some(conversation_id.to_string());
        true
    }

    pub fn reset_unread(&self) {
        let mut state = self.state();
        for conversation in &mut state.conversations {
            conversation.has_unread_message = false;
        }
    }

    /// Case-insensitive filter over titles and message bodies.
    pub fn search(&self, query: &str) -> Vec<Conversation> {
        let query = query.trim().to_lowercase();
        let state = self.state();
        if query.is_empty() {
            return state.conversations.clone();
        }
        state
            .conversations
            .iter()
            .filter(|c| {
                c.title.to_lowercase().contains(&query)
                    || c.messages
                        .iter()
                        .any(|m| m.content.to_lowercase().contains(&query))
            })
            .cloned()
            .collect()
    }

    /// Create a conversation on the backend, adopt it locally, and focus it.
    pub async fn new_chat(&self) -> Result<Conversation, ApiError> {
        let mut chat = self.api.create_chat(DEFAULT_CHAT_TITLE).await?;
        chat.normalize();
        let mut state = self.state();
        state.current_chat_id = Some(chat.id.clone());
        state.conversations.insert(0, chat.clone());
        Ok(chat)
    }

    /// Delete on the backend first; local state only changes on success.
    /// When the focused conversation goes away, focus falls back to the
    /// first remaining one.
    pub async fn delete_chat(&self, conversation_id: &str) -> Result<(), ApiError> {
        self.api.delete_chat(conversation_id).await?;
        let handle = {
            let mut state = self.state();
            let handle = state.active_streams.remove(conversation_id);
            state.conversations.retain(|c| c.id != conversation_id);
            if state.current_chat_id.as_deref() == Some(conversation_id) {
                state.current_chat_id = state.conversations.first().map(|c| c.id.clone());
                if let Some(id) = state.current_chat_id.clone() {
                    if let Some(conversation) = state.conversation_mut(&id) {
                        conversation.has_unread_message = false;
                    }
                }
            }
            handle
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<(), ApiError> {
        self.api.delete_all_chats().await?;
        let handles: Vec<StreamHandle> = {
            let mut state = self.state();
            let handles = state.active_streams.drain().map(|(_, h)| h).collect();
            state.conversations.clear();
            state.current_chat_id = None;
            handles
        };
        for handle in handles {
            handle.cancel();
        }
        Ok(())
    }

    /// Flip a conversation's pinned flag on the backend and re-sort locally.
    pub async fn toggle_pin(&self, conversation_id: &str) -> Result<bool, ApiError> {
        let pinned = {
            let state = self.state();
            let Some(conversation) = state.conversation(conversation_id) else {
                return Ok(false);
            };
            !conversation.pinned
        };
        self.api.set_chat_pinned(conversation_id, pinned).await?;
        let mut state = self.state();
        if let Some(conversation) = state.conversation_mut(conversation_id) {
            conversation.pinned = pinned;
        }
        state.sort();
        Ok(pinned)
    }

    /// Fetch the conversation history, retrying with exponential backoff up
    /// to a bounded count before surfacing a persistent error.
    pub async fn load_history(&self) -> Result<(), ApiError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.api.list_chats().await {
                Ok(mut chats) => {
                    for chat in &mut chats {
                        chat.normalize();
                    }
                    let mut state = self.state();
                    state.conversations = chats;
                    state.current_chat_id = None;
                    state.sort();
                    return Ok(());
                }
                Err(err) => {
                    if attempt > HISTORY_MAX_RETRIES {
                        return Err(err);
                    }
                    let delay = Duration::from_secs_f64(
                        HISTORY_RETRY_BASE.as_secs_f64()
                            * HISTORY_BACKOFF_FACTOR.powi(attempt as i32 - 1),
                    );
                    warn!(
                        attempt,
                        max = HISTORY_MAX_RETRIES,
                        delay_ms = delay.as_millis() as u64,
                        "history load failed, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Send a message in the given conversation.
    ///
    /// Appends the user message and a typing placeholder, then either streams
    /// the reply (when both the process-wide setting and the model version's
    /// capability flag allow it) or falls back to one blocking
    /// request/response. On the streaming path this returns as soon as the
    /// session is open; the reply arrives through state mutations.
    pub async fn send(
        &self,
        conversation_id: &str,
        content: &str,
        model: &str,
        options: SendOptions,
    ) -> Result<(), SendError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if model.trim().is_empty() {
            return Err(SendError::NoModelSelected);
        }

        let registry = self.settings.models();
        let model = qualify_model_name(model, &registry);
        let streaming =
            self.settings.streaming_enabled() && model_supports_streaming(&model, &registry);

        {
            let mut state = self.state();
            let conversation = state
                .conversation_mut(conversation_id)
                .ok_or_else(|| SendError::UnknownConversation(conversation_id.to_string()))?;
            conversation.model = model.clone();
            conversation.messages.push(Message::user(content));
            if conversation.messages.len() == 1 && conversation.title == DEFAULT_CHAT_TITLE {
                conversation.title = truncate_title(content);
            }
            conversation
                .messages
                .push(Message::typing_placeholder(&model));
            conversation.touch();
        }

        let request = SendMessageRequest {
            message: content.to_string(),
            model: model.clone(),
            model_params: self.settings.model_params(&model),
            rag_config: self.settings.rag_config(),
            files: options.files,
            stream: streaming,
            deep_thinking: options.deep_thinking,
        };

        if streaming {
            self.open_stream(conversation_id, model, &request);
            Ok(())
        } else {
            self.send_blocking(conversation_id, model, &request).await
        }
    }

    /// Cancel the conversation's in-flight stream, if any. The partial
    /// message is kept and marked `Cancelled` rather than rolled back, so the
    /// transcript records that a reply was cut short. Idempotent, and a no-op
    /// when nothing is streaming: a blocking send cannot be cancelled, and
    /// its placeholder must stay in place for the pending response.
    pub fn cancel_active(&self, conversation_id: &str) {
        let Some(handle) = self.state().active_streams.remove(conversation_id) else {
            return;
        };
        // Outside the state lock: cancel waits for any in-flight callback,
        // and callbacks take the state lock themselves.
        handle.cancel();
        let mut state = self.state();
        if let Some(conversation) = state.conversation_mut(conversation_id) {
            if let Some(index) = conversation.active_index() {
                conversation.messages[index].status = MessageStatus::Cancelled;
                conversation.touch();
            }
        }
    }

    pub fn has_active_stream(&self, conversation_id: &str) -> bool {
        self.state().active_streams.contains_key(conversation_id)
    }

    async fn send_blocking(
        &self,
        conversation_id: &str,
        model: String,
        request: &SendMessageRequest,
    ) -> Result<(), SendError> {
        match self.api.send_message(conversation_id, request).await {
            Ok(response) => {
                let notify = {
                    let mut state = self.state();
                    let Some(conversation) = state.conversation_mut(conversation_id) else {
                        return Ok(());
                    };
                    remove_placeholder(conversation);
                    let message = match response.ai_message {
                        Some(ai) if !ai.content.is_empty() => {
                            Message::received(ai.content, ai.model.unwrap_or(model))
                        }
                        _ => Message::received(FALLBACK_EMPTY_REPLY, model),
                    };
                    conversation.messages.push(message);
                    conversation.touch();
                    conversation.title.clone()
                };
                self.mark_unread_and_notify(conversation_id, &notify);
                Ok(())
            }
            Err(err) => {
                let diagnostic = format!("Send failed: {err}");
                let mut state = self.state();
                if let Some(conversation) = state.conversation_mut(conversation_id) {
                    remove_placeholder(conversation);
                    conversation
                        .messages
                        .push(Message::failed(diagnostic, Some(model)));
                    conversation.touch();
                }
                Err(SendError::Api(err))
            }
        }
    }

    fn open_stream(&self, conversation_id: &str, model: String, request: &SendMessageRequest) {
        let body = match serde_json::to_value(request) {
            Ok(body) => body,
            Err(e) => {
                let mut state = self.state();
                if let Some(conversation) = state.conversation_mut(conversation_id) {
                    remove_placeholder(conversation);
                    conversation
                        .messages
                        .push(Message::failed(format!("Send failed: {e}"), Some(model)));
                }
                return;
            }
        };

        let params = StreamParams {
            client: self.api.http_client().clone(),
            url: self.api.message_endpoint(conversation_id),
            body,
        };

        let id = conversation_id.to_string();
        let callbacks = StreamCallbacks {
            on_event: {
                let controller = self.clone();
                let id = id.clone();
                let model = model.clone();
                Box::new(move |event| controller.apply_stream_event(&id, &model, event))
            },
            on_error: {
                let controller = self.clone();
                let id = id.clone();
                Box::new(move |err| controller.fail_stream(&id, err))
            },
            on_complete: {
                let controller = self.clone();
                let id = id.clone();
                let model = model.clone();
                Box::new(move || controller.finish_stream(&id, &model))
            },
        };

        // Insert under the lock so the task's own callbacks, which take the
        // same lock, cannot observe the map before the handle is in it.
        let mut state = self.state();
        let handle = StreamingSession::open(params, callbacks);
        state.active_streams.insert(id, handle);
    }

    /// Fold one stream event into its conversation. Chunks grow the active
    /// message's content monotonically; a terminal event finalizes it.
    fn apply_stream_event(&self, conversation_id: &str, requested_model: &str, event: StreamEvent) {
        let mut notify: Option<String> = None;
        {
            let mut state = self.state();
            let Some(conversation) = state.conversation_mut(conversation_id) else {
                debug!("dropping stream event for unknown conversation {conversation_id}");
                return;
            };

            if let Some(chunk) = event.chunk.as_deref().filter(|c| !c.is_empty()) {
                if let Some(index) = conversation.index_with_status(MessageStatus::Typing) {
                    // First content: replace the placeholder in place so the
                    // message keeps its position in the transcript.
                    let mut message = Message::streaming(requested_model);
                    message.content.push_str(chunk);
                    conversation.messages[index] = message;
                } else if let Some(index) = conversation.index_with_status(MessageStatus::Streaming)
                {
                    conversation.messages[index].content.push_str(chunk);
                } else {
                    // Late chunk after a terminal transition; never mutate a
                    // finished message.
                    debug!("dropping chunk for settled message in {conversation_id}");
                }
            }

            if event.is_terminal() {
                if let Some(index) = conversation.index_with_status(MessageStatus::Streaming) {
                    let message = &mut conversation.messages[index];
                    message.status = MessageStatus::Received;
                    let event_model = event.ai_message.as_ref().and_then(|m| m.model.clone());
                    message.model = event_model.or_else(|| Some(requested_model.to_string()));
                    notify = Some(conversation.title.clone());
                }
                // A terminal event with the placeholder still in Typing means
                // the stream never produced content; finish_stream settles it.
            }
            conversation.touch();
        }

        if let Some(title) = notify {
            self.mark_unread_and_notify(conversation_id, &title);
        }
    }

    /// End-of-stream. Settles anything the terminal event left open; the
    /// status check makes a second settle a no-op.
    fn finish_stream(&self, conversation_id: &str, requested_model: &str) {
        let mut notify: Option<String> = None;
        {
            let mut state = self.state();
            state.active_streams.remove(conversation_id);
            let Some(conversation) = state.conversation_mut(conversation_id) else {
                return;
            };
            if let Some(index) = conversation.active_index() {
                match conversation.messages[index].status {
                    MessageStatus::Streaming => {
                        let message = &mut conversation.messages[index];
                        message.status = MessageStatus::Received;
                        if message.model.is_none() {
                            message.model = Some(requested_model.to_string());
                        }
                        notify = Some(conversation.title.clone());
                    }
                    MessageStatus::Typing => {
                        // Stream ended without a single chunk.
                        conversation.messages[index] =
                            Message::failed(FALLBACK_EMPTY_REPLY, Some(requested_model.to_string()));
                    }
                    _ => {}
                }
                conversation.touch();
            }
        }

        if let Some(title) = notify {
            self.mark_unread_and_notify(conversation_id, &title);
        }
    }

    /// Stream failure. The placeholder becomes an error message; a partially
    /// streamed message keeps its content and is flagged `Error`.
    fn fail_stream(&self, conversation_id: &str, err: StreamError) {
        let diagnostic = format!("Send failed: {err}");
        let mut state = self.state();
        state.active_streams.remove(conversation_id);
        let Some(conversation) = state.conversation_mut(conversation_id) else {
            return;
        };
        match conversation.active_index() {
            Some(index) if conversation.messages[index].status == MessageStatus::Typing => {
                let model = conversation.messages[index].model.clone();
                conversation.messages[index] = Message::failed(diagnostic, model);
            }
            Some(index) => {
                let message = &mut conversation.messages[index];
                message.status = MessageStatus::Error;
                message.error = Some(diagnostic);
            }
            None => {
                debug!("stream error after message settled in {conversation_id}: {diagnostic}");
            }
        }
        conversation.touch();
    }

    /// Background-conversation side effects: unread flag, toast, sound. A
    /// no-op when the conversation is the focused one.
    fn mark_unread_and_notify(&self, conversation_id: &str, title: &str) {
        let is_background = {
            let mut state = self.state();
            if state.current_chat_id.as_deref() == Some(conversation_id) {
                false
            } else {
                if let Some(conversation) = state.conversation_mut(conversation_id) {
                    conversation.has_unread_message = true;
                }
                true
            }
        };
        if is_background && self.settings.new_message_notifications_enabled() {
            let display_time = self.settings.notification_display_time().duration();
            self.notifier
                .notify(&format!("New message: {title}"), display_time);
            if self.settings.sound_enabled() {
                self.sound.play_notification();
            }
        }
    }
}

fn remove_placeholder(conversation: &mut Conversation) {
    if let Some(index) = conversation.index_with_status(MessageStatus::Typing) {
        conversation.messages.remove(index);
    }
}

fn truncate_title(content: &str) -> String {
    let mut title: String = content.chars().take(TITLE_MAX_CHARS).collect();
    if content.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

#[cfg(test)]
impl ConversationController {
    /// Adopt a conversation without touching the backend.
    fn seed_chat_for_test(&self, id: &str) {
        let mut chat = Conversation {
            id: id.to_string(),
            ..Conversation::default()
        };
        chat.normalize();
        self.state().conversations.insert(0, chat);
    }
}
