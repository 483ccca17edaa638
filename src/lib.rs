//! Resilient client core for a streaming chat backend.
//!
//! The crate is split along the request path:
//!
//! - [`api`] talks HTTP: typed wire payloads, a retrying request executor
//!   with exponential backoff, and the endpoint surface of the backend.
//! - [`core::sse`] turns raw transport bytes into parsed stream events,
//!   tolerating arbitrary chunk boundaries.
//! - [`core::chat_stream`] runs one streaming request on its own task and
//!   reports through a callback triple, cancellable at any point.
//! - [`core::conversation`] owns all conversation state and drives every
//!   message through its lifecycle, including background-chat notifications.
//!
//! Rendering, persistence, and user input are out of scope; embedders observe
//! state through [`core::conversation::ConversationController`] snapshots and
//! plug in their own settings and notification surfaces via the traits in
//! [`core::settings`].

pub mod api;
pub mod core;

pub use api::{ApiClient, ApiError, RetryPolicy};
pub use core::conversation::{Conversation, ConversationController, SendError, SendOptions};
pub use core::message::{Message, MessageRole, MessageStatus};
