pub mod chat_stream;
pub mod conversation;
pub mod message;
pub mod settings;
pub mod sse;
