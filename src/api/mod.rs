//! Wire payloads and the HTTP client for the chat backend.
//!
//! Every call goes through the retrying executor in [`retry`]; the streaming
//! endpoint is opened separately by [`crate::core::chat_stream`], which needs
//! the raw byte stream rather than a buffered response.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::conversation::Conversation;

pub mod retry;

pub use retry::{ApiError, RequestSpec, RetryPolicy};

/// Timeout for blocking (non-streaming) message sends. Generous so slow
/// models can finish a full completion in one response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the primary health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for the fallback health probe.
const HEALTH_FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// An uploaded file attached to a message; `content` is already base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileAttachment {
    pub name: String,
    pub content: String,
}

/// Body of `POST /chats/{id}/messages`. The same shape serves the blocking
/// and streaming paths; `stream` selects the response type.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub message: String,
    pub model: String,
    pub model_params: Value,
    pub rag_config: Value,
    pub files: Vec<FileAttachment>,
    pub stream: bool,
    pub deep_thinking: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageResponse {
    #[serde(default)]
    pub ai_message: Option<AiMessage>,
}

#[derive(Debug, Deserialize)]
struct CreateChatResponse {
    chat: Conversation,
}

#[derive(Debug, Deserialize)]
struct ListChatsResponse {
    #[serde(default)]
    chats: Vec<Conversation>,
}

/// Client for the chat backend. Cheap to clone; the inner `reqwest::Client`
/// is already reference-counted.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_policy(base_url, RetryPolicy::default())
    }

    pub fn with_policy(base_url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            base_url: normalize_base_url(&base_url.into()),
            policy,
        }
    }

    pub fn http_client(&self) -> &Client {
        &self.client
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// URL of the message endpoint for one conversation; the streaming
    /// session POSTs to this directly.
    pub fn message_endpoint(&self, chat_id: &str) -> String {
        self.endpoint(&format!("chats/{chat_id}/messages"))
    }

    pub async fn create_chat(&self, title: &str) -> Result<Conversation, ApiError> {
        let spec = RequestSpec::post(self.endpoint("chats"), json!({ "title": title }));
        let response = retry::execute_with_retry(&self.client, &spec, &self.policy).await?;
        let parsed: CreateChatResponse = decode_json(response).await?;
        Ok(parsed.chat)
    }

    pub async fn list_chats(&self) -> Result<Vec<Conversation>, ApiError> {
        let spec = RequestSpec::get(self.endpoint("chats"));
        let response = retry::execute_with_retry(&self.client, &spec, &self.policy).await?;
        let parsed: ListChatsResponse = decode_json(response).await?;
        Ok(parsed.chats)
    }

    pub async fn delete_chat(&self, chat_id: &str) -> Result<(), ApiError> {
        let spec = RequestSpec::delete(self.endpoint(&format!("chats/{chat_id}")));
        retry::execute_with_retry(&self.client, &spec, &self.policy).await?;
        Ok(())
    }

    pub async fn delete_all_chats(&self) -> Result<(), ApiError> {
        let spec = RequestSpec::delete(self.endpoint("chats/delete-all"));
        retry::execute_with_retry(&self.client, &spec, &self.policy).await?;
        Ok(())
    }

    pub async fn set_chat_pinned(&self, chat_id: &str, pinned: bool) -> Result<(), ApiError> {
        let spec = RequestSpec::patch(
            self.endpoint(&format!("chats/{chat_id}/pin")),
            json!({ "pinned": pinned }),
        );
        retry::execute_with_retry(&self.client, &spec, &self.policy).await?;
        Ok(())
    }

    /// Blocking send: the full reply arrives in one response.
    pub async fn send_message(
        &self,
        chat_id: &str,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, ApiError> {
        let body = serde_json::to_value(request).map_err(ApiError::Decode)?;
        let spec =
            RequestSpec::post(self.message_endpoint(chat_id), body).with_timeout(REQUEST_TIMEOUT);
        let response = retry::execute_with_retry(&self.client, &spec, &self.policy).await?;
        decode_json(response).await
    }

    /// Liveness probe: a short-timeout GET against `/health`, falling back to
    /// `/models` when the primary endpoint is unreachable. Classifies
    /// "backend is up" only; no retries.
    pub async fn health_check(&self) -> Result<(), ApiError> {
        let probe = RequestSpec::get(self.endpoint("health")).with_timeout(HEALTH_TIMEOUT);
        let none = RetryPolicy::none();
        match retry::execute_with_retry(&self.client, &probe, &none).await {
            Ok(_) => Ok(()),
            Err(primary) => {
                tracing::debug!("health endpoint unreachable, probing /models: {primary}");
                let fallback =
                    RequestSpec::get(self.endpoint("models")).with_timeout(HEALTH_FALLBACK_TIMEOUT);
                retry::execute_with_retry(&self.client, &fallback, &none)
                    .await
                    .map(|_| ())
            }
        }
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let bytes = response.bytes().await.map_err(ApiError::Network)?;
    serde_json::from_slice(&bytes).map_err(ApiError::Decode)
}

fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_client(uri: &str) -> ApiClient {
        ApiClient::with_policy(uri, RetryPolicy::none())
    }

    #[test]
    fn endpoints_never_double_slash() {
        let api = ApiClient::new("http://localhost:8000/api/");
        assert_eq!(api.endpoint("chats"), "http://localhost:8000/api/chats");
        assert_eq!(api.endpoint("/chats"), "http://localhost:8000/api/chats");
        assert_eq!(
            api.message_endpoint("c1"),
            "http://localhost:8000/api/chats/c1/messages"
        );
    }

    #[test]
    fn send_body_uses_backend_field_names() {
        let request = SendMessageRequest {
            message: "hi".into(),
            model: "gpt-4.1".into(),
            model_params: json!({"temperature": 0.2}),
            rag_config: json!({}),
            files: vec![],
            stream: true,
            deep_thinking: false,
        };
        let body = serde_json::to_value(&request).expect("serializable");
        assert_eq!(body["modelParams"]["temperature"], 0.2);
        assert_eq!(body["ragConfig"], json!({}));
        assert_eq!(body["deepThinking"], false);
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn create_chat_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chats"))
            .and(body_json(json!({"title": "New chat"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"chat":{"id":"c1","title":"New chat","messages":[],"createdAt":1,"updatedAt":1,"model":"gpt-4.1","pinned":false}}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let api = test_client(&server.uri());
        let chat = api.create_chat("New chat").await.expect("created");
        assert_eq!(chat.id, "c1");
        assert_eq!(chat.title, "New chat");
        assert!(chat.messages.is_empty());
    }

    #[tokio::test]
    async fn health_check_falls_back_to_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"models":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let api = test_client(&server.uri());
        api.health_check().await.expect("fallback succeeds");
    }

    #[tokio::test]
    async fn malformed_history_payload_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let api = test_client(&server.uri());
        let err = api.list_chats().await.expect_err("bad payload");
        assert!(matches!(err, ApiError::Decode(_)));
    }
}
