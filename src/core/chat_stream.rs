//! One long-lived streaming request against the message endpoint.
//!
//! The session owns the read loop on a spawned task: bytes from the transport
//! go through the frame decoder, decoded events are delivered strictly in
//! arrival order, and exactly one of `on_complete`, `on_error`, or silent
//! cancellation terminates the session.

use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::sse::{SseFrameDecoder, StreamEvent};

/// Terminal failure of a streaming session.
#[derive(Debug)]
pub enum StreamError {
    /// The request could not be sent or the connection dropped mid-stream.
    Transport(reqwest::Error),
    /// The endpoint answered with a non-success status before streaming.
    Status { status: StatusCode, body: String },
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Transport(e) => write!(f, "stream transport failed: {e}"),
            StreamError::Status { status, body } => {
                if body.is_empty() {
                    write!(f, "stream rejected with {status}")
                } else {
                    write!(f, "stream rejected with {status}: {body}")
                }
            }
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Transport(e) => Some(e),
            StreamError::Status { .. } => None,
        }
    }
}

/// Callback triple for one session. `on_event` fires once per decoded frame;
/// exactly one of `on_error` / `on_complete` fires unless the session is
/// cancelled first.
pub struct StreamCallbacks {
    pub on_event: Box<dyn FnMut(StreamEvent) + Send>,
    pub on_error: Box<dyn FnOnce(StreamError) + Send>,
    pub on_complete: Box<dyn FnOnce() + Send>,
}

pub struct StreamParams {
    pub client: reqwest::Client,
    pub url: String,
    pub body: Value,
}

/// Cancellation handle bound to exactly one session. Cloning shares the
/// underlying token; `cancel` is idempotent.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl StreamHandle {
    /// Abort the transport and suppress all further callbacks. Once this
    /// returns, no callback fires: every delivery holds the session gate and
    /// re-checks the token, and `cancel` waits out a delivery already in
    /// flight. Safe to call any number of times, but not from inside one of
    /// the session's own callbacks.
    pub fn cancel(&self) {
        self.token.cancel();
        drop(self.gate.lock().unwrap_or_else(|e| e.into_inner()));
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct StreamingSession;

impl StreamingSession {
    /// Open the transport and spawn the read loop. Returns immediately.
    pub fn open(params: StreamParams, callbacks: StreamCallbacks) -> StreamHandle {
        let token = CancellationToken::new();
        let gate = Arc::new(Mutex::new(()));
        let task_token = token.clone();
        let task_gate = gate.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = run(params, callbacks, task_token.clone(), task_gate) => {}
                _ = task_token.cancelled() => {
                    debug!("stream cancelled; buffered bytes discarded");
                }
            }
        });
        StreamHandle { token, gate }
    }
}

/// Run one callback under the session gate, skipping it when the session has
/// been cancelled. [`StreamHandle::cancel`] takes the same gate after setting
/// the token, so once it returns no further delivery can start.
fn deliver(gate: &Mutex<()>, token: &CancellationToken, callback: impl FnOnce()) -> bool {
    let _guard = gate.lock().unwrap_or_else(|e| e.into_inner());
    if token.is_cancelled() {
        return false;
    }
    callback();
    true
}

async fn run(
    params: StreamParams,
    callbacks: StreamCallbacks,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
) {
    let StreamCallbacks {
        mut on_event,
        on_error,
        on_complete,
    } = callbacks;

    let response = match params
        .client
        .post(&params.url)
        .header("Content-Type", "application/json")
        .json(&params.body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            deliver(&gate, &token, || on_error(StreamError::Transport(e)));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        deliver(&gate, &token, || on_error(StreamError::Status { status, body }));
        return;
    }

    let mut stream = response.bytes_stream();
    let mut decoder = SseFrameDecoder::new();

    while let Some(chunk) = stream.next().await {
        if token.is_cancelled() {
            return;
        }
        match chunk {
            Ok(bytes) => {
                for item in decoder.feed(&bytes) {
                    match item {
                        Ok(event) => {
                            if !deliver(&gate, &token, || on_event(event)) {
                                return;
                            }
                        }
                        // One bad frame does not abort the session.
                        Err(e) => warn!("skipping malformed stream frame: {e}"),
                    }
                }
            }
            Err(e) => {
                deliver(&gate, &token, || on_error(StreamError::Transport(e)));
                return;
            }
        }
    }

    if let Some(item) = decoder.flush() {
        match item {
            Ok(event) => {
                if !deliver(&gate, &token, || on_event(event)) {
                    return;
                }
            }
            Err(e) => warn!("skipping malformed trailing frame: {e}"),
        }
    }
    deliver(&gate, &token, on_complete);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    struct Recorded {
        events: Mutex<Vec<StreamEvent>>,
        completions: AtomicUsize,
        errors: Mutex<Vec<String>>,
    }

    impl Recorded {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                completions: AtomicUsize::new(0),
                errors: Mutex::new(Vec::new()),
            })
        }

        fn callbacks(self: &Arc<Self>) -> StreamCallbacks {
            let on_event = {
                let recorded = self.clone();
                Box::new(move |event| {
                    recorded.events.lock().expect("events lock").push(event);
                })
            };
            let on_error = {
                let recorded = self.clone();
                Box::new(move |err: StreamError| {
                    recorded
                        .errors
                        .lock()
                        .expect("errors lock")
                        .push(err.to_string());
                })
            };
            let on_complete = {
                let recorded = self.clone();
                Box::new(move || {
                    recorded.completions.fetch_add(1, Ordering::SeqCst);
                })
            };
            StreamCallbacks {
                on_event,
                on_error,
                on_complete,
            }
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn sse_body() -> &'static str {
        "data: {\"chunk\":\"He\"}\n\ndata: {\"chunk\":\"llo\"}\n\ndata: {\"done\": true}\n\n"
    }

    #[tokio::test]
    async fn delivers_events_in_order_then_completes_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chats/c1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body()),
            )
            .mount(&server)
            .await;

        let recorded = Recorded::new();
        let _handle = StreamingSession::open(
            StreamParams {
                client: reqwest::Client::new(),
                url: format!("{}/chats/c1/messages", server.uri()),
                body: serde_json::json!({"message": "hi", "stream": true}),
            },
            recorded.callbacks(),
        );

        wait_until(|| recorded.completions.load(Ordering::SeqCst) == 1).await;

        let events = recorded.events.lock().expect("events lock");
        let chunks: Vec<Option<String>> = events.iter().map(|e| e.chunk.clone()).collect();
        assert_eq!(
            chunks,
            vec![Some("He".to_string()), Some("llo".to_string()), None]
        );
        assert!(events[2].is_terminal());
        assert!(recorded.errors.lock().expect("errors lock").is_empty());
    }

    #[tokio::test]
    async fn trailing_unterminated_frame_is_flushed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chats/c1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {\"chunk\":\"Hi\"}\n\ndata: {\"done\": true}"),
            )
            .mount(&server)
            .await;

        let recorded = Recorded::new();
        StreamingSession::open(
            StreamParams {
                client: reqwest::Client::new(),
                url: format!("{}/chats/c1/messages", server.uri()),
                body: serde_json::json!({"stream": true}),
            },
            recorded.callbacks(),
        );

        wait_until(|| recorded.completions.load(Ordering::SeqCst) == 1).await;
        let events = recorded.events.lock().expect("events lock");
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn non_success_status_errors_without_completing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chats/c1/messages"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let recorded = Recorded::new();
        StreamingSession::open(
            StreamParams {
                client: reqwest::Client::new(),
                url: format!("{}/chats/c1/messages", server.uri()),
                body: serde_json::json!({"stream": true}),
            },
            recorded.callbacks(),
        );

        wait_until(|| !recorded.errors.lock().expect("errors lock").is_empty()).await;
        assert_eq!(recorded.completions.load(Ordering::SeqCst), 0);
        assert!(recorded.events.lock().expect("events lock").is_empty());
        let errors = recorded.errors.lock().expect("errors lock");
        assert!(errors[0].contains("503"), "got: {}", errors[0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nothing_fires_after_cancel_returns_mid_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chats/c1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body()),
            )
            .mount(&server)
            .await;

        let delivered = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(AtomicUsize::new(0));
        let (first_tx, first_rx) = std::sync::mpsc::channel::<()>();

        let handle = StreamingSession::open(
            StreamParams {
                client: reqwest::Client::new(),
                url: format!("{}/chats/c1/messages", server.uri()),
                body: serde_json::json!({"stream": true}),
            },
            StreamCallbacks {
                on_event: {
                    let delivered = delivered.clone();
                    Box::new(move |_event: StreamEvent| {
                        if delivered.fetch_add(1, Ordering::SeqCst) == 0 {
                            let _ = first_tx.send(());
                            // Keep this delivery in flight while the test
                            // thread calls cancel.
                            std::thread::sleep(Duration::from_millis(150));
                        }
                    })
                },
                on_error: {
                    let errors = errors.clone();
                    Box::new(move |_err: StreamError| {
                        errors.fetch_add(1, Ordering::SeqCst);
                    })
                },
                on_complete: {
                    let completions = completions.clone();
                    Box::new(move || {
                        completions.fetch_add(1, Ordering::SeqCst);
                    })
                },
            },
        );

        first_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("first delivery entered");
        handle.cancel();
        // cancel waited out the in-flight delivery; from here on nothing
        // else may fire, now or later.
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert_eq!(completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_silences_callbacks() {
        let server = MockServer::start().await;
        // Hold the response long enough for cancellation to land first.
        Mock::given(method("POST"))
            .and(path("/chats/c1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let recorded = Recorded::new();
        let handle = StreamingSession::open(
            StreamParams {
                client: reqwest::Client::new(),
                url: format!("{}/chats/c1/messages", server.uri()),
                body: serde_json::json!({"stream": true}),
            },
            recorded.callbacks(),
        );

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(recorded.events.lock().expect("events lock").is_empty());
        assert!(recorded.errors.lock().expect("errors lock").is_empty());
        assert_eq!(recorded.completions.load(Ordering::SeqCst), 0);
    }
}
