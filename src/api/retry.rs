use std::fmt;
use std::time::Duration;

use rand::Rng;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use tracing::warn;

/// Retry configuration for a logical request.
///
/// Delay before attempt `n` (1-based, n >= 2) is
/// `min(initial_delay * backoff_factor^(n-2), max_delay)`, then signed jitter
/// of `± delay * jitter_fraction` drawn uniformly, floored at `initial_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    pub retryable_status_codes: Vec<u16>,
    /// Methods eligible for retry. This gates retries rather than granting
    /// them: a method in this set is retried only when the failure itself is
    /// transient (network class or a retryable status).
    pub retryable_methods: Vec<Method>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(8),
            jitter_fraction: 0.1,
            retryable_status_codes: vec![500, 502, 503, 504],
            retryable_methods: vec![Method::GET, Method::POST, Method::PUT, Method::DELETE],
        }
    }
}

impl RetryPolicy {
    /// No retries at all; useful for probes and tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Pre-jitter delay before the given attempt. Always within
    /// `[initial_delay, max_delay]`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(self.initial_delay.as_secs_f64()))
    }

    /// Delay before the given attempt with jitter applied, floored at
    /// `initial_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = if self.jitter_fraction > 0.0 {
            base * self.jitter_fraction * rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let floor = self.initial_delay.as_secs_f64();
        Duration::from_secs_f64((base + jitter).max(floor))
    }

    fn method_is_retryable(&self, method: &Method) -> bool {
        self.retryable_methods.contains(method)
    }

    fn status_is_retryable(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }
}

/// A single logical request, independent of the HTTP client driving it.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    /// Per-attempt timeout; `None` uses the client default.
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            body: Some(body),
            timeout: None,
        }
    }

    pub fn patch(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::PATCH,
            url: url.into(),
            body: Some(body),
            timeout: None,
        }
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self {
            method: Method::DELETE,
            url: url.into(),
            body: None,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Error surfaced by the request layer after retries are exhausted (or the
/// failure was not retryable to begin with).
#[derive(Debug)]
pub enum ApiError {
    /// No response was received: connect, timeout, or abort class.
    Network(reqwest::Error),
    /// The backend answered with a non-success status.
    Status { status: StatusCode, body: String },
    /// The response body could not be decoded as the expected payload.
    Decode(serde_json::Error),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Network(e) => write!(f, "network error: {e}"),
            ApiError::Status { status, body } => {
                if body.is_empty() {
                    write!(f, "server returned {status}")
                } else {
                    write!(f, "server returned {status}: {body}")
                }
            }
            ApiError::Decode(e) => write!(f, "invalid response payload: {e}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Network(e) => Some(e),
            ApiError::Status { .. } => None,
            ApiError::Decode(e) => Some(e),
        }
    }
}

/// Classification of one failed attempt, used to decide on a retry and to tag
/// the retry warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    TransientNetwork,
    RetryableServer,
    NonRetryableServer,
}

impl FailureClass {
    fn as_str(self) -> &'static str {
        match self {
            FailureClass::TransientNetwork => "transient-network",
            FailureClass::RetryableServer => "retryable-server",
            FailureClass::NonRetryableServer => "non-retryable-server",
        }
    }
}

fn classify_send_error(error: &reqwest::Error) -> FailureClass {
    if error.is_connect() || error.is_timeout() || error.is_request() {
        FailureClass::TransientNetwork
    } else {
        FailureClass::NonRetryableServer
    }
}

/// Issue a request, retrying transient failures per `policy`.
///
/// Makes up to `max_retries + 1` attempts. Callers must not assume partial
/// side effects of failed attempts were rolled back.
pub async fn execute_with_retry(
    client: &Client,
    spec: &RequestSpec,
    policy: &RetryPolicy,
) -> Result<Response, ApiError> {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let failure = match send_once(client, spec).await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let class = if policy.status_is_retryable(status) {
                    FailureClass::RetryableServer
                } else {
                    FailureClass::NonRetryableServer
                };
                let retryable = class == FailureClass::RetryableServer
                    && policy.method_is_retryable(&spec.method)
                    && attempt <= policy.max_retries;
                if !retryable {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ApiError::Status { status, body });
                }
                class
            }
            Err(error) => {
                let class = classify_send_error(&error);
                let retryable = class == FailureClass::TransientNetwork
                    && policy.method_is_retryable(&spec.method)
                    && attempt <= policy.max_retries;
                if !retryable {
                    return Err(ApiError::Network(error));
                }
                class
            }
        };

        let delay = policy.delay_before(attempt + 1);
        warn!(
            attempt,
            total = policy.max_retries + 1,
            class = failure.as_str(),
            delay_ms = delay.as_millis() as u64,
            method = %spec.method,
            url = %spec.url,
            "request failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

async fn send_once(client: &Client, spec: &RequestSpec) -> Result<Response, reqwest::Error> {
    let mut request = client.request(spec.method.clone(), &spec.url);
    if let Some(body) = &spec.body {
        request = request
            .header("Content-Type", "application/json")
            .json(body);
    }
    if let Some(timeout) = spec.timeout {
        request = request.timeout(timeout);
    }
    request.send().await
}
