//! A reusable `reqwest`-backed HTTP client wrapper with status-based error
//! classification and exponential backoff, parameterized per call site
//! (carrier / agent / CRM each supply their own policy).

use rand::Rng;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Shared error shape for every downstream HTTP dependency (carrier, agent,
/// CRM). `CarrierError`/`AgentError`/`CrmError` alias this type so each
/// client's public API still names its own error, without three copies of
/// identical classification logic.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DownstreamError {
    pub kind: DownstreamErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl DownstreamError {
    pub fn new(kind: DownstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(DownstreamErrorKind::Network, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(DownstreamErrorKind::RateLimit, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(DownstreamErrorKind::ServerError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(DownstreamErrorKind::Auth, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(DownstreamErrorKind::InvalidRequest, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(DownstreamErrorKind::Unknown, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamErrorKind {
    Network,
    RateLimit,
    ServerError,
    Auth,
    InvalidRequest,
    Unknown,
}

impl DownstreamErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::RateLimit | Self::ServerError)
    }
}

/// Classify an HTTP response status + body into a `DownstreamError`,
/// parsing a `Retry-After` style hint when present.
pub fn classify_error(status: StatusCode, body: &str, retry_after_header: Option<&str>) -> DownstreamError {
    let message = body.to_string();
    let mut err = match status.as_u16() {
        401 | 403 => DownstreamError::auth(format!("authentication failed: {message}")),
        429 => DownstreamError::rate_limit(format!("rate limited: {message}")),
        400 => DownstreamError::invalid_request(format!("invalid request: {message}")),
        408 => DownstreamError::network(format!("request timeout: {message}")),
        500..=599 => DownstreamError::server_error(format!("server error ({status}): {message}")),
        _ => DownstreamError::unknown(format!("HTTP {status}: {message}")),
    };
    if let Some(seconds) = retry_after_header.and_then(|h| h.parse::<f64>().ok()) {
        err = err.with_retry_after(Duration::from_secs_f64(seconds));
    }
    err
}

/// Retry/backoff policy for one downstream dependency.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Carrier control API: 20s timeout, <=3 retries, base 2s / cap 15s.
    pub fn carrier() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15),
            timeout: Duration::from_secs(20),
        }
    }

    /// AI agent signed-URL fetch: 15s timeout, <=2 retries.
    pub fn agent() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(15),
        }
    }

    /// CRM API calls: 20s timeout, <=3 retries.
    pub fn crm() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Thin wrapper over a shared `reqwest::Client` that retries transient
/// failures with exponential backoff plus jitter.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new(policy: RetryPolicy) -> Self {
        let client = Client::builder()
            .timeout(policy.timeout)
            .build()
            .expect("failed to build reqwest client");
        Self { client, policy }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Execute a request built fresh on each attempt (required since
    /// `RequestBuilder` with a body can't always be cloned), retrying on
    /// network errors and retryable status codes.
    pub async fn execute_with_retry<F>(&self, mut build: F) -> Result<reqwest::Response, DownstreamError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        let mut delay = self.policy.base_delay;

        loop {
            let result = build().send().await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = response.text().await.unwrap_or_default();
                    let err = classify_error(status, &body, retry_after.as_deref());
                    if attempt >= self.policy.max_retries || !err.kind.is_retryable() {
                        return Err(err);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    let err = if e.is_timeout() {
                        DownstreamError::network(format!("request timeout: {e}"))
                    } else if e.is_connect() {
                        DownstreamError::network(format!("connection failed: {e}"))
                    } else {
                        DownstreamError::unknown(format!("request failed: {e}"))
                    };
                    if attempt >= self.policy.max_retries || !err.kind.is_retryable() {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }

            let jitter_ms = rand::thread_rng().gen_range(0..250);
            tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
            delay = (delay * 2).min(self.policy.max_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_status_table() {
        assert_eq!(
            classify_error(StatusCode::UNAUTHORIZED, "", None).kind,
            DownstreamErrorKind::Auth
        );
        assert_eq!(
            classify_error(StatusCode::TOO_MANY_REQUESTS, "", None).kind,
            DownstreamErrorKind::RateLimit
        );
        assert_eq!(
            classify_error(StatusCode::BAD_REQUEST, "", None).kind,
            DownstreamErrorKind::InvalidRequest
        );
        assert_eq!(
            classify_error(StatusCode::INTERNAL_SERVER_ERROR, "", None).kind,
            DownstreamErrorKind::ServerError
        );
    }

    #[test]
    fn retryable_kinds() {
        assert!(DownstreamErrorKind::Network.is_retryable());
        assert!(DownstreamErrorKind::RateLimit.is_retryable());
        assert!(DownstreamErrorKind::ServerError.is_retryable());
        assert!(!DownstreamErrorKind::Auth.is_retryable());
        assert!(!DownstreamErrorKind::InvalidRequest.is_retryable());
    }

    #[test]
    fn retry_after_header_is_parsed() {
        let err = classify_error(StatusCode::TOO_MANY_REQUESTS, "", Some("2.5"));
        assert_eq!(err.retry_after, Some(Duration::from_secs_f64(2.5)));
    }
}
