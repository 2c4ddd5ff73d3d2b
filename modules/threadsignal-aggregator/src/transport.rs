// HTTP plumbing: a transport-agnostic request/response pair, the reqwest
// implementation, and the retrying decorator every fetcher goes through.
//
// Retry state lives in a RequestBudget owned by one logical fetch, so a
// heavily throttled thread never eats into another thread's budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use threadsignal_common::{Config, Result, ThreadError};

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// An outbound call, described independently of any HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub basic_auth: Option<(String, String)>,
    pub body: Option<RequestBody>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url.into())
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url.into())
    }

    fn new(method: Method, url: String) -> Self {
        Self {
            method,
            url,
            query: Vec::new(),
            headers: Vec::new(),
            bearer: None,
            basic_auth: None,
            body: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.body = Some(RequestBody::Form(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Value of a query parameter, if set.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Status, headers and body of a completed call. Header names are lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|v| v.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Server-provided wait hint: `Retry-After` (seconds or HTTP date), else
    /// an `x-rate-limit-reset` epoch timestamp.
    pub fn retry_after(&self) -> Option<Duration> {
        if let Some(value) = self.header("retry-after") {
            if let Ok(secs) = value.trim().parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
            if let Ok(at) = DateTime::parse_from_rfc2822(value.trim()) {
                return (at.with_timezone(&Utc) - Utc::now()).to_std().ok();
            }
        }
        let reset = self.header("x-rate-limit-reset")?.trim().parse::<i64>().ok()?;
        let at = DateTime::<Utc>::from_timestamp(reset, 0)?;
        (at - Utc::now()).to_std().ok()
    }

    /// Map a non-success status onto the error taxonomy.
    pub fn error_for_status(&self, url: &str) -> ThreadError {
        let message = format!("{url}: {}", truncate(&self.body, 300));
        match self.status {
            429 | 503 => ThreadError::RateLimited {
                retry_after: self.retry_after(),
                message,
            },
            502 | 504 => ThreadError::TransientNetwork(format!("status {}: {message}", self.status)),
            401 => ThreadError::Unauthorized(message),
            404 | 410 => ThreadError::NotFound(url.to_string()),
            status => ThreadError::Api { status, message },
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform one call. Errors are network-level only; HTTP error statuses
    /// come back as a `RawResponse`.
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| ThreadError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.user_agent, config.http_timeout)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        builder = match &request.body {
            Some(RequestBody::Form(fields)) => builder.form(fields),
            Some(RequestBody::Json(body)) => builder.json(body),
            None => builder,
        };

        let resp = builder.send().await.map_err(network_error)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp.text().await.map_err(network_error)?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

fn network_error(err: reqwest::Error) -> ThreadError {
    if err.is_builder() {
        ThreadError::InvalidReference(err.to_string())
    } else {
        ThreadError::TransientNetwork(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Retry policy and per-operation budget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed for a single request.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.backoff_base,
            max_delay: config.backoff_max,
        }
    }

    /// Exponential delay for the given zero-based attempt, plus up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ms = (exp.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Request and retry allowance for one logical fetch, plus its cancellation
/// signal.
#[derive(Debug)]
pub struct RequestBudget {
    max_retries: u32,
    max_requests: usize,
    retries: AtomicU32,
    requests: AtomicUsize,
    cancel: CancellationToken,
}

impl RequestBudget {
    pub fn new(max_retries: u32, max_requests: usize, cancel: CancellationToken) -> Self {
        Self {
            max_retries,
            max_requests,
            retries: AtomicU32::new(0),
            requests: AtomicUsize::new(0),
            cancel,
        }
    }

    /// A standalone budget for calls made outside any thread fetch, such as
    /// credential exchanges.
    pub fn standalone() -> Self {
        Self::new(10, 20, CancellationToken::new())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn requests_made(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn retries_used(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    fn claim_request(&self) -> Result<()> {
        let made = self.requests.fetch_add(1, Ordering::SeqCst);
        if made >= self.max_requests {
            return Err(ThreadError::RateLimited {
                retry_after: None,
                message: format!("request ceiling of {} reached", self.max_requests),
            });
        }
        Ok(())
    }

    fn claim_retry(&self) -> bool {
        self.retries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.max_retries).then_some(used + 1)
            })
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// RateLimitedTransport
// ---------------------------------------------------------------------------

/// Retrying decorator over any `HttpTransport`.
///
/// 429/503, gateway errors and connection failures back off exponentially
/// with jitter (or honor the server's wait hint). Anything else is terminal.
/// Once either the per-request retry cap or the operation's retry budget is
/// spent, the call fails with `RateLimited`.
pub struct RateLimitedTransport {
    inner: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
}

impl RateLimitedTransport {
    pub fn new(inner: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute(&self, budget: &RequestBudget, request: &ApiRequest) -> Result<RawResponse> {
        let mut attempt = 0u32;
        loop {
            if budget.cancel.is_cancelled() {
                return Err(ThreadError::Cancelled);
            }
            budget.claim_request()?;

            let outcome = tokio::select! {
                _ = budget.cancel.cancelled() => return Err(ThreadError::Cancelled),
                outcome = self.inner.send(request) => outcome,
            };
            let err = match outcome {
                Ok(resp) if resp.is_success() => return Ok(resp),
                Ok(resp) => resp.error_for_status(&request.url),
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(url = %request.url, error = %err, "Terminal response");
                return Err(err);
            }
            if attempt >= self.policy.max_retries || !budget.claim_retry() {
                warn!(
                    url = %request.url,
                    attempts = attempt + 1,
                    retries_used = budget.retries_used(),
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(ThreadError::RateLimited {
                    retry_after: err.retry_after(),
                    message: format!("{} after {} attempts: {err}", request.url, attempt + 1),
                });
            }

            let delay = err
                .retry_after()
                .map(|hint| hint.min(self.policy.max_delay))
                .unwrap_or_else(|| self.policy.delay_for(attempt));
            warn!(
                url = %request.url,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Throttled, retrying after backoff"
            );
            tokio::select! {
                _ = budget.cancel.cancelled() => return Err(ThreadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_policy, MockReply, MockTransport};

    fn transport(mock: MockTransport) -> (Arc<MockTransport>, RateLimitedTransport) {
        let mock = Arc::new(mock);
        let transport = RateLimitedTransport::new(mock.clone(), fast_policy());
        (mock, transport)
    }

    #[tokio::test]
    async fn retries_throttled_calls_until_success() {
        let (mock, transport) = transport(MockTransport::new().on_sequence(
            "https://api.test/items",
            &[],
            vec![
                MockReply::status(429),
                MockReply::status(503),
                MockReply::network_error(),
                MockReply::json(serde_json::json!({"ok": true})),
            ],
        ));
        let budget = RequestBudget::new(50, 100, CancellationToken::new());

        let resp = transport
            .execute(&budget, &ApiRequest::get("https://api.test/items"))
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(mock.call_count("https://api.test/items"), 4);
        assert_eq!(budget.retries_used(), 3);
    }

    #[tokio::test]
    async fn terminal_statuses_are_not_retried() {
        let (mock, transport) =
            transport(MockTransport::new().on_status("https://api.test/missing", 404));
        let budget = RequestBudget::new(50, 100, CancellationToken::new());

        let err = transport
            .execute(&budget, &ApiRequest::get("https://api.test/missing"))
            .await
            .unwrap_err();

        assert!(matches!(err, ThreadError::NotFound(_)));
        assert_eq!(mock.call_count("https://api.test/missing"), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_rate_limited_with_hint() {
        let (mock, transport) = transport(MockTransport::new().on(
            "https://api.test/busy",
            &[],
            MockReply::Response(RawResponse::new(429, "slow down").with_header("Retry-After", "0")),
        ));
        let budget = RequestBudget::new(50, 100, CancellationToken::new());

        let err = transport
            .execute(&budget, &ApiRequest::get("https://api.test/busy"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ThreadError::RateLimited {
                retry_after: Some(d),
                ..
            } if d == Duration::ZERO
        ));
        // one initial attempt plus max_retries
        assert_eq!(mock.call_count("https://api.test/busy"), 6);
    }

    #[tokio::test]
    async fn operation_budget_is_shared_across_requests() {
        let (_, transport) = transport(MockTransport::new().on_status("https://api.test/busy", 429));
        let budget = RequestBudget::new(3, 100, CancellationToken::new());

        let _ = transport
            .execute(&budget, &ApiRequest::get("https://api.test/busy"))
            .await;
        assert_eq!(budget.retries_used(), 3);

        // Budget spent: the next throttled call fails on its first response.
        let before = budget.requests_made();
        let err = transport
            .execute(&budget, &ApiRequest::get("https://api.test/busy"))
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadError::RateLimited { .. }));
        assert_eq!(budget.requests_made() - before, 1);
    }

    #[tokio::test]
    async fn separate_budgets_do_not_starve_each_other() {
        let (_, transport) = transport(
            MockTransport::new()
                .on_status("https://api.test/busy", 429)
                .on_json("https://api.test/ok", serde_json::json!({})),
        );
        let heavy = RequestBudget::new(2, 100, CancellationToken::new());
        let light = RequestBudget::new(2, 100, CancellationToken::new());

        let _ = transport
            .execute(&heavy, &ApiRequest::get("https://api.test/busy"))
            .await;
        assert_eq!(heavy.retries_used(), 2);

        let resp = transport
            .execute(&light, &ApiRequest::get("https://api.test/ok"))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(light.retries_used(), 0);
    }

    #[tokio::test]
    async fn request_ceiling_aborts_with_rate_limited() {
        let (_, transport) =
            transport(MockTransport::new().on_json("https://api.test/ok", serde_json::json!({})));
        let budget = RequestBudget::new(5, 2, CancellationToken::new());
        let request = ApiRequest::get("https://api.test/ok");

        assert!(transport.execute(&budget, &request).await.is_ok());
        assert!(transport.execute(&budget, &request).await.is_ok());
        let err = transport.execute(&budget, &request).await.unwrap_err();
        assert!(matches!(err, ThreadError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn cancelled_budget_short_circuits() {
        let (mock, transport) =
            transport(MockTransport::new().on_json("https://api.test/ok", serde_json::json!({})));
        let cancel = CancellationToken::new();
        let budget = RequestBudget::new(5, 100, cancel.clone());
        cancel.cancel();

        let err = transport
            .execute(&budget, &ApiRequest::get("https://api.test/ok"))
            .await
            .unwrap_err();
        assert_eq!(err, ThreadError::Cancelled);
        assert_eq!(mock.call_count("https://api.test/ok"), 0);
    }

    #[test]
    fn status_classification() {
        let url = "https://api.test/x";
        assert!(matches!(
            RawResponse::new(401, "").error_for_status(url),
            ThreadError::Unauthorized(_)
        ));
        assert!(matches!(
            RawResponse::new(400, "bad").error_for_status(url),
            ThreadError::Api { status: 400, .. }
        ));
        assert!(RawResponse::new(502, "").error_for_status(url).is_retryable());
        assert!(RawResponse::new(503, "").error_for_status(url).is_retryable());
        assert!(!RawResponse::new(403, "").error_for_status(url).is_retryable());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        let first = policy.delay_for(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = policy.delay_for(2);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        let capped = policy.delay_for(10);
        assert!(capped >= Duration::from_millis(1000) && capped <= Duration::from_millis(1250));
    }

    #[test]
    fn retry_after_reads_seconds_header() {
        let resp = RawResponse::new(429, "").with_header("Retry-After", "7");
        assert_eq!(resp.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(RawResponse::new(429, "").retry_after(), None);
    }
}
