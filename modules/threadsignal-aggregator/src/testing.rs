// Test mocks for the aggregation engine.
//
// - MockTransport (HttpTransport): URL + query matched scripted replies,
//   with call log and in-flight tracking for concurrency assertions
// - fast_policy / test_settings: zero-delay retry configuration
// - node(): RawNode builder with minute-offset timestamps

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use threadsignal_common::{RawNode, Result, ThreadError};

use crate::aggregator::FetchSettings;
use crate::transport::{ApiRequest, HttpTransport, RawResponse, RetryPolicy};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum MockReply {
    Response(RawResponse),
    Error(ThreadError),
}

impl MockReply {
    pub fn json(body: serde_json::Value) -> Self {
        MockReply::Response(RawResponse::new(200, body.to_string()))
    }

    pub fn status(status: u16) -> Self {
        MockReply::Response(RawResponse::new(status, format!("status {status}")))
    }

    pub fn network_error() -> Self {
        MockReply::Error(ThreadError::TransientNetwork("connection reset by peer".into()))
    }
}

struct MockRoute {
    url: String,
    query: Vec<(String, String)>,
    replies: VecDeque<MockReply>,
}

impl MockRoute {
    fn matches(&self, request: &ApiRequest) -> bool {
        request.url == self.url
            && self
                .query
                .iter()
                .all(|(k, v)| request.query_value(k) == Some(v.as_str()))
    }
}

/// Scripted transport. Routes match on exact URL plus any query pairs they
/// name; the most specific route wins. A route's replies are consumed in
/// order and the last one repeats. Unmatched requests get a 404.
pub struct MockTransport {
    routes: Mutex<Vec<MockRoute>>,
    calls: Mutex<Vec<ApiRequest>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Hold each call open for `latency` so concurrent calls overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn on(self, url: &str, query: &[(&str, &str)], reply: MockReply) -> Self {
        self.on_sequence(url, query, vec![reply])
    }

    pub fn on_json(self, url: &str, body: serde_json::Value) -> Self {
        self.on(url, &[], MockReply::json(body))
    }

    pub fn on_query_json(self, url: &str, query: &[(&str, &str)], body: serde_json::Value) -> Self {
        self.on(url, query, MockReply::json(body))
    }

    pub fn on_status(self, url: &str, status: u16) -> Self {
        self.on(url, &[], MockReply::status(status))
    }

    pub fn on_sequence(self, url: &str, query: &[(&str, &str)], replies: Vec<MockReply>) -> Self {
        self.add_route(url, query, replies);
        self
    }

    /// Register a route on a shared mock.
    pub fn add_route(&self, url: &str, query: &[(&str, &str)], replies: Vec<MockReply>) {
        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        routes.push(MockRoute {
            url: url.to_string(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            replies: replies.into(),
        });
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls().iter().filter(|c| c.url == url).count()
    }

    /// Highest number of calls that were open at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &ApiRequest) -> MockReply {
        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        let best = routes
            .iter_mut()
            .filter(|r| r.matches(request))
            .max_by_key(|r| r.query.len());
        match best {
            Some(route) if route.replies.len() > 1 => route
                .replies
                .pop_front()
                .unwrap_or_else(|| MockReply::status(500)),
            Some(route) => route
                .replies
                .front()
                .cloned()
                .unwrap_or_else(|| MockReply::status(500)),
            None => MockReply::status(404),
        }
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
        let reply = self.next_reply(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            MockReply::Response(resp) => Ok(resp),
            MockReply::Error(err) => Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings and builders
// ---------------------------------------------------------------------------

/// Retry policy with no delays, so throttling tests run instantly.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 5,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

pub fn test_settings() -> FetchSettings {
    FetchSettings {
        retry: fast_policy(),
        ..FetchSettings::default()
    }
}

/// Fixed instant tests offset from.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// RawNode published `minute` minutes after `base_time()`.
pub fn node(id: &str, parent: Option<&str>, minute: i64) -> RawNode {
    let mut raw = RawNode::new(id)
        .with_author(format!("author-{id}"))
        .with_body(format!("body of {id}"))
        .with_published_at(base_time() + chrono::Duration::minutes(minute));
    raw.parent_id = parent.map(|p| p.to_string());
    raw
}
