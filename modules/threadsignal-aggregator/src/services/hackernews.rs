// Hacker News: fan-out-recursive strategy over the Firebase item API.
//
// Every item lists its reply ids in `kids`, and each kid is its own request.
// Requests fan out concurrently, capped per operation by a semaphore. A
// failed child is recorded and dropped without aborting its siblings.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use threadsignal_common::{Platform, RawNode, Result, SkipReason, ThreadError, ThreadReference};

use crate::auth::TokenAuthenticator;
use crate::context::FetchContext;
use crate::fetcher::{ApiClient, FetchedThread, PlatformFetcher};
use crate::services::halts_fetch;
use crate::transport::{ApiRequest, RateLimitedTransport};

pub(crate) const API_BASE: &str = "https://hacker-news.firebaseio.com/v0";

#[derive(Debug, Deserialize)]
struct Item {
    id: u64,
    #[serde(rename = "type")]
    kind: Option<String>,
    by: Option<String>,
    text: Option<String>,
    title: Option<String>,
    url: Option<String>,
    time: Option<i64>,
    score: Option<i64>,
    parent: Option<u64>,
    #[serde(default)]
    kids: Vec<u64>,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    dead: bool,
    descendants: Option<u64>,
}

pub(crate) struct HackerNewsFetcher {
    api: ApiClient,
}

impl HackerNewsFetcher {
    pub(crate) fn new(transport: Arc<RateLimitedTransport>) -> Self {
        Self {
            api: ApiClient::new(Platform::HackerNews, transport, None),
        }
    }

    /// `Ok(None)` when the API answers `null` for an unknown id.
    async fn get_item(&self, id: u64, ctx: &FetchContext) -> Result<Option<Item>> {
        self.api
            .get_json(ctx, ApiRequest::get(format!("{API_BASE}/item/{id}.json")))
            .await
    }
}

#[async_trait]
impl PlatformFetcher for HackerNewsFetcher {
    fn platform(&self) -> Platform {
        Platform::HackerNews
    }

    fn authenticator(&self) -> Option<&Arc<TokenAuthenticator>> {
        None
    }

    async fn fetch_thread(
        &self,
        reference: &ThreadReference,
        ctx: &FetchContext,
    ) -> Result<FetchedThread> {
        let root_id = extract_item_id(&reference.id_or_url)?;
        info!(root_id, "hackernews: fetching thread");

        let root = self
            .get_item(root_id, ctx)
            .await?
            .ok_or_else(|| ThreadError::NotFound(format!("hacker news item {root_id}")))?;
        ctx.mark_seen(&root_id.to_string());
        let kids = root.kids.clone();
        let root = item_to_raw(root);

        // Every completed item queues its kids right away, so one slow item
        // never holds back the rest of its level.
        let semaphore = Arc::new(Semaphore::new(ctx.concurrency()));
        let mut nodes = Vec::new();
        let mut in_flight = FuturesUnordered::new();

        let spawn = |id: u64| {
            let semaphore = semaphore.clone();
            async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => self.get_item(id, ctx).await,
                    Err(_) => Err(ThreadError::Cancelled),
                };
                (id, outcome)
            }
        };

        for kid in kids {
            if ctx.should_stop() {
                break;
            }
            if ctx.mark_seen(&kid.to_string()) {
                in_flight.push(spawn(kid));
            }
        }

        while let Some((id, outcome)) = in_flight.next().await {
            match outcome {
                Ok(Some(item)) => {
                    if !ctx.reserve_slot() {
                        break;
                    }
                    for kid in &item.kids {
                        if ctx.should_stop() {
                            break;
                        }
                        if ctx.mark_seen(&kid.to_string()) {
                            in_flight.push(spawn(*kid));
                        }
                    }
                    nodes.push(item_to_raw(item));
                }
                Ok(None) => {
                    debug!(id, "Item missing");
                    ctx.record(SkipReason::Unavailable {
                        id: id.to_string(),
                        reason: "not found".to_string(),
                    });
                }
                Err(err) if halts_fetch(&err) => {
                    ctx.record_interruption(&err);
                    break;
                }
                Err(ThreadError::MalformedPayload(error)) => {
                    warn!(id, %error, "Skipping malformed item");
                    ctx.record(SkipReason::MalformedNode {
                        id: Some(id.to_string()),
                        error,
                    });
                }
                Err(err) => {
                    warn!(id, error = %err, "Failed to fetch item");
                    ctx.record(SkipReason::NodeFetchFailed {
                        id: id.to_string(),
                        error: err.to_string(),
                    });
                }
            }
            if ctx.is_cancelled() {
                ctx.record_interruption(&ThreadError::Cancelled);
                break;
            }
            if ctx.is_full() && !in_flight.is_empty() {
                ctx.should_stop();
                break;
            }
        }
        // Requests still outstanding are dropped with the stream.
        drop(in_flight);

        info!(root_id, nodes = nodes.len(), "hackernews: thread fetched");
        Ok(FetchedThread { root, nodes })
    }
}

fn item_to_raw(item: Item) -> RawNode {
    let body = match (item.title, item.text) {
        (Some(title), Some(text)) => format!("{title}\n\n{text}"),
        (Some(title), None) => title,
        (None, Some(text)) => text,
        (None, None) => String::new(),
    };
    let mut raw = RawNode::new(item.id.to_string()).with_body(body);
    raw.parent_id = item.parent.map(|p| p.to_string());
    raw.author = item.by;
    raw.published_at = item.time.and_then(|t| chrono::DateTime::from_timestamp(t, 0));
    raw.score = item.score;
    raw.reply_ids = item.kids.iter().map(|k| k.to_string()).collect();
    if let Some(kind) = item.kind {
        raw = raw.with_metadata("type", kind);
    }
    if let Some(url) = item.url {
        raw = raw.with_metadata("url", url);
    }
    if let Some(count) = item.descendants {
        raw = raw.with_metadata("descendants", count);
    }
    if item.deleted {
        raw = raw.with_metadata("deleted", true);
    }
    if item.dead {
        raw = raw.with_metadata("dead", true);
    }
    raw
}

/// Item id from `news.ycombinator.com/item?id=N` or a bare number.
pub(crate) fn extract_item_id(input: &str) -> Result<u64> {
    let input = input.trim();
    let candidate = match url::Url::parse(input) {
        Ok(parsed) => parsed
            .query_pairs()
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default(),
        Err(_) => input.to_string(),
    };
    candidate.parse().map_err(|_| {
        ThreadError::InvalidReference(format!("not a hacker news item reference: {input}"))
    })
}
