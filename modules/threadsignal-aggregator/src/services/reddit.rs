// Reddit: flat-listing strategy.
//
// /comments/{id} returns [post listing, comment listing]. Comments nest their
// first replies inline; the rest hide behind "more" stubs, expanded in
// batches through /api/morechildren. A stub with no child ids is a "continue
// this thread" link and is expanded by re-fetching the parent's subtree.
// With credentials the OAuth host is used, otherwise the public .json host.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use threadsignal_common::{
    Credentials, Platform, RawNode, Result, SkipReason, ThreadError, ThreadReference,
};

use crate::auth::{AuthSession, CredentialExchange, TokenAuthenticator};
use crate::context::{Admission, FetchContext};
use crate::fetcher::{ApiClient, FetchedThread, PlatformFetcher};
use crate::services::{from_unix_secs, halts_fetch, OAuthTokenResponse};
use crate::transport::{ApiRequest, RateLimitedTransport, RequestBudget};

pub(crate) const OAUTH_API: &str = "https://oauth.reddit.com";
pub(crate) const PUBLIC_API: &str = "https://www.reddit.com";
pub(crate) const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";

const MORE_CHILDREN_BATCH: usize = 100;
const LISTING_LIMIT: &str = "500";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Default, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Thing>,
}

/// One listing entry. `data` stays untyped until `kind` is known, so a single
/// malformed comment is skipped instead of failing the page.
#[derive(Debug, Deserialize)]
struct Thing {
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct LinkData {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    author: Option<String>,
    created_utc: Option<f64>,
    score: Option<i64>,
    url: Option<String>,
    permalink: Option<String>,
    subreddit: Option<String>,
    num_comments: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CommentData {
    id: String,
    parent_id: Option<String>,
    author: Option<String>,
    body: Option<String>,
    created_utc: Option<f64>,
    score: Option<i64>,
    permalink: Option<String>,
    depth: Option<u32>,
    #[serde(default)]
    stickied: bool,
    /// Either "" or a nested listing.
    #[serde(default)]
    replies: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MoreData {
    parent_id: String,
    #[serde(default)]
    count: u64,
    #[serde(default)]
    children: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MoreChildrenResponse {
    json: MoreChildrenBody,
}

#[derive(Debug, Deserialize)]
struct MoreChildrenBody {
    #[serde(default)]
    errors: Vec<serde_json::Value>,
    #[serde(default)]
    data: Option<MoreChildrenData>,
}

#[derive(Debug, Deserialize)]
struct MoreChildrenData {
    #[serde(default)]
    things: Vec<Thing>,
}

/// An unexpanded "more" entry.
#[derive(Debug, Clone)]
struct MoreStub {
    parent_id: String,
    count: u64,
    children: Vec<String>,
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

pub(crate) struct RedditFetcher {
    api: ApiClient,
}

impl RedditFetcher {
    pub(crate) fn new(
        transport: Arc<RateLimitedTransport>,
        auth: Option<Arc<TokenAuthenticator>>,
    ) -> Self {
        Self {
            api: ApiClient::new(Platform::Reddit, transport, auth),
        }
    }

    fn comments_url(&self, post_id: &str) -> String {
        match self.api.authenticator() {
            Some(_) => format!("{OAUTH_API}/comments/{post_id}"),
            None => format!("{PUBLIC_API}/comments/{post_id}.json"),
        }
    }

    fn more_children_url(&self) -> String {
        match self.api.authenticator() {
            Some(_) => format!("{OAUTH_API}/api/morechildren"),
            None => format!("{PUBLIC_API}/api/morechildren.json"),
        }
    }

    async fn expand_more(
        &self,
        post_id: &str,
        ctx: &FetchContext,
        out: &mut Vec<RawNode>,
        mut pending: VecDeque<MoreStub>,
    ) {
        while let Some(stub) = pending.pop_front() {
            if ctx.should_stop() {
                return;
            }
            if stub.children.is_empty() {
                if !self.expand_continuation(post_id, &stub, ctx, out, &mut pending).await {
                    return;
                }
                continue;
            }

            let wanted: Vec<String> = stub
                .children
                .iter()
                .filter(|id| !ctx.has_seen(id))
                .cloned()
                .collect();
            for batch in wanted.chunks(MORE_CHILDREN_BATCH) {
                if ctx.should_stop() {
                    return;
                }
                let request = ApiRequest::get(self.more_children_url())
                    .query("api_type", "json")
                    .query("link_id", format!("t3_{post_id}"))
                    .query("children", batch.join(","))
                    .query("limit_children", "false")
                    .query("raw_json", "1");
                match self.api.get_json::<MoreChildrenResponse>(ctx, request).await {
                    Ok(resp) => {
                        if !resp.json.errors.is_empty() {
                            warn!(parent_id = %stub.parent_id, errors = ?resp.json.errors, "morechildren returned errors");
                        }
                        let things = resp.json.data.map(|d| d.things).unwrap_or_default();
                        unwrap_things(things, ctx, out, &mut pending);
                    }
                    Err(err) if halts_fetch(&err) => {
                        ctx.record_interruption(&err);
                        return;
                    }
                    Err(err) => {
                        warn!(parent_id = %stub.parent_id, error = %err, "Failed to expand more replies");
                        ctx.record(SkipReason::RepliesNotExpanded {
                            parent_id: stub.parent_id.clone(),
                            count: batch.len() as u64,
                        });
                    }
                }
            }
        }
    }

    /// Expand a "continue this thread" stub. Returns false if the fetch must stop.
    async fn expand_continuation(
        &self,
        post_id: &str,
        stub: &MoreStub,
        ctx: &FetchContext,
        out: &mut Vec<RawNode>,
        pending: &mut VecDeque<MoreStub>,
    ) -> bool {
        if stub.parent_id == post_id {
            debug!(post_id, "Ignoring empty top-level more stub");
            return true;
        }
        let request = ApiRequest::get(self.comments_url(post_id))
            .query("comment", stub.parent_id.as_str())
            .query("limit", LISTING_LIMIT)
            .query("raw_json", "1");
        match self.api.get_json::<Vec<Listing>>(ctx, request).await {
            Ok(listings) => {
                if let Some(comments) = listings.into_iter().nth(1) {
                    unwrap_things(comments.data.children, ctx, out, pending);
                }
                true
            }
            Err(err) if halts_fetch(&err) => {
                ctx.record_interruption(&err);
                false
            }
            Err(err) => {
                warn!(parent_id = %stub.parent_id, error = %err, "Failed to continue thread");
                ctx.record(SkipReason::RepliesNotExpanded {
                    parent_id: stub.parent_id.clone(),
                    count: stub.count,
                });
                true
            }
        }
    }
}

#[async_trait]
impl PlatformFetcher for RedditFetcher {
    fn platform(&self) -> Platform {
        Platform::Reddit
    }

    fn authenticator(&self) -> Option<&Arc<TokenAuthenticator>> {
        self.api.authenticator()
    }

    async fn fetch_thread(
        &self,
        reference: &ThreadReference,
        ctx: &FetchContext,
    ) -> Result<FetchedThread> {
        let post_id = extract_post_id(&reference.id_or_url)?;
        info!(%post_id, "reddit: fetching thread");

        let request = ApiRequest::get(self.comments_url(&post_id))
            .query("limit", LISTING_LIMIT)
            .query("sort", "old")
            .query("raw_json", "1");
        let listings: Vec<Listing> = self.api.get_json(ctx, request).await?;
        let mut listings = listings.into_iter();

        let root = listings
            .next()
            .and_then(|post| post.data.children.into_iter().find(|t| t.kind == "t3"))
            .ok_or_else(|| ThreadError::NotFound(format!("reddit post {post_id}")))?;
        let root = parse_link(root.data)?;

        let mut nodes = Vec::new();
        let mut pending = VecDeque::new();
        if let Some(comments) = listings.next() {
            unwrap_things(comments.data.children, ctx, &mut nodes, &mut pending);
        }
        self.expand_more(&post_id, ctx, &mut nodes, pending).await;

        info!(%post_id, nodes = nodes.len(), "reddit: thread fetched");
        Ok(FetchedThread { root, nodes })
    }
}

// ---------------------------------------------------------------------------
// Listing parsing
// ---------------------------------------------------------------------------

/// Flatten a listing (and every nested reply listing) into raw nodes,
/// queueing "more" stubs for expansion.
fn unwrap_things(
    things: Vec<Thing>,
    ctx: &FetchContext,
    out: &mut Vec<RawNode>,
    pending: &mut VecDeque<MoreStub>,
) {
    for thing in things {
        if ctx.should_stop() {
            return;
        }
        match thing.kind.as_str() {
            "t1" => {
                let id_hint = thing.data.get("id").and_then(|v| v.as_str()).map(String::from);
                let mut comment: CommentData = match serde_json::from_value(thing.data) {
                    Ok(comment) => comment,
                    Err(err) => {
                        ctx.record(SkipReason::MalformedNode {
                            id: id_hint,
                            error: err.to_string(),
                        });
                        continue;
                    }
                };
                let replies = nested_listing(std::mem::take(&mut comment.replies));
                let reply_ids = replies.as_ref().map(reply_ids).unwrap_or_default();

                match ctx.admit(&comment.id) {
                    Admission::Accepted => out.push(comment_to_raw(comment, reply_ids)),
                    Admission::Duplicate => {}
                    Admission::Full => return,
                }
                if let Some(listing) = replies {
                    unwrap_things(listing.data.children, ctx, out, pending);
                }
            }
            "more" => {
                let announced = announced_replies(&thing.data);
                match serde_json::from_value::<MoreData>(thing.data) {
                    Ok(more) => pending.push_back(MoreStub {
                        parent_id: strip_fullname(&more.parent_id).to_string(),
                        count: more.count,
                        children: more.children,
                    }),
                    Err(err) => {
                        warn!(error = %err, announced, "Skipping malformed more stub");
                        ctx.record(SkipReason::MalformedNode {
                            id: None,
                            error: format!("more stub hiding {announced} replies: {err}"),
                        });
                    }
                }
            }
            other => debug!(kind = other, "Ignoring listing entry"),
        }
    }
}

/// Replies a raw "more" entry claims to hide: its `count`, else its child ids.
fn announced_replies(data: &serde_json::Value) -> u64 {
    let children = data
        .get("children")
        .and_then(|v| v.as_array())
        .map_or(0, |c| c.len() as u64);
    data.get("count")
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
        .max(children)
}

fn nested_listing(value: serde_json::Value) -> Option<Listing> {
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

fn reply_ids(listing: &Listing) -> Vec<String> {
    let mut ids = Vec::new();
    for thing in &listing.data.children {
        match thing.kind.as_str() {
            "t1" => {
                if let Some(id) = thing.data.get("id").and_then(|v| v.as_str()) {
                    ids.push(id.to_string());
                }
            }
            "more" => {
                if let Some(children) = thing.data.get("children").and_then(|v| v.as_array()) {
                    ids.extend(children.iter().filter_map(|c| c.as_str()).map(String::from));
                }
            }
            _ => {}
        }
    }
    ids
}

fn comment_to_raw(comment: CommentData, reply_ids: Vec<String>) -> RawNode {
    let deleted = matches!(comment.body.as_deref(), Some("[deleted]") | Some("[removed]"))
        && matches!(comment.author.as_deref(), None | Some("[deleted]"));
    let author = comment.author.filter(|a| a != "[deleted]");

    let mut raw = RawNode::new(comment.id);
    raw.parent_id = comment.parent_id.as_deref().map(|p| strip_fullname(p).to_string());
    raw.author = author;
    raw.body = comment.body.unwrap_or_default();
    raw.published_at = comment.created_utc.and_then(from_unix_secs);
    raw.score = comment.score;
    raw.reply_ids = reply_ids;
    if let Some(permalink) = comment.permalink {
        raw = raw.with_metadata("permalink", format!("{PUBLIC_API}{permalink}"));
    }
    if let Some(depth) = comment.depth {
        raw = raw.with_metadata("depth", depth);
    }
    if comment.stickied {
        raw = raw.with_metadata("stickied", true);
    }
    if deleted {
        raw = raw.with_metadata("deleted", true);
    }
    raw
}

fn parse_link(data: serde_json::Value) -> Result<RawNode> {
    let link: LinkData = serde_json::from_value(data)?;
    let body = format!("{}\n\n{}", link.title, link.selftext).trim().to_string();

    let mut raw = RawNode::new(link.id).with_body(body);
    raw.author = link.author.filter(|a| a != "[deleted]");
    raw.published_at = link.created_utc.and_then(from_unix_secs);
    raw.score = link.score;
    raw = raw.with_metadata("title", link.title);
    if let Some(url) = link.url {
        raw = raw.with_metadata("url", url);
    }
    if let Some(permalink) = link.permalink {
        raw = raw.with_metadata("permalink", format!("{PUBLIC_API}{permalink}"));
    }
    if let Some(subreddit) = link.subreddit {
        raw = raw.with_metadata("subreddit", subreddit);
    }
    if let Some(count) = link.num_comments {
        raw = raw.with_metadata("num_comments", count);
    }
    Ok(raw)
}

/// "t1_abc" -> "abc"
fn strip_fullname(id: &str) -> &str {
    match id.split_once('_') {
        Some((prefix, rest)) if prefix.len() == 2 && prefix.starts_with('t') => rest,
        _ => id,
    }
}

/// Post id from a fullname, permalink, short link or bare id.
pub(crate) fn extract_post_id(input: &str) -> Result<String> {
    let input = input.trim();
    let candidate = if let Some(rest) = input.strip_prefix("t3_") {
        rest
    } else if let Some((_, rest)) = input.split_once("/comments/") {
        rest.split(['/', '?', '#']).next().unwrap_or_default()
    } else if let Some((_, rest)) = input.split_once("redd.it/") {
        rest.split(['/', '?', '#']).next().unwrap_or_default()
    } else {
        input
    };
    if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(candidate.to_string())
    } else {
        Err(ThreadError::InvalidReference(format!(
            "not a reddit post reference: {input}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Credential exchange
// ---------------------------------------------------------------------------

/// Application-only OAuth (client credentials grant).
pub(crate) struct RedditExchange {
    transport: Arc<RateLimitedTransport>,
}

impl RedditExchange {
    pub(crate) fn new(transport: Arc<RateLimitedTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl CredentialExchange for RedditExchange {
    async fn exchange(&self, credentials: &Credentials) -> Result<AuthSession> {
        let Credentials::ClientSecret {
            client_id,
            client_secret,
        } = credentials
        else {
            return Err(ThreadError::AuthenticationFailed(
                "reddit requires a client id and secret".to_string(),
            ));
        };
        let request = ApiRequest::post(TOKEN_URL)
            .basic_auth(client_id.as_str(), client_secret.as_str())
            .form(&[("grant_type", "client_credentials")]);
        let resp = self
            .transport
            .execute(&RequestBudget::standalone(), &request)
            .await?;
        resp.json::<OAuthTokenResponse>()?.into_session(Platform::Reddit)
    }
}
