// Bluesky: strict-tree strategy over the AT Protocol.
//
// getPostThread returns the thread as nested views. Each post's record names
// its parent explicitly, and that edge wins over where the view happened to
// nest it. Subtrees cut off at the depth limit are re-fetched from their own
// root. Without credentials the public AppView is used; with an app password
// calls go through the PDS with a session from createSession.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use threadsignal_common::{
    Credentials, Platform, RawNode, Result, SkipReason, ThreadError, ThreadReference,
};

use crate::auth::{AuthSession, CredentialExchange, TokenAuthenticator};
use crate::context::{Admission, FetchContext};
use crate::fetcher::{ApiClient, FetchedThread, PlatformFetcher};
use crate::services::{halts_fetch, parse_rfc3339};
use crate::transport::{ApiRequest, RateLimitedTransport, RequestBudget};

pub(crate) const PUBLIC_API: &str = "https://public.api.bsky.app";
pub(crate) const PDS_API: &str = "https://bsky.social";

const THREAD_DEPTH: &str = "1000";
/// Access JWTs without a readable `exp` are assumed to live this long.
const DEFAULT_SESSION_SECS: i64 = 2 * 60 * 60;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    thread: serde_json::Value,
}

/// threadViewPost, notFoundPost or blockedPost, told apart by their fields.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadView {
    uri: Option<String>,
    post: Option<PostView>,
    #[serde(default)]
    replies: Vec<serde_json::Value>,
    #[serde(default)]
    not_found: bool,
    #[serde(default)]
    blocked: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostView {
    uri: String,
    cid: Option<String>,
    author: Author,
    #[serde(default)]
    record: PostRecord,
    indexed_at: Option<String>,
    reply_count: Option<u64>,
    repost_count: Option<u64>,
    like_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Author {
    did: String,
    handle: String,
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord {
    #[serde(default)]
    text: String,
    created_at: Option<String>,
    reply: Option<ReplyRef>,
}

#[derive(Debug, Deserialize)]
struct ReplyRef {
    parent: StrongRef,
}

#[derive(Debug, Deserialize)]
struct StrongRef {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
    refresh_jwt: Option<String>,
}

/// A post whose replies were cut off at the depth limit.
struct Truncated {
    uri: String,
    reply_count: u64,
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

pub(crate) struct BlueskyFetcher {
    api: ApiClient,
}

impl BlueskyFetcher {
    pub(crate) fn new(
        transport: Arc<RateLimitedTransport>,
        auth: Option<Arc<TokenAuthenticator>>,
    ) -> Self {
        Self {
            api: ApiClient::new(Platform::Bluesky, transport, auth),
        }
    }

    fn xrpc(&self, method: &str) -> String {
        let base = match self.api.authenticator() {
            Some(_) => PDS_API,
            None => PUBLIC_API,
        };
        format!("{base}/xrpc/{method}")
    }

    async fn resolve_did(&self, actor: &str, ctx: &FetchContext) -> Result<String> {
        if actor.starts_with("did:") {
            return Ok(actor.to_string());
        }
        debug!(handle = actor, "Resolving handle");
        let request = ApiRequest::get(self.xrpc("com.atproto.identity.resolveHandle"))
            .query("handle", actor);
        let resolved: ResolveHandleResponse = self
            .api
            .get_json(ctx, request)
            .await
            .map_err(|err| not_found_on_bad_request(err, actor))?;
        Ok(resolved.did)
    }

    async fn get_thread(&self, uri: &str, ctx: &FetchContext) -> Result<serde_json::Value> {
        let request = ApiRequest::get(self.xrpc("app.bsky.feed.getPostThread"))
            .query("uri", uri)
            .query("depth", THREAD_DEPTH)
            .query("parentHeight", "0");
        let resp: ThreadResponse = self
            .api
            .get_json(ctx, request)
            .await
            .map_err(|err| not_found_on_bad_request(err, uri))?;
        Ok(resp.thread)
    }
}

#[async_trait]
impl PlatformFetcher for BlueskyFetcher {
    fn platform(&self) -> Platform {
        Platform::Bluesky
    }

    fn authenticator(&self) -> Option<&Arc<TokenAuthenticator>> {
        self.api.authenticator()
    }

    async fn fetch_thread(
        &self,
        reference: &ThreadReference,
        ctx: &FetchContext,
    ) -> Result<FetchedThread> {
        let (actor, rkey) = parse_post_reference(&reference.id_or_url)?;
        let did = self.resolve_did(&actor, ctx).await?;
        let root_uri = format!("at://{did}/app.bsky.feed.post/{rkey}");
        info!(uri = %root_uri, "bluesky: fetching thread");

        let thread = self.get_thread(&root_uri, ctx).await?;
        let view: ThreadView = serde_json::from_value(thread)?;
        if view.not_found || view.blocked {
            return Err(ThreadError::NotFound(root_uri));
        }
        let post = view
            .post
            .ok_or_else(|| ThreadError::MalformedPayload(format!("{root_uri}: thread has no post")))?;
        let root_uri = post.uri.clone();
        let root = post_to_raw(post, None);
        ctx.mark_seen(&root_uri);

        let mut nodes = Vec::new();
        let mut truncated = VecDeque::new();
        let mut expanded: HashSet<String> = HashSet::from([root_uri.clone()]);
        let mut pending: Vec<(serde_json::Value, String)> = view
            .replies
            .into_iter()
            .rev()
            .map(|reply| (reply, root_uri.clone()))
            .collect();

        loop {
            if !walk(&mut pending, ctx, &mut nodes, &mut truncated) {
                break;
            }
            let Some(cut) = truncated.pop_front() else {
                break;
            };
            if !expanded.insert(cut.uri.clone()) {
                continue;
            }
            debug!(uri = %cut.uri, replies = cut.reply_count, "Re-fetching truncated subtree");
            match self.get_thread(&cut.uri, ctx).await {
                Ok(thread) => match serde_json::from_value::<ThreadView>(thread) {
                    Ok(sub) => pending.extend(
                        sub.replies
                            .into_iter()
                            .rev()
                            .map(|reply| (reply, cut.uri.clone())),
                    ),
                    Err(err) => {
                        warn!(uri = %cut.uri, error = %err, "Malformed subtree response");
                        ctx.record(SkipReason::RepliesNotExpanded {
                            parent_id: cut.uri.clone(),
                            count: cut.reply_count,
                        });
                    }
                },
                Err(err) if halts_fetch(&err) => {
                    ctx.record_interruption(&err);
                    break;
                }
                Err(err) => {
                    warn!(uri = %cut.uri, error = %err, "Failed to re-fetch subtree");
                    ctx.record(SkipReason::RepliesNotExpanded {
                        parent_id: cut.uri.clone(),
                        count: cut.reply_count,
                    });
                }
            }
        }

        info!(uri = %root_uri, nodes = nodes.len(), "bluesky: thread fetched");
        Ok(FetchedThread { root, nodes })
    }
}

/// Depth-first walk of pending views. Returns false once collection must stop.
fn walk(
    pending: &mut Vec<(serde_json::Value, String)>,
    ctx: &FetchContext,
    out: &mut Vec<RawNode>,
    truncated: &mut VecDeque<Truncated>,
) -> bool {
    while let Some((value, structural_parent)) = pending.pop() {
        if ctx.should_stop() {
            return false;
        }
        let uri_hint = value
            .get("post")
            .and_then(|p| p.get("uri"))
            .or_else(|| value.get("uri"))
            .and_then(|u| u.as_str())
            .map(String::from);
        let view: ThreadView = match serde_json::from_value(value) {
            Ok(view) => view,
            Err(err) => {
                ctx.record(SkipReason::MalformedNode {
                    id: uri_hint,
                    error: err.to_string(),
                });
                continue;
            }
        };

        let Some(post) = view.post else {
            let id = view.uri.unwrap_or_default();
            let reason = if view.blocked {
                "blocked"
            } else if view.not_found {
                "not found"
            } else {
                "no post in thread view"
            };
            ctx.record(SkipReason::Unavailable {
                id,
                reason: reason.to_string(),
            });
            continue;
        };

        let uri = post.uri.clone();
        let reply_count = post.reply_count.unwrap_or(0);
        match ctx.admit(&uri) {
            Admission::Accepted => out.push(post_to_raw(post, Some(structural_parent))),
            Admission::Duplicate => {}
            Admission::Full => return false,
        }
        if view.replies.is_empty() && reply_count > 0 {
            truncated.push_back(Truncated { uri, reply_count });
        } else {
            pending.extend(view.replies.into_iter().rev().map(|reply| (reply, uri.clone())));
        }
    }
    true
}

fn post_to_raw(post: PostView, structural_parent: Option<String>) -> RawNode {
    let parent = post
        .record
        .reply
        .map(|r| r.parent.uri)
        .filter(|uri| !uri.is_empty())
        .or(structural_parent);
    let published_at = post
        .record
        .created_at
        .as_deref()
        .and_then(parse_rfc3339)
        .or_else(|| post.indexed_at.as_deref().and_then(parse_rfc3339));
    let rkey = post.uri.rsplit('/').next().unwrap_or_default().to_string();

    let mut raw = RawNode::new(post.uri)
        .with_author(post.author.handle.clone())
        .with_body(post.record.text)
        .with_metadata("did", post.author.did)
        .with_metadata(
            "url",
            format!("https://bsky.app/profile/{}/post/{rkey}", post.author.handle),
        );
    raw.parent_id = parent;
    raw.published_at = published_at;
    raw.score = post.like_count;
    if let Some(cid) = post.cid {
        raw = raw.with_metadata("cid", cid);
    }
    if let Some(name) = post.author.display_name.filter(|n| !n.is_empty()) {
        raw = raw.with_metadata("display_name", name);
    }
    if let Some(count) = post.reply_count {
        raw = raw.with_metadata("reply_count", count);
    }
    if let Some(count) = post.repost_count {
        raw = raw.with_metadata("repost_count", count);
    }
    raw
}

/// XRPC answers an unknown post or handle with 400 rather than 404.
fn not_found_on_bad_request(err: ThreadError, what: &str) -> ThreadError {
    match err {
        ThreadError::Api { status: 400, message } if message.contains("NotFound") || message.contains("Unable to resolve") => {
            ThreadError::NotFound(what.to_string())
        }
        other => other,
    }
}

/// (actor, rkey) from an at:// URI or a bsky.app post URL.
pub(crate) fn parse_post_reference(input: &str) -> Result<(String, String)> {
    let input = input.trim();
    let invalid = || ThreadError::InvalidReference(format!("not a bluesky post reference: {input}"));

    let (actor, rkey) = if let Some(rest) = input.strip_prefix("at://") {
        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(actor), Some("app.bsky.feed.post"), Some(rkey)) => (actor, rkey),
            _ => return Err(invalid()),
        }
    } else if let Some((_, rest)) = input.split_once("/profile/") {
        let mut parts = rest.split(['/', '?', '#']);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(actor), Some("post"), Some(rkey)) => (actor, rkey),
            _ => return Err(invalid()),
        }
    } else {
        return Err(invalid());
    };
    if actor.is_empty() || rkey.is_empty() {
        return Err(invalid());
    }
    Ok((actor.to_string(), rkey.to_string()))
}

// ---------------------------------------------------------------------------
// Credential exchange
// ---------------------------------------------------------------------------

/// App-password sessions via com.atproto.server.createSession / refreshSession.
pub(crate) struct BlueskyExchange {
    transport: Arc<RateLimitedTransport>,
}

impl BlueskyExchange {
    pub(crate) fn new(transport: Arc<RateLimitedTransport>) -> Self {
        Self { transport }
    }

    async fn call(&self, request: ApiRequest) -> Result<AuthSession> {
        let resp = self
            .transport
            .execute(&RequestBudget::standalone(), &request)
            .await?;
        let session: SessionResponse = resp.json()?;
        let expires_at = jwt_expiry(&session.access_jwt)
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(DEFAULT_SESSION_SECS));
        let mut auth = AuthSession::new(session.access_jwt).with_expiry(expires_at);
        if let Some(refresh) = session.refresh_jwt {
            auth = auth.with_refresh_token(refresh);
        }
        Ok(auth)
    }
}

#[async_trait]
impl CredentialExchange for BlueskyExchange {
    async fn exchange(&self, credentials: &Credentials) -> Result<AuthSession> {
        let Credentials::AppPassword {
            identifier,
            password,
        } = credentials
        else {
            return Err(ThreadError::AuthenticationFailed(
                "bluesky requires an identifier and app password".to_string(),
            ));
        };
        let request = ApiRequest::post(format!("{PDS_API}/xrpc/com.atproto.server.createSession"))
            .json(serde_json::json!({
                "identifier": identifier,
                "password": password,
            }));
        self.call(request).await
    }

    async fn refresh(&self, _credentials: &Credentials, session: &AuthSession) -> Result<AuthSession> {
        let Some(refresh) = &session.refresh_token else {
            return Err(ThreadError::AuthenticationFailed(
                "no refresh token".to_string(),
            ));
        };
        let request = ApiRequest::post(format!("{PDS_API}/xrpc/com.atproto.server.refreshSession"))
            .bearer_auth(refresh.as_str());
        self.call(request).await
    }
}

/// `exp` claim of a JWT, read without verifying the signature.
fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.get("exp")?.as_i64()?, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_policy, MockTransport};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    const DID: &str = "did:plc:alice";

    fn uri(rkey: &str) -> String {
        format!("at://{DID}/app.bsky.feed.post/{rkey}")
    }

    fn post(rkey: &str, minute: u32, parent: Option<&str>, reply_count: u64) -> serde_json::Value {
        let mut record = json!({
            "$type": "app.bsky.feed.post",
            "text": format!("text {rkey}"),
            "createdAt": format!("2024-05-01T12:{minute:02}:00.000Z"),
        });
        if let Some(parent) = parent {
            record["reply"] = json!({
                "root": {"uri": uri("root"), "cid": "c"},
                "parent": {"uri": uri(parent), "cid": "c"},
            });
        }
        json!({
            "uri": uri(rkey),
            "cid": format!("cid-{rkey}"),
            "author": {"did": DID, "handle": "alice.bsky.social", "displayName": "Alice"},
            "record": record,
            "indexedAt": "2024-05-01T13:00:00.000Z",
            "replyCount": reply_count,
            "likeCount": 2,
        })
    }

    fn view(post: serde_json::Value, replies: Vec<serde_json::Value>) -> serde_json::Value {
        json!({"$type": "app.bsky.feed.defs#threadViewPost", "post": post, "replies": replies})
    }

    fn fetcher(mock: MockTransport) -> (Arc<MockTransport>, BlueskyFetcher) {
        let mock = Arc::new(mock);
        let transport = Arc::new(RateLimitedTransport::new(mock.clone(), fast_policy()));
        (mock, BlueskyFetcher::new(transport, None))
    }

    fn ctx() -> FetchContext {
        FetchContext::new(RequestBudget::new(10, 100, CancellationToken::new()), 4)
    }

    fn thread_url() -> String {
        format!("{PUBLIC_API}/xrpc/app.bsky.feed.getPostThread")
    }

    #[test]
    fn parses_post_references() {
        assert_eq!(
            parse_post_reference("https://bsky.app/profile/alice.bsky.social/post/3kabc").unwrap(),
            ("alice.bsky.social".to_string(), "3kabc".to_string())
        );
        assert_eq!(
            parse_post_reference("at://did:plc:alice/app.bsky.feed.post/3kabc").unwrap(),
            ("did:plc:alice".to_string(), "3kabc".to_string())
        );
        assert!(parse_post_reference("at://did:plc:alice/app.bsky.feed.like/3kabc").is_err());
        assert!(parse_post_reference("https://bsky.app/profile/alice").is_err());
    }

    #[test]
    fn reads_jwt_expiry() {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(br#"{"exp": 1900000000, "scope": "com.atproto.access"}"#);
        let token = format!("eyJhbGciOiJIUzI1NiJ9.{payload}.sig");
        assert_eq!(jwt_expiry(&token).unwrap().timestamp(), 1_900_000_000);
        assert!(jwt_expiry("not-a-jwt").is_none());
    }

    #[tokio::test]
    async fn explicit_parent_wins_and_unavailable_posts_are_recorded() {
        let thread = view(
            post("root", 0, None, 3),
            vec![
                view(post("r1", 1, Some("root"), 1), vec![view(post("r2", 2, Some("r1"), 0), vec![])]),
                // nested under root by the view, but the record says r1
                view(post("r3", 3, Some("r1"), 0), vec![]),
                json!({"$type": "app.bsky.feed.defs#notFoundPost", "uri": uri("gone"), "notFound": true}),
            ],
        );
        let (mock, fetcher) = fetcher(
            MockTransport::new()
                .on_json(
                    &format!("{PUBLIC_API}/xrpc/com.atproto.identity.resolveHandle"),
                    json!({"did": DID}),
                )
                .on_json(&thread_url(), json!({"thread": thread})),
        );

        let ctx = ctx();
        let fetched = fetcher
            .fetch_thread(
                &ThreadReference::new(
                    Platform::Bluesky,
                    "https://bsky.app/profile/alice.bsky.social/post/root",
                ),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(fetched.root.id, uri("root"));
        assert!(fetched.root.parent_id.is_none());
        let ids: Vec<String> = fetched.nodes.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec![uri("r1"), uri("r2"), uri("r3")]);
        let r3 = &fetched.nodes[2];
        assert_eq!(r3.parent_id, Some(uri("r1")));
        assert_eq!(r3.author.as_deref(), Some("alice.bsky.social"));
        assert_eq!(
            ctx.skipped(),
            vec![SkipReason::Unavailable {
                id: uri("gone"),
                reason: "not found".into()
            }]
        );
        assert_eq!(mock.calls()[1].query_value("uri"), Some(uri("root").as_str()));
    }

    #[tokio::test]
    async fn truncated_subtrees_are_refetched() {
        let root = view(
            post("root", 0, None, 1),
            vec![view(post("deep", 1, Some("root"), 1), vec![])],
        );
        let subtree = view(
            post("deep", 1, Some("root"), 1),
            vec![view(post("deeper", 2, Some("deep"), 0), vec![])],
        );
        let (_mock, fetcher) = fetcher(
            MockTransport::new()
                .on_query_json(&thread_url(), &[("uri", uri("root").as_str())], json!({"thread": root}))
                .on_query_json(&thread_url(), &[("uri", uri("deep").as_str())], json!({"thread": subtree})),
        );

        let fetched = fetcher
            .fetch_thread(&ThreadReference::new(Platform::Bluesky, uri("root")), &ctx())
            .await
            .unwrap();

        let ids: Vec<String> = fetched.nodes.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec![uri("deep"), uri("deeper")]);
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let (_mock, fetcher) = fetcher(MockTransport::new().on(
            &thread_url(),
            &[],
            crate::testing::MockReply::Response(crate::transport::RawResponse::new(
                400,
                r#"{"error":"NotFound","message":"Post not found"}"#,
            )),
        ));
        let err = fetcher
            .fetch_thread(&ThreadReference::new(Platform::Bluesky, uri("nope")), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadError::NotFound(_)));
    }

    #[tokio::test]
    async fn exchange_creates_session_with_refresh_token() {
        let mock = Arc::new(MockTransport::new().on_json(
            &format!("{PDS_API}/xrpc/com.atproto.server.createSession"),
            json!({"accessJwt": "a.b.c", "refreshJwt": "refresh", "did": DID, "handle": "alice"}),
        ));
        let exchange = BlueskyExchange::new(Arc::new(RateLimitedTransport::new(
            mock.clone(),
            fast_policy(),
        )));
        let session = exchange
            .exchange(&Credentials::AppPassword {
                identifier: "alice".into(),
                password: "app-pass".into(),
            })
            .await
            .unwrap();

        assert_eq!(session.access_token, "a.b.c");
        assert_eq!(session.refresh_token.as_deref(), Some("refresh"));
        assert!(session.expires_at.is_some());
    }
}
