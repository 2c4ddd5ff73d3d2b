// Twitter/X: cursor-search strategy over API v2.
//
// Replies are not linked from the tweet itself. They are found with a
// recent-search for `conversation_id:{root}` and paged with `next_token`.
// Each result names its direct parent in `referenced_tweets`. The API only
// reads with an app bearer token, so this fetcher always needs credentials.

use std::collections::HashMap;
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
use crate::services::{parse_rfc3339, OAuthTokenResponse};
use crate::transport::{ApiRequest, RateLimitedTransport, RequestBudget};

pub(crate) const API_BASE: &str = "https://api.twitter.com/2";
pub(crate) const TOKEN_URL: &str = "https://api.twitter.com/oauth2/token";

const PAGE_SIZE: &str = "100";
const TWEET_FIELDS: &str =
    "author_id,conversation_id,created_at,in_reply_to_user_id,referenced_tweets,public_metrics";
const USER_FIELDS: &str = "username,name";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LookupResponse {
    data: Option<Tweet>,
    #[serde(default)]
    includes: Includes,
    #[serde(default)]
    errors: Vec<ApiProblem>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    /// Parsed one tweet at a time so a malformed entry does not fail the page.
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(default)]
    includes: Includes,
    meta: Option<SearchMeta>,
}

#[derive(Debug, Deserialize)]
struct SearchMeta {
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    #[serde(default)]
    text: String,
    author_id: Option<String>,
    conversation_id: Option<String>,
    created_at: Option<String>,
    #[serde(default)]
    referenced_tweets: Vec<ReferencedTweet>,
    public_metrics: Option<PublicMetrics>,
}

#[derive(Debug, Deserialize)]
struct ReferencedTweet {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    like_count: i64,
    #[serde(default)]
    reply_count: u64,
    #[serde(default)]
    retweet_count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct ApiProblem {
    #[serde(default)]
    detail: String,
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

pub(crate) struct TwitterFetcher {
    api: ApiClient,
}

impl TwitterFetcher {
    pub(crate) fn new(
        transport: Arc<RateLimitedTransport>,
        auth: Option<Arc<TokenAuthenticator>>,
    ) -> Self {
        Self {
            api: ApiClient::new(Platform::Twitter, transport, auth),
        }
    }

    async fn lookup(&self, id: &str, ctx: &FetchContext) -> Result<(Tweet, Includes)> {
        let request = ApiRequest::get(format!("{API_BASE}/tweets/{id}"))
            .query("tweet.fields", TWEET_FIELDS)
            .query("expansions", "author_id")
            .query("user.fields", USER_FIELDS);
        let resp: LookupResponse = self.api.get_json(ctx, request).await?;
        match resp.data {
            Some(tweet) => Ok((tweet, resp.includes)),
            None => {
                let detail = resp
                    .errors
                    .into_iter()
                    .map(|e| e.detail)
                    .next()
                    .unwrap_or_else(|| format!("tweet {id}"));
                Err(ThreadError::NotFound(detail))
            }
        }
    }

    /// The conversation's first tweet, or `tweet` itself if it is the root
    /// or the root is gone.
    async fn conversation_root(
        &self,
        tweet: Tweet,
        includes: Includes,
        ctx: &FetchContext,
    ) -> Result<(Tweet, Includes)> {
        let Some(conversation) = tweet.conversation_id.clone().filter(|c| *c != tweet.id) else {
            return Ok((tweet, includes));
        };
        debug!(id = %tweet.id, %conversation, "Fetching conversation root");
        match self.lookup(&conversation, ctx).await {
            Ok(root) => Ok(root),
            Err(ThreadError::NotFound(detail)) => {
                warn!(%conversation, %detail, "Conversation root unavailable, rooting at requested tweet");
                Ok((tweet, includes))
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl PlatformFetcher for TwitterFetcher {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn requires_auth(&self) -> bool {
        true
    }

    fn authenticator(&self) -> Option<&Arc<TokenAuthenticator>> {
        self.api.authenticator()
    }

    async fn fetch_thread(
        &self,
        reference: &ThreadReference,
        ctx: &FetchContext,
    ) -> Result<FetchedThread> {
        let id = extract_tweet_id(&reference.id_or_url)?;
        info!(%id, "twitter: fetching conversation");

        let (tweet, includes) = self.lookup(&id, ctx).await?;
        let (root_tweet, includes) = self.conversation_root(tweet, includes, ctx).await?;
        let mut usernames: HashMap<String, String> = includes
            .users
            .into_iter()
            .map(|u| (u.id, u.username))
            .collect();
        let conversation = root_tweet.id.clone();
        ctx.mark_seen(&conversation);
        let root = tweet_to_raw(root_tweet, None, &usernames);

        let mut nodes = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        'pages: loop {
            if ctx.should_stop() {
                break;
            }
            let mut request = ApiRequest::get(format!("{API_BASE}/tweets/search/recent"))
                .query("query", format!("conversation_id:{conversation}"))
                .query("max_results", PAGE_SIZE)
                .query("tweet.fields", TWEET_FIELDS)
                .query("expansions", "author_id")
                .query("user.fields", USER_FIELDS);
            if let Some(token) = &cursor {
                request = request.query("next_token", token.as_str());
            }

            let page: SearchResponse = match self.api.get_json(ctx, request).await {
                Ok(page) => page,
                Err(err) => {
                    ctx.record_interruption(&err);
                    break;
                }
            };
            pages += 1;
            usernames.extend(page.includes.users.into_iter().map(|u| (u.id, u.username)));

            for entry in page.data {
                let id_hint = entry.get("id").and_then(|v| v.as_str()).map(String::from);
                let tweet: Tweet = match serde_json::from_value(entry) {
                    Ok(tweet) => tweet,
                    Err(err) => {
                        debug!(id = ?id_hint, error = %err, "Skipping malformed tweet");
                        ctx.record(SkipReason::MalformedNode {
                            id: id_hint,
                            error: err.to_string(),
                        });
                        continue;
                    }
                };
                if let (Some(from), Some(at)) = (
                    ctx.from_date(),
                    tweet.created_at.as_deref().and_then(parse_rfc3339),
                ) {
                    if at < from {
                        continue;
                    }
                }
                match ctx.admit(&tweet.id) {
                    Admission::Accepted => {
                        nodes.push(tweet_to_raw(tweet, Some(conversation.as_str()), &usernames))
                    }
                    Admission::Duplicate => {}
                    Admission::Full => break 'pages,
                }
            }

            match page.meta.and_then(|m| m.next_token) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(%conversation, pages, nodes = nodes.len(), "twitter: conversation fetched");
        Ok(FetchedThread { root, nodes })
    }
}

fn tweet_to_raw(
    tweet: Tweet,
    conversation: Option<&str>,
    usernames: &HashMap<String, String>,
) -> RawNode {
    let parent = tweet
        .referenced_tweets
        .iter()
        .find(|r| r.kind == "replied_to")
        .map(|r| r.id.clone())
        .or_else(|| conversation.map(String::from));
    let author = tweet
        .author_id
        .as_ref()
        .and_then(|id| usernames.get(id).cloned().or_else(|| Some(id.clone())));

    let mut raw = RawNode::new(tweet.id).with_body(tweet.text);
    raw.parent_id = parent;
    raw.author = author;
    raw.published_at = tweet.created_at.as_deref().and_then(parse_rfc3339);
    if let Some(metrics) = tweet.public_metrics {
        raw.score = Some(metrics.like_count);
        raw = raw
            .with_metadata("reply_count", metrics.reply_count)
            .with_metadata("retweet_count", metrics.retweet_count);
    }
    if let Some(author_id) = tweet.author_id {
        raw = raw.with_metadata("author_id", author_id);
    }
    raw
}

/// Tweet id from a twitter.com / x.com status URL or a bare id.
pub(crate) fn extract_tweet_id(input: &str) -> Result<String> {
    let input = input.trim();
    let candidate = match url::Url::parse(input) {
        Ok(parsed) => {
            let segments: Vec<&str> = parsed.path_segments().map(|s| s.collect()).unwrap_or_default();
            segments
                .windows(2)
                .find(|pair| pair[0] == "status")
                .map(|pair| pair[1].to_string())
                .unwrap_or_default()
        }
        Err(_) => input.to_string(),
    };
    if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()) {
        Ok(candidate)
    } else {
        Err(ThreadError::InvalidReference(format!(
            "not a tweet reference: {input}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Credential exchange
// ---------------------------------------------------------------------------

/// App-only bearer token from the API key and secret.
pub(crate) struct TwitterExchange {
    transport: Arc<RateLimitedTransport>,
}

impl TwitterExchange {
    pub(crate) fn new(transport: Arc<RateLimitedTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl CredentialExchange for TwitterExchange {
    async fn exchange(&self, credentials: &Credentials) -> Result<AuthSession> {
        let Credentials::ClientSecret {
            client_id,
            client_secret,
        } = credentials
        else {
            return Err(ThreadError::AuthenticationFailed(
                "twitter requires an API key and secret".to_string(),
            ));
        };
        let request = ApiRequest::post(TOKEN_URL)
            .basic_auth(client_id.as_str(), client_secret.as_str())
            .form(&[("grant_type", "client_credentials")]);
        let resp = self
            .transport
            .execute(&RequestBudget::standalone(), &request)
            .await?;
        resp.json::<OAuthTokenResponse>()?.into_session(Platform::Twitter)
    }
}
