use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ThreadError};

/// Opaque per-platform metadata attached to a node (permalinks, flags, counts).
pub type Metadata = BTreeMap<String, serde_json::Value>;

// --- Platforms ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Reddit,
    Bluesky,
    HackerNews,
    Twitter,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Reddit,
        Platform::Bluesky,
        Platform::HackerNews,
        Platform::Twitter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Reddit => "reddit",
            Platform::Bluesky => "bluesky",
            Platform::HackerNews => "hacker_news",
            Platform::Twitter => "twitter",
        }
    }

    /// Detect the platform from a thread URL. Bare ids carry no platform
    /// information and return `None`.
    pub fn detect(target: &str) -> Option<Platform> {
        let target = target.trim();
        if target.to_ascii_lowercase().starts_with("at://") {
            return Some(Platform::Bluesky);
        }
        let host = url_host(target)?;
        let on = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));
        if on("bsky.app") {
            Some(Platform::Bluesky)
        } else if on("reddit.com") || on("redd.it") {
            Some(Platform::Reddit)
        } else if on("news.ycombinator.com") {
            Some(Platform::HackerNews)
        } else if on("twitter.com") || on("x.com") {
            Some(Platform::Twitter)
        } else {
            None
        }
    }
}

/// Lowercased host of a URL, accepting a missing scheme ("x.com/a/status/1").
fn url_host(target: &str) -> Option<String> {
    let parsed = match url::Url::parse(target) {
        Ok(parsed) if parsed.has_host() => parsed,
        _ if target.contains('.') && !target.contains("://") => {
            url::Url::parse(&format!("https://{target}")).ok()?
        }
        _ => return None,
    };
    parsed.host_str().map(|h| h.to_ascii_lowercase())
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ThreadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "reddit" => Ok(Platform::Reddit),
            "bluesky" | "bsky" => Ok(Platform::Bluesky),
            "hacker_news" | "hackernews" | "hn" => Ok(Platform::HackerNews),
            "twitter" | "x" => Ok(Platform::Twitter),
            other => Err(ThreadError::UnsupportedPlatform(other.to_string())),
        }
    }
}

// --- Caller input ---

/// Points at one discussion thread: a platform tag plus an id or URL that
/// only the owning fetcher interprets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadReference {
    pub platform: Platform,
    pub id_or_url: String,
}

impl ThreadReference {
    pub fn new(platform: Platform, id_or_url: impl Into<String>) -> Self {
        Self {
            platform,
            id_or_url: id_or_url.into().trim().to_string(),
        }
    }

    /// Build a reference from a URL, detecting the platform from the host.
    pub fn parse(target: &str) -> Result<Self> {
        let platform = Platform::detect(target).ok_or_else(|| {
            ThreadError::InvalidReference(format!("cannot detect platform for {target:?}"))
        })?;
        Ok(Self::new(platform, target))
    }
}

impl std::fmt::Display for ThreadReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.platform, self.id_or_url)
    }
}

/// One `Aggregate()` call's input.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadRequest {
    pub reference: ThreadReference,
    /// Stop collecting after this many reply nodes.
    pub max_nodes: Option<usize>,
    /// Drop replies published before this instant. Honored by cursor-search only.
    pub from_date: Option<DateTime<Utc>>,
}

impl ThreadRequest {
    pub fn new(reference: ThreadReference) -> Self {
        Self {
            reference,
            max_nodes: None,
            from_date: None,
        }
    }

    pub fn max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }

    pub fn from_date(mut self, from_date: DateTime<Utc>) -> Self {
        self.from_date = Some(from_date);
        self
    }
}

// --- Fetch-stage nodes ---

/// A platform node as a fetcher produced it, before tree reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub author: Option<String>,
    pub body: String,
    pub published_at: Option<DateTime<Utc>>,
    pub score: Option<i64>,
    /// Child ids the payload announced, whether or not they were returned.
    pub reply_ids: Vec<String>,
    pub metadata: Metadata,
}

impl RawNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            author: None,
            body: String::new(),
            published_at: None,
            score: None,
            reply_ids: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    pub fn with_score(mut self, score: i64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

// --- Canonical tree ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub author: Option<String>,
    pub body: String,
    pub published_at: Option<DateTime<Utc>>,
    pub score: Option<i64>,
    #[serde(default)]
    pub children: Vec<CommentNode>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl CommentNode {
    /// Convert a raw node under the given parent. Children are attached by the tree builder.
    pub fn from_raw(raw: RawNode, parent_id: Option<String>) -> Self {
        Self {
            id: raw.id,
            parent_id,
            author: raw.author,
            body: raw.body,
            published_at: raw.published_at,
            score: raw.score,
            children: Vec::new(),
            metadata: raw.metadata,
        }
    }

    /// Nodes in this subtree, including self.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }

    pub fn find(&self, id: &str) -> Option<&CommentNode> {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.id == id {
                return Some(node);
            }
            stack.extend(node.children.iter());
        }
        None
    }

    /// Ids of the direct children, in order.
    pub fn child_ids(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.id.as_str()).collect()
    }

    /// Longest root-to-leaf path length, counting edges.
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut stack = vec![(self, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            max = max.max(depth);
            stack.extend(node.children.iter().map(|c| (c, depth + 1)));
        }
        max
    }
}

// Unlinks descendants onto a heap stack so dropping a deep chain does not
// recurse once per level.
impl Drop for CommentNode {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.children);
        while let Some(mut node) = stack.pop() {
            stack.append(&mut node.children);
        }
    }
}

// --- Completeness ---

/// Why a result may be missing nodes, or what the builder had to repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    RateLimited {
        processed: usize,
        retry_after_secs: Option<u64>,
    },
    CeilingReached {
        limit: usize,
    },
    Cancelled {
        processed: usize,
    },
    PaginationFailed {
        error: String,
    },
    NodeFetchFailed {
        id: String,
        error: String,
    },
    MalformedNode {
        id: Option<String>,
        error: String,
    },
    Unavailable {
        id: String,
        reason: String,
    },
    RepliesNotExpanded {
        parent_id: String,
        count: u64,
    },
    CycleBroken {
        id: String,
    },
}

impl SkipReason {
    /// Whether this reason means nodes are missing from the result.
    /// A broken cycle repairs an edge but keeps every node.
    pub fn drops_data(&self) -> bool {
        !matches!(self, SkipReason::CycleBroken { .. })
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::RateLimited { processed, .. } => {
                write!(f, "rate limit reached after processing {processed} nodes")
            }
            SkipReason::CeilingReached { limit } => {
                write!(f, "node ceiling of {limit} reached")
            }
            SkipReason::Cancelled { processed } => {
                write!(f, "cancelled after processing {processed} nodes")
            }
            SkipReason::PaginationFailed { error } => {
                write!(f, "pagination stopped early: {error}")
            }
            SkipReason::NodeFetchFailed { id, error } => {
                write!(f, "failed to fetch node {id}: {error}")
            }
            SkipReason::MalformedNode { id: Some(id), error } => {
                write!(f, "skipped malformed node {id}: {error}")
            }
            SkipReason::MalformedNode { id: None, error } => {
                write!(f, "skipped malformed node: {error}")
            }
            SkipReason::Unavailable { id, reason } => {
                write!(f, "node {id} unavailable ({reason})")
            }
            SkipReason::RepliesNotExpanded { parent_id, count } => {
                write!(f, "{count} replies under {parent_id} were not expanded")
            }
            SkipReason::CycleBroken { id } => {
                write!(f, "cyclic parent chain broken at {id}")
            }
        }
    }
}

/// The finished, normalized thread.
///
/// Serializes as the root post's fields at the top level, with nested
/// `children` arrays, followed by completeness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadResult {
    pub platform: Platform,
    #[serde(flatten)]
    pub root: CommentNode,
    /// Reply nodes placed in the tree (the root is not counted).
    pub total_nodes_processed: usize,
    pub may_be_incomplete: bool,
    pub incomplete_reason: Option<String>,
    #[serde(default)]
    pub skipped: Vec<SkipReason>,
}

impl ThreadResult {
    /// Assemble a result, deriving the completeness flag from the skip list.
    pub fn new(
        platform: Platform,
        root: CommentNode,
        total_nodes_processed: usize,
        skipped: Vec<SkipReason>,
    ) -> Self {
        let incomplete_reason = skipped
            .iter()
            .find(|r| r.drops_data())
            .map(|r| r.to_string());
        Self {
            platform,
            root,
            total_nodes_processed,
            may_be_incomplete: incomplete_reason.is_some(),
            incomplete_reason,
            skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_platform_from_urls() {
        assert_eq!(
            Platform::detect("https://www.reddit.com/r/rust/comments/abc123/title/"),
            Some(Platform::Reddit)
        );
        assert_eq!(
            Platform::detect("https://bsky.app/profile/alice.bsky.social/post/3kxyz"),
            Some(Platform::Bluesky)
        );
        assert_eq!(
            Platform::detect("at://did:plc:abc/app.bsky.feed.post/3kxyz"),
            Some(Platform::Bluesky)
        );
        assert_eq!(
            Platform::detect("https://news.ycombinator.com/item?id=8863"),
            Some(Platform::HackerNews)
        );
        assert_eq!(
            Platform::detect("https://x.com/someone/status/1234"),
            Some(Platform::Twitter)
        );
        assert_eq!(Platform::detect("8863"), None);
    }

    #[test]
    fn detection_matches_whole_host_labels() {
        assert_eq!(
            Platform::detect("https://mobile.twitter.com/someone/status/1234"),
            Some(Platform::Twitter)
        );
        assert_eq!(
            Platform::detect("old.reddit.com/r/rust/comments/abc123/"),
            Some(Platform::Reddit)
        );
        assert_eq!(Platform::detect("https://box.com/someone/status/1234"), None);
        assert_eq!(Platform::detect("https://netflix.com/title/80100172"), None);
        assert_eq!(Platform::detect("https://notreddit.com/r/rust/"), None);
        assert_eq!(Platform::detect("https://example.com/?next=x.com/status/1"), None);
    }

    #[test]
    fn parses_platform_names() {
        assert_eq!("HN".parse::<Platform>().unwrap(), Platform::HackerNews);
        assert_eq!("x".parse::<Platform>().unwrap(), Platform::Twitter);
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn reference_parse_requires_detectable_platform() {
        let reference = ThreadReference::parse(" https://redd.it/abc123 ").unwrap();
        assert_eq!(reference.platform, Platform::Reddit);
        assert_eq!(reference.id_or_url, "https://redd.it/abc123");
        assert!(matches!(
            ThreadReference::parse("abc123"),
            Err(ThreadError::InvalidReference(_))
        ));
    }

    #[test]
    fn result_flag_follows_data_dropping_reasons() {
        let root = CommentNode::from_raw(RawNode::new("p1"), None);

        let repaired = ThreadResult::new(
            Platform::Reddit,
            root.clone(),
            2,
            vec![SkipReason::CycleBroken { id: "x".into() }],
        );
        assert!(!repaired.may_be_incomplete);
        assert!(repaired.incomplete_reason.is_none());

        let throttled = ThreadResult::new(
            Platform::Reddit,
            root,
            212,
            vec![
                SkipReason::CycleBroken { id: "x".into() },
                SkipReason::RateLimited {
                    processed: 212,
                    retry_after_secs: None,
                },
            ],
        );
        assert!(throttled.may_be_incomplete);
        assert_eq!(
            throttled.incomplete_reason.as_deref(),
            Some("rate limit reached after processing 212 nodes")
        );
    }

    #[test]
    fn tree_helpers_walk_the_whole_subtree() {
        let mut root = CommentNode::from_raw(RawNode::new("p1"), None);
        let mut c1 = CommentNode::from_raw(RawNode::new("c1"), Some("p1".into()));
        c1.children
            .push(CommentNode::from_raw(RawNode::new("c2"), Some("c1".into())));
        root.children.push(c1);
        root.children
            .push(CommentNode::from_raw(RawNode::new("c3"), Some("p1".into())));

        assert_eq!(root.node_count(), 4);
        assert_eq!(root.depth(), 2);
        assert_eq!(root.child_ids(), vec!["c1", "c3"]);
        assert_eq!(root.find("c2").unwrap().parent_id.as_deref(), Some("c1"));
        assert!(root.find("zzz").is_none());
    }
}
