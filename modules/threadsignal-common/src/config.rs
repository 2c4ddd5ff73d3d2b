use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::{Result, ThreadError};
use crate::types::Platform;

/// Credential material for one platform. Consumed for a session's lifetime,
/// never persisted.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// OAuth client-credentials grant (Reddit, Twitter).
    ClientSecret {
        client_id: String,
        client_secret: String,
    },
    /// Username plus app password (Bluesky).
    AppPassword { identifier: String, password: String },
}

impl Credentials {
    /// Public half of the credential pair. Sessions are keyed on it.
    pub fn identity(&self) -> &str {
        match self {
            Credentials::ClientSecret { client_id, .. } => client_id,
            Credentials::AppPassword { identifier, .. } => identifier,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ClientSecret { client_id, .. } => f
                .debug_struct("ClientSecret")
                .field("client_id", client_id)
                .field("client_secret", &"[redacted]")
                .finish(),
            Credentials::AppPassword { identifier, .. } => f
                .debug_struct("AppPassword")
                .field("identifier", identifier)
                .field("password", &"[redacted]")
                .finish(),
        }
    }
}

/// Source of per-platform credentials.
pub trait CredentialStore: Send + Sync {
    fn credentials(&self, platform: Platform) -> Option<Credentials>;
}

impl CredentialStore for HashMap<Platform, Credentials> {
    fn credentials(&self, platform: Platform) -> Option<Credentials> {
        self.get(&platform).cloned()
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Platform credentials
    pub reddit_client_id: Option<String>,
    pub reddit_client_secret: Option<String>,
    pub bluesky_identifier: Option<String>,
    pub bluesky_app_password: Option<String>,
    pub twitter_api_key: Option<String>,
    pub twitter_api_secret: Option<String>,

    // HTTP
    pub user_agent: String,
    pub http_timeout: Duration,

    // Fetch limits
    pub max_retries: u32,
    pub retry_budget: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_requests: usize,
    pub fan_out_concurrency: usize,
    pub max_nodes: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reddit_client_id: None,
            reddit_client_secret: None,
            bluesky_identifier: None,
            bluesky_app_password: None,
            twitter_api_key: None,
            twitter_api_secret: None,
            user_agent: format!("threadsignal/{}", env!("CARGO_PKG_VERSION")),
            http_timeout: Duration::from_secs(30),
            max_retries: 5,
            retry_budget: 50,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_requests: 2000,
            fan_out_concurrency: 50,
            max_nodes: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables. Every variable is
    /// optional; unparseable numbers are a configuration error.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            reddit_client_id: optional_env("REDDIT_CLIENT_ID"),
            reddit_client_secret: optional_env("REDDIT_CLIENT_SECRET"),
            bluesky_identifier: optional_env("BLUESKY_IDENTIFIER"),
            bluesky_app_password: optional_env("BLUESKY_APP_PASSWORD"),
            twitter_api_key: optional_env("TWITTER_API_KEY"),
            twitter_api_secret: optional_env("TWITTER_API_SECRET"),
            user_agent: optional_env("HTTP_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout: Duration::from_secs(parsed_env(
                "HTTP_TIMEOUT_SECS",
                defaults.http_timeout.as_secs(),
            )?),
            max_retries: parsed_env("FETCH_MAX_RETRIES", defaults.max_retries)?,
            retry_budget: parsed_env("FETCH_RETRY_BUDGET", defaults.retry_budget)?,
            backoff_base: Duration::from_millis(parsed_env(
                "FETCH_BACKOFF_BASE_MS",
                defaults.backoff_base.as_millis() as u64,
            )?),
            backoff_max: Duration::from_millis(parsed_env(
                "FETCH_BACKOFF_MAX_MS",
                defaults.backoff_max.as_millis() as u64,
            )?),
            max_requests: parsed_env("FETCH_MAX_REQUESTS", defaults.max_requests)?,
            fan_out_concurrency: parsed_env("FETCH_CONCURRENCY", defaults.fan_out_concurrency)?
                .max(1),
            max_nodes: optional_env("FETCH_MAX_NODES")
                .map(|v| parse_value("FETCH_MAX_NODES", &v))
                .transpose()?,
        })
    }

    /// Log which credentials are present without printing any secret.
    pub fn log_redacted(&self) {
        info!(
            reddit = self.reddit_client_id.is_some() && self.reddit_client_secret.is_some(),
            bluesky = self.bluesky_identifier.is_some() && self.bluesky_app_password.is_some(),
            twitter = self.twitter_api_key.is_some() && self.twitter_api_secret.is_some(),
            max_retries = self.max_retries,
            retry_budget = self.retry_budget,
            max_requests = self.max_requests,
            fan_out_concurrency = self.fan_out_concurrency,
            max_nodes = ?self.max_nodes,
            "Loaded config"
        );
    }
}

impl CredentialStore for Config {
    fn credentials(&self, platform: Platform) -> Option<Credentials> {
        match platform {
            Platform::Reddit => Some(Credentials::ClientSecret {
                client_id: self.reddit_client_id.clone()?,
                client_secret: self.reddit_client_secret.clone()?,
            }),
            Platform::Bluesky => Some(Credentials::AppPassword {
                identifier: self.bluesky_identifier.clone()?,
                password: self.bluesky_app_password.clone()?,
            }),
            Platform::Twitter => Some(Credentials::ClientSecret {
                client_id: self.twitter_api_key.clone()?,
                client_secret: self.twitter_api_secret.clone()?,
            }),
            Platform::HackerNews => None,
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match optional_env(key) {
        Some(value) => parse_value(key, &value),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ThreadError::Config(format!("{key} must be a number, got {value:?}")))
}
