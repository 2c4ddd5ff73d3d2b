// Aggregator: the public entry point. Callers hand it a ThreadRequest and a
// cancellation token and get back one normalized ThreadResult.
//
// The aggregator owns one fetcher per platform and, for platforms with
// credentials, one long-lived TokenAuthenticator. Everything else (retry
// budget, seen set, skip list) is created fresh per call.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use threadsignal_common::{
    Config, CredentialStore, Platform, Result, ThreadError, ThreadRequest, ThreadResult,
};

use crate::auth::{AuthStatus, CredentialExchange, TokenAuthenticator};
use crate::context::FetchContext;
use crate::fetcher::PlatformFetcher;
use crate::services::bluesky::{BlueskyExchange, BlueskyFetcher};
use crate::services::hackernews::HackerNewsFetcher;
use crate::services::reddit::{RedditExchange, RedditFetcher};
use crate::services::twitter::{TwitterExchange, TwitterFetcher};
use crate::transport::{HttpTransport, RateLimitedTransport, ReqwestTransport, RequestBudget, RetryPolicy};
use crate::tree::TreeBuilder;

/// Per-call limits applied to every fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchSettings {
    pub retry: RetryPolicy,
    /// Retries shared by all requests of one call.
    pub retry_budget: u32,
    /// HTTP calls allowed per call.
    pub max_requests: usize,
    /// Fan-out concurrency cap.
    pub concurrency: usize,
    /// Default node ceiling when the request sets none.
    pub max_nodes: Option<usize>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retry_budget: 50,
            max_requests: 2000,
            concurrency: 50,
            max_nodes: None,
        }
    }
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            retry_budget: config.retry_budget,
            max_requests: config.max_requests,
            concurrency: config.fan_out_concurrency,
            max_nodes: config.max_nodes,
        }
    }
}

pub struct Aggregator {
    fetchers: HashMap<Platform, Arc<dyn PlatformFetcher>>,
    settings: FetchSettings,
}

impl Aggregator {
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::default()
    }

    /// Production aggregator: reqwest transport, credentials and limits from
    /// the environment config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = ReqwestTransport::from_config(config)?;
        Self::builder()
            .transport(Arc::new(transport))
            .credentials(Arc::new(config.clone()))
            .settings(FetchSettings::from_config(config))
            .build()
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.fetchers.keys().copied().collect();
        platforms.sort();
        platforms
    }

    /// Session state for a platform, `None` if it has no credentials.
    pub fn auth_status(&self, platform: Platform) -> Option<AuthStatus> {
        self.fetchers
            .get(&platform)?
            .authenticator()
            .map(|auth| auth.status())
    }

    /// Fetch one thread and rebuild its comment tree.
    ///
    /// Fails only when the root cannot be fetched or authentication never
    /// succeeds. Anything lost after the root is in hand, including
    /// cancellation, yields a partial result with `may_be_incomplete`.
    pub async fn aggregate(
        &self,
        request: ThreadRequest,
        cancel: CancellationToken,
    ) -> Result<ThreadResult> {
        let platform = request.reference.platform;
        let fetcher = self
            .fetchers
            .get(&platform)
            .ok_or_else(|| ThreadError::UnsupportedPlatform(platform.to_string()))?;
        if cancel.is_cancelled() {
            return Err(ThreadError::Cancelled);
        }

        match fetcher.authenticator() {
            Some(auth) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ThreadError::Cancelled),
                    session = auth.ensure_valid_session() => { session?; }
                }
            }
            None if fetcher.requires_auth() => {
                warn!(%platform, "No credentials configured");
                return Err(ThreadError::AuthenticationFailed(format!(
                    "{platform} requires credentials and none are configured"
                )));
            }
            None => {}
        }

        let budget = RequestBudget::new(
            self.settings.retry_budget,
            self.settings.max_requests,
            cancel.child_token(),
        );
        let ctx = FetchContext::new(budget, self.settings.concurrency)
            .with_max_nodes(request.max_nodes.or(self.settings.max_nodes))
            .with_from_date(request.from_date);

        info!(reference = %request.reference, "Aggregating thread");
        let fetched = fetcher.fetch_thread(&request.reference, &ctx).await?;
        let built = TreeBuilder::build(fetched.root, fetched.nodes);

        let mut skipped = ctx.skipped();
        skipped.extend(built.skipped);
        let result = ThreadResult::new(platform, built.root, built.processed, skipped);

        info!(
            reference = %request.reference,
            nodes = result.total_nodes_processed,
            orphans_adopted = built.orphans_adopted,
            requests = ctx.budget().requests_made(),
            retries = ctx.budget().retries_used(),
            may_be_incomplete = result.may_be_incomplete,
            "Thread aggregated"
        );
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct AggregatorBuilder {
    transport: Option<Arc<dyn HttpTransport>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    settings: FetchSettings,
    overrides: Vec<Arc<dyn PlatformFetcher>>,
}

impl AggregatorBuilder {
    /// HTTP client every fetcher and credential exchange goes through.
    /// Defaults to reqwest.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn settings(mut self, settings: FetchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the built-in fetcher for `fetcher.platform()`.
    pub fn fetcher(mut self, fetcher: Arc<dyn PlatformFetcher>) -> Self {
        self.overrides.push(fetcher);
        self
    }

    pub fn build(self) -> Result<Aggregator> {
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::from_config(&Config::default())?),
        };
        let http = Arc::new(RateLimitedTransport::new(transport, self.settings.retry));
        let credentials = self.credentials;

        let authenticator = |platform: Platform, exchange: Arc<dyn CredentialExchange>| {
            let creds = credentials.as_ref()?.credentials(platform)?;
            info!(%platform, identity = creds.identity(), "Credentials configured");
            Some(Arc::new(TokenAuthenticator::new(platform, creds, exchange)))
        };

        let mut fetchers: HashMap<Platform, Arc<dyn PlatformFetcher>> = HashMap::new();
        fetchers.insert(
            Platform::Reddit,
            Arc::new(RedditFetcher::new(
                http.clone(),
                authenticator(Platform::Reddit, Arc::new(RedditExchange::new(http.clone()))),
            )),
        );
        fetchers.insert(
            Platform::Bluesky,
            Arc::new(BlueskyFetcher::new(
                http.clone(),
                authenticator(Platform::Bluesky, Arc::new(BlueskyExchange::new(http.clone()))),
            )),
        );
        fetchers.insert(
            Platform::HackerNews,
            Arc::new(HackerNewsFetcher::new(http.clone())),
        );
        fetchers.insert(
            Platform::Twitter,
            Arc::new(TwitterFetcher::new(
                http.clone(),
                authenticator(Platform::Twitter, Arc::new(TwitterExchange::new(http.clone()))),
            )),
        );
        for fetcher in self.overrides {
            fetchers.insert(fetcher.platform(), fetcher);
        }

        Ok(Aggregator {
            fetchers,
            settings: self.settings,
        })
    }
}
