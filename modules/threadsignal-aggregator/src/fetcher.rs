// The shared fetcher contract plus the authenticated call helper every
// platform strategy uses.
//
// Strategies own URL building, pagination and payload parsing. Retry,
// backoff and the 401-refresh-once rule live here and in the transport, so
// no platform re-implements them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::info;

use threadsignal_common::{Platform, RawNode, Result, ThreadError, ThreadReference};

use crate::auth::TokenAuthenticator;
use crate::context::FetchContext;
use crate::transport::{ApiRequest, RateLimitedTransport, RawResponse};

/// The root post and every reply node a fetch collected.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedThread {
    pub root: RawNode,
    pub nodes: Vec<RawNode>,
}

#[async_trait]
pub trait PlatformFetcher: Send + Sync {
    fn platform(&self) -> Platform;

    /// Whether this platform can only be read with a session.
    fn requires_auth(&self) -> bool {
        false
    }

    /// The authenticator for this fetcher's credentials, if it has any.
    fn authenticator(&self) -> Option<&Arc<TokenAuthenticator>>;

    /// Fetch a thread. Fails only when the root itself cannot be fetched;
    /// anything lost after that is recorded on `ctx` and the partial
    /// collection is returned.
    async fn fetch_thread(
        &self,
        reference: &ThreadReference,
        ctx: &FetchContext,
    ) -> Result<FetchedThread>;
}

/// Transport plus optional session, shared by the platform strategies.
#[derive(Clone)]
pub(crate) struct ApiClient {
    platform: Platform,
    transport: Arc<RateLimitedTransport>,
    auth: Option<Arc<TokenAuthenticator>>,
}

impl ApiClient {
    pub(crate) fn new(
        platform: Platform,
        transport: Arc<RateLimitedTransport>,
        auth: Option<Arc<TokenAuthenticator>>,
    ) -> Self {
        Self {
            platform,
            transport,
            auth,
        }
    }

    pub(crate) fn authenticator(&self) -> Option<&Arc<TokenAuthenticator>> {
        self.auth.as_ref()
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &FetchContext,
        request: ApiRequest,
    ) -> Result<T> {
        self.send(ctx, request).await?.json()
    }

    /// Send through the retrying transport. With a session, a 401 marks the
    /// token expired and the call is retried once with a fresh one; a second
    /// 401 is an authentication failure.
    pub(crate) async fn send(&self, ctx: &FetchContext, request: ApiRequest) -> Result<RawResponse> {
        let Some(auth) = &self.auth else {
            return match self.transport.execute(ctx.budget(), &request).await {
                Err(ThreadError::Unauthorized(msg)) => Err(ThreadError::AuthenticationFailed(msg)),
                other => other,
            };
        };

        let session = auth.ensure_valid_session().await?;
        let first = self
            .transport
            .execute(ctx.budget(), &request.clone().bearer_auth(&session.access_token))
            .await;
        match first {
            Err(ThreadError::Unauthorized(msg)) => {
                info!(platform = %self.platform, reason = %msg, "Session rejected, refreshing once");
                auth.invalidate(&session);
                let fresh = auth.ensure_valid_session().await?;
                match self
                    .transport
                    .execute(ctx.budget(), &request.bearer_auth(&fresh.access_token))
                    .await
                {
                    Err(ThreadError::Unauthorized(msg)) => {
                        Err(ThreadError::AuthenticationFailed(msg))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}
