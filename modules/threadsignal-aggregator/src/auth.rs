// Token lifecycle for one platform + credential pair.
//
// Unauthenticated -> Authenticating -> Authenticated -> Expired -> Authenticating(refresh)
//
// The in-flight exchange is a shared future: concurrent callers clone it and
// await the same outcome instead of issuing duplicate exchanges. The state
// lock is never held across an await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{info, warn};

use threadsignal_common::{Credentials, Platform, Result, ThreadError};

/// Access token plus expiry and, where the platform issues one, a refresh token.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// `None` for tokens that do not expire on their own.
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn expires_in(self, seconds: i64) -> Self {
        self.with_expiry(Utc::now() + chrono::Duration::seconds(seconds))
    }

    pub fn is_expired(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        self.expires_at.is_some_and(|at| now + skew >= at)
    }
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A platform's credential exchange.
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    /// Trade credentials for a fresh session.
    async fn exchange(&self, credentials: &Credentials) -> Result<AuthSession>;

    /// Renew an expired session. Platforms without refresh tokens re-exchange.
    async fn refresh(&self, credentials: &Credentials, expired: &AuthSession) -> Result<AuthSession> {
        let _ = expired;
        self.exchange(credentials).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
}

type Flight = Shared<BoxFuture<'static, Result<AuthSession>>>;

enum AuthState {
    Unauthenticated,
    Authenticating { flight: Flight, generation: u64 },
    Authenticated(AuthSession),
}

pub struct TokenAuthenticator {
    platform: Platform,
    credentials: Credentials,
    exchange: Arc<dyn CredentialExchange>,
    state: Mutex<AuthState>,
    generation: AtomicU64,
    expiry_skew: chrono::Duration,
}

impl TokenAuthenticator {
    pub fn new(
        platform: Platform,
        credentials: Credentials,
        exchange: Arc<dyn CredentialExchange>,
    ) -> Self {
        Self {
            platform,
            credentials,
            exchange,
            state: Mutex::new(AuthState::Unauthenticated),
            generation: AtomicU64::new(0),
            expiry_skew: chrono::Duration::seconds(30),
        }
    }

    /// Treat sessions as expired this long before their stated expiry.
    pub fn with_expiry_skew(mut self, skew: chrono::Duration) -> Self {
        self.expiry_skew = skew;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// The platform + credential pair this authenticator owns a session for.
    pub fn key(&self) -> (Platform, &str) {
        (self.platform, self.credentials.identity())
    }

    pub fn status(&self) -> AuthStatus {
        match &*self.lock_state() {
            AuthState::Unauthenticated => AuthStatus::Unauthenticated,
            AuthState::Authenticating { .. } => AuthStatus::Authenticating,
            AuthState::Authenticated(session) if session.is_expired(Utc::now(), self.expiry_skew) => {
                AuthStatus::Expired
            }
            AuthState::Authenticated(_) => AuthStatus::Authenticated,
        }
    }

    /// Return a valid session, authenticating or refreshing first if needed.
    /// Concurrent callers share a single in-flight exchange.
    pub async fn ensure_valid_session(&self) -> Result<AuthSession> {
        let (flight, generation) = {
            let mut state = self.lock_state();
            let mut previous = None;
            let joined = match &*state {
                AuthState::Authenticated(session)
                    if !session.is_expired(Utc::now(), self.expiry_skew) =>
                {
                    return Ok(session.clone());
                }
                AuthState::Authenticating { flight, generation } => {
                    Some((flight.clone(), *generation))
                }
                AuthState::Authenticated(expired) => {
                    previous = Some(expired.clone());
                    None
                }
                AuthState::Unauthenticated => None,
            };
            match joined {
                Some(in_flight) => in_flight,
                None => self.begin_flight(&mut state, previous),
            }
        };

        let outcome = flight.await;

        let mut state = self.lock_state();
        let current = matches!(
            &*state,
            AuthState::Authenticating { generation: g, .. } if *g == generation
        );
        if current {
            *state = match &outcome {
                Ok(session) => AuthState::Authenticated(session.clone()),
                Err(_) => AuthState::Unauthenticated,
            };
        }
        outcome
    }

    /// Mark a session the platform rejected as expired, so the next
    /// `ensure_valid_session` refreshes it. Stale sessions are ignored.
    pub fn invalidate(&self, rejected: &AuthSession) {
        let mut state = self.lock_state();
        if let AuthState::Authenticated(current) = &mut *state {
            if current.access_token == rejected.access_token {
                info!(platform = %self.platform, "Access token rejected, session marked expired");
                current.expires_at = Some(DateTime::<Utc>::MIN_UTC);
            }
        }
    }

    fn begin_flight(
        &self,
        state: &mut MutexGuard<'_, AuthState>,
        previous: Option<AuthSession>,
    ) -> (Flight, u64) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let flight = authenticate(
            self.platform,
            self.credentials.clone(),
            self.exchange.clone(),
            previous,
        )
        .boxed()
        .shared();
        **state = AuthState::Authenticating {
            flight: flight.clone(),
            generation,
        };
        (flight, generation)
    }

    fn lock_state(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn authenticate(
    platform: Platform,
    credentials: Credentials,
    exchange: Arc<dyn CredentialExchange>,
    previous: Option<AuthSession>,
) -> Result<AuthSession> {
    let outcome = match previous.filter(|s| s.refresh_token.is_some()) {
        Some(expired) => {
            info!(%platform, "Refreshing access token");
            match exchange.refresh(&credentials, &expired).await {
                Ok(session) => Ok(session),
                Err(err) => {
                    warn!(%platform, error = %err, "Token refresh failed, re-authenticating");
                    exchange.exchange(&credentials).await
                }
            }
        }
        None => {
            info!(%platform, identity = credentials.identity(), "Authenticating");
            exchange.exchange(&credentials).await
        }
    };

    match outcome {
        Ok(session) => {
            info!(%platform, expires_at = ?session.expires_at, "Authenticated");
            Ok(session)
        }
        Err(ThreadError::AuthenticationFailed(msg)) => {
            warn!(%platform, error = %msg, "Authentication failed");
            Err(ThreadError::AuthenticationFailed(msg))
        }
        Err(other) => {
            warn!(%platform, error = %other, "Authentication failed");
            Err(ThreadError::AuthenticationFailed(format!("{platform}: {other}")))
        }
    }
}
