// Platform strategies. Each one knows a single platform's URLs, pagination
// and payload shapes, and hands raw nodes back to the aggregator. Retry,
// backoff and session handling come from the shared transport and ApiClient.

pub(crate) mod bluesky;
pub(crate) mod hackernews;
pub(crate) mod reddit;
pub(crate) mod twitter;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use threadsignal_common::{Platform, Result, ThreadError};

use crate::auth::AuthSession;

/// Token endpoint reply shared by the OAuth2 client-credentials platforms.
/// Some providers answer 200 with an `error` field instead of a token.
#[derive(Debug, Deserialize)]
pub(crate) struct OAuthTokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

impl OAuthTokenResponse {
    pub(crate) fn into_session(self, platform: Platform) -> Result<AuthSession> {
        match self.access_token {
            Some(token) if !token.is_empty() => {
                let session = AuthSession::new(token);
                Ok(match self.expires_in {
                    Some(secs) => session.expires_in(secs),
                    None => session,
                })
            }
            _ => Err(ThreadError::AuthenticationFailed(format!(
                "{platform} token endpoint returned no token: {}",
                self.error_description
                    .or(self.error)
                    .unwrap_or_else(|| "empty response".to_string())
            ))),
        }
    }
}

/// Errors that end a whole fetch rather than a single node or page.
pub(crate) fn halts_fetch(err: &ThreadError) -> bool {
    matches!(
        err,
        ThreadError::RateLimited { .. }
            | ThreadError::Cancelled
            | ThreadError::AuthenticationFailed(_)
    )
}

pub(crate) fn from_unix_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp(secs.trunc() as i64, 0)
}

pub(crate) fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_reply_with_error_field_fails() {
        let reply: OAuthTokenResponse =
            serde_json::from_str(r#"{"error": "invalid_grant"}"#).unwrap();
        let err = reply.into_session(Platform::Reddit).unwrap_err();
        assert!(matches!(err, ThreadError::AuthenticationFailed(m) if m.contains("invalid_grant")));
    }

    #[test]
    fn token_reply_sets_expiry_when_given() {
        let reply: OAuthTokenResponse =
            serde_json::from_str(r#"{"access_token": "abc", "expires_in": 3600}"#).unwrap();
        let session = reply.into_session(Platform::Reddit).unwrap();
        assert_eq!(session.access_token, "abc");
        assert!(session.expires_at.is_some());

        let reply: OAuthTokenResponse =
            serde_json::from_str(r#"{"access_token": "abc"}"#).unwrap();
        assert!(reply.into_session(Platform::Twitter).unwrap().expires_at.is_none());
    }

    #[test]
    fn timestamps_parse() {
        assert_eq!(from_unix_secs(0.0).unwrap().timestamp(), 0);
        assert!(from_unix_secs(f64::NAN).is_none());
        assert!(parse_rfc3339("2024-05-01T12:00:00.000Z").is_some());
        assert!(parse_rfc3339("yesterday").is_none());
    }
}
