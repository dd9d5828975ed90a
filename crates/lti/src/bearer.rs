//! Internal bearer tokens: the launching user, signed with a process-local
//! key, so the frontend can call our API after the launch.
//!
//! Restarting the process rotates the key and invalidates every token.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use margin_core::error::{MarginError, Result};
use margin_core::models::lti_user::LtiUser;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
struct BearerClaims {
    user: LtiUser,
    iat: i64,
    exp: i64,
}

pub struct BearerTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl BearerTokens {
    /// Tokens signed with a fresh random key.
    pub fn new(lifetime_secs: u64) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::with_secret(&secret, lifetime_secs)
    }

    pub fn with_secret(secret: &[u8], lifetime_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            lifetime: Duration::seconds(lifetime_secs as i64),
        }
    }

    pub fn issue(&self, user: &LtiUser) -> Result<String> {
        let now = Utc::now();
        let claims = BearerClaims {
            user: user.clone(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| MarginError::Crypto(format!("failed to sign bearer token: {e}")))
    }

    /// The `Authorization` header value for `user`.
    pub fn authorization(&self, user: &LtiUser) -> Result<String> {
        Ok(format!("Bearer {}", self.issue(user)?))
    }

    pub fn verify(&self, token: &str) -> std::result::Result<LtiUser, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<BearerClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims.user)
            .map_err(|e| {
                debug!(error = %e, "rejected bearer token");
                ApiError::Unauthorized("invalid or expired bearer token".into())
            })
    }
}

/// The user an API request is made for.
///
/// Read from `Authorization: Bearer ...`, or from an `authorization` query
/// parameter for browser redirects that cannot set headers.
#[derive(Debug, Clone)]
pub struct AuthUser(pub LtiUser);

fn strip_bearer(value: &str) -> &str {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim()
}

fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        return Some(strip_bearer(value).to_string());
    }
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "authorization")
        .map(|(_, v)| strip_bearer(&v).to_string())
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = token_from_parts(parts)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
        state.bearer.verify(&token).map(AuthUser)
    }
}
