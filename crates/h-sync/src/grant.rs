//! Grant tokens: short-lived HS256 JWTs the annotation client exchanges for
//! an access token acting as the launching user.

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use margin_core::config::HConfig;
use margin_core::error::{MarginError, Result};
use margin_core::models::h_user::HUser;

const GRANT_LIFETIME_MINUTES: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrantClaims {
    pub aud: String,
    pub iss: String,
    pub sub: String,
    pub nbf: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct GrantTokenIssuer {
    audience: String,
    client_id: String,
    key: EncodingKey,
    authority: String,
}

impl GrantTokenIssuer {
    pub fn new(config: &HConfig) -> Result<Self> {
        let audience = url::Url::parse(&config.api_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| MarginError::Config(format!("h.api_url has no host: {}", config.api_url)))?;
        Ok(Self {
            audience,
            client_id: config.jwt_client_id.clone(),
            key: EncodingKey::from_secret(config.jwt_client_secret.as_bytes()),
            authority: config.authority.clone(),
        })
    }

    pub fn grant_token(&self, user: &HUser) -> Result<String> {
        let now = Utc::now();
        let claims = GrantClaims {
            aud: self.audience.clone(),
            iss: self.client_id.clone(),
            sub: user.userid(&self.authority),
            nbf: now.timestamp(),
            exp: (now + Duration::minutes(GRANT_LIFETIME_MINUTES)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.key)
            .map_err(|e| MarginError::Crypto(format!("failed to sign grant token: {e}")))
    }
}
