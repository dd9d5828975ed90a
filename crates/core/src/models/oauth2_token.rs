//! Stored OAuth 2 tokens: per-user vendor API tokens and per-registration
//! LTI Advantage service tokens.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The vendor API a user token grants access to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Canvas,
    Blackboard,
    #[serde(rename = "d2l")]
    D2L,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Canvas => "canvas",
            Service::Blackboard => "blackboard",
            Service::D2L => "d2l",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "canvas" => Some(Service::Canvas),
            "blackboard" => Some(Service::Blackboard),
            "d2l" => Some(Service::D2L),
            _ => None,
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a user's token row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub application_instance_id: i64,
    pub user_id: String,
    pub service: Service,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuth2Token {
    pub id: i64,
    pub application_instance_id: i64,
    pub user_id: String,
    pub service: Service,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub received_at: DateTime<Utc>,
}

impl OAuth2Token {
    pub fn key(&self) -> TokenKey {
        TokenKey {
            application_instance_id: self.application_instance_id,
            user_id: self.user_id.clone(),
            service: self.service,
        }
    }

    /// Whether the token has expired as of `now`. Tokens without a lifetime
    /// are treated as valid until the API rejects them.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_in {
            Some(secs) => self.received_at + Duration::seconds(secs) <= now,
            None => false,
        }
    }
}

/// Token endpoint response, as stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// A cached client-credentials token for LTI Advantage services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtOAuth2Token {
    pub lti_registration_id: i64,
    pub scopes: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl JwtOAuth2Token {
    /// Usable for at least `margin` more.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at - margin > now
    }
}
