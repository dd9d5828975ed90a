//! Calls to vendor OAuth 2 token endpoints.

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ExternalRequestError, MarginError, Result};
use crate::models::oauth2_token::TokenGrant;

/// How client credentials are presented to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// `client_id` / `client_secret` form fields (Canvas, D2L).
    Body,
    /// HTTP Basic (Blackboard).
    Basic,
}

/// A vendor token endpoint and the credentials to use with it.
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub auth: ClientAuth,
}

/// Token endpoint client. Its `reqwest::Client` carries the refresh timeout.
#[derive(Debug, Clone)]
pub struct OAuthHttpService {
    client: Client,
}

impl OAuthHttpService {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Exchange an authorization code.
    pub async fn get_access_token(
        &self,
        endpoint: &TokenEndpoint,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant> {
        self.post(
            endpoint,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
        )
        .await
    }

    /// Exchange a refresh token.
    pub async fn refresh_access_token(
        &self,
        endpoint: &TokenEndpoint,
        refresh_token: &str,
    ) -> Result<TokenGrant> {
        self.post(
            endpoint,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }

    async fn post(&self, endpoint: &TokenEndpoint, fields: &[(&str, &str)]) -> Result<TokenGrant> {
        let mut form: Vec<(&str, &str)> = fields.to_vec();
        let mut req = self.client.post(&endpoint.token_url);
        match endpoint.auth {
            ClientAuth::Body => {
                form.push(("client_id", endpoint.client_id.as_str()));
                form.push(("client_secret", endpoint.client_secret.as_str()));
            }
            ClientAuth::Basic => {
                req = req.basic_auth(&endpoint.client_id, Some(&endpoint.client_secret));
            }
        }

        debug!(url = %endpoint.token_url, grant_type = fields[0].1, "requesting OAuth 2 token");
        let resp = req
            .form(&form)
            .send()
            .await
            .map_err(|e| ExternalRequestError::from_transport("POST", &endpoint.token_url, &e))?;

        let status = resp.status();
        let reason = status.canonical_reason();
        let body = resp.text().await?;
        if !status.is_success() {
            warn!(url = %endpoint.token_url, status = status.as_u16(), "token endpoint rejected request");
            return Err(ExternalRequestError::new("OAuth 2 token request failed")
                .with_request("POST", &endpoint.token_url)
                .with_response(status.as_u16(), reason, &body)
                .into());
        }

        serde_json::from_str::<TokenGrant>(&body).map_err(|e| {
            MarginError::from(
                ExternalRequestError::new("Unable to parse OAuth 2 token response")
                    .with_request("POST", &endpoint.token_url)
                    .with_response(status.as_u16(), reason, &body)
                    .with_validation_errors(Value::String(e.to_string())),
            )
        })
    }
}

/// Whether a failed token request means the refresh token is dead and the
/// user has to authorize again.
pub fn is_invalid_grant(err: &ExternalRequestError) -> bool {
    let Some(body) = &err.response_body else {
        return false;
    };
    if body.contains("refresh_token not found") {
        return true;
    }
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(|e| e == "invalid_grant"))
        .unwrap_or(false)
}
