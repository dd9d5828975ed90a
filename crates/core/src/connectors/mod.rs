//! LMS vendor REST API clients.
//!
//! Canvas, Blackboard and D2L are reached through [`proxy::ApiProxy`] with a
//! per-user OAuth 2 token. Moodle web services authenticate with a
//! tenant-wide token in the query string instead.

pub mod blackboard;
pub mod canvas;
pub mod d2l;
pub mod moodle;
pub mod proxy;

use std::sync::Arc;

use reqwest::Client;

use crate::config::MarginConfig;
use crate::crypto::SecretBox;
use crate::error::{CodedError, MarginError, Result};
use crate::models::application_instance::ApplicationInstance;
use crate::models::family::Family;
use crate::models::oauth2_token::{Service, TokenKey};
use crate::oauth2::{ClientAuth, TokenEndpoint, TokenStore};

use blackboard::BlackboardApi;
use canvas::CanvasApi;
use d2l::D2lApi;
use moodle::MoodleApi;
use proxy::ApiProxy;

/// D2L authenticates every tenant against Brightspace's central auth service.
pub const D2L_AUTH_URL: &str = "https://auth.brightspace.com/oauth2/auth";
pub const D2L_TOKEN_URL: &str = "https://auth.brightspace.com/core/connect/token";

/// Builds per-request vendor API clients for a tenant and user.
#[derive(Clone)]
pub struct ApiFactory {
    client: Client,
    tokens: Arc<TokenStore>,
    config: Arc<MarginConfig>,
    secrets: Arc<SecretBox>,
}

impl ApiFactory {
    pub fn new(
        client: Client,
        tokens: Arc<TokenStore>,
        config: Arc<MarginConfig>,
        secrets: Arc<SecretBox>,
    ) -> Self {
        Self {
            client,
            tokens,
            config,
            secrets,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// The vendor whose OAuth 2 tokens a tenant's API calls use.
    pub fn service_for(ai: &ApplicationInstance) -> Option<Service> {
        match ai.family {
            Family::Canvas => Some(Service::Canvas),
            Family::Blackboard => Some(Service::Blackboard),
            Family::D2L => Some(Service::D2L),
            _ => None,
        }
    }

    /// Token endpoint and client credentials for a tenant's vendor API.
    pub fn token_endpoint(&self, ai: &ApplicationInstance, service: Service) -> Result<TokenEndpoint> {
        match service {
            Service::Canvas => {
                let client_id = ai.developer_key.clone().ok_or_else(|| {
                    MarginError::Config(format!(
                        "application instance {} has no Canvas developer key",
                        ai.id
                    ))
                })?;
                let secret = ai.developer_secret.as_deref().ok_or_else(|| {
                    MarginError::Config(format!(
                        "application instance {} has no Canvas developer secret",
                        ai.id
                    ))
                })?;
                Ok(TokenEndpoint {
                    token_url: format!("{}/login/oauth2/token", ai.lms_base()),
                    client_id,
                    client_secret: self.secrets.decrypt_string(secret)?,
                    auth: ClientAuth::Body,
                })
            }
            Service::Blackboard => {
                let (client_id, client_secret) = configured(&self.config.blackboard, "blackboard")?;
                Ok(TokenEndpoint {
                    token_url: format!("{}/learn/api/public/v1/oauth2/token", ai.lms_base()),
                    client_id,
                    client_secret,
                    auth: ClientAuth::Basic,
                })
            }
            Service::D2L => {
                let (client_id, client_secret) = configured(&self.config.d2l, "d2l")?;
                Ok(TokenEndpoint {
                    token_url: D2L_TOKEN_URL.to_string(),
                    client_id,
                    client_secret,
                    auth: ClientAuth::Body,
                })
            }
        }
    }

    /// Where to send the user to grant API access.
    pub fn authorization_url(
        &self,
        ai: &ApplicationInstance,
        service: Service,
        redirect_uri: &str,
        state: &str,
    ) -> Result<String> {
        let endpoint = self.token_endpoint(ai, service)?;
        let (base, scope) = match service {
            Service::Canvas => (
                format!("{}/login/oauth2/auth", ai.lms_base()),
                canvas::scopes(ai),
            ),
            Service::Blackboard => (
                format!("{}/learn/api/public/v1/oauth2/authorizationcode", ai.lms_base()),
                "read offline".to_string(),
            ),
            Service::D2L => (D2L_AUTH_URL.to_string(), d2l::SCOPES.join(" ")),
        };
        let mut url = url::Url::parse(&base)
            .map_err(|e| MarginError::Config(format!("invalid LMS URL {base}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &endpoint.client_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("state", state);
            if !scope.is_empty() {
                query.append_pair("scope", &scope);
            }
        }
        Ok(url.to_string())
    }

    fn proxy(
        &self,
        ai: &ApplicationInstance,
        user_id: &str,
        service: Service,
        base_url: String,
        profile: proxy::ApiProfile,
    ) -> Result<ApiProxy> {
        let key = TokenKey {
            application_instance_id: ai.id,
            user_id: user_id.to_string(),
            service,
        };
        Ok(ApiProxy::new(
            self.client.clone(),
            self.tokens.clone(),
            key,
            self.token_endpoint(ai, service)?,
            &base_url,
            profile,
        ))
    }

    pub fn canvas(&self, ai: &ApplicationInstance, user_id: &str) -> Result<CanvasApi> {
        let base = format!("{}/api/v1", ai.lms_base());
        Ok(CanvasApi::new(self.proxy(ai, user_id, Service::Canvas, base, canvas::PROFILE)?))
    }

    pub fn blackboard(&self, ai: &ApplicationInstance, user_id: &str) -> Result<BlackboardApi> {
        let base = format!("{}/learn/api/public", ai.lms_base());
        Ok(BlackboardApi::new(self.proxy(
            ai,
            user_id,
            Service::Blackboard,
            base,
            blackboard::PROFILE,
        )?))
    }

    pub fn d2l(&self, ai: &ApplicationInstance, user_id: &str) -> Result<D2lApi> {
        let base = format!("{}/d2l/api", ai.lms_base());
        Ok(D2lApi::new(self.proxy(ai, user_id, Service::D2L, base, d2l::PROFILE)?))
    }

    pub fn moodle(&self, ai: &ApplicationInstance) -> Result<MoodleApi> {
        let token = ai
            .settings
            .get_str("moodle", "api_token")
            .ok_or_else(|| {
                MarginError::Config(format!(
                    "application instance {} has no Moodle web service token",
                    ai.id
                ))
            })?;
        Ok(MoodleApi::new(self.client.clone(), ai.lms_base(), token))
    }
}

fn configured(cfg: &crate::config::VendorOAuthConfig, section: &str) -> Result<(String, String)> {
    match (&cfg.client_id, &cfg.client_secret) {
        (Some(id), Some(secret)) => Ok((id.clone(), secret.clone())),
        _ => Err(MarginError::Config(format!(
            "[{section}] client_id and client_secret must be set"
        ))),
    }
}

/// Turn a 404 from a file endpoint into the vendor's "file not found in
/// course" error.
pub(crate) fn file_not_found_on_404(err: MarginError, family: Family, file_id: &str) -> MarginError {
    if err.external_status() == Some(404) {
        CodedError::file_not_found(family, file_id).into()
    } else {
        err
    }
}
