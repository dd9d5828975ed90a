//! Launch verification for LTI 1.1 (OAuth 1 signed form posts) and LTI 1.3
//! (RS256 id_tokens checked against the platform's key set).

pub mod jwks;
pub mod nonce;
mod v11;
mod v13;

use std::collections::HashMap;
use std::time::Duration;

use moka::sync::Cache;
use tokio::sync::OnceCell;
use url::Url;

use margin_core::config::LaunchConfig;
use margin_core::db::repository::MarginRepository;
use margin_core::models::application_instance::{ApplicationInstance, LtiRegistration, LtiVersion};
use margin_core::models::lti_params::LtiParams;

use crate::error::LaunchError;

use self::jwks::KeySetCache;
use self::nonce::NonceStore;

/// A launch that passed verification.
#[derive(Debug, Clone)]
pub struct VerifiedLaunch {
    pub version: LtiVersion,
    pub application_instance: ApplicationInstance,
    pub registration: Option<LtiRegistration>,
    pub params: LtiParams,
}

/// An incoming launch request.
///
/// The verification outcome is memoised: verifying the same request again
/// returns the first result without repeating any lookups or fetches.
#[derive(Debug)]
pub struct LaunchRequest {
    method: String,
    url: Url,
    form: Vec<(String, String)>,
    outcome: OnceCell<Result<VerifiedLaunch, LaunchError>>,
}

impl LaunchRequest {
    /// `url` is the URL the LMS posted to, as the LMS saw it.
    pub fn new(method: &str, url: Url, form: Vec<(String, String)>) -> Self {
        LaunchRequest {
            method: method.to_ascii_uppercase(),
            url,
            form,
            outcome: OnceCell::new(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// First value of a form field.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    fn form(&self) -> &[(String, String)] {
        &self.form
    }

    fn form_map(&self) -> HashMap<String, String> {
        self.form.iter().cloned().collect()
    }

    pub async fn verify(
        &self,
        verifier: &LaunchVerifier,
        repo: &dyn MarginRepository,
    ) -> Result<&VerifiedLaunch, LaunchError> {
        self.outcome
            .get_or_init(|| verifier.verify(repo, self))
            .await
            .as_ref()
            .map_err(Clone::clone)
    }
}

/// Verifies launches. One per process: the nonce store and key set cache
/// are shared by every request.
pub struct LaunchVerifier {
    nonces: NonceStore,
    keys: KeySetCache,
    /// OIDC login `state` to the nonce we asked the platform to embed.
    logins: Cache<String, String>,
    timestamp_tolerance_secs: i64,
    leeway_secs: u64,
}

impl LaunchVerifier {
    pub fn new(config: &LaunchConfig, client: reqwest::Client) -> Self {
        let window = Duration::from_secs(config.nonce_window_secs);
        LaunchVerifier {
            nonces: NonceStore::new(window),
            keys: KeySetCache::new(client, Duration::from_secs(config.key_set_ttl_secs)),
            logins: Cache::builder().time_to_live(window).build(),
            timestamp_tolerance_secs: config.timestamp_tolerance_secs as i64,
            leeway_secs: config.jwt_leeway_secs,
        }
    }

    /// Remember an OIDC login so the launch that follows it can be matched.
    pub fn remember_login(&self, state: &str, nonce: &str) {
        self.logins.insert(state.to_string(), nonce.to_string());
    }

    #[cfg(test)]
    pub(crate) fn login_nonce(&self, state: &str) -> Option<String> {
        self.logins.get(state)
    }

    async fn verify(
        &self,
        repo: &dyn MarginRepository,
        req: &LaunchRequest,
    ) -> Result<VerifiedLaunch, LaunchError> {
        if req.param("id_token").is_some() {
            return v13::verify(self, repo, req).await;
        }
        if req.param("oauth_consumer_key").is_none() && req.param("state").is_some() {
            // An LTI 1.3 form post that lost its assertion.
            return Err(LaunchError::MissingAssertion);
        }
        v11::verify(self, repo, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_come_from_form_and_query() {
        let req = LaunchRequest::new(
            "post",
            Url::parse("https://margin.example.com/lti_launches?resource_link_id=Q").unwrap(),
            vec![
                ("resource_link_id".into(), "F".into()),
                ("context_id".into(), "C".into()),
            ],
        );
        assert_eq!(req.method(), "POST");
        assert_eq!(req.param("resource_link_id"), Some("F"));
        assert_eq!(req.query_param("resource_link_id").as_deref(), Some("Q"));
        assert_eq!(req.param("missing"), None);
    }
}
