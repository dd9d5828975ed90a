//! LTI 1.1: an OAuth 1 HMAC-SHA1 signed form post.

use chrono::Utc;
use tracing::debug;

use margin_core::db::repository::MarginRepository;
use margin_core::models::application_instance::LtiVersion;
use margin_core::models::lti_params::LtiParams;
use margin_core::oauth1::{self, SIGNATURE_METHOD};

use super::{LaunchRequest, LaunchVerifier, VerifiedLaunch};
use crate::error::LaunchError;

const REQUIRED: &[&str] = &[
    "oauth_nonce",
    "oauth_timestamp",
    "oauth_signature",
    "oauth_signature_method",
];

fn invalid(reason: impl Into<String>) -> LaunchError {
    LaunchError::SignatureInvalid(reason.into())
}

pub(super) async fn verify(
    verifier: &LaunchVerifier,
    repo: &dyn MarginRepository,
    req: &LaunchRequest,
) -> Result<VerifiedLaunch, LaunchError> {
    let consumer_key = req
        .param("oauth_consumer_key")
        .filter(|k| !k.is_empty())
        .ok_or(LaunchError::NoConsumerKey)?;
    let ai = repo
        .get_application_instance_by_consumer_key(consumer_key)
        .await?
        .ok_or_else(|| LaunchError::UnknownConsumerKey(consumer_key.to_string()))?;
    let secret = ai
        .shared_secret
        .as_deref()
        .ok_or_else(|| LaunchError::UnknownConsumerKey(consumer_key.to_string()))?;

    for name in REQUIRED {
        if req.param(name).map_or(true, str::is_empty) {
            return Err(invalid(format!("missing {name}")));
        }
    }
    let signature_method = req.param("oauth_signature_method").unwrap_or_default();
    if signature_method != SIGNATURE_METHOD {
        return Err(invalid(format!("unsupported signature method {signature_method}")));
    }

    // Form values arrive decoded exactly once; the base string re-encodes them.
    let mut params = req.form().to_vec();
    params.extend(
        req.url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned())),
    );
    let base_string = oauth1::signature_base_string(req.method(), req.url(), &params);
    let signature = req.param("oauth_signature").unwrap_or_default();
    if !oauth1::verify(secret, &base_string, signature)? {
        debug!(consumer_key, base_string = %base_string, "OAuth signature mismatch");
        return Err(invalid("signature mismatch"));
    }

    let timestamp: i64 = req
        .param("oauth_timestamp")
        .unwrap_or_default()
        .parse()
        .map_err(|_| invalid("oauth_timestamp is not a number"))?;
    let skew = (Utc::now().timestamp() - timestamp).abs();
    if skew > verifier.timestamp_tolerance_secs {
        return Err(invalid(format!("timestamp is {skew}s from server time")));
    }

    let nonce = req.param("oauth_nonce").unwrap_or_default();
    if !verifier
        .nonces
        .check_and_insert(&format!("v11:{consumer_key}:{nonce}"))
    {
        return Err(LaunchError::ReplayedNonce);
    }

    Ok(VerifiedLaunch {
        version: LtiVersion::V11,
        params: LtiParams::from_v11(&req.form_map()),
        application_instance: ai,
        registration: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{sign_v11, test_repo, v11_form, LAUNCH_URL};
    use crate::verifier::LaunchRequest;
    use margin_core::config::LaunchConfig;
    use url::Url;

    fn verifier() -> LaunchVerifier {
        LaunchVerifier::new(&LaunchConfig::default(), reqwest::Client::new())
    }

    fn request(form: Vec<(String, String)>) -> LaunchRequest {
        LaunchRequest::new("POST", Url::parse(LAUNCH_URL).unwrap(), form)
    }

    fn set(form: &mut Vec<(String, String)>, key: &str, value: &str) {
        form.retain(|(k, _)| k != key);
        form.push((key.into(), value.into()));
    }

    #[tokio::test]
    async fn valid_signature_is_accepted() {
        let (repo, _) = test_repo().await;
        let req = request(v11_form("Learner", Utc::now().timestamp()));
        let launch = req.verify(&verifier(), &repo).await.unwrap();
        assert_eq!(launch.version, LtiVersion::V11);
        assert_eq!(launch.params.context_id(), Some("C"));
        assert_eq!(launch.params.get("oauth_nonce"), None);
    }

    #[tokio::test]
    async fn repeated_verification_is_memoised() {
        let (repo, _) = test_repo().await;
        let verifier = verifier();
        let req = request(v11_form("Learner", Utc::now().timestamp()));
        req.verify(&verifier, &repo).await.unwrap();
        // The nonce would be a replay if the request were verified afresh.
        req.verify(&verifier, &repo).await.unwrap();

        let again = request(req.form().to_vec());
        assert_eq!(
            again.verify(&verifier, &repo).await.unwrap_err(),
            LaunchError::ReplayedNonce
        );
    }

    #[tokio::test]
    async fn changing_a_signed_parameter_breaks_the_signature() {
        let (repo, _) = test_repo().await;
        let mut form = v11_form("Learner", Utc::now().timestamp());
        set(&mut form, "roles", "Instructor");
        let err = request(form).verify(&verifier(), &repo).await.unwrap_err();
        assert!(matches!(err, LaunchError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn percent_signs_in_values_are_not_decoded_twice() {
        let (repo, _) = test_repo().await;
        let mut form = v11_form("Learner", Utc::now().timestamp());
        form.retain(|(k, _)| k != "oauth_signature");
        set(&mut form, "context_title", "Biology%20101 & more");
        let form = sign_v11(form, "secret");
        request(form).verify(&verifier(), &repo).await.unwrap();
    }

    #[tokio::test]
    async fn timestamp_tolerance_is_five_minutes() {
        let (repo, _) = test_repo().await;
        let verifier = verifier();
        let now = Utc::now().timestamp();

        request(v11_form("Learner", now - 290))
            .verify(&verifier, &repo)
            .await
            .unwrap();
        let err = request(v11_form("Learner", now - 310))
            .verify(&verifier, &repo)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::SignatureInvalid(_)));
        let err = request(v11_form("Learner", now + 310))
            .verify(&verifier, &repo)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn consumer_key_errors() {
        let (repo, _) = test_repo().await;
        let mut form = v11_form("Learner", Utc::now().timestamp());
        form.retain(|(k, _)| k != "oauth_consumer_key");
        assert_eq!(
            request(form).verify(&verifier(), &repo).await.unwrap_err(),
            LaunchError::NoConsumerKey
        );

        let mut form = v11_form("Learner", Utc::now().timestamp());
        set(&mut form, "oauth_consumer_key", "nope");
        assert_eq!(
            request(form).verify(&verifier(), &repo).await.unwrap_err(),
            LaunchError::UnknownConsumerKey("nope".into())
        );
    }

    #[tokio::test]
    async fn missing_oauth_parameters_are_rejected() {
        let (repo, _) = test_repo().await;
        let mut form = v11_form("Learner", Utc::now().timestamp());
        form.retain(|(k, _)| k != "oauth_nonce");
        let err = request(form).verify(&verifier(), &repo).await.unwrap_err();
        assert_eq!(err, LaunchError::SignatureInvalid("missing oauth_nonce".into()));
    }
}
