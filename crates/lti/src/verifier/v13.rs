//! LTI 1.3: an RS256 id_token signed by the platform.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use margin_core::db::repository::MarginRepository;
use margin_core::models::application_instance::{LtiRegistration, LtiVersion};
use margin_core::models::lti_params::LtiParams;

use super::{LaunchRequest, LaunchVerifier, VerifiedLaunch};
use crate::error::LaunchError;

const CLAIM: &str = "https://purl.imsglobal.org/spec/lti/claim/";
const RESOURCE_LINK_REQUEST: &str = "LtiResourceLinkRequest";

#[derive(Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn values(&self) -> Vec<&str> {
        match self {
            Audience::One(a) => vec![a.as_str()],
            Audience::Many(a) => a.iter().map(String::as_str).collect(),
        }
    }
}

/// The claims needed to find the registration, read before the signature
/// can be checked.
#[derive(Deserialize)]
struct Unverified {
    iss: String,
    aud: Audience,
}

fn peek(token: &str) -> Result<Unverified, LaunchError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| LaunchError::MalformedAssertion("not a compact JWT".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| LaunchError::MalformedAssertion(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| LaunchError::MalformedAssertion(e.to_string()))
}

async fn find_registration(
    repo: &dyn MarginRepository,
    claims: &Unverified,
) -> Result<LtiRegistration, LaunchError> {
    for client_id in claims.aud.values() {
        if let Some(registration) = repo.find_lti_registration(&claims.iss, client_id).await? {
            return Ok(registration);
        }
    }
    Err(LaunchError::UnknownRegistration {
        issuer: claims.iss.clone(),
        client_id: claims.aud.values().join(","),
    })
}

fn claim<'a>(claims: &'a Value, name: &str) -> Option<&'a Value> {
    claims.get(format!("{CLAIM}{name}"))
}

fn require_str<'a>(value: Option<&'a Value>, name: &str) -> Result<&'a str, LaunchError> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LaunchError::MissingClaim(name.to_string()))
}

pub(super) async fn verify(
    verifier: &LaunchVerifier,
    repo: &dyn MarginRepository,
    req: &LaunchRequest,
) -> Result<VerifiedLaunch, LaunchError> {
    let token = req
        .param("id_token")
        .filter(|t| !t.is_empty())
        .ok_or(LaunchError::MissingAssertion)?;
    let header = decode_header(token).map_err(|e| LaunchError::MalformedAssertion(e.to_string()))?;
    if header.alg != Algorithm::RS256 {
        return Err(LaunchError::SignatureInvalid(format!(
            "unsupported algorithm {:?}",
            header.alg
        )));
    }
    let kid = header
        .kid
        .ok_or_else(|| LaunchError::MalformedAssertion("no kid in header".into()))?;

    let unverified = peek(token)?;
    let registration = find_registration(repo, &unverified).await?;
    let key = verifier
        .keys
        .decoding_key(&registration.key_set_url, &kid)
        .await?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&[&registration.issuer]);
    validation.set_audience(&[&registration.client_id]);
    validation.set_required_spec_claims(&["exp", "iat", "iss", "aud"]);
    validation.leeway = verifier.leeway_secs;
    let claims = decode::<Value>(token, &key, &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => LaunchError::ExpiredAssertion,
            ErrorKind::InvalidSignature => LaunchError::SignatureInvalid("signature mismatch".into()),
            ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => {
                LaunchError::SignatureInvalid(e.to_string())
            }
            ErrorKind::MissingRequiredClaim(name) => LaunchError::MissingClaim(name.clone()),
            _ => LaunchError::MalformedAssertion(e.to_string()),
        })?
        .claims;

    let iat = claims.get("iat").and_then(Value::as_i64).unwrap_or_default();
    if iat > Utc::now().timestamp() + verifier.leeway_secs as i64 {
        return Err(LaunchError::ClockSkew);
    }

    let nonce = require_str(claims.get("nonce"), "nonce")?;
    // Every launch answers one of our logins and carries the nonce we sent.
    let expected = req
        .param("state")
        .and_then(|state| verifier.logins.remove(state))
        .ok_or_else(|| LaunchError::SignatureInvalid("launch does not answer a login".into()))?;
    if expected != nonce {
        return Err(LaunchError::SignatureInvalid("nonce does not match login".into()));
    }
    if !verifier
        .nonces
        .check_and_insert(&format!("v13:{}:{nonce}", registration.issuer))
    {
        return Err(LaunchError::ReplayedNonce);
    }

    let deployment_id = require_str(claim(&claims, "deployment_id"), "deployment_id")?;
    if !claim(&claims, "roles").is_some_and(Value::is_array) {
        return Err(LaunchError::MissingClaim("roles".into()));
    }
    require_str(claim(&claims, "context").and_then(|c| c.get("id")), "context")?;
    let message_type = claim(&claims, "message_type")
        .and_then(Value::as_str)
        .unwrap_or(RESOURCE_LINK_REQUEST);
    if message_type == RESOURCE_LINK_REQUEST {
        require_str(
            claim(&claims, "resource_link").and_then(|c| c.get("id")),
            "resource_link",
        )?;
    }

    let ai = repo
        .get_application_instance_by_deployment(registration.id, deployment_id)
        .await?
        .ok_or_else(|| LaunchError::UnknownDeployment(deployment_id.to_string()))?;
    debug!(
        issuer = %registration.issuer,
        deployment_id,
        application_instance_id = ai.id,
        "verified LTI 1.3 launch"
    );

    Ok(VerifiedLaunch {
        version: LtiVersion::V13,
        params: LtiParams::from_v13(&claims),
        application_instance: ai,
        registration: Some(registration),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{
        id_token_claims, platform_key, seed_registration, sign_id_token, test_repo, LAUNCH_URL,
    };
    use margin_core::config::LaunchConfig;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn verifier() -> LaunchVerifier {
        LaunchVerifier::new(&LaunchConfig::default(), reqwest::Client::new())
    }

    fn request(token: &str) -> LaunchRequest {
        LaunchRequest::new(
            "POST",
            Url::parse(LAUNCH_URL).unwrap(),
            vec![("id_token".into(), token.into()), ("state".into(), "s-1".into())],
        )
    }

    /// A launch answering login `s-1`, made with the token's own nonce.
    fn after_login(verifier: &LaunchVerifier, claims: &Value) -> LaunchRequest {
        verifier.remember_login("s-1", claims["nonce"].as_str().unwrap());
        request(&sign_id_token(claims))
    }

    async fn key_server(expected_fetches: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"keys": [platform_key().jwk()]})),
            )
            .expect(expected_fetches)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn valid_token_is_normalised() {
        let server = key_server(1).await;
        let (repo, _) = test_repo().await;
        seed_registration(&repo, &server.uri()).await;

        let verifier = verifier();
        let req = after_login(&verifier, &id_token_claims("Instructor"));
        let launch = req.verify(&verifier, &repo).await.unwrap();
        assert_eq!(launch.version, LtiVersion::V13);
        assert_eq!(launch.params.context_id(), Some("C"));
        assert_eq!(launch.params.resource_link_id(), Some("RL"));
        assert!(launch.registration.is_some());
    }

    #[tokio::test]
    async fn repeated_verification_makes_no_new_calls() {
        let server = key_server(1).await;
        let (repo, _) = test_repo().await;
        seed_registration(&repo, &server.uri()).await;

        let verifier = verifier();
        let req = after_login(&verifier, &id_token_claims("Learner"));
        let first = req.verify(&verifier, &repo).await.unwrap().params.clone();
        let second = req.verify(&verifier, &repo).await.unwrap().params.clone();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let server = key_server(1).await;
        let (repo, _) = test_repo().await;
        seed_registration(&repo, &server.uri()).await;

        let mut claims = id_token_claims("Learner");
        claims["exp"] = json!(Utc::now().timestamp() - 3600);
        let err = request(&sign_id_token(&claims))
            .verify(&verifier(), &repo)
            .await
            .unwrap_err();
        assert_eq!(err, LaunchError::ExpiredAssertion);
    }

    #[tokio::test]
    async fn nonce_is_single_use() {
        let server = key_server(1).await;
        let (repo, _) = test_repo().await;
        seed_registration(&repo, &server.uri()).await;

        let verifier = verifier();
        let claims = id_token_claims("Learner");
        after_login(&verifier, &claims)
            .verify(&verifier, &repo)
            .await
            .unwrap();
        assert_eq!(
            after_login(&verifier, &claims)
                .verify(&verifier, &repo)
                .await
                .unwrap_err(),
            LaunchError::ReplayedNonce
        );
    }

    #[tokio::test]
    async fn launch_without_a_login_is_rejected() {
        let server = key_server(1).await;
        let (repo, _) = test_repo().await;
        seed_registration(&repo, &server.uri()).await;

        let verifier = verifier();
        let token = sign_id_token(&id_token_claims("Learner"));
        let no_state = LaunchRequest::new(
            "POST",
            Url::parse(LAUNCH_URL).unwrap(),
            vec![("id_token".into(), token.clone())],
        );
        let err = no_state.verify(&verifier, &repo).await.unwrap_err();
        assert!(matches!(err, LaunchError::SignatureInvalid(_)));

        // A state we never issued.
        let err = request(&token).verify(&verifier, &repo).await.unwrap_err();
        assert!(matches!(err, LaunchError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn login_state_is_single_use() {
        let server = key_server(1).await;
        let (repo, _) = test_repo().await;
        seed_registration(&repo, &server.uri()).await;

        let verifier = verifier();
        after_login(&verifier, &id_token_claims("Learner"))
            .verify(&verifier, &repo)
            .await
            .unwrap();
        assert_eq!(verifier.login_nonce("s-1"), None);
    }

    #[tokio::test]
    async fn login_nonce_must_match() {
        let server = key_server(1).await;
        let (repo, _) = test_repo().await;
        seed_registration(&repo, &server.uri()).await;

        let verifier = verifier();
        verifier.remember_login("s-1", "a-different-nonce");
        let err = request(&sign_id_token(&id_token_claims("Learner")))
            .verify(&verifier, &repo)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn unknown_issuer_is_rejected_without_fetching_keys() {
        let server = key_server(0).await;
        let (repo, _) = test_repo().await;
        seed_registration(&repo, &server.uri()).await;

        let mut claims = id_token_claims("Learner");
        claims["iss"] = json!("https://other.example.com");
        let err = request(&sign_id_token(&claims))
            .verify(&verifier(), &repo)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::UnknownRegistration { .. }));
    }

    #[tokio::test]
    async fn required_claims_are_checked() {
        let server = key_server(1).await;
        let (repo, _) = test_repo().await;
        seed_registration(&repo, &server.uri()).await;

        let mut claims = id_token_claims("Learner");
        claims
            .as_object_mut()
            .unwrap()
            .remove(&format!("{CLAIM}deployment_id"));
        let verifier = verifier();
        let err = after_login(&verifier, &claims)
            .verify(&verifier, &repo)
            .await
            .unwrap_err();
        assert_eq!(err, LaunchError::MissingClaim("deployment_id".into()));
    }

    #[tokio::test]
    async fn missing_assertion() {
        let (repo, _) = test_repo().await;
        let err = request("").verify(&verifier(), &repo).await.unwrap_err();
        assert_eq!(err, LaunchError::MissingAssertion);
    }
}
