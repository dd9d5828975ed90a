//! Margin LTI: launch verification, the launch pipeline and the API the
//! frontend calls after a launch.

pub mod api;
pub mod bearer;
pub mod error;
pub mod frontend;
pub mod identity;
pub mod launch;
pub mod oidc;
pub mod pipeline;
pub mod verifier;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::error;

use margin_core::config::MarginConfig;
use margin_core::connectors::ApiFactory;
use margin_core::content::files::CourseCopyResolver;
use margin_core::content::jstor::JstorSource;
use margin_core::content::via::ViaUrlBuilder;
use margin_core::content::ContentRegistry;
use margin_core::crypto::SecretBox;
use margin_core::db::sqlite::SqliteRepository;
use margin_core::error::Result;
use margin_core::grading::ags::LtiAdvantageAuth;
use margin_core::grading::GradingServiceFactory;
use margin_core::http::{client_with_deadline, vendor_client};
use margin_core::oauth2::{OAuthHttpService, TokenStore};
use margin_core::signing::ToolKey;
use margin_h_sync::client::HClient;
use margin_h_sync::grant::GrantTokenIssuer;
use margin_h_sync::provision::Provisioner;

use crate::bearer::BearerTokens;
use crate::error::ApiError;
use crate::verifier::LaunchVerifier;

const DEFAULT_PUBLIC_URL: &str = "http://localhost:8000";

/// Shared state for every route.
pub struct AppState {
    /// Not bound to any transaction. Request handlers write through the
    /// per-request [`Tx`] instead.
    pub repo: SqliteRepository,
    pub config: Arc<MarginConfig>,
    /// Externally reachable base URL, without a trailing slash.
    pub public_url: String,
    pub verifier: LaunchVerifier,
    pub bearer: BearerTokens,
    pub apis: ApiFactory,
    pub content: ContentRegistry,
    pub course_copy: CourseCopyResolver,
    pub jstor: JstorSource,
    pub via: ViaUrlBuilder,
    pub grading: GradingServiceFactory,
    pub provisioner: Provisioner,
    pub grants: GrantTokenIssuer,
    pub tool_key: Arc<ToolKey>,
}

impl AppState {
    pub fn build(
        config: MarginConfig,
        repo: SqliteRepository,
        secrets: Arc<SecretBox>,
        tool_key: Arc<ToolKey>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let repo = repo.pooled();
        let client = vendor_client(&config.http)?;

        // Token refreshes write outside the request transaction so that a
        // refreshed token survives a failed request.
        let refresh_client = client_with_deadline(&config.http, config.http.refresh_timeout_secs)?;
        let tokens = Arc::new(TokenStore::new(
            Arc::new(repo.clone()),
            OAuthHttpService::new(refresh_client),
        ));
        let apis = ApiFactory::new(client.clone(), tokens, config.clone(), secrets);
        let ags_auth = Arc::new(LtiAdvantageAuth::new(
            client.clone(),
            Arc::new(repo.clone()),
            tool_key.clone(),
        ));
        let via = ViaUrlBuilder::new(&config.h);
        let public_url = config
            .margin
            .public_url
            .as_deref()
            .unwrap_or(DEFAULT_PUBLIC_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            verifier: LaunchVerifier::new(&config.launch, client.clone()),
            bearer: BearerTokens::new(config.launch.bearer_lifetime_secs),
            content: ContentRegistry::new(&config),
            course_copy: CourseCopyResolver::new(),
            jstor: JstorSource::new(&config.jstor, via.clone()),
            via,
            grading: GradingServiceFactory::new(client, ags_auth),
            provisioner: Provisioner::new(HClient::new(&config.h, &config.http)?),
            grants: GrantTokenIssuer::new(&config.h)?,
            apis,
            tool_key,
            public_url,
            repo,
            config,
        })
    }
}

/// The request's database transaction, committed when the handler returns
/// anything but a server error.
#[derive(Clone)]
pub struct Tx(pub SqliteRepository);

async fn transaction(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let tx = match state.repo.begin().await {
        Ok(tx) => tx,
        Err(e) => return ApiError::from(e).into_response(),
    };
    req.extensions_mut().insert(Tx(tx.clone()));

    let response = next.run(req).await;
    let outcome = if response.status().is_server_error() {
        tx.rollback().await
    } else {
        tx.commit().await
    };
    match outcome {
        Ok(()) => response,
        Err(e) => {
            error!(error = %e, "failed to finish request transaction");
            ApiError::from(e).into_response()
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(launch::launch_router())
        .merge(oidc::oidc_router())
        .nest("/api", api::api_router())
        .route_layer(middleware::from_fn_with_state(state.clone(), transaction))
        .route("/health", get(health))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod tests {
    //! Fixtures shared by the crate's tests.

    use super::*;
    use std::sync::OnceLock;

    use chrono::Utc;
    use serde_json::{json, Value};
    use url::Url;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use margin_core::db::repository::{ApplicationInstanceRepository, LtiRegistrationRepository};
    use margin_core::db::DatabasePool;
    use margin_core::models::application_instance::{
        ApplicationInstance, LtiRegistration, NewApplicationInstance,
    };
    use margin_core::models::family::Family;
    use margin_core::oauth1;

    pub(crate) const LAUNCH_URL: &str = "https://margin.example.com/lti_launches";
    pub(crate) const CONSUMER_KEY: &str = "margin-key";
    pub(crate) const ISSUER: &str = "https://platform.example.com";
    pub(crate) const CLIENT_ID: &str = "client-1";
    pub(crate) const DEPLOYMENT_ID: &str = "deployment-1";
    pub(crate) const MASTER_KEY: [u8; 32] = [7; 32];

    /// One platform key per test binary; RSA generation is slow in debug.
    pub(crate) fn platform_key_pem() -> String {
        static PEM: OnceLock<String> = OnceLock::new();
        PEM.get_or_init(|| ToolKey::generate_pem().unwrap()).clone()
    }

    pub(crate) fn platform_key() -> &'static ToolKey {
        static KEY: OnceLock<ToolKey> = OnceLock::new();
        KEY.get_or_init(|| ToolKey::from_pem(&platform_key_pem()).unwrap())
    }

    /// A repository with one LTI 1.1 Canvas tenant.
    pub(crate) async fn test_repo() -> (SqliteRepository, ApplicationInstance) {
        let repo = match DatabasePool::new_sqlite_memory().await.unwrap() {
            DatabasePool::Sqlite(pool) => SqliteRepository::new(pool),
        };
        let ai = repo
            .create_application_instance(&NewApplicationInstance {
                consumer_key: Some(CONSUMER_KEY.into()),
                shared_secret: Some("secret".into()),
                lms_url: "https://lms.example.com".into(),
                family: Family::Canvas,
                provisioning: true,
                ..Default::default()
            })
            .await
            .unwrap();
        (repo, ai)
    }

    /// Sign `form` as a POST to [`LAUNCH_URL`].
    pub(crate) fn sign_v11(mut form: Vec<(String, String)>, secret: &str) -> Vec<(String, String)> {
        form.retain(|(k, _)| k != "oauth_signature");
        let url = Url::parse(LAUNCH_URL).unwrap();
        let base = oauth1::signature_base_string("POST", &url, &form);
        let signature = oauth1::sign(secret, &base).unwrap();
        form.push(("oauth_signature".into(), signature));
        form
    }

    /// A signed LTI 1.1 launch into course `C`, resource link `RL`.
    pub(crate) fn v11_form(roles: &str, timestamp: i64) -> Vec<(String, String)> {
        let form = [
            ("oauth_consumer_key", CONSUMER_KEY.to_string()),
            ("oauth_nonce", uuid::Uuid::new_v4().simple().to_string()),
            ("oauth_timestamp", timestamp.to_string()),
            ("oauth_signature_method", oauth1::SIGNATURE_METHOD.to_string()),
            ("oauth_version", "1.0".to_string()),
            ("lti_message_type", "basic-lti-launch-request".to_string()),
            ("lti_version", "LTI-1p0".to_string()),
            ("user_id", "u-1".to_string()),
            ("roles", roles.to_string()),
            ("lis_person_name_full", "Jane Doe".to_string()),
            ("context_id", "C".to_string()),
            ("context_title", "Biology".to_string()),
            ("resource_link_id", "RL".to_string()),
            ("tool_consumer_instance_guid", "G".to_string()),
            ("custom_canvas_user_id", "77".to_string()),
            ("custom_canvas_course_id", "125".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        sign_v11(form, "secret")
    }

    /// An LTI 1.3 registration whose platform serves its keys from
    /// `{server}/jwks`, plus a Canvas tenant at `server` for
    /// [`DEPLOYMENT_ID`].
    pub(crate) async fn seed_registration(
        repo: &SqliteRepository,
        server: &str,
    ) -> (LtiRegistration, ApplicationInstance) {
        let registration = repo
            .create_lti_registration(
                ISSUER,
                CLIENT_ID,
                &format!("{server}/auth"),
                &format!("{server}/jwks"),
                &format!("{server}/token"),
            )
            .await
            .unwrap();
        let ai = repo
            .create_application_instance(&NewApplicationInstance {
                lti_registration_id: Some(registration.id),
                deployment_id: Some(DEPLOYMENT_ID.into()),
                lms_url: server.to_string(),
                family: Family::Canvas,
                provisioning: true,
                developer_key: Some("dev-key".into()),
                developer_secret: Some(SecretBox::new(MASTER_KEY).encrypt(b"dev-secret").unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();
        (registration, ai)
    }

    pub(crate) fn id_token_claims(role: &str) -> Value {
        let now = Utc::now().timestamp();
        let claim = |name: &str| format!("https://purl.imsglobal.org/spec/lti/claim/{name}");
        let mut claims = json!({
            "iss": ISSUER,
            "aud": CLIENT_ID,
            "sub": "u-1",
            "exp": now + 300,
            "iat": now,
            "nonce": uuid::Uuid::new_v4().simple().to_string(),
            "name": "Jane Doe",
        });
        let map = claims.as_object_mut().unwrap();
        map.insert(claim("deployment_id"), json!(DEPLOYMENT_ID));
        map.insert(claim("message_type"), json!("LtiResourceLinkRequest"));
        map.insert(claim("version"), json!("1.3.0"));
        map.insert(
            claim("roles"),
            json!([format!("http://purl.imsglobal.org/vocab/lis/v2/membership#{role}")]),
        );
        map.insert(claim("context"), json!({"id": "C", "title": "Biology"}));
        map.insert(claim("resource_link"), json!({"id": "RL"}));
        map.insert(claim("tool_platform"), json!({"guid": "G"}));
        claims
    }

    pub(crate) fn sign_id_token(claims: &Value) -> String {
        platform_key().sign(claims).unwrap()
    }

    /// A signed v1.3 launch that answers a login `state` already remembered.
    pub(crate) fn v13_launch(state: &AppState, role: &str) -> crate::verifier::LaunchRequest {
        let claims = id_token_claims(role);
        let login = uuid::Uuid::new_v4().simple().to_string();
        state
            .verifier
            .remember_login(&login, claims["nonce"].as_str().unwrap());
        crate::verifier::LaunchRequest::new(
            "POST",
            Url::parse(LAUNCH_URL).unwrap(),
            vec![
                ("id_token".into(), sign_id_token(&claims)),
                ("state".into(), login),
            ],
        )
    }

    /// An annotation service that accepts every call.
    pub(crate) async fn h_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(path_regex("^/api/.*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        server
    }

    /// A platform serving [`platform_key`] at `/jwks`.
    pub(crate) async fn key_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"keys": [platform_key().jwk()]})),
            )
            .mount(&server)
            .await;
        server
    }

    pub(crate) fn test_config(h: &MockServer) -> MarginConfig {
        let mut config = MarginConfig::generate_default();
        config.margin.public_url = Some("https://margin.example.com".into());
        config.h.api_url = format!("{}/api/", h.uri());
        config.h.authority = "lms.example.com".into();
        config.h.client_id = "h-client".into();
        config.h.client_secret = "h-secret".into();
        config.h.jwt_client_id = "h-jwt-client".into();
        config.h.jwt_client_secret = "h-jwt-secret".into();
        config.h.via_url = "https://via.example.com/".into();
        config.h.via_secret = "via-secret".into();
        config
    }

    /// App state over [`test_repo`], with the annotation service at `h`.
    pub(crate) async fn test_state(h: &MockServer) -> (Arc<AppState>, SqliteRepository) {
        let (repo, _) = test_repo().await;
        let state = AppState::build(
            test_config(h),
            repo.clone(),
            Arc::new(SecretBox::new(MASTER_KEY)),
            Arc::new(ToolKey::from_pem(&platform_key_pem()).unwrap()),
        )
        .unwrap();
        (Arc::new(state), repo)
    }

    #[tokio::test]
    async fn health_skips_the_transaction() {
        use axum::http::StatusCode;
        use tower::ServiceExt;

        let h = h_server().await;
        let (state, _) = test_state(&h).await;
        let resp = router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
