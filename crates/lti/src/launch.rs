//! The launch endpoint LMSes post to.

use std::sync::Arc;

use axum::{
    extract::{OriginalUri, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Form, Json, Router,
};
use tracing::error;
use url::Url;

use margin_core::error::{ErrorCode, MarginError};

use crate::error::ApiError;
use crate::frontend::FrontendConfig;
use crate::pipeline;
use crate::verifier::LaunchRequest;
use crate::{AppState, Tx};

pub fn launch_router() -> Router<Arc<AppState>> {
    Router::new().route("/lti_launches", post(lti_launch))
}

async fn lti_launch(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    OriginalUri(uri): OriginalUri,
    Form(form): Form<Vec<(String, String)>>,
) -> Response {
    // Signatures cover the URL the LMS posted to, which is our public one.
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/lti_launches");
    let url = match Url::parse(&format!("{}{}", state.public_url, path)) {
        Ok(url) => url,
        Err(e) => {
            return error_response(ApiError::from(MarginError::Config(format!(
                "invalid public URL: {e}"
            ))))
        }
    };

    let req = LaunchRequest::new("POST", url, form);
    match pipeline::launch(&state, &repo, &req).await {
        Ok(config) => Json(config).into_response(),
        Err(e) => error_response(e),
    }
}

/// Every failed launch still renders the frontend, in error mode.
fn error_response(err: ApiError) -> Response {
    let (status, config) = match err {
        ApiError::Margin(MarginError::InstructorLaunchRequired) => (
            StatusCode::BAD_REQUEST,
            FrontendConfig::error(
                ErrorCode::InstructorLaunchRequired.as_str(),
                "An instructor must launch this assignment before students can use it.",
            ),
        ),
        ApiError::Margin(MarginError::Validation(message)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            FrontendConfig::error("invalid_assignment", &message),
        ),
        ApiError::Margin(MarginError::ExternalRequest(e)) => {
            error!(error = %e, "launch failed calling an external service");
            (
                StatusCode::BAD_GATEWAY,
                FrontendConfig::error(
                    "external_request_failed",
                    e.message
                        .as_deref()
                        .unwrap_or("The LMS or annotation service request failed."),
                ),
            )
        }
        ApiError::Margin(e) => {
            error!(error = %e, "launch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                FrontendConfig::error("internal_error", "Something went wrong with this launch."),
            )
        }
        other => return other.into_response(),
    };
    (status, Json(config)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use crate::tests::{h_server, test_state, v11_form};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use margin_core::db::repository::AssignmentRepository;
    use margin_core::models::assignment::AssignmentUpsert;
    use serde_json::Value;
    use tower::ServiceExt;

    fn post(form: &[(String, String)]) -> Request<Body> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form.iter())
            .finish();
        Request::builder()
            .method("POST")
            .uri("/lti_launches")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn learner_launch_renders_the_document() {
        let h = h_server().await;
        let (state, repo) = test_state(&h).await;
        repo.upsert_assignment(&AssignmentUpsert {
            tool_consumer_instance_guid: "G".into(),
            resource_link_id: "RL".into(),
            document_url: "https://example.com/doc.pdf".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        let resp = router(state)
            .oneshot(post(&v11_form("Learner", Utc::now().timestamp())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let config = json(resp).await;
        assert_eq!(config["mode"], "LAUNCH");
        assert!(config["api"]["auth_token"].as_str().unwrap().starts_with("Bearer "));
        assert!(config["hypothesis_client"]["grant_token"].is_string());
        assert!(config["content"]["direct_url"]
            .as_str()
            .unwrap()
            .starts_with("https://via.example.com/"));
    }

    #[tokio::test]
    async fn replayed_launch_is_rejected() {
        let h = h_server().await;
        let (state, _) = test_state(&h).await;
        let app = router(state);
        let form = v11_form("Instructor", Utc::now().timestamp());

        let first = app.clone().oneshot(post(&form)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(post(&form)).await.unwrap();
        assert_eq!(second.status(), StatusCode::FORBIDDEN);
        let config = json(second).await;
        assert_eq!(config["mode"], "ERROR");
        assert_eq!(config["error"]["error_code"], "replayed_nonce");
    }

    #[tokio::test]
    async fn bad_signature_renders_an_error_config() {
        let h = h_server().await;
        let (state, _) = test_state(&h).await;
        let mut form = v11_form("Learner", Utc::now().timestamp());
        for (k, v) in form.iter_mut() {
            if k == "user_id" {
                *v = "someone-else".into();
            }
        }
        let resp = router(state).oneshot(post(&form)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(json(resp).await["error"]["error_code"], "signature_invalid");
        // Nothing reached the annotation service.
        assert!(h.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn annotation_service_failure_is_a_bad_gateway() {
        use wiremock::matchers::path_regex;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let h = MockServer::start().await;
        Mock::given(path_regex("^/api/.*"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&h)
            .await;
        let (state, repo) = test_state(&h).await;
        repo.upsert_assignment(&AssignmentUpsert {
            tool_consumer_instance_guid: "G".into(),
            resource_link_id: "RL".into(),
            document_url: "https://example.com/doc.pdf".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        let resp = router(state)
            .oneshot(post(&v11_form("Learner", Utc::now().timestamp())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let config = json(resp).await;
        assert_eq!(config["mode"], "ERROR");
        assert_eq!(config["error"]["error_code"], "external_request_failed");
        assert!(!config["error"]["message"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn learner_launch_before_the_course_group_exists() {
        use wiremock::matchers::{method, path_regex};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let h = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path_regex("^/api/users/.*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&h)
            .await;
        Mock::given(method("PATCH"))
            .and(path_regex("^/api/groups/.*"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&h)
            .await;
        let (state, repo) = test_state(&h).await;
        repo.upsert_assignment(&AssignmentUpsert {
            tool_consumer_instance_guid: "G".into(),
            resource_link_id: "RL".into(),
            document_url: "https://example.com/doc.pdf".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        let resp = router(state)
            .oneshot(post(&v11_form("Learner", Utc::now().timestamp())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let config = json(resp).await;
        assert_eq!(config["mode"], "ERROR");
        assert_eq!(config["error"]["error_code"], "instructor_launch_required");
    }
}
