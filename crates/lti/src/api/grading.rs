//! Instructor grading and Canvas SpeedGrader submissions.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use margin_core::db::repository::{GradingInfoRepository, MarginRepository};
use margin_core::grading::{record_canvas_speedgrader_submission, GradingService, GradingTarget, Submission};
use margin_core::models::application_instance::{ApplicationInstance, LtiRegistration};
use margin_core::models::family::Family;
use margin_core::models::lti_user::LtiUser;

use crate::api::{load_instance, require_instructor};
use crate::bearer::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::{AppState, Tx};

#[derive(Debug, Deserialize)]
pub struct AssignmentQuery {
    pub context_id: String,
    pub resource_link_id: String,
}

/// A learner who can be graded on an assignment.
#[derive(Debug, Serialize)]
pub struct Student {
    pub user_id: String,
    pub h_userid: String,
    pub display_name: Option<String>,
    pub lis_result_sourcedid: String,
    pub lis_outcome_service_url: String,
}

#[derive(Debug, Deserialize)]
pub struct GradeRequest {
    pub context_id: String,
    pub resource_link_id: String,
    pub lis_result_sourcedid: String,
    pub lis_outcome_service_url: String,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct SubmissionRequest {
    pub lis_result_sourcedid: String,
    pub lis_outcome_service_url: String,
    pub lti_launch_url: String,
}

async fn registration_for(
    repo: &dyn MarginRepository,
    ai: &ApplicationInstance,
) -> ApiResult<Option<LtiRegistration>> {
    Ok(match ai.lti_registration_id {
        Some(id) => repo.get_lti_registration(id).await?,
        None => None,
    })
}

/// `url` is the outcome service URL for LTI 1.1 tenants and the line item
/// for LTI 1.3 ones; grading info stores either in the same column.
fn target(registration: Option<&LtiRegistration>, url: &str, lineitems: Option<String>) -> GradingTarget {
    match registration {
        Some(_) => GradingTarget {
            lineitem: Some(url.to_string()),
            lineitems,
            ..Default::default()
        },
        None => GradingTarget {
            outcome_service_url: Some(url.to_string()),
            ..Default::default()
        },
    }
}

async fn grading_service(
    state: &AppState,
    repo: &dyn MarginRepository,
    user: &LtiUser,
    req: &GradeRequest,
) -> ApiResult<Box<dyn GradingService>> {
    require_instructor(user)?;
    let ai = load_instance(repo, user).await?;
    let registration = registration_for(repo, &ai).await?;
    let lineitems = repo
        .get_assignment(&user.tenant_guid, &req.resource_link_id)
        .await?
        .and_then(|a| a.extra.get("lineitems").and_then(Value::as_str).map(str::to_string));
    Ok(state.grading.for_instance(
        &ai,
        registration.as_ref(),
        &target(registration.as_ref(), &req.lis_outcome_service_url, lineitems),
    )?)
}

/// Learners recorded for an assignment by their own launches.
pub async fn students(
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Query(query): Query<AssignmentQuery>,
) -> ApiResult<Json<Vec<Student>>> {
    require_instructor(&user)?;
    let infos = repo
        .list_grading_infos(
            user.application_instance_id,
            &query.context_id,
            &query.resource_link_id,
        )
        .await?;
    Ok(Json(
        infos
            .into_iter()
            .map(|info| Student {
                user_id: info.user_id,
                h_userid: info.h_userid,
                display_name: info.display_name,
                lis_result_sourcedid: info.lis_result_sourcedid,
                lis_outcome_service_url: info.lis_outcome_service_url,
            })
            .collect(),
    ))
}

pub async fn read(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Json(req): Json<GradeRequest>,
) -> ApiResult<Json<Value>> {
    let service = grading_service(&state, &repo, &user, &req).await?;
    let score = service.read_result(&req.lis_result_sourcedid).await?;
    Ok(Json(json!({ "score": score })))
}

pub async fn record(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Json(req): Json<GradeRequest>,
) -> ApiResult<Json<Value>> {
    let score = req
        .score
        .ok_or_else(|| ApiError::BadRequest("score is required".into()))?;
    let service = grading_service(&state, &repo, &user, &req).await?;
    service
        .record_result(&req.lis_result_sourcedid, Some(score), None)
        .await?;
    info!(
        context_id = %req.context_id,
        resource_link_id = %req.resource_link_id,
        score,
        "recorded grade"
    );
    Ok(Json(json!({})))
}

/// Record the learner's launch as a Canvas submission so SpeedGrader can
/// open it. A learner who already has a grade is left alone.
pub async fn speedgrader_submission(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Json(req): Json<SubmissionRequest>,
) -> ApiResult<Json<Value>> {
    let ai = load_instance(&repo, &user).await?;
    if ai.family != Family::Canvas {
        return Err(ApiError::BadRequest(
            "SpeedGrader submissions are Canvas only".into(),
        ));
    }
    let registration = registration_for(&repo, &ai).await?;
    let service = state.grading.for_instance(
        &ai,
        registration.as_ref(),
        &target(registration.as_ref(), &req.lis_outcome_service_url, None),
    )?;
    let recorded = record_canvas_speedgrader_submission(
        service.as_ref(),
        &req.lis_result_sourcedid,
        &Submission {
            lti_launch_url: req.lti_launch_url.clone(),
            submitted_at: Utc::now(),
        },
    )
    .await?;
    Ok(Json(json!({ "recorded": recorded })))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{get, post_json, read};
    use crate::pipeline;
    use crate::router;
    use crate::tests::{h_server, sign_v11, test_state, v11_form, LAUNCH_URL};
    use crate::verifier::LaunchRequest;
    use crate::AppState;
    use axum::http::StatusCode;
    use chrono::Utc;
    use margin_core::db::repository::AssignmentRepository;
    use margin_core::db::sqlite::SqliteRepository;
    use margin_core::models::assignment::AssignmentUpsert;
    use serde_json::json;
    use tower::ServiceExt;
    use url::Url;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pox(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<imsx_POXEnvelopeResponse xmlns="http://www.imsglobal.org/services/ltiv1p1/xsd/imsoms_v1p0">
  <imsx_POXHeader><imsx_POXResponseHeaderInfo>
    <imsx_version>V1.0</imsx_version>
    <imsx_statusInfo><imsx_codeMajor>success</imsx_codeMajor></imsx_statusInfo>
  </imsx_POXResponseHeaderInfo></imsx_POXHeader>
  <imsx_POXBody>{body}</imsx_POXBody>
</imsx_POXEnvelopeResponse>"#
        )
    }

    fn read_response(score: &str) -> String {
        pox(&format!(
            "<readResultResponse><result><resultScore><language>en</language><textString>{score}</textString></resultScore></result></readResultResponse>"
        ))
    }

    /// Launch as `roles` with grading parameters pointing at `outcomes`,
    /// returning the bearer token.
    async fn launch(state: &AppState, repo: &SqliteRepository, roles: &str, outcomes: &str) -> String {
        let mut form = v11_form(roles, Utc::now().timestamp());
        form.push(("lis_result_sourcedid".into(), "S-1".into()));
        form.push(("lis_outcome_service_url".into(), outcomes.into()));
        let req = LaunchRequest::new("POST", Url::parse(LAUNCH_URL).unwrap(), sign_v11(form, "secret"));
        pipeline::launch(state, repo, &req)
            .await
            .unwrap()
            .api
            .unwrap()
            .auth_token
    }

    async fn configured(h: &MockServer) -> (std::sync::Arc<AppState>, SqliteRepository) {
        let (state, repo) = test_state(h).await;
        repo.upsert_assignment(&AssignmentUpsert {
            tool_consumer_instance_guid: "G".into(),
            resource_link_id: "RL".into(),
            document_url: "https://example.com/doc.pdf".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        (state, repo)
    }

    #[tokio::test]
    async fn instructors_list_students_that_launched() {
        let h = h_server().await;
        let (state, repo) = configured(&h).await;
        launch(&state, &repo, "Learner", "https://lms.example.com/outcomes").await;
        let token = launch(&state, &repo, "Instructor", "https://lms.example.com/outcomes").await;

        let resp = router(state)
            .oneshot(get(
                "/api/grading/students?context_id=C&resource_link_id=RL",
                &token,
            ))
            .await
            .unwrap();
        let (status, body) = read(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["lis_result_sourcedid"], "S-1");
        assert_eq!(body[0]["display_name"], "Jane Doe");
    }

    #[tokio::test]
    async fn learners_cannot_list_students() {
        let h = h_server().await;
        let (state, repo) = configured(&h).await;
        let token = launch(&state, &repo, "Learner", "https://lms.example.com/outcomes").await;
        let resp = router(state)
            .oneshot(get(
                "/api/grading/students?context_id=C&resource_link_id=RL",
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn record_and_read_go_to_the_outcome_service() {
        let h = h_server().await;
        let lms = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/outcomes"))
            .and(body_string_contains("replaceResultRequest"))
            .respond_with(ResponseTemplate::new(200).set_body_string(pox("<replaceResultResponse/>")))
            .expect(1)
            .mount(&lms)
            .await;
        Mock::given(method("POST"))
            .and(path("/outcomes"))
            .and(body_string_contains("readResultRequest"))
            .respond_with(ResponseTemplate::new(200).set_body_string(read_response("0.5")))
            .mount(&lms)
            .await;
        let outcomes = format!("{}/outcomes", lms.uri());
        let (state, repo) = configured(&h).await;
        let token = launch(&state, &repo, "Instructor", &outcomes).await;
        let app = router(state);
        let grade = |score: Option<f64>| {
            json!({
                "context_id": "C",
                "resource_link_id": "RL",
                "lis_result_sourcedid": "S-1",
                "lis_outcome_service_url": outcomes,
                "score": score,
            })
        };

        let resp = app
            .clone()
            .oneshot(post_json("/api/grading/record", &token, grade(Some(0.5))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(post_json("/api/grading/read", &token, grade(None)))
            .await
            .unwrap();
        let (status, body) = read(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"score": 0.5}));
    }

    #[tokio::test]
    async fn record_without_a_score_is_rejected() {
        let h = h_server().await;
        let (state, repo) = configured(&h).await;
        let token = launch(&state, &repo, "Instructor", "https://lms.example.com/outcomes").await;
        let resp = router(state)
            .oneshot(post_json(
                "/api/grading/record",
                &token,
                json!({
                    "context_id": "C",
                    "resource_link_id": "RL",
                    "lis_result_sourcedid": "S-1",
                    "lis_outcome_service_url": "https://lms.example.com/outcomes",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn speedgrader_submission_is_skipped_once_graded() {
        let h = h_server().await;
        let lms = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/outcomes"))
            .and(body_string_contains("readResultRequest"))
            .respond_with(ResponseTemplate::new(200).set_body_string(read_response("0.8")))
            .mount(&lms)
            .await;
        Mock::given(method("POST"))
            .and(path("/outcomes"))
            .and(body_string_contains("replaceResultRequest"))
            .respond_with(ResponseTemplate::new(200).set_body_string(pox("<replaceResultResponse/>")))
            .expect(0)
            .mount(&lms)
            .await;
        let outcomes = format!("{}/outcomes", lms.uri());
        let (state, repo) = configured(&h).await;
        let token = launch(&state, &repo, "Learner", &outcomes).await;

        let resp = router(state)
            .oneshot(post_json(
                "/api/lti/submissions",
                &token,
                json!({
                    "lis_result_sourcedid": "S-1",
                    "lis_outcome_service_url": outcomes,
                    "lti_launch_url": "https://margin.example.com/lti_launches?url=x",
                }),
            ))
            .await
            .unwrap();
        let (status, body) = read(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"recorded": false}));
    }
}
