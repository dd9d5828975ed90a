//! Section and group sync, and the group sets a course offers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use tracing::info;

use margin_core::grouping::{self, classify, groupids, plugin_for, LaunchGrouping, SyncUser};
use margin_core::models::grouping::GroupSet;

use crate::api::{load_instance, require_instructor};
use crate::bearer::AuthUser;
use crate::error::ApiResult;
use crate::pipeline::{find_course, restore_context};
use crate::{AppState, Tx};

/// Body of the sync directive a launch config carries.
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub context_id: String,
    pub resource_link_id: String,
    #[serde(default)]
    pub group_set_id: Option<String>,
    /// Set on SpeedGrader launches: the learner being graded.
    #[serde(default)]
    pub grading_learner_id: Option<String>,
}

/// Resolve the caller's sections or groups, store them, provision them in
/// the annotation service and return their group ids.
pub async fn sync(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Json(body): Json<SyncRequest>,
) -> ApiResult<Json<Vec<String>>> {
    let ctx = restore_context(&repo, &user, &body.context_id, &body.resource_link_id).await?;
    let plugin = plugin_for(&state.apis, &ctx.ai, &user);
    let launch = classify(
        plugin.as_ref(),
        &ctx.ai,
        &ctx.course,
        body.group_set_id.as_deref(),
    );
    // Only instructors may look at another user's groups.
    let grading_learner_id = body
        .grading_learner_id
        .as_deref()
        .filter(|_| user.is_instructor());

    let groupings = grouping::sync(
        &repo,
        plugin.as_ref(),
        &ctx.ai,
        &ctx.course,
        &launch,
        SyncUser {
            user: &user,
            lms_user_id: ctx.lms_user.id,
            grading_learner_id,
        },
    )
    .await?;

    let ids = if !ctx.ai.provisioning {
        groupids(&groupings, state.provisioner.authority())
    } else if launch == LaunchGrouping::Course {
        vec![state.provisioner.provision_course(&user, &ctx.course).await?]
    } else {
        state.provisioner.provision_groupings(&user, &groupings).await?
    };
    info!(
        context_id = %body.context_id,
        resource_link_id = %body.resource_link_id,
        groups = ids.len(),
        "sync"
    );
    Ok(Json(ids))
}

/// Group sets of a course, for the assignment form. Empty when the LMS has
/// no groups or the tenant has no API access.
pub async fn group_sets(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Path(context_id): Path<String>,
) -> ApiResult<Json<Vec<GroupSet>>> {
    require_instructor(&user)?;
    let ai = load_instance(&repo, &user).await?;
    let course = find_course(&repo, &user, &context_id).await?;
    let plugin = plugin_for(&state.apis, &ai, &user);
    Ok(Json(plugin.get_group_sets(&course).await?.unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{get, post_json, read};
    use crate::frontend::FrontendConfig;
    use crate::pipeline;
    use crate::router;
    use crate::tests::{h_server, key_server, seed_registration, test_state, v13_launch};
    use crate::AppState;
    use axum::http::StatusCode;
    use chrono::Utc;
    use margin_core::db::repository::{
        AssignmentRepository, GroupingRepository, OAuth2TokenRepository,
    };
    use margin_core::db::sqlite::SqliteRepository;
    use margin_core::models::application_instance::ApplicationInstance;
    use margin_core::models::assignment::AssignmentUpsert;
    use margin_core::models::grouping::{authority_provided_id, GroupingType};
    use margin_core::models::oauth2_token::{Service, TokenGrant, TokenKey};
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// An LTI 1.3 Canvas tenant whose platform, key set and REST API all
    /// live on `lms`, with an assignment using group set 42.
    async fn group_tenant(
        h: &MockServer,
        lms: &MockServer,
    ) -> (Arc<AppState>, SqliteRepository, ApplicationInstance) {
        let (state, repo) = test_state(h).await;
        let (_, ai) = seed_registration(&repo, &lms.uri()).await;
        repo.upsert_assignment(&AssignmentUpsert {
            tool_consumer_instance_guid: "G".into(),
            resource_link_id: "RL".into(),
            document_url: "https://example.com/doc.pdf".into(),
            group_set_id: Some("42".into()),
            ..Default::default()
        })
        .await
        .unwrap();
        repo.save_oauth2_token(
            &TokenKey {
                application_instance_id: ai.id,
                user_id: "u-1".into(),
                service: Service::Canvas,
            },
            &TokenGrant {
                access_token: "canvas-token".into(),
                refresh_token: Some("r1".into()),
                expires_in: Some(3600),
            },
            Utc::now(),
        )
        .await
        .unwrap();
        (state, repo, ai)
    }

    async fn launch(state: &AppState, repo: &SqliteRepository, role: &str) -> FrontendConfig {
        let req = v13_launch(state, role);
        pipeline::launch(state, repo, &req).await.unwrap()
    }

    fn canvas_group(id: i64, name: &str) -> serde_json::Value {
        json!({"id": id, "name": name, "group_category_id": 42, "course_id": 125})
    }

    #[tokio::test]
    async fn instructor_sync_stores_and_provisions_every_group() {
        let h = h_server().await;
        let lms = key_server().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/group_categories/42/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                canvas_group(1, "Group A"),
                canvas_group(2, "Group B"),
                canvas_group(3, "Group C"),
            ])))
            .mount(&lms)
            .await;
        let (state, repo, ai) = group_tenant(&h, &lms).await;

        let config = launch(&state, &repo, "Instructor").await;
        let api = config.api.unwrap();
        let directive = api.sync.unwrap();

        let resp = router(state)
            .oneshot(post_json(&directive.path, &api.auth_token, directive.data))
            .await
            .unwrap();
        let (status, body) = read(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);

        let course = repo
            .get_grouping_by_authority_provided_id(&authority_provided_id(
                "G",
                GroupingType::Course,
                "C",
                None,
            ))
            .await
            .unwrap()
            .unwrap();
        let groups = repo
            .list_child_groupings(course.id, GroupingType::CanvasGroup)
            .await
            .unwrap();
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.application_instance_id == ai.id));
        for group in &groups {
            assert_eq!(repo.list_grouping_memberships(group.id).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn learner_outside_every_group_is_told_so() {
        let h = h_server().await;
        let lms = key_server().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/self/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&lms)
            .await;
        let (state, repo, _) = group_tenant(&h, &lms).await;

        let config = launch(&state, &repo, "Learner").await;
        let api = config.api.unwrap();
        let directive = api.sync.unwrap();

        let resp = router(state)
            .oneshot(post_json(&directive.path, &api.auth_token, directive.data))
            .await
            .unwrap();
        let (status, body) = read(resp).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"error_code": "canvas_student_not_in_group", "details": {"group_set": 42}})
        );
    }

    #[tokio::test]
    async fn sync_needs_a_bearer_token() {
        let h = h_server().await;
        let (state, _) = test_state(&h).await;
        let resp = router(state)
            .oneshot(post_json(
                "/api/sync",
                "",
                json!({"context_id": "C", "resource_link_id": "RL"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn group_sets_come_from_the_lms() {
        let h = h_server().await;
        let lms = key_server().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/courses/C/group_categories"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": 42, "name": "Projects"}])),
            )
            .mount(&lms)
            .await;
        let (state, repo, _) = group_tenant(&h, &lms).await;
        let token = launch(&state, &repo, "Instructor").await.api.unwrap().auth_token;

        let resp = router(state)
            .oneshot(get("/api/courses/C/group_sets", &token))
            .await
            .unwrap();
        let (status, body) = read(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{"id": "42", "name": "Projects"}]));
    }

    #[tokio::test]
    async fn group_sets_are_for_instructors() {
        let h = h_server().await;
        let lms = key_server().await;
        let (state, repo, _) = group_tenant(&h, &lms).await;
        let token = launch(&state, &repo, "Learner").await.api.unwrap().auth_token;
        let resp = router(state)
            .oneshot(get("/api/courses/C/group_sets", &token))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
