//! The JSON API the frontend calls after a launch.
//!
//! Every route authenticates with the bearer token handed out in the launch
//! config and runs inside the request transaction.

pub mod assignment;
pub mod files;
pub mod grading;
pub mod oauth;
pub mod sync;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use margin_core::db::repository::MarginRepository;
use margin_core::error::MarginError;
use margin_core::models::application_instance::ApplicationInstance;
use margin_core::models::family::Family;
use margin_core::models::lti_user::LtiUser;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync", post(sync::sync))
        .route("/courses/:context_id/group_sets", get(sync::group_sets))
        .route("/assignment", post(assignment::configure))
        .route("/grading/students", get(grading::students))
        .route("/grading/read", post(grading::read))
        .route("/grading/record", post(grading::record))
        .route("/lti/submissions", post(grading::speedgrader_submission))
        .route("/jstor/via_url", post(files::jstor_via_url))
        .route("/:vendor/oauth/authorize", get(oauth::authorize))
        .route("/:vendor/oauth/callback", get(oauth::callback))
        .route("/:vendor/courses/:course_id/files", get(files::list_files))
        .route("/:vendor/files/via_url", post(files::via_url))
}

pub(crate) fn require_instructor(user: &LtiUser) -> ApiResult<()> {
    if user.is_instructor() || user.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("instructors only".into()))
    }
}

/// The tenant the bearer token was issued for.
pub(crate) async fn load_instance(
    repo: &dyn MarginRepository,
    user: &LtiUser,
) -> ApiResult<ApplicationInstance> {
    let mut ai = repo
        .get_application_instance(user.application_instance_id)
        .await?
        .ok_or_else(|| MarginError::NotFound("application instance".into()))?;
    if ai.family == Family::Unknown {
        ai.family = Family::from_instance_guid(&user.tenant_guid);
    }
    Ok(ai)
}

/// Check the `{vendor}` path segment against the tenant's LMS.
pub(crate) fn require_vendor(ai: &ApplicationInstance, vendor: &str) -> ApiResult<()> {
    if ai.family.as_str() == vendor.to_ascii_lowercase() {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "this tenant is {}, not {vendor}",
            ai.family
        )))
    }
}
