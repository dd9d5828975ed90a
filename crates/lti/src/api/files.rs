//! LMS file listing for the picker, and Via URLs for LMS and JSTOR documents.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use margin_core::course::course_api_id;
use margin_core::content::files::{file_type_for, FileApi, FileDocument};
use margin_core::db::repository::FileRepository;
use margin_core::models::application_instance::ApplicationInstance;
use margin_core::models::family::Family;
use margin_core::models::file::ListedFile;
use margin_core::models::lti_user::LtiUser;

use crate::api::{load_instance, require_instructor, require_vendor};
use crate::bearer::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::pipeline::find_course;
use crate::{AppState, Tx};

#[derive(Debug, Deserialize)]
pub struct ViaUrlRequest {
    pub document_url: String,
    #[serde(default)]
    pub context_id: Option<String>,
}

fn file_api(state: &AppState, ai: &ApplicationInstance, user: &LtiUser) -> ApiResult<Box<dyn FileApi>> {
    if !ai.files_enabled() {
        return Err(ApiError::BadRequest(format!(
            "{} files are not enabled for this tenant",
            ai.family
        )));
    }
    Ok(match ai.family {
        Family::Canvas => Box::new(state.apis.canvas(ai, &user.user_id)?),
        Family::Blackboard => Box::new(state.apis.blackboard(ai, &user.user_id)?),
        Family::D2L => Box::new(state.apis.d2l(ai, &user.user_id)?),
        Family::Moodle => Box::new(state.apis.moodle(ai)?),
        other => return Err(ApiError::BadRequest(format!("{other} has no file API"))),
    })
}

/// Files of a course, remembered so later course copies can find them.
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Path((vendor, course_id)): Path<(String, String)>,
) -> ApiResult<Json<Vec<ListedFile>>> {
    require_instructor(&user)?;
    let ai = load_instance(&repo, &user).await?;
    require_vendor(&ai, &vendor)?;
    let api = file_api(&state, &ai, &user)?;

    let files = api.list_files(&course_id).await?;
    if let Some(file_type) = file_type_for(ai.family) {
        repo.upsert_files(ai.id, file_type, &course_id, &files).await?;
    }
    Ok(Json(files))
}

/// A Via URL for an LMS file document, resolved for the launching course.
pub async fn via_url(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Path(vendor): Path<String>,
    Json(req): Json<ViaUrlRequest>,
) -> ApiResult<Json<Value>> {
    let ai = load_instance(&repo, &user).await?;
    require_vendor(&ai, &vendor)?;
    let context_id = req
        .context_id
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("context_id is required".into()))?;
    let course = find_course(&repo, &user, context_id).await?;
    let document = FileDocument::parse(&req.document_url)?;
    if document.family != ai.family {
        return Err(ApiError::BadRequest(format!(
            "{} is not a {} document",
            req.document_url, ai.family
        )));
    }

    let api = file_api(&state, &ai, &user)?;
    let course_api_id = course_api_id(&course, ai.family);
    let url = state
        .course_copy
        .public_url(&repo, api.as_ref(), &ai, &course, &course_api_id, &document.file_id)
        .await?;

    // D2L download URLs need the user's token.
    let headers = if ai.family == Family::D2L {
        let token = state
            .apis
            .d2l(&ai, &user.user_id)?
            .proxy()
            .access_token()
            .await?;
        Some(BTreeMap::from([(
            "Authorization".to_string(),
            format!("Bearer {token}"),
        )]))
    } else {
        None
    };
    let via_url = state.via.build(&url, Some("pdf"), headers.as_ref())?;
    Ok(Json(json!({ "via_url": via_url })))
}

pub async fn jstor_via_url(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Json(req): Json<ViaUrlRequest>,
) -> ApiResult<Json<Value>> {
    let ai = load_instance(&repo, &user).await?;
    let via_url = state.jstor.via_url(&ai, &req.document_url)?;
    Ok(Json(json!({ "via_url": via_url })))
}
