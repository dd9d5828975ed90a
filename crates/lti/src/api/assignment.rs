//! The file picker's form submission.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::State, Extension, Json};
use serde::Deserialize;

use margin_core::models::lti_params::LtiParams;

use crate::api::require_instructor;
use crate::bearer::AuthUser;
use crate::error::ApiResult;
use crate::frontend::FrontendConfig;
use crate::pipeline::{assignment_config, configure_assignment, restore_context};
use crate::{AppState, Tx};

#[derive(Debug, Deserialize)]
pub struct AssignmentForm {
    pub context_id: String,
    pub resource_link_id: String,
    pub document_url: String,
    #[serde(default)]
    pub group_set_id: Option<String>,
    #[serde(default)]
    pub resource_link_title: Option<String>,
    #[serde(default)]
    pub lis_outcome_service_url: Option<String>,
    #[serde(default)]
    pub lineitems: Option<String>,
}

impl AssignmentForm {
    /// The launch parameters the picker carried through its form.
    fn params(&self) -> LtiParams {
        let mut map = HashMap::new();
        map.insert("context_id".to_string(), self.context_id.clone());
        map.insert("resource_link_id".to_string(), self.resource_link_id.clone());
        for (key, value) in [
            ("resource_link_title", &self.resource_link_title),
            ("lis_outcome_service_url", &self.lis_outcome_service_url),
            ("lineitems", &self.lineitems),
        ] {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                map.insert(key.to_string(), value.clone());
            }
        }
        LtiParams::from_v11(&map)
    }
}

/// Save the document an instructor picked and return the launch config for
/// it, so the frontend can switch straight to annotating.
pub async fn configure(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Json(form): Json<AssignmentForm>,
) -> ApiResult<Json<FrontendConfig>> {
    require_instructor(&user)?;
    let ctx = restore_context(&repo, &user, &form.context_id, &form.resource_link_id).await?;
    // Reject sources the tenant has disabled before anything is saved.
    state.content.file_display_config(&ctx.ai, &form.document_url)?;

    let assignment = configure_assignment(
        &repo,
        &ctx,
        &form.params(),
        &form.document_url,
        form.group_set_id.as_deref(),
    )
    .await?;
    Ok(Json(
        assignment_config(&state, &repo, &ctx, &assignment, None).await?,
    ))
}
