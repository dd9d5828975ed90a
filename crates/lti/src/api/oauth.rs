//! The OAuth 2 authorization code flow that grants us vendor API access on
//! a user's behalf.
//!
//! The `state` parameter is a bearer token for the user, so the callback
//! knows whose grant it received without a session.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::{Html, IntoResponse, Redirect, Response},
    Extension,
};
use serde::Deserialize;
use tracing::{info, warn};

use margin_core::connectors::ApiFactory;
use margin_core::models::application_instance::ApplicationInstance;
use margin_core::models::oauth2_token::{Service, TokenKey};

use crate::api::{load_instance, require_vendor};
use crate::bearer::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::{AppState, Tx};

const AUTHORIZED_PAGE: &str = "<!DOCTYPE html>\n<html><head><title>Authorized</title></head>\
<body><p>Access granted. You can close this window.</p>\
<script>if (window.opener) { window.opener.postMessage({type: 'authorization_complete'}, '*'); } window.close();</script>\
</body></html>";

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

fn service_for(ai: &ApplicationInstance, vendor: &str) -> ApiResult<Service> {
    require_vendor(ai, vendor)?;
    let service = Service::parse(vendor)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown vendor {vendor}")))?;
    match ApiFactory::service_for(ai) {
        Some(expected) if expected == service => Ok(service),
        _ => Err(ApiError::BadRequest(format!(
            "{vendor} API access is not available for this tenant"
        ))),
    }
}

fn redirect_uri(state: &AppState, vendor: &str) -> String {
    format!("{}/api/{vendor}/oauth/callback", state.public_url)
}

/// Send the user to the vendor to authorize API access.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    AuthUser(user): AuthUser,
    Path(vendor): Path<String>,
) -> ApiResult<Response> {
    let ai = load_instance(&repo, &user).await?;
    let service = service_for(&ai, &vendor)?;
    let token = state.bearer.issue(&user)?;
    let url = state.apis.authorization_url(
        &ai,
        service,
        &redirect_uri(&state, &vendor),
        &token,
    )?;
    Ok(Redirect::to(&url).into_response())
}

/// Exchange the authorization code and store the user's tokens.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    Path(vendor): Path<String>,
    Query(params): Query<CallbackParams>,
) -> ApiResult<Response> {
    let user = state.bearer.verify(params.state.as_deref().unwrap_or_default())?;
    if let Some(error) = params.error.as_deref() {
        warn!(vendor, error, user_id = %user.user_id, "authorization refused");
        return Err(ApiError::BadRequest(format!("authorization refused: {error}")));
    }
    let code = params
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::BadRequest("callback has no code".into()))?;

    let ai = load_instance(&repo, &user).await?;
    let service = service_for(&ai, &vendor)?;
    let endpoint = state.apis.token_endpoint(&ai, service)?;
    let tokens = state.apis.tokens();
    let grant = tokens
        .http()
        .get_access_token(&endpoint, code, &redirect_uri(&state, &vendor))
        .await?;
    tokens
        .save(
            &TokenKey {
                application_instance_id: ai.id,
                user_id: user.user_id.clone(),
                service,
            },
            &grant,
        )
        .await?;
    info!(
        application_instance_id = ai.id,
        user_id = %user.user_id,
        service = service.as_str(),
        "stored API authorization"
    );
    Ok(Html(AUTHORIZED_PAGE).into_response())
}
