//! LTI 1.3 third-party initiated login and the tool's public key set.
//!
//! The platform sends the browser to `/lti/1.3/oidc`; we answer with a
//! redirect to the platform's authorization endpoint carrying a fresh
//! `state` and `nonce`. The platform then form-posts the signed id_token to
//! the launch URL, where the verifier checks the nonce against the state.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Extension, Form, Json, Router,
};
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use url::Url;

use margin_core::db::repository::MarginRepository;
use margin_core::models::application_instance::LtiRegistration;

use crate::error::{ApiError, ApiResult, LaunchError};
use crate::{AppState, Tx};

/// Third-party initiated login parameters, sent as a query string or a form.
#[derive(Debug, Deserialize)]
pub struct LoginParams {
    pub iss: Option<String>,
    pub login_hint: Option<String>,
    pub target_link_uri: Option<String>,
    pub lti_message_hint: Option<String>,
    pub client_id: Option<String>,
    pub lti_deployment_id: Option<String>,
}

pub fn oidc_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/lti/1.3/oidc", get(login_get).post(login_post))
        .route("/lti/1.3/jwks", get(jwks))
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn login_get(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    Query(params): Query<LoginParams>,
) -> ApiResult<Response> {
    login(&state, &repo, params).await
}

async fn login_post(
    State(state): State<Arc<AppState>>,
    Extension(Tx(repo)): Extension<Tx>,
    Form(params): Form<LoginParams>,
) -> ApiResult<Response> {
    login(&state, &repo, params).await
}

async fn find_registration(
    repo: &dyn MarginRepository,
    issuer: &str,
    client_id: Option<&str>,
) -> ApiResult<LtiRegistration> {
    let unknown = || LaunchError::UnknownRegistration {
        issuer: issuer.to_string(),
        client_id: client_id.unwrap_or_default().to_string(),
    };
    if let Some(client_id) = client_id {
        return Ok(repo
            .find_lti_registration(issuer, client_id)
            .await?
            .ok_or_else(unknown)?);
    }
    // Platforms may omit client_id when the issuer has a single registration.
    let mut registrations = repo.list_lti_registrations_by_issuer(issuer).await?;
    match registrations.len() {
        1 => Ok(registrations.remove(0)),
        _ => Err(unknown().into()),
    }
}

pub async fn login(
    state: &AppState,
    repo: &dyn MarginRepository,
    params: LoginParams,
) -> ApiResult<Response> {
    let issuer = params
        .iss
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("login request has no iss".into()))?;
    let login_hint = params
        .login_hint
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("login request has no login_hint".into()))?;
    let registration = find_registration(
        repo,
        issuer,
        params.client_id.as_deref().filter(|s| !s.is_empty()),
    )
    .await?;

    let redirect_uri = params
        .target_link_uri
        .clone()
        .filter(|u| u.starts_with(&state.public_url))
        .unwrap_or_else(|| format!("{}/lti_launches", state.public_url));
    let login_state = random_hex(16);
    let nonce = random_hex(16);

    let mut url = Url::parse(&registration.auth_login_url).map_err(|e| {
        ApiError::BadRequest(format!("registration has an invalid login URL: {e}"))
    })?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("scope", "openid")
            .append_pair("response_type", "id_token")
            .append_pair("response_mode", "form_post")
            .append_pair("prompt", "none")
            .append_pair("client_id", &registration.client_id)
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("login_hint", login_hint)
            .append_pair("state", &login_state)
            .append_pair("nonce", &nonce);
        if let Some(hint) = params.lti_message_hint.as_deref() {
            query.append_pair("lti_message_hint", hint);
        }
    }

    state.verifier.remember_login(&login_state, &nonce);
    info!(issuer, client_id = %registration.client_id, "LTI 1.3 login");
    Ok(Redirect::to(url.as_str()).into_response())
}

async fn jwks(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "keys": [state.tool_key.jwk()] }))
}
