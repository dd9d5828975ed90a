//! Launch verification failures and the JSON error responses of the API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use margin_core::error::{ErrorCode, MarginError};

use crate::frontend::FrontendConfig;

/// Why a launch was rejected.
///
/// Cloneable so a verification outcome can be memoised on the request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("launch has no oauth_consumer_key")]
    NoConsumerKey,

    #[error("unknown consumer key: {0}")]
    UnknownConsumerKey(String),

    #[error("invalid launch signature: {0}")]
    SignatureInvalid(String),

    #[error("launch nonce has already been used")]
    ReplayedNonce,

    #[error("launch assertion was issued in the future")]
    ClockSkew,

    #[error("launch has no id_token")]
    MissingAssertion,

    #[error("malformed id_token: {0}")]
    MalformedAssertion(String),

    #[error("id_token is missing the {0} claim")]
    MissingClaim(String),

    #[error("no registration for issuer {issuer} and client {client_id}")]
    UnknownRegistration { issuer: String, client_id: String },

    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("no key {0} in the platform's key set")]
    KeyNotFound(String),

    #[error("id_token has expired")]
    ExpiredAssertion,

    #[error("platform key set unavailable: {0}")]
    KeySetUnavailable(String),

    #[error("launch verification failed: {0}")]
    Internal(String),
}

impl LaunchError {
    pub fn error_code(&self) -> &'static str {
        match self {
            LaunchError::NoConsumerKey => "no_consumer_key",
            LaunchError::UnknownConsumerKey(_) => "unknown_consumer_key",
            LaunchError::SignatureInvalid(_) => "signature_invalid",
            LaunchError::ReplayedNonce => "replayed_nonce",
            LaunchError::ClockSkew => "clock_skew",
            LaunchError::MissingAssertion => "missing_assertion",
            LaunchError::MalformedAssertion(_) => "malformed_assertion",
            LaunchError::MissingClaim(_) => "missing_claim",
            LaunchError::UnknownRegistration { .. } => "unknown_registration",
            LaunchError::UnknownDeployment(_) => "unknown_deployment",
            LaunchError::KeyNotFound(_) => "key_not_found",
            LaunchError::ExpiredAssertion => "expired_assertion",
            LaunchError::KeySetUnavailable(_) => "key_set_unavailable",
            LaunchError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            LaunchError::NoConsumerKey
            | LaunchError::MissingAssertion
            | LaunchError::MalformedAssertion(_)
            | LaunchError::MissingClaim(_) => StatusCode::BAD_REQUEST,
            // A tenant whose key set URL is broken is misconfigured.
            LaunchError::KeySetUnavailable(_) | LaunchError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::FORBIDDEN,
        }
    }
}

impl From<MarginError> for LaunchError {
    fn from(e: MarginError) -> Self {
        LaunchError::Internal(e.to_string())
    }
}

const GENERIC_MESSAGE: &str = "A problem occurred while handling this request. It has been reported.";

/// Error returned by every API handler.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Margin(#[from] MarginError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Launch(e) => {
                warn!(error_code = e.error_code(), error = %e, "launch rejected");
                let status = e.status();
                (status, Json(FrontendConfig::error(e.error_code(), &e.to_string()))).into_response()
            }
            ApiError::Unauthorized(message) => {
                (StatusCode::UNAUTHORIZED, Json(json!({ "message": message }))).into_response()
            }
            ApiError::Forbidden(message) => {
                (StatusCode::FORBIDDEN, Json(json!({ "message": message }))).into_response()
            }
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response()
            }
            ApiError::Margin(e) => margin_error_response(e),
        }
    }
}

fn margin_error_response(e: MarginError) -> Response {
    match e {
        // The frontend starts the authorization flow on an empty body.
        MarginError::NoToken => (StatusCode::BAD_REQUEST, Json(json!({}))).into_response(),
        MarginError::ExternalRequest(e) => {
            warn!(error = %e, "external request failed");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "message": e.message,
                    "details": e.details(),
                })),
            )
                .into_response()
        }
        MarginError::Coded(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error_code": e.error_code,
                "details": e.details,
            })),
        )
            .into_response(),
        MarginError::InstructorLaunchRequired => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error_code": ErrorCode::InstructorLaunchRequired,
                "details": {},
            })),
        )
            .into_response(),
        MarginError::Validation(message) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "message": message })),
        )
            .into_response(),
        MarginError::NotFound(message) => {
            (StatusCode::NOT_FOUND, Json(json!({ "message": message }))).into_response()
        }
        other => {
            error!(error = %other, "unhandled error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": GENERIC_MESSAGE })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use margin_core::error::{CodedError, ExternalRequestError, GroupErrorKind};
    use margin_core::models::family::Family;
    use serde_json::Value;

    async fn body_of(resp: Response) -> (StatusCode, Value) {
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn no_token_is_an_empty_body() {
        let (status, body) = body_of(ApiError::from(MarginError::NoToken).into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn external_errors_carry_request_details() {
        let err = ExternalRequestError::new("Canvas API error")
            .with_request("GET", "https://lms.example.com/api/v1/files")
            .with_response(500, Some("Internal Server Error"), "boom");
        let (status, body) = body_of(ApiError::from(MarginError::from(err)).into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Canvas API error");
        assert_eq!(body["details"]["request"]["method"], "GET");
        assert_eq!(body["details"]["response"]["status_code"], 500);
    }

    #[tokio::test]
    async fn coded_errors_carry_their_code() {
        let err = CodedError::group(Family::Canvas, GroupErrorKind::StudentNotInGroup, "42");
        let (status, body) = body_of(ApiError::from(MarginError::from(err)).into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"error_code": "canvas_student_not_in_group", "details": {"group_set": 42}})
        );
    }

    #[tokio::test]
    async fn validation_is_422_and_the_rest_500() {
        let (status, _) =
            body_of(ApiError::from(MarginError::Validation("bad".into())).into_response()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) =
            body_of(ApiError::from(MarginError::Crypto("secret leak".into())).into_response()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], GENERIC_MESSAGE);
    }

    #[tokio::test]
    async fn launch_errors_render_error_mode() {
        let (status, body) =
            body_of(ApiError::from(LaunchError::UnknownConsumerKey("k".into())).into_response()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["mode"], "ERROR");
        assert_eq!(body["error"]["error_code"], "unknown_consumer_key");

        let (status, _) =
            body_of(ApiError::from(LaunchError::KeySetUnavailable("404".into())).into_response()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
