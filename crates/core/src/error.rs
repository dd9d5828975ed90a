//! Error types for the margin core crate.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::family::Family;

/// Longest slice of an upstream response body kept on an [`ExternalRequestError`].
const MAX_BODY_CHARS: usize = 150;

/// Top-level error type for all margin core operations.
#[derive(Debug, Error)]
pub enum MarginError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    /// The user has no usable OAuth 2 token for the vendor API and must
    /// (re-)authorize.
    #[error("no OAuth 2 access token for this user")]
    NoToken,

    #[error(transparent)]
    ExternalRequest(#[from] ExternalRequestError),

    #[error(transparent)]
    Coded(#[from] CodedError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("an instructor must launch this course before it can be used")]
    InstructorLaunchRequired,

    #[error("not found: {0}")]
    NotFound(String),
}

/// A convenience Result alias that defaults to [`MarginError`].
pub type Result<T> = std::result::Result<T, MarginError>;

impl From<serde_json::Error> for MarginError {
    fn from(e: serde_json::Error) -> Self {
        MarginError::Serialization(e.to_string())
    }
}

impl MarginError {
    /// The upstream HTTP status, when this error wraps a failed external request.
    pub fn external_status(&self) -> Option<u16> {
        match self {
            MarginError::ExternalRequest(e) => e.status_code,
            _ => None,
        }
    }
}

/// A failed request to a third-party HTTP API (LMS, annotation service, ...).
#[derive(Debug, Clone, Default, Error, Serialize)]
#[error("{}", self.summary())]
pub struct ExternalRequestError {
    pub message: Option<String>,
    pub method: Option<String>,
    pub url: Option<String>,
    pub status_code: Option<u16>,
    pub reason: Option<String>,
    pub response_body: Option<String>,
    pub validation_errors: Option<Value>,
    pub is_timeout: bool,
}

impl ExternalRequestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_request(mut self, method: &str, url: &str) -> Self {
        self.method = Some(method.to_string());
        self.url = Some(url.to_string());
        self
    }

    pub fn with_response(mut self, status: u16, reason: Option<&str>, body: &str) -> Self {
        self.status_code = Some(status);
        self.reason = reason.map(str::to_string);
        self.response_body = Some(body.to_string());
        self
    }

    pub fn with_validation_errors(mut self, errors: Value) -> Self {
        self.validation_errors = Some(errors);
        self
    }

    /// Build from a transport-level reqwest failure (connect error, timeout, ...).
    pub fn from_transport(method: &str, url: &str, err: &reqwest::Error) -> Self {
        let mut e = Self::new(format!("request failed: {err}")).with_request(method, url);
        e.is_timeout = err.is_timeout();
        e
    }

    /// Whether the upstream response body contains `needle`.
    pub fn body_contains(&self, needle: &str) -> bool {
        self.response_body
            .as_deref()
            .map(|b| b.contains(needle))
            .unwrap_or(false)
    }

    /// Response body cut down to a size suitable for logs and API responses.
    pub fn truncated_body(&self) -> Option<String> {
        self.response_body
            .as_ref()
            .map(|b| b.chars().take(MAX_BODY_CHARS).collect())
    }

    /// The `details` object exposed to the frontend.
    pub fn details(&self) -> Value {
        json!({
            "request": {
                "method": self.method,
                "url": self.url,
            },
            "response": {
                "status_code": self.status_code,
                "reason": self.reason,
                "body": self.truncated_body(),
            },
            "validation_errors": self.validation_errors,
        })
    }

    fn summary(&self) -> String {
        let mut out = self
            .message
            .clone()
            .unwrap_or_else(|| "external request failed".to_string());
        if let (Some(method), Some(url)) = (&self.method, &self.url) {
            out.push_str(&format!(" ({method} {url}"));
            if let Some(status) = self.status_code {
                out.push_str(&format!(" -> {status}"));
            }
            out.push(')');
        }
        out
    }
}

/// Machine-readable error codes the frontend renders dedicated dialogs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CanvasApiPermissionError,
    CanvasStudentNotInGroup,
    CanvasGroupSetNotFound,
    CanvasGroupSetEmpty,
    CanvasFileNotFoundInCourse,
    BlackboardStudentNotInGroup,
    BlackboardGroupSetNotFound,
    BlackboardGroupSetEmpty,
    BlackboardFileNotFoundInCourse,
    D2lStudentNotInGroup,
    D2lGroupSetNotFound,
    D2lGroupSetEmpty,
    D2lFileNotFoundInCourse,
    MoodleStudentNotInGroup,
    MoodleGroupSetNotFound,
    MoodleGroupSetEmpty,
    MoodleFileNotFoundInCourse,
    StudentNotInCourse,
    LmsMaxAttempts,
    InstructorLaunchRequired,
}

/// The three ways resolving a launch's groups can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupErrorKind {
    StudentNotInGroup,
    GroupSetNotFound,
    GroupSetEmpty,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CanvasApiPermissionError => "canvas_api_permission_error",
            ErrorCode::CanvasStudentNotInGroup => "canvas_student_not_in_group",
            ErrorCode::CanvasGroupSetNotFound => "canvas_group_set_not_found",
            ErrorCode::CanvasGroupSetEmpty => "canvas_group_set_empty",
            ErrorCode::CanvasFileNotFoundInCourse => "canvas_file_not_found_in_course",
            ErrorCode::BlackboardStudentNotInGroup => "blackboard_student_not_in_group",
            ErrorCode::BlackboardGroupSetNotFound => "blackboard_group_set_not_found",
            ErrorCode::BlackboardGroupSetEmpty => "blackboard_group_set_empty",
            ErrorCode::BlackboardFileNotFoundInCourse => "blackboard_file_not_found_in_course",
            ErrorCode::D2lStudentNotInGroup => "d2l_student_not_in_group",
            ErrorCode::D2lGroupSetNotFound => "d2l_group_set_not_found",
            ErrorCode::D2lGroupSetEmpty => "d2l_group_set_empty",
            ErrorCode::D2lFileNotFoundInCourse => "d2l_file_not_found_in_course",
            ErrorCode::MoodleStudentNotInGroup => "moodle_student_not_in_group",
            ErrorCode::MoodleGroupSetNotFound => "moodle_group_set_not_found",
            ErrorCode::MoodleGroupSetEmpty => "moodle_group_set_empty",
            ErrorCode::MoodleFileNotFoundInCourse => "moodle_file_not_found_in_course",
            ErrorCode::StudentNotInCourse => "student_not_in_course",
            ErrorCode::LmsMaxAttempts => "lms_max_attempts",
            ErrorCode::InstructorLaunchRequired => "instructor_launch_required",
        }
    }

    /// The vendor-specific code for a grouping failure.
    ///
    /// Vendors without group support fall back to the Canvas codes, which
    /// the frontend renders generically.
    pub fn group_error(family: Family, kind: GroupErrorKind) -> Self {
        use GroupErrorKind::*;
        match (family, kind) {
            (Family::Blackboard, StudentNotInGroup) => ErrorCode::BlackboardStudentNotInGroup,
            (Family::Blackboard, GroupSetNotFound) => ErrorCode::BlackboardGroupSetNotFound,
            (Family::Blackboard, GroupSetEmpty) => ErrorCode::BlackboardGroupSetEmpty,
            (Family::D2L, StudentNotInGroup) => ErrorCode::D2lStudentNotInGroup,
            (Family::D2L, GroupSetNotFound) => ErrorCode::D2lGroupSetNotFound,
            (Family::D2L, GroupSetEmpty) => ErrorCode::D2lGroupSetEmpty,
            (Family::Moodle, StudentNotInGroup) => ErrorCode::MoodleStudentNotInGroup,
            (Family::Moodle, GroupSetNotFound) => ErrorCode::MoodleGroupSetNotFound,
            (Family::Moodle, GroupSetEmpty) => ErrorCode::MoodleGroupSetEmpty,
            (_, StudentNotInGroup) => ErrorCode::CanvasStudentNotInGroup,
            (_, GroupSetNotFound) => ErrorCode::CanvasGroupSetNotFound,
            (_, GroupSetEmpty) => ErrorCode::CanvasGroupSetEmpty,
        }
    }

    pub fn file_not_found(family: Family) -> Self {
        match family {
            Family::Blackboard => ErrorCode::BlackboardFileNotFoundInCourse,
            Family::D2L => ErrorCode::D2lFileNotFoundInCourse,
            Family::Moodle => ErrorCode::MoodleFileNotFoundInCourse,
            _ => ErrorCode::CanvasFileNotFoundInCourse,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain error carrying an [`ErrorCode`] and free-form details.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{error_code}")]
pub struct CodedError {
    pub error_code: ErrorCode,
    pub details: Value,
}

impl CodedError {
    pub fn new(error_code: ErrorCode, details: Value) -> Self {
        Self {
            error_code,
            details,
        }
    }

    pub fn group(family: Family, kind: GroupErrorKind, group_set: &str) -> Self {
        Self::new(
            ErrorCode::group_error(family, kind),
            json!({ "group_set": group_set_detail(group_set) }),
        )
    }

    pub fn file_not_found(family: Family, document_id: &str) -> Self {
        Self::new(
            ErrorCode::file_not_found(family),
            json!({ "document_id": document_id }),
        )
    }

    pub fn student_not_in_course(detail: &str) -> Self {
        Self::new(
            ErrorCode::StudentNotInCourse,
            json!({ "message": detail }),
        )
    }
}

/// Group set ids are echoed back numerically when they look numeric, as
/// LMSes that use integer ids send them.
fn group_set_detail(group_set: &str) -> Value {
    group_set
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(group_set))
}
