//! The JSON config a launch hands to the frontend.
//!
//! Every launch response, including failed ones, is one [`FrontendConfig`].
//! The frontend switches on `mode` and reads only the sections that mode
//! needs; absent sections are omitted from the JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use margin_core::content::{ApiCallback, FileDisplayConfig};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    #[serde(rename = "LAUNCH")]
    Launch,
    #[serde(rename = "FILEPICKER")]
    FilePicker,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "DASHBOARD")]
    Dashboard,
}

/// What the annotation client shows: a fixed list of group ids, or the
/// RPC handle that makes it ask the frontend, which asks the sync API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Groups {
    List(Vec<String>),
    Rpc(String),
}

impl Groups {
    pub const REQUEST_GROUPS: &'static str = "$rpc:requestGroups";

    pub fn rpc() -> Self {
        Groups::Rpc(Self::REQUEST_GROUPS.to_string())
    }
}

/// Bootstrap for the annotation client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HClientConfig {
    pub authority: String,
    pub api_url: String,
    pub grant_token: String,
    pub groups: Groups,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ApiConfig {
    /// `Bearer ...` value for the `Authorization` header of API calls.
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<ApiCallback>,
}

/// Assignment configuration form shown to instructors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilePickerConfig {
    pub form_action: String,
    /// Values the picker posts back alongside the chosen document.
    pub form_fields: Map<String, Value>,
    /// Per-source picker settings, keyed by source name.
    pub sources: Map<String, Value>,
    /// Whether the picker can offer group sets for a group assignment.
    pub group_sets_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_sets: Option<ApiCallback>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradingConfig {
    pub enabled: bool,
    pub assignment_name: String,
    pub students: ApiCallback,
    pub read: ApiCallback,
    pub record: ApiCallback,
}

/// What a Canvas learner launch posts to record a SpeedGrader submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeedGraderConfig {
    pub submission: ApiCallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CanvasConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speedgrader: Option<SpeedGraderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardConfig {
    pub context_id: String,
    pub course_title: String,
    pub students: ApiCallback,
    pub group_sets: ApiCallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorConfig {
    pub error_code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserConfig {
    pub display_name: String,
    pub is_instructor: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FrontendConfig {
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis_client: Option<HClientConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<FileDisplayConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_picker: Option<FilePickerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grading: Option<GradingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas: Option<CanvasConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard: Option<DashboardConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorConfig>,
}

impl FrontendConfig {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn error(error_code: &str, message: &str) -> Self {
        Self {
            error: Some(ErrorConfig {
                error_code: error_code.to_string(),
                message: message.to_string(),
            }),
            ..Self::new(Mode::Error)
        }
    }
}

/// A callback to one of our own API routes.
pub fn api_call(method: &str, path: impl Into<String>, data: Value) -> ApiCallback {
    ApiCallback {
        method: method.to_string(),
        path: path.into(),
        data,
    }
}
