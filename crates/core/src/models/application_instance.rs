//! Tenants: one LMS install enrolled with this service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::family::Family;

/// Launch protocol version a tenant speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LtiVersion {
    #[serde(rename = "1.1")]
    V11,
    #[serde(rename = "1.3.0")]
    V13,
}

/// An LTI 1.3 platform registration: (issuer, client_id) plus the platform's
/// endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LtiRegistration {
    pub id: i64,
    pub issuer: String,
    pub client_id: String,
    pub auth_login_url: String,
    pub key_set_url: String,
    pub token_url: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Namespaced per-tenant feature settings, stored as a JSON object of
/// objects (`{"canvas": {"sections_enabled": true}}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Settings(pub Map<String, Value>);

impl Settings {
    pub fn get(&self, group: &str, key: &str) -> Option<&Value> {
        self.0.get(group)?.get(key)
    }

    pub fn get_bool(&self, group: &str, key: &str) -> bool {
        self.get(group, key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get_str(&self, group: &str, key: &str) -> Option<&str> {
        self.get(group, key).and_then(Value::as_str)
    }

    pub fn set(&mut self, group: &str, key: &str, value: Value) {
        let entry = self
            .0
            .entry(group.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), value);
        }
    }
}

/// A tenant ("application instance").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationInstance {
    pub id: i64,
    /// LTI 1.1 consumer key.
    pub consumer_key: Option<String>,
    /// LTI 1.1 shared secret.
    #[serde(skip_serializing)]
    pub shared_secret: Option<String>,
    pub lti_registration_id: Option<i64>,
    pub deployment_id: Option<String>,
    pub tool_consumer_instance_guid: Option<String>,
    pub lms_url: String,
    pub family: Family,
    /// Whether launches provision users and groups in the annotation service.
    pub provisioning: bool,
    pub settings: Settings,
    /// Per-tenant vendor API client id (Canvas developer key, D2L app id).
    pub developer_key: Option<String>,
    /// Encrypted with the installation master key.
    #[serde(skip)]
    pub developer_secret: Option<Vec<u8>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ApplicationInstance {
    pub fn lti_version(&self) -> LtiVersion {
        if self.lti_registration_id.is_some() {
            LtiVersion::V13
        } else {
            LtiVersion::V11
        }
    }

    /// The guid used as the tenant half of every derived identifier.
    ///
    /// Tenants that have never sent a guid fall back to a stable synthetic
    /// one so identifiers stay deterministic.
    pub fn tenant_guid(&self, launch_guid: Option<&str>) -> String {
        launch_guid
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .or_else(|| self.tool_consumer_instance_guid.clone())
            .unwrap_or_else(|| format!("margin-tenant-{}", self.id))
    }

    /// Host part of the LMS base URL, used to build vendor API URLs.
    pub fn lms_host(&self) -> Option<String> {
        url::Url::parse(&self.lms_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    /// LMS base URL without a trailing slash.
    pub fn lms_base(&self) -> &str {
        self.lms_url.trim_end_matches('/')
    }

    pub fn sections_enabled(&self) -> bool {
        // Sections need an API developer key to query the LMS.
        self.family == Family::Canvas
            && self.developer_key.is_some()
            && self.settings.get_bool("canvas", "sections_enabled")
    }

    pub fn groups_enabled(&self) -> bool {
        match self.family {
            Family::Canvas => self.settings.get_bool("canvas", "groups_enabled"),
            Family::Blackboard => self.settings.get_bool("blackboard", "groups_enabled"),
            Family::D2L => self.settings.get_bool("desire2learn", "groups_enabled"),
            Family::Moodle => self.settings.get_bool("moodle", "groups_enabled"),
            _ => false,
        }
    }

    pub fn files_enabled(&self) -> bool {
        match self.family {
            Family::Canvas => self.developer_key.is_some(),
            Family::Blackboard => self.settings.get_bool("blackboard", "files_enabled"),
            Family::D2L => self.settings.get_bool("desire2learn", "files_enabled"),
            Family::Moodle => self.settings.get_bool("moodle", "files_enabled"),
            _ => false,
        }
    }
}

/// Fields needed to register a new tenant.
#[derive(Debug, Clone, Default)]
pub struct NewApplicationInstance {
    pub consumer_key: Option<String>,
    pub shared_secret: Option<String>,
    pub lti_registration_id: Option<i64>,
    pub deployment_id: Option<String>,
    pub lms_url: String,
    pub family: Family,
    pub provisioning: bool,
    pub settings: Settings,
    pub developer_key: Option<String>,
    pub developer_secret: Option<Vec<u8>>,
}

#[cfg(test)]
pub(crate) fn sample_instance() -> ApplicationInstance {
    ApplicationInstance {
        id: 1,
        consumer_key: Some("Hypothesis123".into()),
        shared_secret: Some("secret".into()),
        lti_registration_id: None,
        deployment_id: None,
        tool_consumer_instance_guid: Some("G".into()),
        lms_url: "https://lms.example.com/".into(),
        family: Family::Canvas,
        provisioning: true,
        settings: Settings::default(),
        developer_key: None,
        developer_secret: None,
        created: Utc::now(),
        updated: Utc::now(),
    }
}
