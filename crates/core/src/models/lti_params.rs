//! Launch parameters normalised to LTI 1.1 names so the rest of the launch
//! pipeline does not care which protocol version the LMS spoke.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const CLAIM_PREFIX: &str = "https://purl.imsglobal.org/spec/lti/claim/";
const AGS_ENDPOINT_CLAIM: &str = "https://purl.imsglobal.org/spec/lti-ags/claim/endpoint";

/// (v1.1 name, v1.3 claim path). A path segment starting with `~` is
/// resolved relative to the LTI claim namespace.
const V13_MAPPING: &[(&str, &[&str])] = &[
    ("user_id", &["sub"]),
    ("lis_person_name_given", &["given_name"]),
    ("lis_person_name_family", &["family_name"]),
    ("lis_person_name_full", &["name"]),
    ("lis_person_contact_email_primary", &["email"]),
    ("context_id", &["~context", "id"]),
    ("context_title", &["~context", "title"]),
    ("resource_link_id", &["~resource_link", "id"]),
    ("resource_link_title", &["~resource_link", "title"]),
    ("resource_link_description", &["~resource_link", "description"]),
    ("tool_consumer_instance_guid", &["~tool_platform", "guid"]),
    (
        "tool_consumer_info_product_family_code",
        &["~tool_platform", "product_family_code"],
    ),
    ("tool_consumer_instance_name", &["~tool_platform", "name"]),
    ("deployment_id", &["~deployment_id"]),
    ("lti_message_type", &["~message_type"]),
    ("lti_version", &["~version"]),
    ("launch_presentation_return_url", &["~launch_presentation", "return_url"]),
    ("lis_outcome_service_url", &[AGS_ENDPOINT_CLAIM, "lineitem"]),
    ("lineitems", &[AGS_ENDPOINT_CLAIM, "lineitems"]),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct LtiParams(HashMap<String, String>);

impl LtiParams {
    /// Wrap LTI 1.1 form parameters. `oauth_*` parameters are dropped.
    pub fn from_v11(form: &HashMap<String, String>) -> Self {
        Self(
            form.iter()
                .filter(|(k, _)| !k.starts_with("oauth_"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Normalise verified LTI 1.3 claims.
    pub fn from_v13(claims: &Value) -> Self {
        let mut params = HashMap::new();

        for (name, path) in V13_MAPPING {
            if let Some(v) = claim_at(claims, path).and_then(value_to_string) {
                params.insert((*name).to_string(), v);
            }
        }

        if let Some(roles) = claims
            .get(format!("{CLAIM_PREFIX}roles"))
            .and_then(Value::as_array)
        {
            let joined: Vec<&str> = roles.iter().filter_map(Value::as_str).collect();
            params.insert("roles".into(), joined.join(","));
        }

        if let Some(custom) = claims
            .get(format!("{CLAIM_PREFIX}custom"))
            .and_then(Value::as_object)
        {
            for (k, v) in custom {
                if let Some(v) = value_to_string(v) {
                    params.insert(format!("custom_{k}"), v);
                }
            }
        }

        // AGS keys grades by the learner's `sub`.
        if params.contains_key("lis_outcome_service_url") {
            if let Some(sub) = params.get("user_id").cloned() {
                params.insert("lis_result_sourcedid".into(), sub);
            }
        }

        Self(params)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn context_id(&self) -> Option<&str> {
        self.get("context_id")
    }

    pub fn resource_link_id(&self) -> Option<&str> {
        self.get("resource_link_id")
    }

    pub fn user_id(&self) -> Option<&str> {
        self.get("user_id")
    }

    pub fn tool_consumer_instance_guid(&self) -> Option<&str> {
        self.get("tool_consumer_instance_guid")
    }

    pub fn roles(&self) -> &str {
        self.get("roles").unwrap_or("")
    }

    /// Best available display name for the user.
    pub fn display_name(&self) -> String {
        if let Some(full) = self.get("lis_person_name_full") {
            return full.trim().to_string();
        }
        let given = self.get("lis_person_name_given").unwrap_or("");
        let family = self.get("lis_person_name_family").unwrap_or("");
        let joined = format!("{given} {family}").trim().to_string();
        if joined.is_empty() {
            "Anonymous".to_string()
        } else {
            joined
        }
    }

    pub fn email(&self) -> Option<&str> {
        self.get("lis_person_contact_email_primary")
    }

    pub fn context_title(&self) -> &str {
        self.get("context_title").unwrap_or("")
    }
}

fn claim_at<'a>(claims: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut cur = match first.strip_prefix('~') {
        Some(name) => claims.get(format!("{CLAIM_PREFIX}{name}"))?,
        None => claims.get(*first)?,
    };
    for seg in rest {
        cur = cur.get(*seg)?;
    }
    Some(cur)
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
