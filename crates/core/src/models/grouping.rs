//! Courses, sections and groups: the containers that map to annotation groups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::sha1_hex;
use crate::models::application_instance::Settings;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GroupingType {
    Course,
    CanvasSection,
    CanvasGroup,
    BlackboardGroup,
    D2lGroup,
    MoodleGroup,
}

impl GroupingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupingType::Course => "course",
            GroupingType::CanvasSection => "canvas_section",
            GroupingType::CanvasGroup => "canvas_group",
            GroupingType::BlackboardGroup => "blackboard_group",
            GroupingType::D2lGroup => "d2l_group",
            GroupingType::MoodleGroup => "moodle_group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "course" => Some(GroupingType::Course),
            "canvas_section" => Some(GroupingType::CanvasSection),
            "canvas_group" => Some(GroupingType::CanvasGroup),
            "blackboard_group" => Some(GroupingType::BlackboardGroup),
            "d2l_group" => Some(GroupingType::D2lGroup),
            "moodle_group" => Some(GroupingType::MoodleGroup),
            _ => None,
        }
    }

    /// Whether this is a small-group (as opposed to section) type.
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            GroupingType::CanvasGroup
                | GroupingType::BlackboardGroup
                | GroupingType::D2lGroup
                | GroupingType::MoodleGroup
        )
    }
}

/// Stable id of a grouping inside the annotation service.
///
/// Derived from the tenant guid, the grouping type, the LMS id and, for
/// child groupings, the parent's own id. Copies of a course keep their id
/// because the inputs do not include any database key.
pub fn authority_provided_id(
    tenant_guid: &str,
    grouping_type: GroupingType,
    lms_id: &str,
    parent_authority_provided_id: Option<&str>,
) -> String {
    let mut parts = vec![tenant_guid, grouping_type.as_str(), lms_id];
    if let Some(parent) = parent_authority_provided_id {
        parts.push(parent);
    }
    sha1_hex(&parts)
}

/// The annotation-service group id for an authority provided id.
pub fn groupid(authority_provided_id: &str, authority: &str) -> String {
    format!("group:{authority_provided_id}@{authority}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Grouping {
    pub id: i64,
    pub application_instance_id: i64,
    pub authority_provided_id: String,
    pub lms_id: String,
    pub lms_name: String,
    pub parent_id: Option<i64>,
    pub grouping_type: GroupingType,
    pub settings: Settings,
    pub extra: Map<String, Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Grouping {
    pub fn groupid(&self, authority: &str) -> String {
        groupid(&self.authority_provided_id, authority)
    }

    /// Name shown in the annotation client, capped at the service's limit.
    pub fn display_name(&self) -> String {
        truncate_group_name(&self.lms_name)
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Longest group name the annotation service accepts.
pub const GROUP_NAME_MAX_LEN: usize = 25;

pub fn truncate_group_name(name: &str) -> String {
    let name = name.trim();
    if name.chars().count() <= GROUP_NAME_MAX_LEN {
        return name.to_string();
    }
    let mut out: String = name.chars().take(GROUP_NAME_MAX_LEN - 1).collect();
    out.push('…');
    out
}

/// A grouping as reported by the LMS, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewGrouping {
    pub lms_id: String,
    pub lms_name: String,
    pub extra: Map<String, Value>,
}

impl NewGrouping {
    pub fn new(lms_id: impl Into<String>, lms_name: impl Into<String>) -> Self {
        Self {
            lms_id: lms_id.into(),
            lms_name: lms_name.into(),
            extra: Map::new(),
        }
    }

    pub fn with_group_set(mut self, group_set_id: &str) -> Self {
        self.extra
            .insert("group_set_id".into(), Value::String(group_set_id.to_string()));
        self
    }
}

/// A named collection of groups (Canvas group category, Blackboard group
/// set, D2L group category, Moodle grouping).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSet {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupingMembership {
    pub grouping_id: i64,
    pub lms_user_id: i64,
    pub roles: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping_type_roundtrip() {
        for t in [
            GroupingType::Course,
            GroupingType::CanvasSection,
            GroupingType::CanvasGroup,
            GroupingType::BlackboardGroup,
            GroupingType::D2lGroup,
            GroupingType::MoodleGroup,
        ] {
            assert_eq!(GroupingType::parse(t.as_str()), Some(t));
        }
        assert_eq!(GroupingType::parse("bogus"), None);
    }

    #[test]
    fn course_authority_provided_id_matches_hash() {
        let apid = authority_provided_id("G", GroupingType::Course, "C", None);
        assert_eq!(apid, sha1_hex(&["G", "course", "C"]));
        assert_eq!(apid.len(), 40);
    }

    #[test]
    fn child_id_depends_on_parent() {
        let course = authority_provided_id("G", GroupingType::Course, "C", None);
        let a = authority_provided_id("G", GroupingType::CanvasGroup, "7", Some(&course));
        let other = authority_provided_id("G", GroupingType::Course, "C2", None);
        let b = authority_provided_id("G", GroupingType::CanvasGroup, "7", Some(&other));
        assert_ne!(a, b);
        assert_ne!(
            a,
            authority_provided_id("G", GroupingType::CanvasSection, "7", Some(&course))
        );
    }

    #[test]
    fn groupid_format() {
        assert_eq!(groupid("abc", "lms.example.com"), "group:abc@lms.example.com");
    }

    #[test]
    fn long_names_truncated() {
        let name = truncate_group_name("Introduction to Organic Chemistry (Section 12)");
        assert_eq!(name.chars().count(), GROUP_NAME_MAX_LEN);
        assert!(name.ends_with('…'));
        assert_eq!(truncate_group_name("  Short  "), "Short");
    }

    #[test]
    fn new_grouping_group_set() {
        let g = NewGrouping::new("1", "Group 1").with_group_set("42");
        assert_eq!(g.extra["group_set_id"], "42");
    }
}
