//! LMS product families.

use serde::{Deserialize, Serialize};

/// The LMS product a tenant runs. Drives plugin and content-source selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Canvas,
    Blackboard,
    #[serde(rename = "d2l")]
    D2L,
    Moodle,
    Sakai,
    Schoology,
    Blackbaud,
    #[default]
    Unknown,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Canvas => "canvas",
            Family::Blackboard => "blackboard",
            Family::D2L => "d2l",
            Family::Moodle => "moodle",
            Family::Sakai => "sakai",
            Family::Schoology => "schoology",
            Family::Blackbaud => "blackbaud",
            Family::Unknown => "unknown",
        }
    }

    /// Parse a stored family string. Unrecognised values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "canvas" => Family::Canvas,
            "blackboard" | "blackboardlearn" | "bblearn" => Family::Blackboard,
            "d2l" | "desire2learn" | "brightspace" => Family::D2L,
            "moodle" => Family::Moodle,
            "sakai" => Family::Sakai,
            "schoology" => Family::Schoology,
            "blackbaud" | "k12" => Family::Blackbaud,
            _ => Family::Unknown,
        }
    }

    /// Infer the family from a `tool_consumer_instance_guid`, for LMSes that
    /// send no product code. Moodle appends its hostname, D2L and Schoology
    /// use recognisable suffixes.
    pub fn from_instance_guid(guid: &str) -> Self {
        let guid = guid.to_ascii_lowercase();
        if guid.ends_with(".schoology.com") {
            Family::Schoology
        } else if guid.ends_with(".brightspace.com") || guid.ends_with(".desire2learn.com") {
            Family::D2L
        } else if guid.ends_with(".blackboard.com") {
            Family::Blackboard
        } else if guid.ends_with(".instructure.com") || guid.ends_with(":canvas-lms") {
            Family::Canvas
        } else if guid.contains("moodle") {
            Family::Moodle
        } else {
            Family::Unknown
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrips_as_str() {
        for family in [
            Family::Canvas,
            Family::Blackboard,
            Family::D2L,
            Family::Moodle,
            Family::Sakai,
            Family::Schoology,
            Family::Blackbaud,
            Family::Unknown,
        ] {
            assert_eq!(Family::parse(family.as_str()), family);
        }
    }

    #[test]
    fn parse_accepts_product_codes() {
        assert_eq!(Family::parse("BlackboardLearn"), Family::Blackboard);
        assert_eq!(Family::parse("desire2learn"), Family::D2L);
        assert_eq!(Family::parse("something-else"), Family::Unknown);
    }

    #[test]
    fn guid_suffixes() {
        assert_eq!(
            Family::from_instance_guid("12345.example.schoology.com"),
            Family::Schoology
        );
        assert_eq!(
            Family::from_instance_guid("abc.brightspace.com"),
            Family::D2L
        );
        assert_eq!(Family::from_instance_guid("opaque-guid"), Family::Unknown);
    }

    #[test]
    fn serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Family::D2L).unwrap(), "\"d2l\"");
        let f: Family = serde_json::from_str("\"canvas\"").unwrap();
        assert_eq!(f, Family::Canvas);
    }
}
