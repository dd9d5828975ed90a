//! LMS files seen in course listings, kept so copied courses can find the
//! equivalent of a file from the original course.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    CanvasFile,
    BlackboardFile,
    D2lFile,
    MoodleFile,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::CanvasFile => "canvas_file",
            FileType::BlackboardFile => "blackboard_file",
            FileType::D2lFile => "d2l_file",
            FileType::MoodleFile => "moodle_file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "canvas_file" => Some(FileType::CanvasFile),
            "blackboard_file" => Some(FileType::BlackboardFile),
            "d2l_file" => Some(FileType::D2lFile),
            "moodle_file" => Some(FileType::MoodleFile),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct File {
    pub id: i64,
    pub application_instance_id: i64,
    pub file_type: FileType,
    pub lms_id: String,
    pub course_id: String,
    pub name: Option<String>,
    pub size: Option<i64>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// A file as listed by an LMS API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListedFile {
    pub lms_id: String,
    pub name: String,
    pub size: Option<i64>,
    /// Folder / parent the file sits in, for pickers that show a tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}
