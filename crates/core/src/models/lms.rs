//! Mirror rows of LMS courses and users, plus legacy course settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::application_instance::Settings;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LmsCourse {
    pub id: i64,
    pub tool_consumer_instance_guid: String,
    pub context_id: String,
    pub name: String,
    pub h_authority_provided_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LmsUser {
    pub id: i64,
    pub application_instance_id: i64,
    pub user_id: String,
    pub h_userid: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub roles: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Course settings carried over from before courses were groupings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegacyCourse {
    pub authority_provided_id: String,
    pub settings: Settings,
}
