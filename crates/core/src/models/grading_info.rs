//! Per-learner grading slots recorded at launch time so instructors can
//! list and grade students.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradingInfo {
    pub id: i64,
    pub application_instance_id: i64,
    pub context_id: String,
    pub resource_link_id: String,
    pub user_id: String,
    pub h_userid: String,
    pub display_name: Option<String>,
    /// v1.1 sourcedid, or the learner's `sub` for AGS.
    pub lis_result_sourcedid: String,
    /// v1.1 outcome URL, or the AGS line item.
    pub lis_outcome_service_url: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GradingInfoUpsert {
    pub application_instance_id: i64,
    pub context_id: String,
    pub resource_link_id: String,
    pub user_id: String,
    pub h_userid: String,
    pub display_name: Option<String>,
    pub lis_result_sourcedid: String,
    pub lis_outcome_service_url: String,
}
