//! Assignments: a resource link configured with a document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub id: i64,
    pub tool_consumer_instance_guid: String,
    pub resource_link_id: String,
    pub document_url: String,
    pub title: Option<String>,
    /// Group set the assignment is restricted to, for group assignments.
    pub group_set_id: Option<String>,
    /// LTI 1.1 outcome service URL shared by all learners.
    pub lis_outcome_service_url: Option<String>,
    /// LTI 1.3 AGS line item URL.
    pub lineitem: Option<String>,
    pub extra: Map<String, Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Assignment {
    pub fn is_gradable(&self) -> bool {
        self.lis_outcome_service_url.is_some() || self.lineitem.is_some()
    }
}

/// Values written when an assignment is created or reconfigured.
#[derive(Debug, Clone, Default)]
pub struct AssignmentUpsert {
    pub tool_consumer_instance_guid: String,
    pub resource_link_id: String,
    pub document_url: String,
    pub title: Option<String>,
    pub group_set_id: Option<String>,
    pub lis_outcome_service_url: Option<String>,
    pub lineitem: Option<String>,
    pub extra: Map<String, Value>,
}
