//! Moodle web services (`/webservice/rest/server.php`).
//!
//! Moodle authenticates with a tenant-wide web service token sent as
//! `wstoken`, and reports failures as HTTP 200 with an `exception` body.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CodedError, ExternalRequestError, MarginError, Result};
use crate::models::family::Family;
use crate::models::file::ListedFile;
use crate::models::grouping::{GroupSet, NewGrouping};

#[derive(Debug, Deserialize)]
struct MoodleGrouping {
    id: i64,
    name: String,
    #[serde(default)]
    groups: Vec<MoodleGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoodleGroup {
    pub id: i64,
    pub name: String,
}

impl MoodleGroup {
    pub fn into_grouping(self, group_set_id: &str) -> NewGrouping {
        NewGrouping::new(self.id.to_string(), self.name).with_group_set(group_set_id)
    }
}

#[derive(Debug, Deserialize)]
struct UserGroups {
    #[serde(default)]
    groups: Vec<MoodleGroup>,
}

#[derive(Debug, Deserialize)]
struct CourseSection {
    #[serde(default)]
    modules: Vec<CourseModule>,
}

#[derive(Debug, Deserialize)]
struct CourseModule {
    id: i64,
    modname: String,
    #[serde(default)]
    contents: Vec<ModuleContent>,
}

#[derive(Debug, Deserialize)]
struct ModuleContent {
    #[serde(rename = "type")]
    kind: String,
    filename: String,
    fileurl: String,
    #[serde(default)]
    filesize: Option<i64>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    timemodified: Option<i64>,
}

impl CourseModule {
    fn pdf(&self) -> Option<&ModuleContent> {
        if self.modname != "resource" {
            return None;
        }
        self.contents.iter().find(|c| {
            c.kind == "file"
                && (c.mimetype.as_deref() == Some("application/pdf")
                    || c.filename.to_ascii_lowercase().ends_with(".pdf"))
        })
    }
}

pub struct MoodleApi {
    client: Client,
    lms_base: String,
    token: String,
}

impl MoodleApi {
    pub fn new(client: Client, lms_base: &str, token: &str) -> Self {
        Self {
            client,
            lms_base: lms_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    async fn call<T: DeserializeOwned>(&self, function: &str, params: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/webservice/rest/server.php", self.lms_base);
        debug!(function, "moodle web service call");
        let response = self
            .client
            .get(&url)
            .query(&[
                ("wstoken", self.token.as_str()),
                ("wsfunction", function),
                ("moodlewsrestformat", "json"),
            ])
            .query(params)
            .send()
            .await
            .map_err(|e| ExternalRequestError::from_transport("GET", &url, &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExternalRequestError::from_transport("GET", &url, &e))?;
        // Never log or echo the URL with the token in it.
        let shown_url = format!("{url}?wsfunction={function}");
        if !status.is_success() {
            return Err(ExternalRequestError::new("Moodle API request failed")
                .with_request("GET", &shown_url)
                .with_response(status.as_u16(), status.canonical_reason(), &body)
                .into());
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| {
            ExternalRequestError::new("Unable to interpret this server response")
                .with_request("GET", &shown_url)
                .with_response(status.as_u16(), status.canonical_reason(), &body)
                .with_validation_errors(Value::from(vec![e.to_string()]))
        })?;
        if let Some(exception) = value.get("exception").and_then(Value::as_str) {
            let errorcode = value.get("errorcode").and_then(Value::as_str).unwrap_or_default();
            warn!(function, exception, errorcode, "moodle web service error");
            return Err(ExternalRequestError::new(format!("Moodle error: {errorcode}"))
                .with_request("GET", &shown_url)
                .with_response(status.as_u16(), status.canonical_reason(), &body)
                .into());
        }
        serde_json::from_value(value).map_err(|e| {
            ExternalRequestError::new("Unable to interpret this server response")
                .with_request("GET", &shown_url)
                .with_response(status.as_u16(), status.canonical_reason(), &body)
                .with_validation_errors(Value::from(vec![e.to_string()]))
                .into()
        })
    }

    pub async fn course_group_sets(&self, course_id: &str) -> Result<Vec<GroupSet>> {
        let groupings: Vec<MoodleGrouping> = self
            .call(
                "core_group_get_course_groupings",
                &[("courseid", course_id.to_string())],
            )
            .await?;
        Ok(groupings
            .into_iter()
            .map(|g| GroupSet {
                id: g.id.to_string(),
                name: g.name,
            })
            .collect())
    }

    /// All groups of a grouping. `None` when the grouping does not exist.
    pub async fn group_set_groups(&self, group_set_id: &str) -> Result<Option<Vec<MoodleGroup>>> {
        let groupings: Vec<MoodleGrouping> = match self
            .call(
                "core_group_get_groupings",
                &[
                    ("groupingids[0]", group_set_id.to_string()),
                    ("returngroups", "1".to_string()),
                ],
            )
            .await
        {
            Ok(g) => g,
            Err(e) if is_missing_record(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(groupings.into_iter().next().map(|g| g.groups))
    }

    pub async fn user_groups(
        &self,
        course_id: &str,
        group_set_id: &str,
        user_id: &str,
    ) -> Result<Vec<MoodleGroup>> {
        let res: UserGroups = self
            .call(
                "core_group_get_course_user_groups",
                &[
                    ("courseid", course_id.to_string()),
                    ("userid", user_id.to_string()),
                    ("groupingid", group_set_id.to_string()),
                ],
            )
            .await?;
        Ok(res.groups)
    }

    pub async fn list_files(&self, course_id: &str) -> Result<Vec<ListedFile>> {
        let sections: Vec<CourseSection> = self
            .call("core_course_get_contents", &[("courseid", course_id.to_string())])
            .await?;
        Ok(sections
            .iter()
            .flat_map(|s| s.modules.iter())
            .filter_map(|m| {
                m.pdf().map(|c| ListedFile {
                    lms_id: m.id.to_string(),
                    name: c.filename.clone(),
                    size: c.filesize,
                    parent_id: None,
                    updated_at: c.timemodified.map(|t| t.to_string()),
                })
            })
            .collect())
    }

    /// Download URL for a course module's PDF, carrying the web service token.
    pub async fn public_url(&self, course_id: &str, file_id: &str) -> Result<String> {
        let sections: Vec<CourseSection> = self
            .call("core_course_get_contents", &[("courseid", course_id.to_string())])
            .await?;
        let content = sections
            .iter()
            .flat_map(|s| s.modules.iter())
            .find(|m| m.id.to_string() == file_id)
            .and_then(CourseModule::pdf)
            .ok_or_else(|| MarginError::from(CodedError::file_not_found(Family::Moodle, file_id)))?;

        let mut url = url::Url::parse(&content.fileurl).map_err(|e| {
            MarginError::from(ExternalRequestError::new(format!("invalid Moodle file URL: {e}")))
        })?;
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url.to_string())
    }
}

fn is_missing_record(err: &MarginError) -> bool {
    match err {
        MarginError::ExternalRequest(e) => {
            e.body_contains("invalidrecord") || e.body_contains("invalidrecordunknown")
        }
        _ => false,
    }
}
