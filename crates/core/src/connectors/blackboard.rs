//! Blackboard Learn REST API (`/learn/api/public`).
//!
//! Course and user ids arrive from launches as UUIDs and are addressed with
//! the `uuid:` prefix.

use serde::Deserialize;
use serde_json::Value;

use super::file_not_found_on_404;
use super::proxy::{ApiProfile, ApiProxy, ApiRequest, Pagination};
use crate::error::{MarginError, Result};
use crate::models::family::Family;
use crate::models::file::ListedFile;
use crate::models::grouping::{GroupSet, NewGrouping};

pub const PROFILE: ApiProfile = ApiProfile {
    family: Family::Blackboard,
    pagination: Pagination::BodyField {
        items: "/results",
        next: "/paging/nextPage",
    },
    per_page: Some(("limit", 200)),
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Resource {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    modified: Option<String>,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadUrl {
    download_url: String,
}

#[derive(Debug, Deserialize)]
struct BbGroupSet {
    id: String,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlackboardGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub group_set_id: Option<String>,
    #[serde(default)]
    enrollment: Option<Value>,
}

impl BlackboardGroup {
    /// Groups with self-enrollment are visible to students before they join.
    fn is_self_enrollment(&self) -> bool {
        self.enrollment
            .as_ref()
            .and_then(|e| e.get("type"))
            .and_then(Value::as_str)
            == Some("SelfEnrollment")
    }
}

impl From<BlackboardGroup> for NewGrouping {
    fn from(g: BlackboardGroup) -> Self {
        let set = g.group_set_id.clone().unwrap_or_default();
        NewGrouping::new(g.id, g.name).with_group_set(&set)
    }
}

/// A listed entry: either a file or a folder the picker can expand.
#[derive(Debug, Clone, PartialEq)]
pub enum BlackboardEntry {
    File(ListedFile),
    Folder { id: String, name: String },
}

pub struct BlackboardApi {
    proxy: ApiProxy,
}

impl BlackboardApi {
    pub fn new(proxy: ApiProxy) -> Self {
        Self { proxy }
    }

    /// PDFs and folders at the top of a course, or inside `folder_id`.
    pub async fn list_files(
        &self,
        course_id: &str,
        folder_id: Option<&str>,
    ) -> Result<Vec<BlackboardEntry>> {
        let path = match folder_id {
            Some(folder) => format!("v1/courses/uuid:{course_id}/resources/{folder}/children"),
            None => format!("v1/courses/uuid:{course_id}/resources"),
        };
        let resources: Vec<Resource> = self.proxy.send_many(ApiRequest::get(path)).await?;
        Ok(resources
            .into_iter()
            .filter_map(|r| match r.kind.as_str() {
                "folder" => Some(BlackboardEntry::Folder {
                    id: r.id,
                    name: r.name,
                }),
                "file" if r.mime_type.as_deref().map_or(true, |m| m == "application/pdf") => {
                    Some(BlackboardEntry::File(ListedFile {
                        lms_id: r.id,
                        name: r.name,
                        size: r.size,
                        parent_id: folder_id.map(str::to_string),
                        updated_at: r.modified,
                    }))
                }
                _ => None,
            })
            .collect())
    }

    pub async fn public_url(&self, course_id: &str, file_id: &str) -> Result<String> {
        let res: DownloadUrl = self
            .proxy
            .send(
                ApiRequest::get(format!("v1/courses/uuid:{course_id}/resources/{file_id}"))
                    .query("fields", "id,name,downloadUrl"),
            )
            .await
            .map_err(|e| file_not_found_on_404(e, Family::Blackboard, file_id))?;
        Ok(res.download_url)
    }

    pub async fn course_group_sets(&self, course_id: &str) -> Result<Vec<GroupSet>> {
        let sets: Vec<BbGroupSet> = self
            .proxy
            .send_many(ApiRequest::get(format!("v2/courses/uuid:{course_id}/groups/sets")))
            .await?;
        Ok(sets
            .into_iter()
            .map(|s| GroupSet {
                id: s.id,
                name: s.name,
            })
            .collect())
    }

    pub async fn group_set_groups(
        &self,
        course_id: &str,
        group_set_id: &str,
    ) -> Result<Vec<BlackboardGroup>> {
        let groups: Vec<BlackboardGroup> = self
            .proxy
            .send_many(ApiRequest::get(format!(
                "v2/courses/uuid:{course_id}/groups/sets/{group_set_id}/groups"
            )))
            .await?;
        Ok(groups
            .into_iter()
            .map(|mut g| {
                g.group_set_id.get_or_insert_with(|| group_set_id.to_string());
                g
            })
            .collect())
    }

    /// Groups in the set that the token's own user is a member of.
    pub async fn current_user_groups(
        &self,
        course_id: &str,
        group_set_id: &str,
    ) -> Result<Vec<BlackboardGroup>> {
        let groups: Vec<BlackboardGroup> = self
            .proxy
            .send_many(ApiRequest::get(format!("v2/courses/uuid:{course_id}/groups")))
            .await?;
        Ok(groups
            .into_iter()
            .filter(|g| g.group_set_id.as_deref() == Some(group_set_id))
            .filter(|g| !g.is_self_enrollment())
            .collect())
    }

    /// Groups in the set that `user_id` (a launch UUID) is a member of.
    pub async fn user_groups(
        &self,
        course_id: &str,
        group_set_id: &str,
        user_id: &str,
    ) -> Result<Vec<BlackboardGroup>> {
        let mut out = Vec::new();
        for group in self.group_set_groups(course_id, group_set_id).await? {
            let membership = self
                .proxy
                .send::<Value>(ApiRequest::get(format!(
                    "v2/courses/uuid:{course_id}/groups/{}/users/uuid:{user_id}",
                    group.id
                )))
                .await;
            match membership {
                Ok(_) => out.push(group),
                Err(e) if e.external_status() == Some(404) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Blackboard answers 404 for a group set that was deleted.
pub fn is_not_found(err: &MarginError) -> bool {
    err.external_status() == Some(404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::proxy::tests::proxy_for;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn api(server: &MockServer) -> BlackboardApi {
        let (proxy, _) = proxy_for(server, "/learn/api/public", PROFILE, Some("r1")).await;
        BlackboardApi::new(proxy)
    }

    #[tokio::test]
    async fn list_files_keeps_pdfs_and_folders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/learn/api/public/v1/courses/uuid:C1/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"id": "_1_1", "name": "a.pdf", "type": "file", "mimeType": "application/pdf", "size": 10},
                    {"id": "_2_1", "name": "b.docx", "type": "file", "mimeType": "application/msword"},
                    {"id": "_3_1", "name": "Week 1", "type": "folder"}
                ]
            })))
            .mount(&server)
            .await;

        let entries = api(&server).await.list_files("C1", None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[0], BlackboardEntry::File(f) if f.lms_id == "_1_1" && f.size == Some(10)));
        assert!(matches!(&entries[1], BlackboardEntry::Folder { id, .. } if id == "_3_1"));
    }

    #[tokio::test]
    async fn public_url_reads_download_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/learn/api/public/v1/courses/uuid:C1/resources/_1_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "_1_1", "name": "a.pdf", "downloadUrl": "https://bb.example.com/dl/a.pdf"
            })))
            .mount(&server)
            .await;

        let url = api(&server).await.public_url("C1", "_1_1").await.unwrap();
        assert_eq!(url, "https://bb.example.com/dl/a.pdf");
    }

    #[tokio::test]
    async fn user_groups_checks_membership_per_group() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/learn/api/public/v2/courses/uuid:C1/groups/sets/S1/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"id": "G1", "name": "One"}, {"id": "G2", "name": "Two"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/learn/api/public/v2/courses/uuid:C1/groups/G1/users/uuid:U1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/learn/api/public/v2/courses/uuid:C1/groups/G2/users/uuid:U1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"userId": "_5_1"})))
            .mount(&server)
            .await;

        let groups = api(&server).await.user_groups("C1", "S1", "U1").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "G2");
        let g: NewGrouping = groups[0].clone().into();
        assert_eq!(g.extra["group_set_id"], "S1");
    }

    #[tokio::test]
    async fn current_user_groups_skips_self_enrollment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/learn/api/public/v2/courses/uuid:C1/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"id": "G1", "name": "One", "groupSetId": "S1"},
                    {"id": "G2", "name": "Two", "groupSetId": "S1", "enrollment": {"type": "SelfEnrollment"}},
                    {"id": "G3", "name": "Three", "groupSetId": "S2"}
                ]
            })))
            .mount(&server)
            .await;

        let groups = api(&server).await.current_user_groups("C1", "S1").await.unwrap();
        assert_eq!(groups.iter().map(|g| g.id.as_str()).collect::<Vec<_>>(), vec!["G1"]);
    }
}
