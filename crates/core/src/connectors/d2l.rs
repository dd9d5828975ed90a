//! D2L Brightspace Valence API (`/d2l/api`).

use serde::Deserialize;
use serde_json::Value;

use super::file_not_found_on_404;
use super::proxy::{ApiProfile, ApiProxy, ApiRequest, Pagination};
use crate::error::Result;
use crate::models::family::Family;
use crate::models::file::ListedFile;
use crate::models::grouping::{GroupSet, NewGrouping};

const LP_VERSION: &str = "1.31";
const LE_VERSION: &str = "1.51";

pub const PROFILE: ApiProfile = ApiProfile {
    family: Family::D2L,
    pagination: Pagination::None,
    per_page: None,
};

pub const SCOPES: &[&str] = &[
    "content:toc:read",
    "content:topics:read",
    "groups:group:read",
    "users:userdata:read",
];

/// The numeric API id inside a D2L LTI `user_id` (`{guid}_{id}`).
pub fn api_user_id(lti_user_id: &str) -> &str {
    lti_user_id.rsplit('_').next().unwrap_or(lti_user_id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GroupCategory {
    group_category_id: i64,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct D2lGroup {
    pub group_id: i64,
    pub name: String,
    #[serde(default)]
    pub enrollments: Vec<i64>,
    #[serde(skip)]
    pub group_category_id: String,
}

impl From<D2lGroup> for NewGrouping {
    fn from(g: D2lGroup) -> Self {
        NewGrouping::new(g.group_id.to_string(), g.name).with_group_set(&g.group_category_id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Toc {
    #[serde(default)]
    modules: Vec<Module>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Module {
    module_id: i64,
    #[serde(default)]
    modules: Vec<Module>,
    #[serde(default)]
    topics: Vec<Topic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Topic {
    topic_id: i64,
    title: String,
    #[serde(default)]
    type_identifier: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    last_modified_date: Option<String>,
}

fn collect_files(module: Module, out: &mut Vec<ListedFile>) {
    let parent = module.module_id.to_string();
    for topic in module.topics {
        let is_pdf = topic
            .url
            .as_deref()
            .map(|u| u.to_ascii_lowercase().ends_with(".pdf"))
            .unwrap_or(false);
        if topic.type_identifier.as_deref() == Some("File") && is_pdf {
            out.push(ListedFile {
                lms_id: topic.topic_id.to_string(),
                name: topic.title,
                size: None,
                parent_id: Some(parent.clone()),
                updated_at: topic.last_modified_date,
            });
        }
    }
    for child in module.modules {
        collect_files(child, out);
    }
}

pub struct D2lApi {
    proxy: ApiProxy,
}

impl D2lApi {
    pub fn new(proxy: ApiProxy) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &ApiProxy {
        &self.proxy
    }

    pub async fn list_files(&self, org_unit: &str) -> Result<Vec<ListedFile>> {
        let toc: Toc = self
            .proxy
            .send(ApiRequest::get(format!("le/{LE_VERSION}/{org_unit}/content/toc")))
            .await?;
        let mut files = Vec::new();
        for module in toc.modules {
            collect_files(module, &mut files);
        }
        Ok(files)
    }

    /// URL of a topic's file. Fetching it needs the user's bearer token.
    pub async fn public_url(&self, org_unit: &str, file_id: &str) -> Result<String> {
        let path = format!("le/{LE_VERSION}/{org_unit}/content/topics/{file_id}");
        self.proxy
            .send::<Value>(ApiRequest::get(path.clone()))
            .await
            .map_err(|e| file_not_found_on_404(e, Family::D2L, file_id))?;
        Ok(format!("{}/file?stream=1", self.proxy.url_for(&path)?))
    }

    pub async fn course_group_sets(&self, org_unit: &str) -> Result<Vec<GroupSet>> {
        let categories: Vec<GroupCategory> = self
            .proxy
            .send(ApiRequest::get(format!(
                "lp/{LP_VERSION}/{org_unit}/groupcategories/"
            )))
            .await?;
        Ok(categories
            .into_iter()
            .map(|c| GroupSet {
                id: c.group_category_id.to_string(),
                name: c.name,
            })
            .collect())
    }

    pub async fn group_set_groups(&self, org_unit: &str, group_set_id: &str) -> Result<Vec<D2lGroup>> {
        let groups: Vec<D2lGroup> = self
            .proxy
            .send(ApiRequest::get(format!(
                "lp/{LP_VERSION}/{org_unit}/groupcategories/{group_set_id}/groups/"
            )))
            .await?;
        Ok(groups
            .into_iter()
            .map(|mut g| {
                g.group_category_id = group_set_id.to_string();
                g
            })
            .collect())
    }

    /// Groups of the set with `user_id` (a D2L LTI user id) enrolled.
    pub async fn user_groups(
        &self,
        org_unit: &str,
        group_set_id: &str,
        user_id: &str,
    ) -> Result<Vec<D2lGroup>> {
        let id: i64 = match api_user_id(user_id).parse() {
            Ok(id) => id,
            Err(_) => return Ok(Vec::new()),
        };
        Ok(self
            .group_set_groups(org_unit, group_set_id)
            .await?
            .into_iter()
            .filter(|g| g.enrollments.contains(&id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::proxy::tests::proxy_for;
    use crate::error::MarginError;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn api(server: &MockServer) -> D2lApi {
        let (proxy, _) = proxy_for(server, "/d2l/api", PROFILE, Some("r1")).await;
        D2lApi::new(proxy)
    }

    #[test]
    fn api_user_id_strips_guid() {
        assert_eq!(api_user_id("abc-def_123"), "123");
        assert_eq!(api_user_id("123"), "123");
    }

    #[tokio::test]
    async fn toc_is_flattened_to_pdf_topics() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/d2l/api/le/1.51/6782/content/toc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Modules": [{
                    "ModuleId": 1,
                    "Topics": [
                        {"TopicId": 10, "Title": "Reading", "TypeIdentifier": "File", "Url": "/content/a.PDF"},
                        {"TopicId": 11, "Title": "Link", "TypeIdentifier": "Link", "Url": "https://example.com"}
                    ],
                    "Modules": [{
                        "ModuleId": 2,
                        "Topics": [{"TopicId": 12, "Title": "Nested", "TypeIdentifier": "File", "Url": "/content/b.pdf"}]
                    }]
                }]
            })))
            .mount(&server)
            .await;

        let files = api(&server).await.list_files("6782").await.unwrap();
        let ids: Vec<_> = files.iter().map(|f| f.lms_id.as_str()).collect();
        assert_eq!(ids, vec!["10", "12"]);
        assert_eq!(files[1].parent_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn user_groups_filters_on_enrollments() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/d2l/api/lp/1.31/6782/groupcategories/5/groups/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"GroupId": 1, "Name": "A", "Enrollments": [123, 124]},
                {"GroupId": 2, "Name": "B", "Enrollments": [125]}
            ])))
            .mount(&server)
            .await;

        let groups = api(&server)
            .await
            .user_groups("6782", "5", "guid_123")
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
        let g: NewGrouping = groups[0].clone().into();
        assert_eq!(g.lms_id, "1");
        assert_eq!(g.extra["group_set_id"], "5");
    }

    #[tokio::test]
    async fn missing_topic_is_file_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = api(&server).await.public_url("6782", "99").await.unwrap_err();
        assert!(matches!(err, MarginError::Coded(c) if c.error_code.as_str() == "d2l_file_not_found_in_course"));
    }
}
