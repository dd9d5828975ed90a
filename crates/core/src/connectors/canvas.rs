//! Canvas REST API (`/api/v1`).

use serde::Deserialize;
use serde_json::Value;

use super::file_not_found_on_404;
use super::proxy::{ApiProfile, ApiProxy, ApiRequest, Pagination};
use crate::error::Result;
use crate::models::application_instance::ApplicationInstance;
use crate::models::family::Family;
use crate::models::file::ListedFile;
use crate::models::grouping::{GroupSet, NewGrouping};

pub const PROFILE: ApiProfile = ApiProfile {
    family: Family::Canvas,
    pagination: Pagination::LinkHeader,
    per_page: Some(("per_page", 100)),
};

/// Endpoints requested when the tenant's developer key enforces scopes.
const SCOPES: &[&str] = &[
    "url:GET|/api/v1/courses/:id",
    "url:GET|/api/v1/courses/:course_id/files",
    "url:GET|/api/v1/files/:id/public_url",
    "url:GET|/api/v1/courses/:course_id/sections",
    "url:GET|/api/v1/courses/:course_id/users/:id",
    "url:GET|/api/v1/courses/:course_id/group_categories",
    "url:GET|/api/v1/group_categories/:group_category_id/groups",
    "url:GET|/api/v1/users/:user_id/groups",
];

/// The `scope` parameter for the authorization request. Empty unless the
/// tenant opted into scoped developer keys.
pub fn scopes(ai: &ApplicationInstance) -> String {
    if ai.settings.get_bool("canvas", "scoped_developer_key") {
        SCOPES.join(" ")
    } else {
        String::new()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CanvasFile {
    id: i64,
    display_name: String,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    folder_id: Option<i64>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PublicUrl {
    public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasSection {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct CourseWithSections {
    #[serde(default)]
    sections: Vec<CanvasSection>,
}

#[derive(Debug, Deserialize)]
struct Enrollment {
    course_section_id: i64,
}

#[derive(Debug, Deserialize)]
struct UserWithEnrollments {
    #[serde(default)]
    enrollments: Vec<Enrollment>,
}

#[derive(Debug, Deserialize)]
struct GroupCategory {
    id: i64,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasGroup {
    pub id: i64,
    pub name: String,
    pub group_category_id: i64,
    #[serde(default)]
    pub course_id: Option<i64>,
    #[serde(default)]
    users: Option<Vec<Value>>,
}

impl CanvasGroup {
    fn has_member(&self, user_id: &str) -> bool {
        self.users.iter().flatten().any(|u| match u.get("id") {
            Some(Value::Number(n)) => n.to_string() == user_id,
            Some(Value::String(s)) => s == user_id,
            _ => false,
        })
    }
}

impl From<CanvasSection> for NewGrouping {
    fn from(s: CanvasSection) -> Self {
        NewGrouping::new(s.id.to_string(), s.name)
    }
}

impl From<CanvasGroup> for NewGrouping {
    fn from(g: CanvasGroup) -> Self {
        NewGrouping::new(g.id.to_string(), g.name).with_group_set(&g.group_category_id.to_string())
    }
}

pub struct CanvasApi {
    proxy: ApiProxy,
}

impl CanvasApi {
    pub fn new(proxy: ApiProxy) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &ApiProxy {
        &self.proxy
    }

    /// PDF files of a course.
    pub async fn list_files(&self, course_id: &str) -> Result<Vec<ListedFile>> {
        let files: Vec<CanvasFile> = self
            .proxy
            .send_many(
                ApiRequest::get(format!("courses/{course_id}/files"))
                    .query("content_types[]", "application/pdf")
                    .query("sort", "position"),
            )
            .await?;
        Ok(files
            .into_iter()
            .map(|f| ListedFile {
                lms_id: f.id.to_string(),
                name: f.display_name,
                size: f.size,
                parent_id: f.folder_id.map(|id| id.to_string()),
                updated_at: f.updated_at,
            })
            .collect())
    }

    /// A short-lived download URL for a file.
    pub async fn public_url(&self, file_id: &str) -> Result<String> {
        let res: PublicUrl = self
            .proxy
            .send(ApiRequest::get(format!("files/{file_id}/public_url")))
            .await
            .map_err(|e| file_not_found_on_404(e, Family::Canvas, file_id))?;
        Ok(res.public_url)
    }

    pub async fn course_sections(&self, course_id: &str) -> Result<Vec<CanvasSection>> {
        self.proxy
            .send_many(ApiRequest::get(format!("courses/{course_id}/sections")))
            .await
    }

    /// Sections the token's own user is enrolled in.
    pub async fn authenticated_users_sections(&self, course_id: &str) -> Result<Vec<CanvasSection>> {
        let course: CourseWithSections = self
            .proxy
            .send(ApiRequest::get(format!("courses/{course_id}")).query("include[]", "sections"))
            .await?;
        Ok(course.sections)
    }

    /// Sections another user (a student being graded) is enrolled in.
    pub async fn users_sections(&self, user_id: &str, course_id: &str) -> Result<Vec<CanvasSection>> {
        let user: UserWithEnrollments = self
            .proxy
            .send(
                ApiRequest::get(format!("courses/{course_id}/users/{user_id}"))
                    .query("include[]", "enrollments"),
            )
            .await?;
        let enrolled: Vec<i64> = user.enrollments.iter().map(|e| e.course_section_id).collect();
        Ok(self
            .course_sections(course_id)
            .await?
            .into_iter()
            .filter(|s| enrolled.contains(&s.id))
            .collect())
    }

    pub async fn course_group_categories(&self, course_id: &str) -> Result<Vec<GroupSet>> {
        let categories: Vec<GroupCategory> = self
            .proxy
            .send_many(ApiRequest::get(format!("courses/{course_id}/group_categories")))
            .await?;
        Ok(categories
            .into_iter()
            .map(|c| GroupSet {
                id: c.id.to_string(),
                name: c.name,
            })
            .collect())
    }

    pub async fn group_category_groups(&self, group_category_id: &str) -> Result<Vec<CanvasGroup>> {
        self.proxy
            .send_many(ApiRequest::get(format!(
                "group_categories/{group_category_id}/groups"
            )))
            .await
    }

    /// Groups of `group_category_id` the token's own user belongs to.
    pub async fn current_user_groups(
        &self,
        course_id: &str,
        group_category_id: &str,
    ) -> Result<Vec<CanvasGroup>> {
        let groups: Vec<CanvasGroup> = self
            .proxy
            .send_many(ApiRequest::get("users/self/groups").query("context_type", "Course"))
            .await?;
        Ok(groups
            .into_iter()
            .filter(|g| {
                g.group_category_id.to_string() == group_category_id
                    && g.course_id.map(|c| c.to_string() == course_id).unwrap_or(true)
            })
            .collect())
    }

    /// Groups of `group_category_id` that `user_id` belongs to.
    pub async fn user_groups(&self, user_id: &str, group_category_id: &str) -> Result<Vec<CanvasGroup>> {
        let groups: Vec<CanvasGroup> = self
            .proxy
            .send_many(
                ApiRequest::get(format!("group_categories/{group_category_id}/groups"))
                    .query("include[]", "users"),
            )
            .await?;
        Ok(groups.into_iter().filter(|g| g.has_member(user_id)).collect())
    }
}
