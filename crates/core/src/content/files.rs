//! LMS-hosted files: `canvas://`, `blackboard://`, `d2l://` and `moodle://`
//! document URLs, and the course-copy fallback used when a file id from an
//! original course no longer exists in its copy.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{ContentSource, FileDisplayConfig};
use crate::connectors::blackboard::{BlackboardApi, BlackboardEntry};
use crate::connectors::canvas::CanvasApi;
use crate::connectors::d2l::D2lApi;
use crate::connectors::moodle::MoodleApi;
use crate::db::repository::MarginRepository;
use crate::error::{ErrorCode, MarginError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::models::application_instance::ApplicationInstance;
use crate::models::family::Family;
use crate::models::file::{FileType, ListedFile};
use crate::models::grouping::Grouping;

/// Blackboard folders nested deeper than this are not searched.
const MAX_FOLDER_DEPTH: usize = 3;

/// A parsed LMS file document URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDocument {
    pub family: Family,
    /// Course the file was picked in, when the URL records it.
    pub course_id: Option<String>,
    pub file_id: String,
}

impl FileDocument {
    pub fn parse(document_url: &str) -> Result<Self> {
        let invalid = || MarginError::Validation(format!("invalid file URL: {document_url}"));
        let (family, rest) = if let Some(rest) = document_url.strip_prefix("canvas://file/") {
            (Family::Canvas, rest)
        } else if let Some(rest) = document_url.strip_prefix("d2l://file/") {
            (Family::D2L, rest)
        } else if let Some(rest) = document_url.strip_prefix("moodle://file/") {
            (Family::Moodle, rest)
        } else if let Some(rest) = document_url.strip_prefix("blackboard://content-resource/") {
            let file_id = rest.trim_end_matches('/');
            if file_id.is_empty() || file_id.contains('/') {
                return Err(invalid());
            }
            return Ok(Self {
                family: Family::Blackboard,
                course_id: None,
                file_id: file_id.to_string(),
            });
        } else {
            return Err(invalid());
        };

        let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
        match parts.as_slice() {
            ["course", course_id, "file_id", file_id] if !course_id.is_empty() && !file_id.is_empty() => {
                Ok(Self {
                    family,
                    course_id: Some(course_id.to_string()),
                    file_id: file_id.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }

    pub fn document_url(&self) -> String {
        match (self.family, &self.course_id) {
            (Family::Blackboard, _) => format!("blackboard://content-resource/{}/", self.file_id),
            (Family::D2L, Some(course)) => {
                format!("d2l://file/course/{course}/file_id/{}/", self.file_id)
            }
            (family, course) => format!(
                "{}://file/course/{}/file_id/{}",
                scheme_name(family),
                course.as_deref().unwrap_or_default(),
                self.file_id
            ),
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        file_type_for(self.family)
    }
}

fn scheme_name(family: Family) -> &'static str {
    match family {
        Family::Blackboard => "blackboard",
        Family::D2L => "d2l",
        Family::Moodle => "moodle",
        _ => "canvas",
    }
}

pub fn file_type_for(family: Family) -> Option<FileType> {
    match family {
        Family::Canvas => Some(FileType::CanvasFile),
        Family::Blackboard => Some(FileType::BlackboardFile),
        Family::D2L => Some(FileType::D2lFile),
        Family::Moodle => Some(FileType::MoodleFile),
        _ => None,
    }
}

/// Vendor file operations the course-copy fallback needs.
#[async_trait]
pub trait FileApi: Send + Sync {
    fn family(&self) -> Family;
    async fn list_files(&self, course_id: &str) -> Result<Vec<ListedFile>>;
    async fn public_url(&self, course_id: &str, file_id: &str) -> Result<String>;
}

#[async_trait]
impl FileApi for CanvasApi {
    fn family(&self) -> Family {
        Family::Canvas
    }

    async fn list_files(&self, course_id: &str) -> Result<Vec<ListedFile>> {
        CanvasApi::list_files(self, course_id).await
    }

    async fn public_url(&self, _course_id: &str, file_id: &str) -> Result<String> {
        CanvasApi::public_url(self, file_id).await
    }
}

#[async_trait]
impl FileApi for BlackboardApi {
    fn family(&self) -> Family {
        Family::Blackboard
    }

    /// Every PDF in the course, descending into folders.
    async fn list_files(&self, course_id: &str) -> Result<Vec<ListedFile>> {
        let mut files = Vec::new();
        let mut pending: Vec<(Option<String>, usize)> = vec![(None, 0)];
        while let Some((folder, depth)) = pending.pop() {
            for entry in BlackboardApi::list_files(self, course_id, folder.as_deref()).await? {
                match entry {
                    BlackboardEntry::File(f) => files.push(f),
                    BlackboardEntry::Folder { id, .. } if depth < MAX_FOLDER_DEPTH => {
                        pending.push((Some(id), depth + 1))
                    }
                    BlackboardEntry::Folder { .. } => {}
                }
            }
        }
        Ok(files)
    }

    async fn public_url(&self, course_id: &str, file_id: &str) -> Result<String> {
        BlackboardApi::public_url(self, course_id, file_id).await
    }
}

#[async_trait]
impl FileApi for D2lApi {
    fn family(&self) -> Family {
        Family::D2L
    }

    async fn list_files(&self, course_id: &str) -> Result<Vec<ListedFile>> {
        D2lApi::list_files(self, course_id).await
    }

    async fn public_url(&self, course_id: &str, file_id: &str) -> Result<String> {
        D2lApi::public_url(self, course_id, file_id).await
    }
}

#[async_trait]
impl FileApi for MoodleApi {
    fn family(&self) -> Family {
        Family::Moodle
    }

    async fn list_files(&self, course_id: &str) -> Result<Vec<ListedFile>> {
        MoodleApi::list_files(self, course_id).await
    }

    async fn public_url(&self, course_id: &str, file_id: &str) -> Result<String> {
        MoodleApi::public_url(self, course_id, file_id).await
    }
}

fn is_file_not_found(err: &MarginError) -> bool {
    matches!(
        err,
        MarginError::Coded(e) if matches!(
            e.error_code,
            ErrorCode::CanvasFileNotFoundInCourse
                | ErrorCode::BlackboardFileNotFoundInCourse
                | ErrorCode::D2lFileNotFoundInCourse
                | ErrorCode::MoodleFileNotFoundInCourse
        )
    )
}

/// Key of a course's file id mapping inside its `extra`.
fn mapping_key(file_type: FileType) -> String {
    format!("{}_mappings", file_type.as_str())
}

/// Resolves file ids across course copies.
///
/// Mappings are stored in the course grouping's `extra`, one map per file
/// type. Entries are only ever added; writes for the same course are
/// serialised so concurrent fallbacks don't lose each other's entries.
#[derive(Default)]
pub struct CourseCopyResolver {
    locks: KeyedLocks<i64>,
}

impl CourseCopyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A public URL for `file_id` as seen from `course`.
    ///
    /// A previously recorded mapping is applied first. If the vendor then
    /// says the file isn't in the course, the course's files are searched
    /// for one with the same name and size as the original; a hit is
    /// recorded and used.
    pub async fn public_url(
        &self,
        repo: &dyn MarginRepository,
        api: &dyn FileApi,
        ai: &ApplicationInstance,
        course: &Grouping,
        course_api_id: &str,
        file_id: &str,
    ) -> Result<String> {
        let Some(file_type) = file_type_for(api.family()) else {
            return api.public_url(course_api_id, file_id).await;
        };
        let effective = mapped_id(course, file_type, file_id).unwrap_or(file_id);

        let err = match api.public_url(course_api_id, effective).await {
            Ok(url) => return Ok(url),
            Err(e) if is_file_not_found(&e) => e,
            Err(e) => return Err(e),
        };

        let Some(original) = repo.find_file(ai.id, file_type, file_id).await? else {
            debug!(file_id, "no record of original file, cannot search course copy");
            return Err(err);
        };
        let Some(name) = original.name.as_deref() else {
            return Err(err);
        };

        let listed = api.list_files(course_api_id).await?;
        repo.upsert_files(ai.id, file_type, course_api_id, &listed)
            .await?;
        let Some(copy) = repo
            .find_file_by_name_and_size(ai.id, file_type, course_api_id, name, original.size)
            .await?
        else {
            return Err(err);
        };

        self.record_mapping(repo, course, file_type, file_id, &copy.lms_id)
            .await?;
        info!(
            course = %course.lms_id,
            original = file_id,
            copy = %copy.lms_id,
            "mapped file from course copy"
        );
        api.public_url(course_api_id, &copy.lms_id).await
    }

    async fn record_mapping(
        &self,
        repo: &dyn MarginRepository,
        course: &Grouping,
        file_type: FileType,
        from: &str,
        to: &str,
    ) -> Result<()> {
        self.locks
            .run(
                &course.id,
                Self::merge_mapping(repo, course, file_type, from, to),
            )
            .await
    }

    async fn merge_mapping(
        repo: &dyn MarginRepository,
        course: &Grouping,
        file_type: FileType,
        from: &str,
        to: &str,
    ) -> Result<()> {
        // Re-read so entries written by another request are kept.
        let current = repo
            .get_grouping_by_authority_provided_id(&course.authority_provided_id)
            .await?;
        let mut extra = current.map(|c| c.extra).unwrap_or_else(|| course.extra.clone());
        let key = mapping_key(file_type);
        let mut mappings = match extra.remove(&key) {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        };
        mappings.insert(from.to_string(), json!(to));
        extra.insert(key, Value::Object(mappings));
        repo.set_grouping_extra(course.id, &extra).await
    }
}

/// The mapped id for `file_id` in `course`, if one was recorded.
pub fn mapped_id<'a>(course: &'a Grouping, file_type: FileType, file_id: &str) -> Option<&'a str> {
    course
        .extra
        .get(&mapping_key(file_type))
        .and_then(|m| m.get(file_id))
        .and_then(Value::as_str)
}

/// Content source for one LMS's own files.
pub struct LmsFileSource {
    family: Family,
    scheme: &'static str,
}

impl LmsFileSource {
    pub fn canvas() -> Self {
        Self {
            family: Family::Canvas,
            scheme: "canvas://",
        }
    }

    pub fn blackboard() -> Self {
        Self {
            family: Family::Blackboard,
            scheme: "blackboard://",
        }
    }

    pub fn d2l() -> Self {
        Self {
            family: Family::D2L,
            scheme: "d2l://",
        }
    }

    pub fn moodle() -> Self {
        Self {
            family: Family::Moodle,
            scheme: "moodle://",
        }
    }

    fn api_prefix(&self) -> &'static str {
        scheme_name(self.family)
    }
}

impl ContentSource for LmsFileSource {
    fn url_scheme(&self) -> &'static str {
        self.scheme
    }

    fn is_enabled(&self, ai: &ApplicationInstance) -> bool {
        ai.family == self.family && ai.files_enabled()
    }

    fn picker_config(&self, ai: &ApplicationInstance) -> Value {
        json!({
            "enabled": self.is_enabled(ai),
            "list_files": {
                "path": format!("/api/{}/courses/:course_id/files", self.api_prefix()),
            },
        })
    }

    fn file_display_config(&self, document_url: &str) -> Result<FileDisplayConfig> {
        let doc = FileDocument::parse(document_url)?;
        Ok(FileDisplayConfig::callback(
            format!("/api/{}/files/via_url", self.api_prefix()),
            json!({ "document_url": doc.document_url() }),
        ))
    }
}
