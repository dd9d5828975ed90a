//! Course groupings: creation on first launch, settings inheritance and the
//! `lms_course` mirror row.

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::db::repository::{GroupingUpsert, MarginRepository};
use crate::error::Result;
use crate::models::application_instance::{ApplicationInstance, Settings};
use crate::models::family::Family;
use crate::models::grouping::{authority_provided_id, Grouping, GroupingType};

/// What a launch tells us about its course.
#[derive(Debug, Clone)]
pub struct CourseLaunch<'a> {
    pub tenant_guid: &'a str,
    pub context_id: &'a str,
    pub title: &'a str,
    /// Canvas's numeric course id (`custom_canvas_course_id`).
    pub canvas_course_id: Option<&'a str>,
}

/// Settings a course gets when it is first seen: those of a legacy course
/// row with the same id, or else defaults derived from the tenant.
async fn initial_settings(
    repo: &dyn MarginRepository,
    ai: &ApplicationInstance,
    apid: &str,
) -> Result<Settings> {
    if let Some(legacy) = repo.get_legacy_course(apid).await? {
        debug!(authority_provided_id = %apid, "inheriting legacy course settings");
        return Ok(legacy.settings);
    }
    let mut settings = Settings::default();
    if ai.family == Family::Canvas {
        settings.set("canvas", "sections_enabled", Value::Bool(ai.sections_enabled()));
    }
    Ok(settings)
}

/// Create or update the course grouping for a launch.
pub async fn upsert_course(
    repo: &dyn MarginRepository,
    ai: &ApplicationInstance,
    launch: &CourseLaunch<'_>,
) -> Result<Grouping> {
    let apid = authority_provided_id(launch.tenant_guid, GroupingType::Course, launch.context_id, None);

    let existing = repo.get_grouping_by_authority_provided_id(&apid).await?;
    let settings = match &existing {
        Some(course) => course.settings.clone(),
        None => initial_settings(repo, ai, &apid).await?,
    };

    let mut extra = Map::new();
    if let Some(id) = launch.canvas_course_id {
        extra.insert("canvas".into(), json!({ "custom_canvas_course_id": id }));
    }

    let course = repo
        .upsert_grouping(&GroupingUpsert {
            application_instance_id: ai.id,
            authority_provided_id: &apid,
            lms_id: launch.context_id,
            lms_name: launch.title,
            parent_id: None,
            grouping_type: GroupingType::Course,
            settings: &settings,
            extra: &extra,
        })
        .await?;

    repo.upsert_lms_course(launch.tenant_guid, launch.context_id, launch.title, &apid)
        .await?;

    if existing.is_none() {
        info!(
            application_instance_id = ai.id,
            context_id = %launch.context_id,
            authority_provided_id = %apid,
            "created course"
        );
    }
    Ok(course)
}

/// The id the vendor REST API knows the course by.
pub fn course_api_id(course: &Grouping, family: Family) -> String {
    if family == Family::Canvas {
        if let Some(id) = course
            .extra
            .get("canvas")
            .and_then(|c| c.get("custom_canvas_course_id"))
            .and_then(Value::as_str)
        {
            return id.to_string();
        }
    }
    course.lms_id.clone()
}

/// Course-level switch for sections, falling back to the tenant's.
pub fn course_sections_enabled(course: &Grouping, ai: &ApplicationInstance) -> bool {
    ai.sections_enabled()
        && course
            .settings
            .get("canvas", "sections_enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::{GroupingRepository, LegacyCourseRepository, LmsCourseRepository};
    use crate::db::sqlite::tests::{seed_instance, test_repo};
    use crate::models::lms::LegacyCourse;

    fn launch<'a>(title: &'a str, canvas_id: Option<&'a str>) -> CourseLaunch<'a> {
        CourseLaunch {
            tenant_guid: "G",
            context_id: "C",
            title,
            canvas_course_id: canvas_id,
        }
    }

    #[tokio::test]
    async fn first_launch_creates_course_and_mirror() {
        let repo = test_repo().await;
        let ai = seed_instance(&repo).await;

        let course = upsert_course(&repo, &ai, &launch("Biology", Some("125")))
            .await
            .unwrap();
        assert_eq!(
            course.authority_provided_id,
            authority_provided_id("G", GroupingType::Course, "C", None)
        );
        assert_eq!(course.grouping_type, GroupingType::Course);
        assert_eq!(course_api_id(&course, Family::Canvas), "125");
        assert_eq!(course_api_id(&course, Family::Moodle), "C");
        assert_eq!(repo.count_lms_courses().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn relaunch_updates_name_and_keeps_settings() {
        let repo = test_repo().await;
        let ai = seed_instance(&repo).await;

        let first = upsert_course(&repo, &ai, &launch("Biology", None)).await.unwrap();
        let second = upsert_course(&repo, &ai, &launch("Biology 101", None)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.lms_name, "Biology 101");
        assert_eq!(second.settings, first.settings);
        assert_eq!(repo.count_groupings(GroupingType::Course).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn legacy_settings_are_inherited_on_creation() {
        let repo = test_repo().await;
        let ai = seed_instance(&repo).await;
        let apid = authority_provided_id("G", GroupingType::Course, "C", None);
        let mut settings = Settings::default();
        settings.set("canvas", "sections_enabled", Value::Bool(false));
        repo.upsert_legacy_course(&LegacyCourse {
            authority_provided_id: apid.clone(),
            settings: settings.clone(),
        })
        .await
        .unwrap();

        let course = upsert_course(&repo, &ai, &launch("Biology", None)).await.unwrap();
        assert_eq!(course.settings, settings);
    }

    #[tokio::test]
    async fn course_can_opt_out_of_sections() {
        let repo = test_repo().await;
        let mut ai = seed_instance(&repo).await;
        ai.developer_key = Some("1".into());
        ai.settings.set("canvas", "sections_enabled", Value::Bool(true));

        let mut course = upsert_course(&repo, &ai, &launch("Biology", None)).await.unwrap();
        assert!(course_sections_enabled(&course, &ai));
        course.settings.set("canvas", "sections_enabled", Value::Bool(false));
        assert!(!course_sections_enabled(&course, &ai));
    }
}
