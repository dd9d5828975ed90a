//! Grouping synchronisation: which annotation groups a launch belongs to.
//!
//! A launch is scoped to its course, to the user's sections or to the
//! user's groups within a group set. Course launches resolve immediately.
//! Section and group launches are resolved by a later sync call, which asks
//! the vendor plugin for the relevant groupings, stores them under the
//! course and records the launching user's membership.

pub mod blackboard;
pub mod canvas;
pub mod d2l;
pub mod moodle;
pub mod plugin;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connectors::ApiFactory;
use crate::course::course_sections_enabled;
use crate::db::repository::{GroupingUpsert, MarginRepository};
use crate::error::{MarginError, Result};
use crate::models::application_instance::{ApplicationInstance, Settings};
use crate::models::family::Family;
use crate::models::grouping::{authority_provided_id, Grouping, GroupingType, NewGrouping};
use crate::models::lti_user::LtiUser;

pub use plugin::{GroupingPlugin, NullPlugin};

use self::blackboard::BlackboardGroupingPlugin;
use self::canvas::CanvasGroupingPlugin;
use self::d2l::D2lGroupingPlugin;
use self::moodle::MoodleGroupingPlugin;

/// How a launch maps to annotation groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchGrouping {
    Course,
    Sections,
    Groups { group_set_id: String },
}

impl LaunchGrouping {
    /// Whether the frontend must call the sync endpoint to learn its groups.
    pub fn needs_sync(&self) -> bool {
        !matches!(self, LaunchGrouping::Course)
    }
}

/// Decide whether a launch is course, section or group scoped.
pub fn classify(
    plugin: &dyn GroupingPlugin,
    ai: &ApplicationInstance,
    course: &Grouping,
    group_set_id: Option<&str>,
) -> LaunchGrouping {
    if let Some(group_set_id) = group_set_id.filter(|s| !s.is_empty()) {
        if plugin.group_type().is_some() {
            return LaunchGrouping::Groups {
                group_set_id: group_set_id.to_string(),
            };
        }
    }
    if plugin.sections_type().is_some() && course_sections_enabled(course, ai) {
        return LaunchGrouping::Sections;
    }
    LaunchGrouping::Course
}

/// The grouping plugin for a tenant.
///
/// Tenants whose vendor credentials are not configured get a
/// [`NullPlugin`], which makes every launch course scoped.
pub fn plugin_for(
    factory: &ApiFactory,
    ai: &ApplicationInstance,
    user: &LtiUser,
) -> Box<dyn GroupingPlugin> {
    let built: Result<Box<dyn GroupingPlugin>> = match ai.family {
        Family::Canvas => factory.canvas(ai, &user.user_id).map(|api| {
            Box::new(CanvasGroupingPlugin::new(api, ai.sections_enabled())) as Box<dyn GroupingPlugin>
        }),
        Family::Blackboard => factory
            .blackboard(ai, &user.user_id)
            .map(|api| Box::new(BlackboardGroupingPlugin::new(api)) as Box<dyn GroupingPlugin>),
        Family::D2L => factory.d2l(ai, &user.user_id).map(|api| {
            Box::new(D2lGroupingPlugin::new(api, &user.user_id)) as Box<dyn GroupingPlugin>
        }),
        Family::Moodle => factory.moodle(ai).map(|api| {
            Box::new(MoodleGroupingPlugin::new(api, user.api_user_id())) as Box<dyn GroupingPlugin>
        }),
        family => return Box::new(NullPlugin { family }),
    };
    match built {
        Ok(plugin) => plugin,
        Err(e) => {
            debug!(
                application_instance_id = ai.id,
                family = %ai.family,
                error = %e,
                "no vendor API access, groupings limited to the course"
            );
            Box::new(NullPlugin { family: ai.family })
        }
    }
}

/// Who is asking for groupings in a sync call.
#[derive(Debug, Clone, Copy)]
pub struct SyncUser<'a> {
    pub user: &'a LtiUser,
    /// Primary key of the user's `lms_user` row.
    pub lms_user_id: i64,
    /// Vendor API id of the learner an instructor is grading, if any.
    pub grading_learner_id: Option<&'a str>,
}

/// Resolve, store and join the groupings for a launch.
///
/// Returns the groupings the user's annotation client should show. Each
/// returned child grouping has a membership row for the user.
pub async fn sync(
    repo: &dyn MarginRepository,
    plugin: &dyn GroupingPlugin,
    ai: &ApplicationInstance,
    course: &Grouping,
    launch: &LaunchGrouping,
    who: SyncUser<'_>,
) -> Result<Vec<Grouping>> {
    let (fetched, grouping_type) = match launch {
        LaunchGrouping::Course => return Ok(vec![course.clone()]),
        LaunchGrouping::Sections => {
            let fetched = match (who.user.is_instructor(), who.grading_learner_id) {
                (true, Some(learner)) => plugin.get_sections_for_grading(course, learner).await?,
                (true, None) => plugin.get_sections_for_instructor(course).await?,
                (false, _) => plugin.get_sections_for_learner(course).await?,
            };
            (fetched, plugin.sections_type())
        }
        LaunchGrouping::Groups { group_set_id } => {
            let fetched = match (who.user.is_instructor(), who.grading_learner_id) {
                (true, Some(learner)) => {
                    plugin
                        .get_groups_for_grading(course, group_set_id, learner)
                        .await?
                }
                (true, None) => plugin.get_groups_for_instructor(course, group_set_id).await?,
                (false, _) => plugin.get_groups_for_learner(course, group_set_id).await?,
            };
            (fetched, plugin.group_type())
        }
    };

    let (Some(fetched), Some(grouping_type)) = (fetched, grouping_type) else {
        return Err(MarginError::Unsupported(format!(
            "{} does not support {:?} groupings",
            plugin.family(),
            launch
        )));
    };

    let groupings = upsert_groupings(
        repo,
        ai.id,
        &who.user.tenant_guid,
        course,
        grouping_type,
        &fetched,
    )
    .await?;
    let roles = who.user.roles.to_db_string();
    for grouping in &groupings {
        repo.upsert_grouping_membership(grouping.id, who.lms_user_id, &roles)
            .await?;
    }
    info!(
        application_instance_id = ai.id,
        course = %course.lms_id,
        grouping_type = grouping_type.as_str(),
        count = groupings.len(),
        "synced groupings"
    );
    Ok(groupings)
}

/// Store vendor groupings as children of `course`.
pub async fn upsert_groupings(
    repo: &dyn MarginRepository,
    application_instance_id: i64,
    tenant_guid: &str,
    course: &Grouping,
    grouping_type: GroupingType,
    fetched: &[NewGrouping],
) -> Result<Vec<Grouping>> {
    let settings = Settings::default();
    let mut out = Vec::with_capacity(fetched.len());
    for g in fetched {
        let apid = authority_provided_id(
            tenant_guid,
            grouping_type,
            &g.lms_id,
            Some(&course.authority_provided_id),
        );
        out.push(
            repo.upsert_grouping(&GroupingUpsert {
                application_instance_id,
                authority_provided_id: &apid,
                lms_id: &g.lms_id,
                lms_name: &g.lms_name,
                parent_id: Some(course.id),
                grouping_type,
                settings: &settings,
                extra: &g.extra,
            })
            .await?,
        );
    }
    Ok(out)
}

/// Annotation-service group ids for `groupings`.
pub fn groupids(groupings: &[Grouping], authority: &str) -> Vec<String> {
    groupings.iter().map(|g| g.groupid(authority)).collect()
}
