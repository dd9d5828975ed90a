//! The launch pipeline: verify, resolve tenant and user, record the course,
//! provision the annotation service, then describe the document.
//!
//! Steps run strictly in that order. Annotation provisioning always
//! finishes before the content is resolved, and a failed step stops
//! everything after it.

use serde_json::{json, Map, Value};
use tracing::{debug, info};
use url::Url;

use margin_core::content::FileDisplayConfig;
use margin_core::course::{upsert_course, CourseLaunch};
use margin_core::db::repository::MarginRepository;
use margin_core::error::MarginError;
use margin_core::grouping::{classify, plugin_for, GroupingPlugin, LaunchGrouping};
use margin_core::models::application_instance::{ApplicationInstance, LtiRegistration};
use margin_core::models::assignment::{Assignment, AssignmentUpsert};
use margin_core::models::family::Family;
use margin_core::models::grading_info::GradingInfoUpsert;
use margin_core::models::grouping::{authority_provided_id, Grouping, GroupingType};
use margin_core::models::lms::LmsUser;
use margin_core::models::lti_params::LtiParams;
use margin_core::models::lti_user::LtiUser;

use crate::api::load_instance;
use crate::error::{ApiError, ApiResult, LaunchError};
use crate::frontend::{
    api_call, ApiConfig, CanvasConfig, DashboardConfig, FilePickerConfig, FrontendConfig,
    GradingConfig, Groups, HClientConfig, Mode, SpeedGraderConfig, UserConfig,
};
use crate::identity::{instance_for_launch, record_user, resolve_user};
use crate::verifier::LaunchRequest;
use crate::AppState;

/// Custom parameter an LMS admin sets on a link to open the course dashboard.
const DASHBOARD_PARAM: &str = "custom_margin_dashboard";

/// Everything known about a launch once tenant, user and course are resolved.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub ai: ApplicationInstance,
    pub registration: Option<LtiRegistration>,
    pub user: LtiUser,
    pub lms_user: LmsUser,
    pub course: Grouping,
    pub resource_link_id: String,
}

fn require<'a>(params: &'a LtiParams, key: &str) -> Result<&'a str, LaunchError> {
    params
        .get(key)
        .ok_or_else(|| LaunchError::MissingClaim(key.to_string()))
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(value, Some(v) if !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
}

/// Handle a launch request and return the frontend config.
pub async fn launch(
    state: &AppState,
    repo: &dyn MarginRepository,
    req: &LaunchRequest,
) -> ApiResult<FrontendConfig> {
    let verified = req.verify(&state.verifier, repo).await?;
    let ai = instance_for_launch(&verified.application_instance, &verified.params);
    let mut params = verified.params.clone();

    // Canvas SpeedGrader relaunches carry the real resource link id in the
    // query string.
    if ai.family == Family::Canvas {
        if let Some(rlid) = req.query_param("resource_link_id").filter(|v| !v.is_empty()) {
            debug!(resource_link_id = %rlid, "using resource_link_id from the launch URL");
            params.insert("resource_link_id", rlid);
        }
    }

    let user = resolve_user(&ai, &params)?;
    let context_id = require(&params, "context_id")?;
    let resource_link_id = require(&params, "resource_link_id")?.to_string();

    let lms_user = record_user(repo, &user, state.provisioner.authority()).await?;
    let course = upsert_course(
        repo,
        &ai,
        &CourseLaunch {
            tenant_guid: &user.tenant_guid,
            context_id,
            title: params.context_title(),
            canvas_course_id: params.get("custom_canvas_course_id"),
        },
    )
    .await?;

    let ctx = LaunchContext {
        ai,
        registration: verified.registration.clone(),
        user,
        lms_user,
        course,
        resource_link_id,
    };
    info!(
        application_instance_id = ctx.ai.id,
        context_id = %ctx.course.lms_id,
        resource_link_id = %ctx.resource_link_id,
        roles = %ctx.user.roles.to_db_string(),
        version = ?verified.version,
        "launch"
    );

    if (ctx.user.is_instructor() || ctx.user.is_admin()) && is_truthy(params.get(DASHBOARD_PARAM)) {
        return dashboard_config(state, &ctx);
    }

    if ctx.user.is_learner() {
        record_grading_info(repo, state, &ctx, &params).await?;
    }

    let assignment = match find_assignment(repo, &ctx, &params).await? {
        Some(assignment) => assignment,
        None => match document_url_from_launch(req, &params) {
            Some(url) => configure_assignment(repo, &ctx, &params, &url, None).await?,
            None if ctx.user.is_instructor() || ctx.user.is_admin() => {
                return file_picker_config(state, &ctx, &params);
            }
            None => {
                return Ok(FrontendConfig::error(
                    "assignment_not_configured",
                    "This assignment has not been set up yet. An instructor must launch it first.",
                ));
            }
        },
    };

    assignment_config(state, repo, &ctx, &assignment, Some(&params)).await
}

/// The stored assignment, with its grading URLs refreshed from the launch.
async fn find_assignment(
    repo: &dyn MarginRepository,
    ctx: &LaunchContext,
    params: &LtiParams,
) -> ApiResult<Option<Assignment>> {
    let Some(assignment) = repo
        .get_assignment(&ctx.user.tenant_guid, &ctx.resource_link_id)
        .await?
    else {
        return Ok(None);
    };
    let (outcome_url, lineitem) = grading_urls(ctx, params);
    let stale = (outcome_url.is_some() && outcome_url != assignment.lis_outcome_service_url)
        || (lineitem.is_some() && lineitem != assignment.lineitem);
    if !stale {
        return Ok(Some(assignment));
    }
    let updated = repo
        .upsert_assignment(&AssignmentUpsert {
            tool_consumer_instance_guid: assignment.tool_consumer_instance_guid.clone(),
            resource_link_id: assignment.resource_link_id.clone(),
            document_url: assignment.document_url.clone(),
            title: assignment.title.clone(),
            group_set_id: assignment.group_set_id.clone(),
            lis_outcome_service_url: outcome_url.or(assignment.lis_outcome_service_url),
            lineitem: lineitem.or(assignment.lineitem),
            extra: assignment.extra.clone(),
        })
        .await?;
    Ok(Some(updated))
}

/// (v1.1 outcome service URL, v1.3 line item) carried by a launch.
fn grading_urls(ctx: &LaunchContext, params: &LtiParams) -> (Option<String>, Option<String>) {
    let url = params.get("lis_outcome_service_url").map(str::to_string);
    match ctx.registration {
        Some(_) => (None, url),
        None => (url, None),
    }
}

/// A document URL the LMS configured for this link itself: deep-linked
/// launches and SpeedGrader relaunches.
fn document_url_from_launch(req: &LaunchRequest, params: &LtiParams) -> Option<String> {
    params
        .get("url")
        .map(str::to_string)
        .or_else(|| req.query_param("url").filter(|u| !u.is_empty()))
        .or_else(|| params.get("custom_document_url").map(str::to_string))
}

pub async fn configure_assignment(
    repo: &dyn MarginRepository,
    ctx: &LaunchContext,
    params: &LtiParams,
    document_url: &str,
    group_set_id: Option<&str>,
) -> ApiResult<Assignment> {
    let (outcome_url, lineitem) = grading_urls(ctx, params);
    let mut extra = Map::new();
    if let Some(lineitems) = params.get("lineitems") {
        extra.insert("lineitems".into(), json!(lineitems));
    }
    let assignment = repo
        .upsert_assignment(&AssignmentUpsert {
            tool_consumer_instance_guid: ctx.user.tenant_guid.clone(),
            resource_link_id: ctx.resource_link_id.clone(),
            document_url: document_url.to_string(),
            title: params.get("resource_link_title").map(str::to_string),
            group_set_id: group_set_id.filter(|g| !g.is_empty()).map(str::to_string),
            lis_outcome_service_url: outcome_url,
            lineitem,
            extra,
        })
        .await?;
    info!(
        resource_link_id = %ctx.resource_link_id,
        document_url,
        "configured assignment"
    );
    Ok(assignment)
}

async fn record_grading_info(
    repo: &dyn MarginRepository,
    state: &AppState,
    ctx: &LaunchContext,
    params: &LtiParams,
) -> ApiResult<()> {
    let (Some(sourcedid), Some(outcome_url)) = (
        params.get("lis_result_sourcedid"),
        params.get("lis_outcome_service_url"),
    ) else {
        return Ok(());
    };
    repo.upsert_grading_info(&GradingInfoUpsert {
        application_instance_id: ctx.ai.id,
        context_id: ctx.course.lms_id.clone(),
        resource_link_id: ctx.resource_link_id.clone(),
        user_id: ctx.user.user_id.clone(),
        h_userid: ctx.user.h_user.userid(state.provisioner.authority()),
        display_name: Some(ctx.user.display_name.clone()),
        lis_result_sourcedid: sourcedid.to_string(),
        lis_outcome_service_url: outcome_url.to_string(),
    })
    .await?;
    Ok(())
}

fn base_config(state: &AppState, mode: Mode, user: &LtiUser) -> ApiResult<FrontendConfig> {
    Ok(FrontendConfig {
        api: Some(ApiConfig {
            auth_token: state.bearer.authorization(user)?,
            sync: None,
        }),
        user: Some(UserConfig {
            display_name: user.display_name.clone(),
            is_instructor: user.is_instructor(),
        }),
        ..FrontendConfig::new(mode)
    })
}

fn file_picker_config(
    state: &AppState,
    ctx: &LaunchContext,
    params: &LtiParams,
) -> ApiResult<FrontendConfig> {
    let plugin = plugin_for(&state.apis, &ctx.ai, &ctx.user);
    let group_sets_enabled = ctx.ai.groups_enabled() && plugin.group_type().is_some();

    let mut form_fields = Map::new();
    form_fields.insert("context_id".into(), json!(ctx.course.lms_id));
    form_fields.insert("resource_link_id".into(), json!(ctx.resource_link_id));
    for key in ["resource_link_title", "lis_outcome_service_url", "lineitems"] {
        if let Some(value) = params.get(key) {
            form_fields.insert(key.into(), json!(value));
        }
    }

    Ok(FrontendConfig {
        file_picker: Some(FilePickerConfig {
            form_action: "/api/assignment".into(),
            form_fields,
            sources: state.content.picker_config(&ctx.ai),
            group_sets_enabled,
            group_sets: group_sets_enabled.then(|| {
                api_call(
                    "GET",
                    format!("/api/courses/{}/group_sets", ctx.course.lms_id),
                    Value::Null,
                )
            }),
        }),
        ..base_config(state, Mode::FilePicker, &ctx.user)?
    })
}

fn dashboard_config(state: &AppState, ctx: &LaunchContext) -> ApiResult<FrontendConfig> {
    Ok(FrontendConfig {
        dashboard: Some(DashboardConfig {
            context_id: ctx.course.lms_id.clone(),
            course_title: ctx.course.lms_name.clone(),
            students: api_call(
                "GET",
                "/api/grading/students",
                json!({
                    "context_id": ctx.course.lms_id,
                    "resource_link_id": ctx.resource_link_id,
                }),
            ),
            group_sets: api_call(
                "GET",
                format!("/api/courses/{}/group_sets", ctx.course.lms_id),
                Value::Null,
            ),
        }),
        ..base_config(state, Mode::Dashboard, &ctx.user)?
    })
}

/// The config for a launch of a configured assignment.
///
/// `params` is the launch's own parameters; it is `None` when the config is
/// built after the assignment form was submitted.
pub async fn assignment_config(
    state: &AppState,
    repo: &dyn MarginRepository,
    ctx: &LaunchContext,
    assignment: &Assignment,
    params: Option<&LtiParams>,
) -> ApiResult<FrontendConfig> {
    let plugin = plugin_for(&state.apis, &ctx.ai, &ctx.user);
    let grouping = classify(
        plugin.as_ref(),
        &ctx.ai,
        &ctx.course,
        assignment.group_set_id.as_deref(),
    );
    let authority = state.provisioner.authority();

    let mut config = base_config(state, Mode::Launch, &ctx.user)?;
    let groups = match &grouping {
        LaunchGrouping::Course => {
            repo.upsert_grouping_membership(
                ctx.course.id,
                ctx.lms_user.id,
                &ctx.user.roles.to_db_string(),
            )
            .await?;
            let groupid = if ctx.ai.provisioning {
                state.provisioner.provision_course(&ctx.user, &ctx.course).await?
            } else {
                ctx.course.groupid(authority)
            };
            Groups::List(vec![groupid])
        }
        LaunchGrouping::Sections | LaunchGrouping::Groups { .. } => {
            if ctx.ai.provisioning {
                state.provisioner.provision_user(&ctx.user).await?;
            }
            let mut data = json!({
                "context_id": ctx.course.lms_id,
                "resource_link_id": ctx.resource_link_id,
            });
            if let LaunchGrouping::Groups { group_set_id } = &grouping {
                data["group_set_id"] = json!(group_set_id);
            }
            if let Some(learner) = params.and_then(|p| p.get("learner_canvas_user_id")) {
                data["grading_learner_id"] = json!(learner);
            }
            if let Some(api) = config.api.as_mut() {
                api.sync = Some(api_call("POST", "/api/sync", data));
            }
            Groups::rpc()
        }
    };

    config.hypothesis_client = Some(HClientConfig {
        authority: authority.to_string(),
        api_url: state.config.h.api_url.clone(),
        grant_token: state.grants.grant_token(&ctx.user.h_user)?,
        groups,
    });

    let mut content = state
        .content
        .file_display_config(&ctx.ai, &assignment.document_url)?;
    if let FileDisplayConfig::Callback(callback) = &mut content {
        if let Value::Object(data) = &mut callback.data {
            data.insert("context_id".into(), json!(ctx.course.lms_id));
        }
    }
    config.content = Some(content);

    if assignment.is_gradable() && ctx.user.is_instructor() {
        config.grading = Some(grading_config(ctx, assignment));
    }
    if let Some(params) = params.filter(|_| ctx.user.is_learner()) {
        config.canvas = speedgrader_config(state, ctx, assignment, params)?;
    }
    Ok(config)
}

fn grading_config(ctx: &LaunchContext, assignment: &Assignment) -> GradingConfig {
    let scope = json!({
        "context_id": ctx.course.lms_id,
        "resource_link_id": ctx.resource_link_id,
    });
    GradingConfig {
        enabled: true,
        assignment_name: assignment.title.clone().unwrap_or_default(),
        students: api_call("GET", "/api/grading/students", scope),
        read: api_call("POST", "/api/grading/read", Value::Null),
        record: api_call("POST", "/api/grading/record", Value::Null),
    }
}

/// The submission a Canvas learner launch records so SpeedGrader can
/// relaunch the document for grading.
fn speedgrader_config(
    state: &AppState,
    ctx: &LaunchContext,
    assignment: &Assignment,
    params: &LtiParams,
) -> ApiResult<Option<CanvasConfig>> {
    if ctx.ai.family != Family::Canvas || !assignment.is_gradable() {
        return Ok(None);
    }
    let (Some(sourcedid), Some(outcome_url)) = (
        params.get("lis_result_sourcedid"),
        params.get("lis_outcome_service_url"),
    ) else {
        return Ok(None);
    };
    let Some(learner) = params.get("custom_canvas_user_id") else {
        return Ok(None);
    };
    let mut relaunch = Url::parse(&format!("{}/lti_launches", state.public_url))
        .map_err(|e| MarginError::Config(format!("invalid public URL: {e}")))?;
    relaunch
        .query_pairs_mut()
        .append_pair("url", &assignment.document_url)
        .append_pair("learner_canvas_user_id", learner)
        .append_pair("resource_link_id", &ctx.resource_link_id);

    Ok(Some(CanvasConfig {
        speedgrader: Some(SpeedGraderConfig {
            submission: api_call(
                "POST",
                "/api/lti/submissions",
                json!({
                    "lis_result_sourcedid": sourcedid,
                    "lis_outcome_service_url": outcome_url,
                    "lti_launch_url": relaunch.to_string(),
                }),
            ),
        }),
    }))
}

/// Rebuild the launch context for an API call made by `user` after a launch.
pub async fn restore_context(
    repo: &dyn MarginRepository,
    user: &LtiUser,
    context_id: &str,
    resource_link_id: &str,
) -> ApiResult<LaunchContext> {
    let ai = load_instance(repo, user).await?;
    let registration = match ai.lti_registration_id {
        Some(id) => repo.get_lti_registration(id).await?,
        None => None,
    };
    let course = find_course(repo, user, context_id).await?;
    let lms_user = repo
        .get_lms_user(ai.id, &user.user_id)
        .await?
        .ok_or_else(|| MarginError::NotFound("user has not launched".into()))?;
    Ok(LaunchContext {
        ai,
        registration,
        user: user.clone(),
        lms_user,
        course,
        resource_link_id: resource_link_id.to_string(),
    })
}

/// The course grouping `user` launched from.
pub async fn find_course(
    repo: &dyn MarginRepository,
    user: &LtiUser,
    context_id: &str,
) -> ApiResult<Grouping> {
    let apid = authority_provided_id(&user.tenant_guid, GroupingType::Course, context_id, None);
    repo.get_grouping_by_authority_provided_id(&apid)
        .await?
        .filter(|c| c.application_instance_id == user.application_instance_id)
        .ok_or_else(|| ApiError::from(MarginError::NotFound(format!("course {context_id}"))))
}
