//! Who launched, from where: the LMS family and the launching user.

use tracing::debug;

use margin_core::db::repository::MarginRepository;
use margin_core::error::Result;
use margin_core::models::application_instance::ApplicationInstance;
use margin_core::models::family::Family;
use margin_core::models::h_user::HUser;
use margin_core::models::lms::LmsUser;
use margin_core::models::lti_params::LtiParams;
use margin_core::models::lti_user::{LtiUser, Roles};

use crate::error::LaunchError;

/// The LMS family a launch came from.
///
/// Checked in order: an explicit `custom_lms_family`, the product family
/// code, Canvas's course id custom parameter, then the instance guid.
pub fn detect_family(params: &LtiParams) -> Family {
    for key in ["custom_lms_family", "tool_consumer_info_product_family_code"] {
        if let Some(value) = params.get(key) {
            let family = Family::parse(value);
            if family != Family::Unknown {
                return family;
            }
        }
    }
    if params.get("custom_canvas_course_id").is_some() {
        return Family::Canvas;
    }
    params
        .tool_consumer_instance_guid()
        .map(Family::from_instance_guid)
        .unwrap_or_default()
}

/// The tenant as seen by this launch. A tenant registered without a family
/// takes the one the launch reports.
pub fn instance_for_launch(ai: &ApplicationInstance, params: &LtiParams) -> ApplicationInstance {
    let mut ai = ai.clone();
    if ai.family == Family::Unknown {
        ai.family = detect_family(params);
        debug!(application_instance_id = ai.id, family = %ai.family, "detected LMS family");
    }
    ai
}

/// Build the launching user from verified launch parameters.
pub fn resolve_user(ai: &ApplicationInstance, params: &LtiParams) -> std::result::Result<LtiUser, LaunchError> {
    let user_id = params
        .user_id()
        .ok_or_else(|| LaunchError::MissingClaim("user_id".into()))?;
    let tenant_guid = ai.tenant_guid(params.tool_consumer_instance_guid());
    let display_name = params.display_name();
    let lms_user_id = match ai.family {
        Family::Canvas => params.get("custom_canvas_user_id").map(str::to_string),
        _ => None,
    };
    Ok(LtiUser {
        h_user: HUser::derive(&tenant_guid, user_id, &display_name),
        user_id: user_id.to_string(),
        display_name,
        email: params.email().map(str::to_string),
        roles: Roles::parse(params.roles()),
        application_instance_id: ai.id,
        tenant_guid,
        lms_user_id,
    })
}

/// Record the user's `lms_user` mirror row.
pub async fn record_user(
    repo: &dyn MarginRepository,
    user: &LtiUser,
    authority: &str,
) -> Result<LmsUser> {
    repo.upsert_lms_user(
        user.application_instance_id,
        &user.user_id,
        &user.h_user.userid(authority),
        Some(&user.display_name),
        user.email.as_deref(),
        &user.roles.to_db_string(),
    )
    .await
}
