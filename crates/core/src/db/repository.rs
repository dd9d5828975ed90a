use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{
    application_instance::{ApplicationInstance, LtiRegistration, NewApplicationInstance, Settings},
    assignment::{Assignment, AssignmentUpsert},
    file::{File, FileType, ListedFile},
    grading_info::{GradingInfo, GradingInfoUpsert},
    grouping::{Grouping, GroupingMembership, GroupingType},
    lms::{LegacyCourse, LmsCourse, LmsUser},
    oauth2_token::{JwtOAuth2Token, OAuth2Token, TokenGrant, TokenKey},
};

#[async_trait]
pub trait LtiRegistrationRepository: Send + Sync {
    async fn create_lti_registration(
        &self,
        issuer: &str,
        client_id: &str,
        auth_login_url: &str,
        key_set_url: &str,
        token_url: &str,
    ) -> Result<LtiRegistration>;
    async fn get_lti_registration(&self, id: i64) -> Result<Option<LtiRegistration>>;
    async fn find_lti_registration(
        &self,
        issuer: &str,
        client_id: &str,
    ) -> Result<Option<LtiRegistration>>;
    async fn list_lti_registrations_by_issuer(&self, issuer: &str)
        -> Result<Vec<LtiRegistration>>;
}

#[async_trait]
pub trait ApplicationInstanceRepository: Send + Sync {
    async fn create_application_instance(
        &self,
        new: &NewApplicationInstance,
    ) -> Result<ApplicationInstance>;
    async fn get_application_instance(&self, id: i64) -> Result<Option<ApplicationInstance>>;
    async fn get_application_instance_by_consumer_key(
        &self,
        consumer_key: &str,
    ) -> Result<Option<ApplicationInstance>>;
    async fn get_application_instance_by_deployment(
        &self,
        lti_registration_id: i64,
        deployment_id: &str,
    ) -> Result<Option<ApplicationInstance>>;
    async fn update_application_instance_settings(&self, id: i64, settings: &Settings)
        -> Result<()>;
    async fn count_application_instances(&self) -> Result<i64>;
}

#[async_trait]
pub trait LmsUserRepository: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn upsert_lms_user(
        &self,
        application_instance_id: i64,
        user_id: &str,
        h_userid: &str,
        display_name: Option<&str>,
        email: Option<&str>,
        roles: &str,
    ) -> Result<LmsUser>;
    async fn get_lms_user(
        &self,
        application_instance_id: i64,
        user_id: &str,
    ) -> Result<Option<LmsUser>>;
}

/// Values written when a grouping is upserted.
#[derive(Debug, Clone)]
pub struct GroupingUpsert<'a> {
    pub application_instance_id: i64,
    pub authority_provided_id: &'a str,
    pub lms_id: &'a str,
    pub lms_name: &'a str,
    pub parent_id: Option<i64>,
    pub grouping_type: GroupingType,
    /// Applied only when the row is created.
    pub settings: &'a Settings,
    /// Merged into any existing `extra`.
    pub extra: &'a Map<String, Value>,
}

#[async_trait]
pub trait GroupingRepository: Send + Sync {
    async fn upsert_grouping(&self, grouping: &GroupingUpsert<'_>) -> Result<Grouping>;
    async fn get_grouping_by_authority_provided_id(
        &self,
        authority_provided_id: &str,
    ) -> Result<Option<Grouping>>;
    async fn list_child_groupings(
        &self,
        parent_id: i64,
        grouping_type: GroupingType,
    ) -> Result<Vec<Grouping>>;
    /// Replace the `extra` map wholesale.
    async fn set_grouping_extra(&self, id: i64, extra: &Map<String, Value>) -> Result<()>;
    async fn upsert_grouping_membership(
        &self,
        grouping_id: i64,
        lms_user_id: i64,
        roles: &str,
    ) -> Result<()>;
    async fn list_grouping_memberships(&self, grouping_id: i64)
        -> Result<Vec<GroupingMembership>>;
    async fn count_groupings(&self, grouping_type: GroupingType) -> Result<i64>;
}

#[async_trait]
pub trait OAuth2TokenRepository: Send + Sync {
    async fn get_oauth2_token(&self, key: &TokenKey) -> Result<Option<OAuth2Token>>;
    async fn save_oauth2_token(
        &self,
        key: &TokenKey,
        grant: &TokenGrant,
        received_at: DateTime<Utc>,
    ) -> Result<OAuth2Token>;
    async fn delete_oauth2_token(&self, key: &TokenKey) -> Result<bool>;
}

#[async_trait]
pub trait JwtOAuth2TokenRepository: Send + Sync {
    async fn get_jwt_oauth2_token(
        &self,
        lti_registration_id: i64,
        scopes: &str,
    ) -> Result<Option<JwtOAuth2Token>>;
    async fn save_jwt_oauth2_token(&self, token: &JwtOAuth2Token) -> Result<()>;
}

#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    async fn get_assignment(
        &self,
        tool_consumer_instance_guid: &str,
        resource_link_id: &str,
    ) -> Result<Option<Assignment>>;
    async fn upsert_assignment(&self, assignment: &AssignmentUpsert) -> Result<Assignment>;
}

#[async_trait]
pub trait GradingInfoRepository: Send + Sync {
    async fn upsert_grading_info(&self, info: &GradingInfoUpsert) -> Result<()>;
    async fn list_grading_infos(
        &self,
        application_instance_id: i64,
        context_id: &str,
        resource_link_id: &str,
    ) -> Result<Vec<GradingInfo>>;
}

#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn upsert_files(
        &self,
        application_instance_id: i64,
        file_type: FileType,
        course_id: &str,
        files: &[ListedFile],
    ) -> Result<()>;
    /// Any stored file with this LMS id, regardless of course.
    async fn find_file(
        &self,
        application_instance_id: i64,
        file_type: FileType,
        lms_id: &str,
    ) -> Result<Option<File>>;
    async fn find_file_by_name_and_size(
        &self,
        application_instance_id: i64,
        file_type: FileType,
        course_id: &str,
        name: &str,
        size: Option<i64>,
    ) -> Result<Option<File>>;
}

#[async_trait]
pub trait LmsCourseRepository: Send + Sync {
    async fn upsert_lms_course(
        &self,
        tool_consumer_instance_guid: &str,
        context_id: &str,
        name: &str,
        h_authority_provided_id: &str,
    ) -> Result<LmsCourse>;
    async fn count_lms_courses(&self) -> Result<i64>;
}

#[async_trait]
pub trait LegacyCourseRepository: Send + Sync {
    async fn get_legacy_course(&self, authority_provided_id: &str)
        -> Result<Option<LegacyCourse>>;
    async fn upsert_legacy_course(&self, course: &LegacyCourse) -> Result<()>;
}

/// Combined repository trait for all entity types.
pub trait MarginRepository:
    LtiRegistrationRepository
    + ApplicationInstanceRepository
    + LmsUserRepository
    + GroupingRepository
    + OAuth2TokenRepository
    + JwtOAuth2TokenRepository
    + AssignmentRepository
    + GradingInfoRepository
    + FileRepository
    + LmsCourseRepository
    + LegacyCourseRepository
{
}
