use async_trait::async_trait;

use super::plugin::{require_groups, require_membership, GroupingPlugin};
use crate::connectors::moodle::MoodleApi;
use crate::error::{CodedError, GroupErrorKind, Result};
use crate::models::family::Family;
use crate::models::grouping::{GroupSet, Grouping, GroupingType, NewGrouping};

/// Moodle groupings (group sets) and groups.
pub struct MoodleGroupingPlugin {
    api: MoodleApi,
    user_id: String,
}

impl MoodleGroupingPlugin {
    pub fn new(api: MoodleApi, user_id: impl Into<String>) -> Self {
        Self {
            api,
            user_id: user_id.into(),
        }
    }

    async fn member_groups(
        &self,
        course: &Grouping,
        group_set_id: &str,
        user_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        let groups = self
            .api
            .user_groups(&course.lms_id, group_set_id, user_id)
            .await?;
        require_membership(
            Family::Moodle,
            group_set_id,
            groups
                .into_iter()
                .map(|g| g.into_grouping(group_set_id))
                .collect(),
        )
    }
}

#[async_trait]
impl GroupingPlugin for MoodleGroupingPlugin {
    fn family(&self) -> Family {
        Family::Moodle
    }

    fn group_type(&self) -> Option<GroupingType> {
        Some(GroupingType::MoodleGroup)
    }

    async fn get_groups_for_learner(
        &self,
        course: &Grouping,
        group_set_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        self.member_groups(course, group_set_id, &self.user_id).await
    }

    async fn get_groups_for_instructor(
        &self,
        _course: &Grouping,
        group_set_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        let Some(groups) = self.api.group_set_groups(group_set_id).await? else {
            return Err(
                CodedError::group(Family::Moodle, GroupErrorKind::GroupSetNotFound, group_set_id)
                    .into(),
            );
        };
        require_groups(
            Family::Moodle,
            group_set_id,
            groups
                .into_iter()
                .map(|g| g.into_grouping(group_set_id))
                .collect(),
        )
    }

    async fn get_groups_for_grading(
        &self,
        course: &Grouping,
        group_set_id: &str,
        learner_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        self.member_groups(course, group_set_id, learner_id).await
    }

    async fn get_group_sets(&self, course: &Grouping) -> Result<Option<Vec<GroupSet>>> {
        Ok(Some(self.api.course_group_sets(&course.lms_id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MarginError;
    use crate::grouping::tests::sample_course;
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plugin(server: &MockServer) -> MoodleGroupingPlugin {
        MoodleGroupingPlugin::new(
            MoodleApi::new(reqwest::Client::new(), &server.uri(), "tok"),
            "7",
        )
    }

    #[tokio::test]
    async fn instructor_gets_grouping_groups() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("wsfunction", "core_group_get_groupings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 3, "name": "Projects", "groups": [{"id": 10, "name": "Team A"}]}
            ])))
            .mount(&server)
            .await;

        let groups = plugin(&server)
            .get_groups_for_instructor(&sample_course(), "3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(groups, vec![NewGrouping::new("10", "Team A").with_group_set("3")]);
    }

    #[tokio::test]
    async fn missing_grouping_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("wsfunction", "core_group_get_groupings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let err = plugin(&server)
            .get_groups_for_instructor(&sample_course(), "3")
            .await
            .unwrap_err();
        assert!(matches!(err, MarginError::Coded(e) if e.error_code.as_str() == "moodle_group_set_not_found"));
    }

    #[tokio::test]
    async fn learner_groups_use_own_user_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("wsfunction", "core_group_get_course_user_groups"))
            .and(query_param("userid", "7"))
            .and(query_param("courseid", "C"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "groups": [{"id": 10, "name": "Team A"}],
                "warnings": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let groups = plugin(&server)
            .get_groups_for_learner(&sample_course(), "3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(groups.len(), 1);
    }
}
