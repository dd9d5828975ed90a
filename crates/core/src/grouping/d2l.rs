use async_trait::async_trait;

use super::plugin::{group_set_not_found_on_404, require_groups, require_membership, GroupingPlugin};
use crate::connectors::d2l::D2lApi;
use crate::error::Result;
use crate::models::family::Family;
use crate::models::grouping::{GroupSet, Grouping, GroupingType, NewGrouping};

/// D2L group categories. The course's org unit id is its `context_id`.
pub struct D2lGroupingPlugin {
    api: D2lApi,
    /// LTI user id of the launching user.
    user_id: String,
}

impl D2lGroupingPlugin {
    pub fn new(api: D2lApi, user_id: impl Into<String>) -> Self {
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
            .await
            .map_err(|e| group_set_not_found_on_404(e, Family::D2L, group_set_id))?;
        require_membership(
            Family::D2L,
            group_set_id,
            groups.into_iter().map(Into::into).collect(),
        )
    }
}

#[async_trait]
impl GroupingPlugin for D2lGroupingPlugin {
    fn family(&self) -> Family {
        Family::D2L
    }

    fn group_type(&self) -> Option<GroupingType> {
        Some(GroupingType::D2lGroup)
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
        course: &Grouping,
        group_set_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        let groups = self
            .api
            .group_set_groups(&course.lms_id, group_set_id)
            .await
            .map_err(|e| group_set_not_found_on_404(e, Family::D2L, group_set_id))?;
        require_groups(
            Family::D2L,
            group_set_id,
            groups.into_iter().map(Into::into).collect(),
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
