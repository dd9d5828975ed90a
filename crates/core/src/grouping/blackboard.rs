use async_trait::async_trait;

use super::plugin::{group_set_not_found_on_404, require_groups, require_membership, GroupingPlugin};
use crate::connectors::blackboard::BlackboardApi;
use crate::error::Result;
use crate::models::family::Family;
use crate::models::grouping::{GroupSet, Grouping, GroupingType, NewGrouping};

/// Blackboard group sets. Blackboard courses have no sections.
pub struct BlackboardGroupingPlugin {
    api: BlackboardApi,
}

impl BlackboardGroupingPlugin {
    pub fn new(api: BlackboardApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl GroupingPlugin for BlackboardGroupingPlugin {
    fn family(&self) -> Family {
        Family::Blackboard
    }

    fn group_type(&self) -> Option<GroupingType> {
        Some(GroupingType::BlackboardGroup)
    }

    async fn get_groups_for_learner(
        &self,
        course: &Grouping,
        group_set_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        let groups = self
            .api
            .current_user_groups(&course.lms_id, group_set_id)
            .await?;
        require_membership(
            Family::Blackboard,
            group_set_id,
            groups.into_iter().map(Into::into).collect(),
        )
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
            .map_err(|e| group_set_not_found_on_404(e, Family::Blackboard, group_set_id))?;
        require_groups(
            Family::Blackboard,
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
        let groups = self
            .api
            .user_groups(&course.lms_id, group_set_id, learner_id)
            .await
            .map_err(|e| group_set_not_found_on_404(e, Family::Blackboard, group_set_id))?;
        require_membership(
            Family::Blackboard,
            group_set_id,
            groups.into_iter().map(Into::into).collect(),
        )
    }

    async fn get_group_sets(&self, course: &Grouping) -> Result<Option<Vec<GroupSet>>> {
        Ok(Some(self.api.course_group_sets(&course.lms_id).await?))
    }
}
