use async_trait::async_trait;

use super::plugin::{group_set_not_found_on_404, require_groups, require_membership, GroupingPlugin};
use crate::connectors::canvas::CanvasApi;
use crate::course::course_api_id;
use crate::error::Result;
use crate::models::family::Family;
use crate::models::grouping::{GroupSet, Grouping, GroupingType, NewGrouping};

/// Canvas sections and group categories, through the launching user's token.
pub struct CanvasGroupingPlugin {
    api: CanvasApi,
    sections_enabled: bool,
}

impl CanvasGroupingPlugin {
    pub fn new(api: CanvasApi, sections_enabled: bool) -> Self {
        Self {
            api,
            sections_enabled,
        }
    }

    fn sections<T: Into<NewGrouping>>(items: Vec<T>) -> Option<Vec<NewGrouping>> {
        Some(items.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl GroupingPlugin for CanvasGroupingPlugin {
    fn family(&self) -> Family {
        Family::Canvas
    }

    fn sections_type(&self) -> Option<GroupingType> {
        self.sections_enabled.then_some(GroupingType::CanvasSection)
    }

    fn group_type(&self) -> Option<GroupingType> {
        Some(GroupingType::CanvasGroup)
    }

    async fn get_sections_for_learner(&self, course: &Grouping) -> Result<Option<Vec<NewGrouping>>> {
        if !self.sections_enabled {
            return Ok(None);
        }
        let course_id = course_api_id(course, Family::Canvas);
        Ok(Self::sections(
            self.api.authenticated_users_sections(&course_id).await?,
        ))
    }

    async fn get_sections_for_instructor(
        &self,
        course: &Grouping,
    ) -> Result<Option<Vec<NewGrouping>>> {
        if !self.sections_enabled {
            return Ok(None);
        }
        let course_id = course_api_id(course, Family::Canvas);
        Ok(Self::sections(self.api.course_sections(&course_id).await?))
    }

    async fn get_sections_for_grading(
        &self,
        course: &Grouping,
        learner_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        if !self.sections_enabled {
            return Ok(None);
        }
        let course_id = course_api_id(course, Family::Canvas);
        Ok(Self::sections(
            self.api.users_sections(learner_id, &course_id).await?,
        ))
    }

    async fn get_groups_for_learner(
        &self,
        course: &Grouping,
        group_set_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        let course_id = course_api_id(course, Family::Canvas);
        let groups = self
            .api
            .current_user_groups(&course_id, group_set_id)
            .await?;
        require_membership(
            Family::Canvas,
            group_set_id,
            groups.into_iter().map(Into::into).collect(),
        )
    }

    async fn get_groups_for_instructor(
        &self,
        _course: &Grouping,
        group_set_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        let groups = self
            .api
            .group_category_groups(group_set_id)
            .await
            .map_err(|e| group_set_not_found_on_404(e, Family::Canvas, group_set_id))?;
        require_groups(
            Family::Canvas,
            group_set_id,
            groups.into_iter().map(Into::into).collect(),
        )
    }

    async fn get_groups_for_grading(
        &self,
        _course: &Grouping,
        group_set_id: &str,
        learner_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        let groups = self
            .api
            .user_groups(learner_id, group_set_id)
            .await
            .map_err(|e| group_set_not_found_on_404(e, Family::Canvas, group_set_id))?;
        require_membership(
            Family::Canvas,
            group_set_id,
            groups.into_iter().map(Into::into).collect(),
        )
    }

    async fn get_group_sets(&self, course: &Grouping) -> Result<Option<Vec<GroupSet>>> {
        let course_id = course_api_id(course, Family::Canvas);
        Ok(Some(self.api.course_group_categories(&course_id).await?))
    }
}
