//! Per-vendor grouping capabilities.

use async_trait::async_trait;

use crate::error::{CodedError, GroupErrorKind, MarginError, Result};
use crate::models::family::Family;
use crate::models::grouping::{GroupSet, Grouping, GroupingType, NewGrouping};

/// What a vendor can tell us about a course's sections and groups.
///
/// Every operation returns `Ok(None)` when the vendor has no such concept;
/// callers must check.
#[async_trait]
pub trait GroupingPlugin: Send + Sync {
    fn family(&self) -> Family;

    /// Grouping type sections are stored as, if the vendor has sections.
    fn sections_type(&self) -> Option<GroupingType> {
        None
    }

    /// Grouping type groups are stored as, if the vendor has groups.
    fn group_type(&self) -> Option<GroupingType> {
        None
    }

    async fn get_sections_for_learner(&self, _course: &Grouping) -> Result<Option<Vec<NewGrouping>>> {
        Ok(None)
    }

    async fn get_sections_for_instructor(
        &self,
        _course: &Grouping,
    ) -> Result<Option<Vec<NewGrouping>>> {
        Ok(None)
    }

    async fn get_sections_for_grading(
        &self,
        _course: &Grouping,
        _learner_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        Ok(None)
    }

    async fn get_groups_for_learner(
        &self,
        _course: &Grouping,
        _group_set_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        Ok(None)
    }

    async fn get_groups_for_instructor(
        &self,
        _course: &Grouping,
        _group_set_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        Ok(None)
    }

    async fn get_groups_for_grading(
        &self,
        _course: &Grouping,
        _group_set_id: &str,
        _learner_id: &str,
    ) -> Result<Option<Vec<NewGrouping>>> {
        Ok(None)
    }

    async fn get_group_sets(&self, _course: &Grouping) -> Result<Option<Vec<GroupSet>>> {
        Ok(None)
    }
}

/// Plugin for vendors (or tenants) without section or group support.
#[derive(Debug, Clone, Copy)]
pub struct NullPlugin {
    pub family: Family,
}

#[async_trait]
impl GroupingPlugin for NullPlugin {
    fn family(&self) -> Family {
        self.family
    }
}

/// A learner must be in at least one group of the set.
pub(crate) fn require_membership(
    family: Family,
    group_set_id: &str,
    groups: Vec<NewGrouping>,
) -> Result<Option<Vec<NewGrouping>>> {
    if groups.is_empty() {
        return Err(CodedError::group(family, GroupErrorKind::StudentNotInGroup, group_set_id).into());
    }
    Ok(Some(groups))
}

/// An instructor needs the set to have at least one group.
pub(crate) fn require_groups(
    family: Family,
    group_set_id: &str,
    groups: Vec<NewGrouping>,
) -> Result<Option<Vec<NewGrouping>>> {
    if groups.is_empty() {
        return Err(CodedError::group(family, GroupErrorKind::GroupSetEmpty, group_set_id).into());
    }
    Ok(Some(groups))
}

/// Map a vendor 404 for the group set to `group_set_not_found`.
pub(crate) fn group_set_not_found_on_404(
    err: MarginError,
    family: Family,
    group_set_id: &str,
) -> MarginError {
    if err.external_status() == Some(404) {
        CodedError::group(family, GroupErrorKind::GroupSetNotFound, group_set_id).into()
    } else {
        err
    }
}
