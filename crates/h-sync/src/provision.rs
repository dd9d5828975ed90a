//! Launch-time provisioning: user, then group, then membership.
//!
//! Each step depends on the previous one having succeeded, so steps run
//! strictly in order and the first failure stops the rest.

use tracing::info;

use margin_core::error::Result;
use margin_core::models::grouping::Grouping;
use margin_core::models::lti_user::LtiUser;

use crate::client::HClient;

#[derive(Debug, Clone)]
pub struct Provisioner {
    client: HClient,
}

impl Provisioner {
    pub fn new(client: HClient) -> Self {
        Self { client }
    }

    pub fn authority(&self) -> &str {
        self.client.authority()
    }

    /// Create or update the user alone. Launches whose groups are resolved
    /// by a later sync call only need this much up front.
    pub async fn provision_user(&self, user: &LtiUser) -> Result<()> {
        self.client.upsert_user(&user.h_user).await
    }

    /// Provision the launching user into the course group and return its
    /// annotation group id.
    ///
    /// Only instructors may create a course group; anyone else launching
    /// before it exists gets `InstructorLaunchRequired`.
    pub async fn provision_course(&self, user: &LtiUser, course: &Grouping) -> Result<String> {
        self.client.upsert_user(&user.h_user).await?;

        let groupid = course.groupid(self.authority());
        let creator = user.is_instructor().then_some(&user.h_user);
        self.client
            .upsert_group(&groupid, &course.lms_name, creator)
            .await?;
        self.client.add_member(&groupid, &user.h_user).await?;

        info!(
            userid = %user.h_user.userid(self.authority()),
            groupid = %groupid,
            "provisioned course launch"
        );
        Ok(groupid)
    }

    /// Provision the user into section or group groupings resolved by a
    /// sync call. The user is their own creator here: the course exists.
    pub async fn provision_groupings(
        &self,
        user: &LtiUser,
        groupings: &[Grouping],
    ) -> Result<Vec<String>> {
        self.client.upsert_user(&user.h_user).await?;

        let mut groupids = Vec::with_capacity(groupings.len());
        for grouping in groupings {
            let groupid = grouping.groupid(self.authority());
            self.client
                .upsert_group(&groupid, &grouping.lms_name, Some(&user.h_user))
                .await?;
            self.client.add_member(&groupid, &user.h_user).await?;
            groupids.push(groupid);
        }
        info!(
            userid = %user.h_user.userid(self.authority()),
            groups = groupids.len(),
            "provisioned groupings"
        );
        Ok(groupids)
    }
}
