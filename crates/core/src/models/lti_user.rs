//! The launching user, derived from launch claims on every request.

use serde::{Deserialize, Serialize};

use super::h_user::HUser;

/// Role bitmask. LMSes send role lists in several vocabularies; only the
/// distinctions the tool acts on are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roles(u8);

impl Roles {
    pub const NONE: Roles = Roles(0);
    pub const LEARNER: Roles = Roles(1);
    pub const INSTRUCTOR: Roles = Roles(1 << 1);
    pub const ADMIN: Roles = Roles(1 << 2);
    pub const TA: Roles = Roles(1 << 3);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Roles) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Roles) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Roles) {
        self.0 |= other.0;
    }

    /// Parse a comma separated v1.1 role string or the joined v1.3 role URIs.
    ///
    /// Accepts bare names (`Instructor`), URNs
    /// (`urn:lti:role:ims/lis/TeachingAssistant`) and URIs
    /// (`http://purl.imsglobal.org/vocab/lis/v2/membership#Learner`).
    pub fn parse(roles: &str) -> Self {
        let mut out = Roles::NONE;
        for role in roles.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let name = role
                .rsplit(['#', '/', ':'])
                .next()
                .unwrap_or(role)
                .to_ascii_lowercase();
            match name.as_str() {
                "learner" | "student" => out.insert(Roles::LEARNER),
                "instructor" | "teacher" | "faculty" | "contentdeveloper" => {
                    out.insert(Roles::INSTRUCTOR)
                }
                "administrator" | "sysadmin" => out.insert(Roles::ADMIN),
                "teachingassistant" => out.insert(Roles::TA),
                _ => {}
            }
        }
        out
    }

    /// Role string persisted on memberships and LMS users.
    pub fn to_db_string(self) -> String {
        let mut names = Vec::new();
        if self.contains(Roles::LEARNER) {
            names.push("Learner");
        }
        if self.contains(Roles::INSTRUCTOR) {
            names.push("Instructor");
        }
        if self.contains(Roles::ADMIN) {
            names.push("Administrator");
        }
        if self.contains(Roles::TA) {
            names.push("TeachingAssistant");
        }
        names.join(",")
    }
}

impl std::ops::BitOr for Roles {
    type Output = Roles;

    fn bitor(self, rhs: Roles) -> Roles {
        Roles(self.0 | rhs.0)
    }
}

/// A non-persistent view of the launching user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LtiUser {
    /// Vendor-scoped user id (`user_id` / `sub`).
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub roles: Roles,
    pub application_instance_id: i64,
    /// Tenant guid used to derive annotation-service ids.
    pub tenant_guid: String,
    pub h_user: HUser,
    /// Vendor-specific ids that the LMS APIs key users by (e.g. Canvas's
    /// numeric `custom_canvas_user_id`).
    #[serde(default)]
    pub lms_user_id: Option<String>,
}

impl LtiUser {
    pub fn is_instructor(&self) -> bool {
        self.roles.intersects(Roles::INSTRUCTOR | Roles::TA)
    }

    pub fn is_learner(&self) -> bool {
        self.roles.contains(Roles::LEARNER) && !self.is_instructor()
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(Roles::ADMIN)
    }

    /// The id the LMS REST API uses for this user.
    pub fn api_user_id(&self) -> &str {
        self.lms_user_id.as_deref().unwrap_or(&self.user_id)
    }
}
