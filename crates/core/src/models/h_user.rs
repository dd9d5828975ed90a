//! The annotation-service identity of an LMS user.

use serde::{Deserialize, Serialize};

use crate::crypto::sha1_hex;

/// Longest username the annotation service accepts.
pub const USERNAME_MAX_LEN: usize = 30;
/// Longest display name the annotation service accepts.
pub const DISPLAY_NAME_MAX_LEN: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HUser {
    pub username: String,
    pub display_name: String,
    /// The tenant guid.
    pub provider: String,
    /// The LMS user id.
    pub provider_unique_id: String,
}

impl HUser {
    /// Derive the identity for `user_id` within the tenant `tenant_guid`.
    pub fn derive(tenant_guid: &str, user_id: &str, display_name: &str) -> Self {
        let mut username = sha1_hex(&[tenant_guid, user_id]);
        username.truncate(USERNAME_MAX_LEN);
        Self {
            username,
            display_name: truncate_display_name(display_name),
            provider: tenant_guid.to_string(),
            provider_unique_id: user_id.to_string(),
        }
    }

    /// `acct:{username}@{authority}`.
    pub fn userid(&self, authority: &str) -> String {
        format!("acct:{}@{}", self.username, authority)
    }
}

fn truncate_display_name(name: &str) -> String {
    let name = name.trim();
    if name.chars().count() <= DISPLAY_NAME_MAX_LEN {
        return name.to_string();
    }
    let mut out: String = name.chars().take(DISPLAY_NAME_MAX_LEN - 1).collect();
    out.push('…');
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::lti_user::{LtiUser, Roles};

    pub(crate) fn sample_lti_user(roles: Roles) -> LtiUser {
        LtiUser {
            user_id: "user-1".into(),
            display_name: "Jane Doe".into(),
            email: Some("jane@example.com".into()),
            roles,
            application_instance_id: 1,
            tenant_guid: "G".into(),
            h_user: HUser::derive("G", "user-1", "Jane Doe"),
            lms_user_id: None,
        }
    }

    #[test]
    fn username_is_deterministic_and_truncated() {
        let a = HUser::derive("G", "user-1", "Jane");
        let b = HUser::derive("G", "user-1", "Someone Else");
        assert_eq!(a.username, b.username);
        assert_eq!(a.username.len(), USERNAME_MAX_LEN);
        assert_eq!(a.username, sha1_hex(&["G", "user-1"])[..30]);
    }

    #[test]
    fn username_differs_across_tenants() {
        assert_ne!(
            HUser::derive("G1", "u", "x").username,
            HUser::derive("G2", "u", "x").username
        );
    }

    #[test]
    fn userid_format() {
        let u = HUser::derive("G", "user-1", "Jane");
        assert_eq!(
            u.userid("lms.example.com"),
            format!("acct:{}@lms.example.com", u.username)
        );
    }

    #[test]
    fn long_display_names_are_truncated() {
        let u = HUser::derive("G", "u", &"x".repeat(50));
        assert_eq!(u.display_name.chars().count(), DISPLAY_NAME_MAX_LEN);
        assert!(u.display_name.ends_with('…'));
    }
}
