//! Request bodies for the annotation service's admin API.

use serde::{Deserialize, Serialize};

use margin_core::models::h_user::HUser;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub provider: String,
    pub provider_unique_id: String,
}

/// `POST /users`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateUser {
    pub authority: String,
    pub username: String,
    pub display_name: String,
    pub identities: Vec<Identity>,
}

impl CreateUser {
    pub fn new(user: &HUser, authority: &str) -> Self {
        Self {
            authority: authority.to_string(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            identities: vec![Identity {
                provider: user.provider.clone(),
                provider_unique_id: user.provider_unique_id.clone(),
            }],
        }
    }
}

/// `PATCH /users/{userid}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateUser {
    pub display_name: String,
}

/// `PATCH /groups/{groupid}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateGroup {
    pub name: String,
}

/// `PUT /groups/{groupid}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateGroup {
    pub groupid: String,
    pub name: String,
}
