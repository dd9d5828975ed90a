//! Typed reqwest wrapper for the annotation service's admin API.
//!
//! Every call authenticates with the installation's client credentials over
//! HTTP Basic. Calls made on behalf of a user add `X-Forwarded-User`.

use reqwest::{Method, StatusCode};
use serde::Serialize;
use tracing::{debug, info};

use margin_core::config::{HConfig, HttpConfig};
use margin_core::error::{ExternalRequestError, MarginError, Result};
use margin_core::http::client_with_deadline;
use margin_core::models::grouping::truncate_group_name;
use margin_core::models::h_user::HUser;

use crate::models::{CreateGroup, CreateUser, UpdateGroup, UpdateUser};

const FORWARDED_USER: &str = "X-Forwarded-User";

/// HTTP client for annotation service admin operations.
#[derive(Debug, Clone)]
pub struct HClient {
    http: reqwest::Client,
    api_url: String,
    authority: String,
    client_id: String,
    client_secret: String,
}

impl HClient {
    /// Build a client with the `[http]` annotation service deadline.
    pub fn new(config: &HConfig, http: &HttpConfig) -> Result<Self> {
        Ok(Self::with_client(
            client_with_deadline(http, http.h_timeout_secs)?,
            config,
        ))
    }

    pub fn with_client(http: reqwest::Client, config: &HConfig) -> Self {
        Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            authority: config.authority.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Send one request. `Ok(None)` means the target does not exist (404).
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        forwarded_user: Option<&str>,
    ) -> Result<Option<StatusCode>> {
        let url = format!("{}/{}", self.api_url, path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.client_id, Some(&self.client_secret));
        if let Some(userid) = forwarded_user {
            req = req.header(FORWARDED_USER, userid);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExternalRequestError::from_transport(method.as_str(), &url, &e))?;
        let status = resp.status();
        debug!(method = %method, url = %url, status = status.as_u16(), "annotation service call");
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ExternalRequestError::new("Annotation service request failed")
                .with_request(method.as_str(), &url)
                .with_response(status.as_u16(), status.canonical_reason(), &text)
                .into());
        }
        Ok(Some(status))
    }

    fn not_found(method: &str, url: &str) -> MarginError {
        ExternalRequestError::new("Annotation service returned 404")
            .with_request(method, url)
            .with_response(404, Some("Not Found"), "")
            .into()
    }

    /// Update the user's display name, creating the user if it is new.
    pub async fn upsert_user(&self, user: &HUser) -> Result<()> {
        let userid = user.userid(&self.authority);
        let patched = self
            .send(
                Method::PATCH,
                &format!("users/{userid}"),
                Some(&UpdateUser {
                    display_name: user.display_name.clone(),
                }),
                None,
            )
            .await?;
        if patched.is_some() {
            return Ok(());
        }

        self.send(
            Method::POST,
            "users",
            Some(&CreateUser::new(user, &self.authority)),
            None,
        )
        .await?
        .ok_or_else(|| Self::not_found("POST", "users"))?;
        info!(userid = %userid, "created annotation user");
        Ok(())
    }

    /// Rename the group, creating it owned by `creator` if it is new.
    ///
    /// Without a creator a missing group cannot be created and
    /// [`MarginError::InstructorLaunchRequired`] is returned.
    pub async fn upsert_group(&self, groupid: &str, name: &str, creator: Option<&HUser>) -> Result<()> {
        let name = truncate_group_name(name);
        let patched = self
            .send(
                Method::PATCH,
                &format!("groups/{groupid}"),
                Some(&UpdateGroup { name: name.clone() }),
                None,
            )
            .await?;
        if patched.is_some() {
            return Ok(());
        }

        let Some(creator) = creator else {
            return Err(MarginError::InstructorLaunchRequired);
        };
        let path = format!("groups/{groupid}");
        self.send(
            Method::PUT,
            &path,
            Some(&CreateGroup {
                groupid: groupid.to_string(),
                name,
            }),
            Some(&creator.userid(&self.authority)),
        )
        .await?
        .ok_or_else(|| Self::not_found("PUT", &path))?;
        info!(groupid, "created annotation group");
        Ok(())
    }

    /// Add the user to the group. The service ignores repeat adds.
    pub async fn add_member(&self, groupid: &str, user: &HUser) -> Result<()> {
        let path = format!("groups/{groupid}/members/{}", user.userid(&self.authority));
        self.send::<()>(Method::POST, &path, None, None)
            .await?
            .ok_or_else(|| Self::not_found("POST", &path))?;
        Ok(())
    }
}
