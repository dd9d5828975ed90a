//! Per-(tenant, user, vendor) OAuth 2 tokens with single-flight refresh.
//!
//! Some vendors invalidate a refresh token the moment it is used, so two
//! concurrent refreshes of the same token would log the user out. Refreshes
//! for one key are serialised behind a per-key mutex and every waiter
//! re-reads the row before deciding whether it still needs to refresh.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::http_service::{is_invalid_grant, OAuthHttpService, TokenEndpoint};
use crate::db::repository::OAuth2TokenRepository;
use crate::error::{MarginError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::models::oauth2_token::{OAuth2Token, TokenGrant, TokenKey};

pub struct TokenStore {
    repo: Arc<dyn OAuth2TokenRepository>,
    http: OAuthHttpService,
    refresh_locks: KeyedLocks<TokenKey>,
}

impl TokenStore {
    /// `repo` must not be bound to a request transaction: refreshed tokens
    /// have to survive a rolled back request.
    pub fn new(repo: Arc<dyn OAuth2TokenRepository>, http: OAuthHttpService) -> Self {
        Self {
            repo,
            http,
            refresh_locks: KeyedLocks::new(),
        }
    }

    pub fn http(&self) -> &OAuthHttpService {
        &self.http
    }

    /// The stored token, or [`MarginError::NoToken`].
    pub async fn get(&self, key: &TokenKey) -> Result<OAuth2Token> {
        self.repo
            .get_oauth2_token(key)
            .await?
            .ok_or(MarginError::NoToken)
    }

    /// A usable access token, refreshing first if the stored one has expired.
    pub async fn get_access_token(&self, key: &TokenKey, endpoint: &TokenEndpoint) -> Result<String> {
        let token = self.get(key).await?;
        if token.is_expired(Utc::now()) && token.refresh_token.is_some() {
            debug!(user_id = %key.user_id, service = %key.service, "access token expired");
            return self.refresh(key, &token.access_token, endpoint).await;
        }
        Ok(token.access_token)
    }

    /// Store a freshly granted token (authorization code callback).
    pub async fn save(&self, key: &TokenKey, grant: &TokenGrant) -> Result<OAuth2Token> {
        self.repo.save_oauth2_token(key, grant, Utc::now()).await
    }

    /// Replace `stale_access_token` with a new one.
    ///
    /// If another task already refreshed it while this one waited, the
    /// already-refreshed token is returned without another token call.
    pub async fn refresh(
        &self,
        key: &TokenKey,
        stale_access_token: &str,
        endpoint: &TokenEndpoint,
    ) -> Result<String> {
        self.refresh_locks
            .run(key, self.refresh_exclusive(key, stale_access_token, endpoint))
            .await
    }

    async fn refresh_exclusive(
        &self,
        key: &TokenKey,
        stale_access_token: &str,
        endpoint: &TokenEndpoint,
    ) -> Result<String> {
        let current = self.get(key).await?;
        if current.access_token != stale_access_token {
            debug!(user_id = %key.user_id, service = %key.service, "token already refreshed");
            return Ok(current.access_token);
        }
        let Some(refresh_token) = current.refresh_token else {
            return Err(MarginError::NoToken);
        };

        match self.http.refresh_access_token(endpoint, &refresh_token).await {
            Ok(grant) => {
                let saved = self.repo.save_oauth2_token(key, &grant, Utc::now()).await?;
                info!(user_id = %key.user_id, service = %key.service, "refreshed access token");
                Ok(saved.access_token)
            }
            Err(MarginError::ExternalRequest(e)) if is_invalid_grant(&e) => {
                warn!(
                    user_id = %key.user_id,
                    service = %key.service,
                    "refresh token rejected; deleting stored token"
                );
                self.repo.delete_oauth2_token(key).await?;
                Err(MarginError::NoToken)
            }
            Err(e) => Err(e),
        }
    }
}
