//! JSTOR articles, `jstor://{article id}`.
//!
//! Articles are fetched through the JSTOR PDF proxy, which needs a short
//! lived token naming the tenant's JSTOR site code.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};

use super::via::ViaUrlBuilder;
use super::{ContentSource, FileDisplayConfig};
use crate::config::JstorConfig;
use crate::error::{MarginError, Result};
use crate::models::application_instance::ApplicationInstance;

const SCHEME: &str = "jstor://";

#[derive(Debug, Serialize)]
struct JstorClaims<'a> {
    site_code: &'a str,
    exp: i64,
}

pub struct JstorSource {
    api_url: Option<String>,
    secret: Option<String>,
    enabled: bool,
    via: ViaUrlBuilder,
}

impl JstorSource {
    pub fn new(config: &JstorConfig, via: ViaUrlBuilder) -> Self {
        Self {
            api_url: config.api_url.as_ref().map(|u| u.trim_end_matches('/').to_string()),
            secret: config.secret.clone(),
            enabled: config.enabled,
            via,
        }
    }

    pub fn article_id(document_url: &str) -> Result<&str> {
        document_url
            .strip_prefix(SCHEME)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| MarginError::Validation(format!("invalid JSTOR URL: {document_url}")))
    }

    /// Via URL for an article, authorised for the tenant's site code.
    pub fn via_url(&self, ai: &ApplicationInstance, document_url: &str) -> Result<String> {
        let article_id = Self::article_id(document_url)?;
        let (Some(api_url), Some(secret)) = (&self.api_url, &self.secret) else {
            return Err(MarginError::Config("JSTOR API is not configured".into()));
        };
        let site_code = ai
            .settings
            .get_str("jstor", "site_code")
            .ok_or_else(|| MarginError::Config(format!("tenant {} has no JSTOR site code", ai.id)))?;

        let token = encode(
            &Header::default(),
            &JstorClaims {
                site_code,
                exp: (Utc::now() + Duration::minutes(5)).timestamp(),
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| MarginError::Crypto(format!("failed to sign JSTOR token: {e}")))?;

        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        self.via.build(
            &format!("{api_url}/pdf/{}", urlencoding::encode(article_id)),
            Some("pdf"),
            Some(&headers),
        )
    }
}

impl ContentSource for JstorSource {
    fn url_scheme(&self) -> &'static str {
        SCHEME
    }

    fn is_enabled(&self, ai: &ApplicationInstance) -> bool {
        self.enabled
            && self.api_url.is_some()
            && ai.settings.get_bool("jstor", "enabled")
            && ai.settings.get_str("jstor", "site_code").is_some()
    }

    fn picker_config(&self, ai: &ApplicationInstance) -> Value {
        json!({ "enabled": self.is_enabled(ai) })
    }

    fn file_display_config(&self, document_url: &str) -> Result<FileDisplayConfig> {
        Self::article_id(document_url)?;
        Ok(FileDisplayConfig::callback(
            "/api/jstor/via_url",
            json!({ "document_url": document_url }),
        ))
    }
}
