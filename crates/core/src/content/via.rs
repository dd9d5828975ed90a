//! URLs that open a document through Via, the annotation service's proxy.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::HConfig;
use crate::crypto::SecretBox;
use crate::error::{MarginError, Result};

/// How long a Via URL stays valid.
const VIA_URL_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Serialize)]
struct ViaClaims {
    exp: i64,
}

/// Builds signed Via URLs.
#[derive(Clone)]
pub struct ViaUrlBuilder {
    via_url: String,
    secret: String,
}

impl ViaUrlBuilder {
    pub fn new(config: &HConfig) -> Self {
        Self {
            via_url: config.via_url.trim_end_matches('/').to_string(),
            secret: config.via_secret.clone(),
        }
    }

    /// A Via URL for `document_url`.
    ///
    /// `content_type` forces Via's viewer (`pdf` or `html`). Headers in
    /// `headers` are sent by Via when it fetches the document; they are
    /// encrypted under a key derived from the shared Via secret.
    pub fn build(
        &self,
        document_url: &str,
        content_type: Option<&str>,
        headers: Option<&BTreeMap<String, String>>,
    ) -> Result<String> {
        let mut url = Url::parse(&format!("{}/route", self.via_url))
            .map_err(|e| MarginError::Config(format!("invalid Via URL {}: {e}", self.via_url)))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("url", document_url);
            q.append_pair("via.client.openSidebar", "1");
            q.append_pair("via.client.requestConfigFromFrame.ancestorLevel", "2");
            q.append_pair("via.external_link_mode", "new-tab");
            if let Some(content_type) = content_type {
                q.append_pair("via.content_type", content_type);
            }
            if let Some(headers) = headers.filter(|h| !h.is_empty()) {
                let json = serde_json::to_string(headers)?;
                q.append_pair("via.secret.headers", &self.header_box().seal_token(&json)?);
            }
            q.append_pair("via.sec", &self.sign()?);
        }
        Ok(url.into())
    }

    fn sign(&self) -> Result<String> {
        let claims = ViaClaims {
            exp: (Utc::now() + Duration::seconds(VIA_URL_LIFETIME_SECS)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| MarginError::Crypto(format!("failed to sign Via URL: {e}")))
    }

    fn header_box(&self) -> SecretBox {
        let digest = Sha256::digest(self.secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        SecretBox::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    fn builder() -> ViaUrlBuilder {
        ViaUrlBuilder::new(&HConfig {
            via_url: "https://via.example.com/".into(),
            via_secret: "via-secret".into(),
            ..Default::default()
        })
    }

    fn param(url: &str, key: &str) -> Option<String> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn wraps_document_url() {
        let url = builder()
            .build("https://example.com/paper.pdf?a=1&b=2", Some("pdf"), None)
            .unwrap();
        assert!(url.starts_with("https://via.example.com/route?"));
        assert_eq!(
            param(&url, "url").as_deref(),
            Some("https://example.com/paper.pdf?a=1&b=2")
        );
        assert_eq!(param(&url, "via.content_type").as_deref(), Some("pdf"));
        assert!(param(&url, "via.secret.headers").is_none());
    }

    #[test]
    fn signature_verifies_with_shared_secret() {
        let url = builder().build("https://example.com/", None, None).unwrap();
        let token = param(&url, "via.sec").unwrap();
        let data = decode::<serde_json::Value>(
            &token,
            &DecodingKey::from_secret(b"via-secret"),
            &Validation::default(),
        )
        .unwrap();
        assert!(data.claims["exp"].as_i64().unwrap() > Utc::now().timestamp());
    }

    #[test]
    fn headers_are_encrypted() {
        let b = builder();
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer tok".to_string());
        let url = b.build("https://lms.example.com/file", None, Some(&headers)).unwrap();
        let sealed = param(&url, "via.secret.headers").unwrap();
        assert!(!sealed.contains("tok"));
        let opened = b.header_box().open_token(&sealed).unwrap();
        assert_eq!(opened, r#"{"Authorization":"Bearer tok"}"#);
    }
}
