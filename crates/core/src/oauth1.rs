//! OAuth 1.0a HMAC-SHA1 request signing (RFC 5849), as used by LTI 1.1
//! launches and outcome requests.

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use url::Url;

use crate::error::{MarginError, Result};

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_METHOD: &str = "HMAC-SHA1";

/// RFC 3986 percent-encoding: everything but unreserved characters.
pub fn percent_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// The base string URI: scheme and host lowercased, default port dropped,
/// no query or fragment.
pub fn base_string_uri(url: &Url) -> String {
    let scheme = url.scheme().to_ascii_lowercase();
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    // `Url::port` is already `None` for the scheme's default port.
    match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}{}", url.path()),
        None => format!("{scheme}://{host}{}", url.path()),
    }
}

/// Build the signature base string.
///
/// `params` are the decoded request parameters: form body, query string and
/// `oauth_*` values. `oauth_signature` is ignored if present.
pub fn signature_base_string(method: &str, url: &Url, params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .filter(|(k, _)| k != "oauth_signature")
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();

    let normalized = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(&base_string_uri(url)),
        percent_encode(&normalized)
    )
}

fn signing_key(consumer_secret: &str, token_secret: &str) -> String {
    format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret)
    )
}

fn mac_for(consumer_secret: &str, base_string: &str) -> Result<HmacSha1> {
    let mut mac = HmacSha1::new_from_slice(signing_key(consumer_secret, "").as_bytes())
        .map_err(|e| MarginError::Crypto(format!("invalid HMAC key: {e}")))?;
    mac.update(base_string.as_bytes());
    Ok(mac)
}

/// Sign a base string, returning the base64 signature.
pub fn sign(consumer_secret: &str, base_string: &str) -> Result<String> {
    let mac = mac_for(consumer_secret, base_string)?;
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Check a base64 signature in constant time.
pub fn verify(consumer_secret: &str, base_string: &str, signature: &str) -> Result<bool> {
    let Ok(expected) = STANDARD.decode(signature) else {
        return Ok(false);
    };
    let mac = mac_for(consumer_secret, base_string)?;
    Ok(mac.verify_slice(&expected).is_ok())
}

/// `oauth_body_hash` for a request body.
pub fn body_hash(body: &[u8]) -> String {
    STANDARD.encode(Sha1::digest(body))
}

/// Signs outgoing requests with a consumer key and secret.
#[derive(Debug, Clone)]
pub struct OAuth1Signer {
    consumer_key: String,
    consumer_secret: String,
}

impl OAuth1Signer {
    pub fn new(consumer_key: impl Into<String>, consumer_secret: impl Into<String>) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
        }
    }

    /// `Authorization` header value for a body-hashed request (the form the
    /// LTI outcomes service requires for XML bodies).
    pub fn authorization_header(&self, method: &str, url: &str, body: &[u8]) -> Result<String> {
        let nonce: String = {
            use rand::Rng;
            let bytes: [u8; 16] = rand::thread_rng().gen();
            hex::encode(bytes)
        };
        let timestamp = chrono::Utc::now().timestamp().to_string();
        self.authorization_header_with(method, url, body, &nonce, &timestamp)
    }

    fn authorization_header_with(
        &self,
        method: &str,
        url: &str,
        body: &[u8],
        nonce: &str,
        timestamp: &str,
    ) -> Result<String> {
        let parsed = Url::parse(url)
            .map_err(|e| MarginError::Validation(format!("invalid URL {url}: {e}")))?;

        let mut oauth_params = vec![
            ("oauth_body_hash".to_string(), body_hash(body)),
            ("oauth_consumer_key".to_string(), self.consumer_key.clone()),
            ("oauth_nonce".to_string(), nonce.to_string()),
            ("oauth_signature_method".to_string(), SIGNATURE_METHOD.to_string()),
            ("oauth_timestamp".to_string(), timestamp.to_string()),
            ("oauth_version".to_string(), "1.0".to_string()),
        ];

        let mut all = oauth_params.clone();
        all.extend(
            parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        );
        let base = signature_base_string(method, &parsed, &all);
        oauth_params.push(("oauth_signature".to_string(), sign(&self.consumer_secret, &base)?));

        let fields = oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, percent_encode(v)))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("OAuth realm=\"\", {fields}"))
    }
}

/// Parse an `Authorization: OAuth ...` header into its parameters.
pub fn parse_authorization_header(header: &str) -> Vec<(String, String)> {
    let Some(rest) = header.trim().strip_prefix("OAuth ") else {
        return Vec::new();
    };
    rest.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            let v = v.trim().trim_matches('"');
            let v = urlencoding::decode(v).ok()?.into_owned();
            Some((k.trim().to_string(), v))
        })
        .filter(|(k, _)| k != "realm")
        .collect()
}
