//! Shared outbound HTTP plumbing.

use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::config::HttpConfig;
use crate::error::{MarginError, Result};

/// Build the client used for vendor API and grading calls
/// (connect and read timeouts from `[http]`).
pub fn vendor_client(cfg: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
        .read_timeout(Duration::from_secs(cfg.read_timeout_secs))
        .build()
        .map_err(MarginError::Http)
}

/// Build a client with a single overall deadline, used for token refreshes
/// and annotation service calls.
pub fn client_with_deadline(cfg: &HttpConfig, seconds: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
        .timeout(Duration::from_secs(seconds))
        .build()
        .map_err(MarginError::Http)
}

/// Return the `rel="next"` target of an RFC 5988 `Link` header, if any.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(reqwest::header::LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|link| {
            let mut parts = link.split(';');
            let target = parts.next()?.trim();
            let is_next = parts.any(|p| {
                let p = p.trim().replace(' ', "");
                p == "rel=\"next\"" || p == "rel=next"
            });
            if !is_next {
                return None;
            }
            target
                .strip_prefix('<')
                .and_then(|t| t.strip_suffix('>'))
                .map(str::to_string)
        })
}
