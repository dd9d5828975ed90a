//! Bearer-token HTTP client shared by the vendor REST API clients.
//!
//! Every call picks up the user's token from the [`TokenStore`], validates
//! the response by deserialising it into the caller's type and maps vendor
//! failures onto [`MarginError`]s. A 401 triggers exactly one refresh and
//! retry; there are no other automatic retries.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{CodedError, ErrorCode, ExternalRequestError, MarginError, Result};
use crate::http::next_link;
use crate::models::family::Family;
use crate::models::oauth2_token::TokenKey;
use crate::oauth2::{TokenEndpoint, TokenStore};

/// Most requests a single list call may make.
pub const MAX_PAGES: usize = 25;

/// How a vendor API tells the client where the next page is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// Not paginated.
    None,
    /// RFC 5988 `Link: <...>; rel="next"` header. The body is a JSON array.
    LinkHeader,
    /// A JSON object holding the page's items and the next page's path,
    /// both given as JSON pointers.
    BodyField {
        items: &'static str,
        next: &'static str,
    },
}

/// Per-vendor knobs of the proxy.
#[derive(Debug, Clone, Copy)]
pub struct ApiProfile {
    pub family: Family,
    pub pagination: Pagination,
    /// Page size parameter and the vendor's maximum, sent on list calls.
    pub per_page: Option<(&'static str, u32)>,
}

/// One request to a vendor API.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, or an absolute URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub json: Option<Value>,
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            json: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        let mut req = Self::new(Method::POST, path);
        req.json = Some(body);
        req
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A successful raw response.
struct RawResponse {
    url: String,
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

enum Attempt {
    Done(RawResponse),
    Unauthorized(ExternalRequestError),
}

pub struct ApiProxy {
    client: Client,
    tokens: Arc<TokenStore>,
    key: TokenKey,
    endpoint: TokenEndpoint,
    base_url: String,
    profile: ApiProfile,
}

impl ApiProxy {
    pub fn new(
        client: Client,
        tokens: Arc<TokenStore>,
        key: TokenKey,
        endpoint: TokenEndpoint,
        base_url: &str,
        profile: ApiProfile,
    ) -> Self {
        Self {
            client,
            tokens,
            key,
            endpoint,
            base_url: base_url.trim_end_matches('/').to_string(),
            profile,
        }
    }

    pub fn family(&self) -> Family {
        self.profile.family
    }

    pub fn token_key(&self) -> &TokenKey {
        &self.key
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The current access token, for handing to a viewer that fetches a
    /// document on the user's behalf.
    pub async fn access_token(&self) -> Result<String> {
        self.tokens.get_access_token(&self.key, &self.endpoint).await
    }

    /// Absolute URL for a path relative to the API base.
    ///
    /// Absolute URLs, such as vendor paging links, must be on the API's own
    /// origin: the request carries the user's access token.
    pub fn url_for(&self, path: &str) -> Result<String> {
        if path.starts_with("http://") || path.starts_with("https://") {
            let target = url::Url::parse(path)
                .map_err(|e| MarginError::Validation(format!("invalid vendor URL {path}: {e}")))?;
            let base = url::Url::parse(&self.base_url)
                .map_err(|e| MarginError::Config(format!("invalid API base URL: {e}")))?;
            if target.origin() != base.origin() {
                warn!(
                    family = %self.profile.family,
                    url = %path,
                    "refusing to send credentials to another origin"
                );
                return Err(MarginError::Validation(format!(
                    "{path} is not on the {} API host",
                    self.profile.family
                )));
            }
            return Ok(path.to_string());
        }
        if path.starts_with('/') {
            // Vendor paging links are absolute paths on the LMS host.
            if let Ok(base) = url::Url::parse(&self.base_url) {
                if let Ok(joined) = base.join(path) {
                    if joined.path().starts_with(base.path().trim_end_matches('/')) {
                        return Ok(joined.to_string());
                    }
                }
            }
            return Ok(format!("{}{}", self.base_url, path));
        }
        Ok(format!("{}/{}", self.base_url, path))
    }

    /// Send a request whose response is a single object.
    ///
    /// Fails if the vendor answers with a paginated response.
    pub async fn send<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<T> {
        let url = self.url_for(&req.path)?;
        let raw = self.execute(&req, &url, true).await?;
        if self.next_page(&raw)?.is_some() {
            return Err(ExternalRequestError::new(
                "Received a paginated response for a single-object request",
            )
            .with_request(req.method.as_str(), &raw.url)
            .with_response(raw.status.as_u16(), raw.status.canonical_reason(), &raw.body)
            .into());
        }
        self.validate(&req.method, &raw, &raw.body)
    }

    /// Send a request that has no meaningful response body.
    pub async fn send_no_content(&self, req: ApiRequest) -> Result<()> {
        let url = self.url_for(&req.path)?;
        self.execute(&req, &url, true).await?;
        Ok(())
    }

    /// Send a list request, following next-page links for at most
    /// [`MAX_PAGES`] requests and concatenating the pages in order.
    pub async fn send_many<T: DeserializeOwned>(&self, mut req: ApiRequest) -> Result<Vec<T>> {
        if let Some((param, max)) = self.profile.per_page {
            if !req.query.iter().any(|(k, _)| k == param) {
                req.query.push((param.to_string(), max.to_string()));
            }
        }

        let mut url = self.url_for(&req.path)?;
        let mut items = Vec::new();
        for page in 0..MAX_PAGES {
            // Next-page links already carry the query string.
            let raw = self.execute(&req, &url, page == 0).await?;
            let page_items = self.page_items(&raw)?;
            items.extend(self.validate::<Vec<T>>(&req.method, &raw, &page_items)?);

            match self.next_page(&raw)? {
                Some(next) => url = self.url_for(&next)?,
                None => return Ok(items),
            }
        }
        warn!(
            family = %self.profile.family,
            url = %req.path,
            pages = MAX_PAGES,
            "pagination limit reached; returning partial list"
        );
        Ok(items)
    }

    async fn execute(&self, req: &ApiRequest, url: &str, with_query: bool) -> Result<RawResponse> {
        let token = self.tokens.get_access_token(&self.key, &self.endpoint).await?;
        match self.attempt(req, url, with_query, &token).await? {
            Attempt::Done(raw) => Ok(raw),
            Attempt::Unauthorized(err) => {
                let stored = self.tokens.get(&self.key).await?;
                if stored.refresh_token.is_none() {
                    debug!(url = %url, "401 and no refresh token");
                    return Err(MarginError::NoToken);
                }
                let token = self.tokens.refresh(&self.key, &token, &self.endpoint).await?;
                match self.attempt(req, url, with_query, &token).await? {
                    Attempt::Done(raw) => Ok(raw),
                    Attempt::Unauthorized(_) => {
                        warn!(url = %url, status = ?err.status_code, "still unauthorized after refresh");
                        Err(MarginError::NoToken)
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        req: &ApiRequest,
        url: &str,
        with_query: bool,
        token: &str,
    ) -> Result<Attempt> {
        debug!(method = %req.method, url = %url, "vendor API request");
        let mut builder = self
            .client
            .request(req.method.clone(), url)
            .bearer_auth(token);
        if with_query && !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(body) = &req.json {
            builder = builder.json(body);
        }
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ExternalRequestError::from_transport(req.method.as_str(), url, &e))?;
        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ExternalRequestError::from_transport(req.method.as_str(), url, &e))?;

        if status.is_success() {
            return Ok(Attempt::Done(RawResponse {
                url: final_url,
                status,
                headers,
                body,
            }));
        }

        let err = ExternalRequestError::new(format!("{} API request failed", self.profile.family))
            .with_request(req.method.as_str(), &final_url)
            .with_response(status.as_u16(), status.canonical_reason(), &body);
        warn!(
            family = %self.profile.family,
            status = status.as_u16(),
            url = %final_url,
            body = ?err.truncated_body(),
            "vendor API error"
        );

        if let Some(mapped) = self.map_vendor_error(status, &err) {
            return Err(mapped);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Ok(Attempt::Unauthorized(err));
        }
        Err(err.into())
    }

    /// Vendor responses that mean something other than "retry with a fresh
    /// token".
    fn map_vendor_error(&self, status: StatusCode, err: &ExternalRequestError) -> Option<MarginError> {
        let body = err.response_body.as_deref().unwrap_or_default().to_ascii_lowercase();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            && (body.contains("insufficient scope") || body.contains("insufficient_scope"))
        {
            // Re-authorizing asks for the scopes this version needs.
            return Some(MarginError::NoToken);
        }
        if self.profile.family == Family::Canvas
            && status == StatusCode::UNAUTHORIZED
            && body.contains("user not authorized to perform that action")
        {
            return Some(
                CodedError::new(ErrorCode::CanvasApiPermissionError, err.details()).into(),
            );
        }
        None
    }

    fn next_page(&self, raw: &RawResponse) -> Result<Option<String>> {
        match self.profile.pagination {
            Pagination::None => Ok(None),
            Pagination::LinkHeader => Ok(next_link(&raw.headers)),
            Pagination::BodyField { next, .. } => {
                let value: Value = match serde_json::from_str(&raw.body) {
                    Ok(v) => v,
                    Err(_) => return Ok(None),
                };
                Ok(value
                    .pointer(next)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string))
            }
        }
    }

    /// The JSON text holding a page's list of items.
    fn page_items(&self, raw: &RawResponse) -> Result<String> {
        match self.profile.pagination {
            Pagination::BodyField { items, .. } => {
                let value: Value = serde_json::from_str(&raw.body).map_err(|e| {
                    self.invalid_response(&Method::GET, raw, json!([e.to_string()]))
                })?;
                Ok(value
                    .pointer(items)
                    .cloned()
                    .unwrap_or(Value::Null)
                    .to_string())
            }
            _ => Ok(raw.body.clone()),
        }
    }

    fn validate<T: DeserializeOwned>(&self, method: &Method, raw: &RawResponse, text: &str) -> Result<T> {
        serde_json::from_str(text)
            .map_err(|e| self.invalid_response(method, raw, json!([e.to_string()])).into())
    }

    fn invalid_response(&self, method: &Method, raw: &RawResponse, errors: Value) -> ExternalRequestError {
        ExternalRequestError::new("Unable to interpret this server response")
            .with_request(method.as_str(), &raw.url)
            .with_response(raw.status.as_u16(), raw.status.canonical_reason(), &raw.body)
            .with_validation_errors(errors)
    }
}
