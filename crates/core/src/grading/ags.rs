//! LTI Advantage: client-credentials tokens and Assignment and Grade Services.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use super::{
    is_max_attempts, on_max_attempts, round_score, student_not_in_course, GradingService,
    Submission,
};
use crate::db::repository::JwtOAuth2TokenRepository;
use crate::error::{CodedError, ExternalRequestError, MarginError, Result};
use crate::models::application_instance::LtiRegistration;
use crate::models::family::Family;
use crate::models::oauth2_token::JwtOAuth2Token;
use crate::signing::ToolKey;

pub const SCOPE_LINEITEM: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/lineitem";
pub const SCOPE_RESULT_READONLY: &str =
    "https://purl.imsglobal.org/spec/lti-ags/scope/result.readonly";
pub const SCOPE_SCORE: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/score";

const ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const SCORE_CONTENT_TYPE: &str = "application/vnd.ims.lis.v1.score+json";
const RESULTS_ACCEPT: &str = "application/vnd.ims.lis.v2.resultcontainer+json";
const LINEITEM_CONTENT_TYPE: &str = "application/vnd.ims.lis.v2.lineitem+json";
const LINEITEMS_ACCEPT: &str = "application/vnd.ims.lis.v2.lineitemcontainer+json";
const CANVAS_SUBMISSION: &str = "https://canvas.instructure.com/lti/submission";

/// Default token lifetime when the platform omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

#[derive(Debug, Serialize)]
struct ClientAssertion<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
}

#[derive(Debug, Deserialize)]
struct ServiceToken {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Gets service access tokens from platforms by signing client assertions
/// with the tool key. Tokens are cached per (registration, scopes).
pub struct LtiAdvantageAuth {
    client: Client,
    tokens: Arc<dyn JwtOAuth2TokenRepository>,
    key: Arc<ToolKey>,
}

impl LtiAdvantageAuth {
    pub fn new(client: Client, tokens: Arc<dyn JwtOAuth2TokenRepository>, key: Arc<ToolKey>) -> Self {
        Self {
            client,
            tokens,
            key,
        }
    }

    pub fn key(&self) -> &ToolKey {
        &self.key
    }

    pub async fn access_token(&self, registration: &LtiRegistration, scopes: &[&str]) -> Result<String> {
        let scope = scopes.join(" ");
        let now = Utc::now();
        if let Some(cached) = self
            .tokens
            .get_jwt_oauth2_token(registration.id, &scope)
            .await?
        {
            if cached.is_fresh(now, Duration::seconds(60)) {
                return Ok(cached.access_token);
            }
        }

        let assertion = self.key.sign(&ClientAssertion {
            iss: &registration.client_id,
            sub: &registration.client_id,
            aud: &registration.token_url,
            iat: now.timestamp(),
            exp: (now + Duration::minutes(5)).timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        })?;

        debug!(url = %registration.token_url, scope = %scope, "requesting LTI service token");
        let resp = self
            .client
            .post(&registration.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_assertion_type", ASSERTION_TYPE),
                ("client_assertion", assertion.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ExternalRequestError::from_transport("POST", &registration.token_url, &e))?;

        let status = resp.status();
        let body = resp.text().await?;
        let error = |message: &str| {
            ExternalRequestError::new(message)
                .with_request("POST", &registration.token_url)
                .with_response(status.as_u16(), status.canonical_reason(), &body)
        };
        if !status.is_success() {
            warn!(url = %registration.token_url, status = status.as_u16(), "platform refused service token");
            return Err(error("LTI service token request failed").into());
        }
        let token: ServiceToken = serde_json::from_str(&body)
            .map_err(|_| error("Unable to parse LTI service token response"))?;

        self.tokens
            .save_jwt_oauth2_token(&JwtOAuth2Token {
                lti_registration_id: registration.id,
                scopes: scope,
                access_token: token.access_token.clone(),
                expires_at: now + Duration::seconds(token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)),
            })
            .await?;
        Ok(token.access_token)
    }
}

/// Grades through a platform's Assignment and Grade Services.
pub struct AgsGradingService {
    client: Client,
    auth: Arc<LtiAdvantageAuth>,
    registration: LtiRegistration,
    lineitem: Option<String>,
    lineitems: Option<String>,
    family: Family,
}

impl AgsGradingService {
    pub fn new(
        client: Client,
        auth: Arc<LtiAdvantageAuth>,
        registration: LtiRegistration,
        lineitem: Option<String>,
        lineitems: Option<String>,
        family: Family,
    ) -> Self {
        Self {
            client,
            auth,
            registration,
            lineitem,
            lineitems,
            family,
        }
    }

    fn lineitem(&self) -> Result<&str> {
        self.lineitem
            .as_deref()
            .ok_or_else(|| MarginError::Validation("assignment has no line item".into()))
    }

    fn lineitems(&self) -> Result<&str> {
        self.lineitems
            .as_deref()
            .ok_or_else(|| MarginError::Unsupported("platform has no line item service".into()))
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        scopes: &[&str],
        content_type: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let token = self.auth.access_token(&self.registration, scopes).await?;
        let method_str = method.to_string();
        let url_str = url.to_string();
        let mut req = self.client.request(method, url).bearer_auth(token);
        req = match body {
            Some(body) => req
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(body.to_string()),
            None => req.header(reqwest::header::ACCEPT, content_type),
        };
        let resp = req
            .send()
            .await
            .map_err(|e| ExternalRequestError::from_transport(&method_str, &url_str, &e))?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ExternalRequestError::new("LTI grading request failed")
                .with_request(&method_str, &url_str)
                .with_response(status.as_u16(), status.canonical_reason(), &text)
                .into());
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            ExternalRequestError::new("Unable to parse LTI grading response")
                .with_request(&method_str, &url_str)
                .with_response(status.as_u16(), status.canonical_reason(), &text)
                .with_validation_errors(Value::String(e.to_string()))
                .into()
        })
    }

    /// Map a refused score write to the vendor-neutral error it means.
    fn score_error(&self, err: MarginError) -> Result<()> {
        let MarginError::ExternalRequest(e) = &err else {
            return Err(err);
        };
        let body = e.response_body.as_deref().unwrap_or_default();
        if let Some(detail) = student_not_in_course(body) {
            return Err(CodedError::student_not_in_course(detail).into());
        }
        if e.status_code == Some(422) && is_max_attempts(body) {
            return on_max_attempts(self.family, e.url.as_deref().unwrap_or_default());
        }
        Err(err)
    }

    async fn post_score(&self, user_id: &str, mut score: Value) -> Result<()> {
        score["userId"] = json!(user_id);
        let url = service_url(self.lineitem()?, "scores")?;
        match self
            .request(Method::POST, url, &[SCOPE_SCORE], SCORE_CONTENT_TYPE, Some(score))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => self.score_error(e),
        }
    }
}

#[async_trait]
impl GradingService for AgsGradingService {
    async fn read_result(&self, grading_id: &str) -> Result<Option<f64>> {
        let mut url = service_url(self.lineitem()?, "results")?;
        url.query_pairs_mut().append_pair("user_id", grading_id);
        let results = self
            .request(Method::GET, url, &[SCOPE_RESULT_READONLY], RESULTS_ACCEPT, None)
            .await?;
        let Some(last) = results.as_array().and_then(|r| r.last()) else {
            return Ok(None);
        };
        let Some(score) = last.get("resultScore").and_then(Value::as_f64) else {
            return Ok(None);
        };
        Ok(match last.get("resultMaximum").and_then(Value::as_f64) {
            Some(max) if max > 0.0 => Some(score / max),
            _ => None,
        })
    }

    async fn record_result(
        &self,
        grading_id: &str,
        score: Option<f64>,
        submission: Option<&Submission>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut body = match score {
            Some(score) => json!({
                "scoreMaximum": 1,
                "scoreGiven": round_score(score)?,
                "timestamp": timestamp(now),
                "activityProgress": "Completed",
                "gradingProgress": "FullyGraded",
            }),
            None => json!({
                "timestamp": timestamp(now),
                "activityProgress": "Submitted",
                "gradingProgress": "PendingManual",
            }),
        };
        if let Some(sub) = submission {
            body[CANVAS_SUBMISSION] = json!({
                "new_submission": true,
                "submission_type": "basic_lti_launch",
                "submission_data": sub.lti_launch_url,
                "submitted_at": timestamp(sub.submitted_at),
            });
        }
        self.post_score(grading_id, body).await
    }

    async fn sync_grade(&self, grading_id: &str, score: f64, graded_at: DateTime<Utc>) -> Result<()> {
        let body = json!({
            "scoreMaximum": 1,
            "scoreGiven": round_score(score)?,
            "timestamp": timestamp(graded_at),
            "activityProgress": "Completed",
            "gradingProgress": "FullyGraded",
        });
        self.post_score(grading_id, body).await
    }

    async fn create_line_item(
        &self,
        resource_link_id: &str,
        label: &str,
        score_maximum: f64,
    ) -> Result<Value> {
        let url = parse_url(self.lineitems()?)?;
        self.request(
            Method::POST,
            url,
            &[SCOPE_LINEITEM],
            LINEITEM_CONTENT_TYPE,
            Some(json!({
                "scoreMaximum": score_maximum,
                "label": label,
                "resourceLinkId": resource_link_id,
            })),
        )
        .await
    }

    async fn get_score_maximum(&self, resource_link_id: &str) -> Result<Option<f64>> {
        let mut url = parse_url(self.lineitems()?)?;
        url.query_pairs_mut()
            .append_pair("resource_link_id", resource_link_id);
        let items = self
            .request(Method::GET, url, &[SCOPE_LINEITEM], LINEITEMS_ACCEPT, None)
            .await?;
        Ok(items
            .as_array()
            .and_then(|items| items.first())
            .and_then(|item| item.get("scoreMaximum"))
            .and_then(Value::as_f64))
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| MarginError::Validation(format!("invalid service URL {url}: {e}")))
}

/// `{lineitem}/{suffix}`, keeping the line item's query string.
fn service_url(lineitem: &str, suffix: &str) -> Result<Url> {
    let mut url = parse_url(lineitem)?;
    let path = format!("{}/{suffix}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}
