//! LTI 1.1 Basic Outcomes: `imsx_POXEnvelopeRequest` XML signed with OAuth 1.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use tracing::{debug, warn};

use super::{
    is_max_attempts, on_max_attempts, round_score, student_not_in_course, GradingService,
    Submission,
};
use crate::error::{CodedError, ExternalRequestError, Result};
use crate::models::family::Family;
use crate::oauth1::OAuth1Signer;

const MALFORMED: &str = "Malformed LTI outcome response";

/// Grades through a tenant's LTI 1.1 outcome service.
pub struct OutcomesGradingService {
    client: Client,
    signer: OAuth1Signer,
    service_url: String,
    family: Family,
}

/// A parsed `imsx_POXEnvelopeResponse`.
#[derive(Debug, Clone, PartialEq)]
struct PoxResponse {
    code_major: String,
    description: Option<String>,
    score: Option<String>,
}

impl OutcomesGradingService {
    pub fn new(client: Client, signer: OAuth1Signer, service_url: impl Into<String>, family: Family) -> Self {
        Self {
            client,
            signer,
            service_url: service_url.into(),
            family,
        }
    }

    async fn send(&self, body: String) -> Result<PoxResponse> {
        let auth = self
            .signer
            .authorization_header("POST", &self.service_url, body.as_bytes())?;
        let resp = self
            .client
            .post(&self.service_url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| ExternalRequestError::from_transport("POST", &self.service_url, &e))?;

        let status = resp.status();
        let text = resp.text().await?;
        let error = |message: &str| {
            ExternalRequestError::new(message)
                .with_request("POST", &self.service_url)
                .with_response(status.as_u16(), status.canonical_reason(), &text)
        };
        if !status.is_success() {
            return Err(error("Outcome service request failed").into());
        }
        parse_response(&text).ok_or_else(|| error(MALFORMED).into())
    }

    fn ensure_success(&self, pox: &PoxResponse) -> Result<()> {
        if pox.code_major == "success" {
            return Ok(());
        }
        let description = pox.description.as_deref().unwrap_or_default();
        warn!(
            url = %self.service_url,
            code_major = %pox.code_major,
            description = %description,
            "outcome request failed"
        );
        if let Some(detail) = student_not_in_course(description) {
            return Err(CodedError::student_not_in_course(detail).into());
        }
        Err(ExternalRequestError::new(format!("Outcome request failed: {description}"))
            .with_request("POST", &self.service_url)
            .into())
    }
}

#[async_trait]
impl GradingService for OutcomesGradingService {
    async fn read_result(&self, grading_id: &str) -> Result<Option<f64>> {
        let pox = self.send(read_result_body(grading_id)).await?;
        self.ensure_success(&pox)?;
        let Some(text) = pox.score.filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        text.parse::<f64>().map(Some).map_err(|_| {
            ExternalRequestError::new(MALFORMED)
                .with_request("POST", &self.service_url)
                .into()
        })
    }

    async fn record_result(
        &self,
        grading_id: &str,
        score: Option<f64>,
        submission: Option<&Submission>,
    ) -> Result<()> {
        let score = score.map(round_score).transpose()?;
        let pox = self
            .send(replace_result_body(grading_id, score, submission))
            .await?;
        if pox.code_major != "success" && is_max_attempts(pox.description.as_deref().unwrap_or_default()) {
            return on_max_attempts(self.family, &self.service_url);
        }
        self.ensure_success(&pox)?;
        debug!(url = %self.service_url, ?score, "recorded outcome");
        Ok(())
    }

    async fn sync_grade(&self, grading_id: &str, score: f64, _graded_at: DateTime<Utc>) -> Result<()> {
        self.record_result(grading_id, Some(score), None).await
    }
}

fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<imsx_POXEnvelopeRequest xmlns="http://www.imsglobal.org/services/ltiv1p1/xsd/imsoms_v1p0">
  <imsx_POXHeader>
    <imsx_POXRequestHeaderInfo>
      <imsx_version>V1.0</imsx_version>
      <imsx_messageIdentifier>{}</imsx_messageIdentifier>
    </imsx_POXRequestHeaderInfo>
  </imsx_POXHeader>
  <imsx_POXBody>
{body}
  </imsx_POXBody>
</imsx_POXEnvelopeRequest>"#,
        uuid::Uuid::new_v4()
    )
}

fn sourced_guid(grading_id: &str) -> String {
    format!(
        "<sourcedGUID><sourcedId>{}</sourcedId></sourcedGUID>",
        xml_escape(grading_id)
    )
}

fn read_result_body(grading_id: &str) -> String {
    envelope(&format!(
        "    <readResultRequest>\n      <resultRecord>{}</resultRecord>\n    </readResultRequest>",
        sourced_guid(grading_id)
    ))
}

fn replace_result_body(grading_id: &str, score: Option<f64>, submission: Option<&Submission>) -> String {
    let mut result = String::new();
    if let Some(score) = score {
        result.push_str(&format!(
            "<resultScore><language>en</language><textString>{score}</textString></resultScore>"
        ));
    }
    let mut details = String::new();
    if let Some(sub) = submission {
        result.push_str(&format!(
            "<resultData><ltiLaunchUrl>{}</ltiLaunchUrl></resultData>",
            xml_escape(&sub.lti_launch_url)
        ));
        details = format!(
            "<submissionDetails><submittedAt>{}</submittedAt></submissionDetails>",
            sub.submitted_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }
    envelope(&format!(
        "    <replaceResultRequest>\n      {details}<resultRecord>{}<result>{result}</result></resultRecord>\n    </replaceResultRequest>",
        sourced_guid(grading_id)
    ))
}

const STATUS_PATH: &[&str] = &[
    "imsx_POXEnvelopeResponse",
    "imsx_POXHeader",
    "imsx_POXResponseHeaderInfo",
    "imsx_statusInfo",
];
const SCORE_PATH: &[&str] = &[
    "imsx_POXEnvelopeResponse",
    "imsx_POXBody",
    "readResultResponse",
    "result",
    "resultScore",
    "textString",
];

fn parse_response(xml: &str) -> Option<PoxResponse> {
    let status = element_path(xml, STATUS_PATH)?;
    Some(PoxResponse {
        code_major: element_text(status, "imsx_codeMajor")?.to_ascii_lowercase(),
        description: element_text(status, "imsx_description").map(xml_unescape),
        score: element_path(xml, SCORE_PATH)
            .map(str::trim)
            .map(xml_unescape),
    })
}

/// Content of the element reached by descending through `names`, each
/// looked up inside the previous one.
fn element_path<'a>(xml: &'a str, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .try_fold(xml, |scope, name| element_body(scope, name))
}

/// Trimmed text content of the first element named `name` in `xml`.
fn element_text<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    element_body(xml, name).map(str::trim)
}

/// Raw content of the first element with local name `name`, namespace
/// prefixes ignored. Self-closing elements yield `""`; an element without
/// its closing tag yields nothing.
fn element_body<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let mut offset = 0;
    while let Some(open) = xml[offset..].find('<') {
        let start = offset + open + 1;
        let end = start + xml[start..].find('>')?;
        let tag = &xml[start..end];
        offset = end + 1;
        if tag.starts_with(['/', '?', '!']) {
            continue;
        }
        let tag_name = tag
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        let local = tag_name.rsplit(':').next().unwrap_or(tag_name);
        if local != name {
            continue;
        }
        if tag.ends_with('/') {
            return Some("");
        }
        let body = &xml[offset..];
        let close = body.find(&format!("</{tag_name}>"))?;
        return Some(&body[..close]);
    }
    None
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
