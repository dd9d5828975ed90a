//! Writing grades back to the LMS.
//!
//! LTI 1.1 tenants grade through the Basic Outcomes service, LTI 1.3 tenants
//! through Assignment and Grade Services. Both sit behind [`GradingService`].

pub mod ags;
pub mod outcomes;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{CodedError, ErrorCode, MarginError, Result};
use crate::models::application_instance::{ApplicationInstance, LtiRegistration, LtiVersion};
use crate::models::family::Family;
use crate::oauth1::OAuth1Signer;

use self::ags::{AgsGradingService, LtiAdvantageAuth};
use self::outcomes::OutcomesGradingService;

/// Vendor messages meaning the learner is no longer enrolled.
const STUDENT_NOT_IN_COURSE: &[&str] = &[
    "User is no longer in course",
    "User not found in course or is not a student",
    "User in requested score is not enrolled in the org unit",
    "Incorrect score received",
    "User could not be found",
];

const MAX_ATTEMPTS: &str = "maximum number of allowed attempts";

/// A learner submission recorded alongside (or instead of) a score, so
/// Canvas SpeedGrader can re-open the document.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub lti_launch_url: String,
    pub submitted_at: DateTime<Utc>,
}

/// Reads and writes one learner's grade for an assignment.
///
/// `grading_id` is the `lis_result_sourcedid` for LTI 1.1 and the learner's
/// LTI user id for LTI 1.3.
#[async_trait]
pub trait GradingService: Send + Sync {
    async fn read_result(&self, grading_id: &str) -> Result<Option<f64>>;

    /// Record `score` (in `[0, 1]`, rounded to 4 places) and/or a submission.
    async fn record_result(
        &self,
        grading_id: &str,
        score: Option<f64>,
        submission: Option<&Submission>,
    ) -> Result<()>;

    /// Push an automatically computed grade.
    async fn sync_grade(&self, grading_id: &str, score: f64, graded_at: DateTime<Utc>) -> Result<()>;

    async fn create_line_item(
        &self,
        _resource_link_id: &str,
        _label: &str,
        _score_maximum: f64,
    ) -> Result<Value> {
        Err(MarginError::Unsupported(
            "line items need LTI 1.3 grading".into(),
        ))
    }

    async fn get_score_maximum(&self, _resource_link_id: &str) -> Result<Option<f64>> {
        Err(MarginError::Unsupported(
            "line items need LTI 1.3 grading".into(),
        ))
    }
}

/// Validate a score and round it to 4 decimal places.
pub fn round_score(score: f64) -> Result<f64> {
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(MarginError::Validation(format!(
            "score must be between 0 and 1, got {score}"
        )));
    }
    Ok((score * 10_000.0).round() / 10_000.0)
}

pub(crate) fn student_not_in_course(text: &str) -> Option<&'static str> {
    STUDENT_NOT_IN_COURSE
        .iter()
        .copied()
        .find(|needle| text.contains(needle))
}

pub(crate) fn is_max_attempts(text: &str) -> bool {
    text.contains(MAX_ATTEMPTS)
}

/// A grade write rejected because the learner used up their attempts.
///
/// Canvas reports this when the submission, not the grade, is locked, so the
/// grade is already in place and the error is dropped.
pub(crate) fn on_max_attempts(family: Family, url: &str) -> Result<()> {
    if family == Family::Canvas {
        warn!(url, "ignoring max attempts rejection from Canvas");
        return Ok(());
    }
    Err(CodedError::new(
        ErrorCode::LmsMaxAttempts,
        serde_json::json!({ "family": family.as_str() }),
    )
    .into())
}

/// Record a Canvas SpeedGrader submission unless the learner already has a
/// result. Returns whether a submission was written.
pub async fn record_canvas_speedgrader_submission(
    service: &dyn GradingService,
    grading_id: &str,
    submission: &Submission,
) -> Result<bool> {
    if service.read_result(grading_id).await?.is_some() {
        return Ok(false);
    }
    service.record_result(grading_id, None, Some(submission)).await?;
    info!(grading_id, "recorded SpeedGrader submission");
    Ok(true)
}

/// Where an assignment's grades go.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradingTarget {
    /// LTI 1.1 outcome service.
    pub outcome_service_url: Option<String>,
    /// LTI 1.3 line item for the assignment.
    pub lineitem: Option<String>,
    /// LTI 1.3 line item container for the context.
    pub lineitems: Option<String>,
}

/// Picks the grading transport for a tenant.
#[derive(Clone)]
pub struct GradingServiceFactory {
    client: Client,
    auth: Arc<LtiAdvantageAuth>,
}

impl GradingServiceFactory {
    pub fn new(client: Client, auth: Arc<LtiAdvantageAuth>) -> Self {
        Self { client, auth }
    }

    pub fn auth(&self) -> &Arc<LtiAdvantageAuth> {
        &self.auth
    }

    pub fn for_instance(
        &self,
        ai: &ApplicationInstance,
        registration: Option<&LtiRegistration>,
        target: &GradingTarget,
    ) -> Result<Box<dyn GradingService>> {
        match ai.lti_version() {
            LtiVersion::V11 => {
                let (Some(key), Some(secret)) = (&ai.consumer_key, &ai.shared_secret) else {
                    return Err(MarginError::Config(format!(
                        "tenant {} has no LTI 1.1 credentials",
                        ai.id
                    )));
                };
                let url = target.outcome_service_url.clone().ok_or_else(|| {
                    MarginError::Validation("assignment has no outcome service URL".into())
                })?;
                Ok(Box::new(OutcomesGradingService::new(
                    self.client.clone(),
                    OAuth1Signer::new(key.clone(), secret.clone()),
                    url,
                    ai.family,
                )))
            }
            LtiVersion::V13 => {
                let registration = registration.cloned().ok_or_else(|| {
                    MarginError::Config(format!("tenant {} has no LTI registration", ai.id))
                })?;
                Ok(Box::new(AgsGradingService::new(
                    self.client.clone(),
                    self.auth.clone(),
                    registration,
                    target.lineitem.clone(),
                    target.lineitems.clone(),
                    ai.family,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn scores_round_to_four_places() {
        assert_eq!(round_score(0.7000000000000001).unwrap(), 0.7);
        assert_eq!(round_score(0.123456).unwrap(), 0.1235);
        assert_eq!(round_score(1.0).unwrap(), 1.0);
        assert_eq!(round_score(0.7).unwrap().to_string(), "0.7");
        assert!(round_score(-0.1).is_err());
        assert!(round_score(f64::NAN).is_err());
    }

    #[test]
    fn vendor_messages() {
        assert_eq!(
            student_not_in_course("{\"errors\":[{\"message\":\"User not found in course or is not a student\"}]}"),
            Some("User not found in course or is not a student")
        );
        assert_eq!(student_not_in_course("Internal error"), None);
        assert!(is_max_attempts(
            "The maximum number of allowed attempts has been reached for this submission"
        ));
    }

    #[test]
    fn max_attempts_only_ignored_for_canvas() {
        assert!(on_max_attempts(Family::Canvas, "https://lms").is_ok());
        match on_max_attempts(Family::Blackboard, "https://lms") {
            Err(MarginError::Coded(e)) => assert_eq!(e.error_code, ErrorCode::LmsMaxAttempts),
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// Records every write and reports a fixed existing result.
    struct RecordingGrader {
        existing: Option<f64>,
        writes: Mutex<Vec<(Option<f64>, Option<Submission>)>>,
    }

    #[async_trait]
    impl GradingService for RecordingGrader {
        async fn read_result(&self, _grading_id: &str) -> Result<Option<f64>> {
            Ok(self.existing)
        }

        async fn record_result(
            &self,
            _grading_id: &str,
            score: Option<f64>,
            submission: Option<&Submission>,
        ) -> Result<()> {
            self.writes.lock().unwrap().push((score, submission.cloned()));
            Ok(())
        }

        async fn sync_grade(&self, grading_id: &str, score: f64, _at: DateTime<Utc>) -> Result<()> {
            self.record_result(grading_id, Some(score), None).await
        }
    }

    fn submission() -> Submission {
        Submission {
            lti_launch_url: "https://margin.example.com/lti_launches".into(),
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn speedgrader_submission_written_once() {
        let fresh = RecordingGrader {
            existing: None,
            writes: Mutex::new(vec![]),
        };
        assert!(record_canvas_speedgrader_submission(&fresh, "S", &submission()).await.unwrap());
        let writes = fresh.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, None);
        assert!(writes[0].1.is_some());
    }

    #[tokio::test]
    async fn speedgrader_skips_graded_learner() {
        let graded = RecordingGrader {
            existing: Some(0.5),
            writes: Mutex::new(vec![]),
        };
        assert!(!record_canvas_speedgrader_submission(&graded, "S", &submission()).await.unwrap());
        assert!(graded.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn default_line_item_ops_are_unsupported() {
        let grader = RecordingGrader {
            existing: None,
            writes: Mutex::new(vec![]),
        };
        assert!(matches!(
            grader.get_score_maximum("rl").await,
            Err(MarginError::Unsupported(_))
        ));
    }
}
