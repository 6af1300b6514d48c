//! Audit job handler (§4.C9, first sink): validates the payload, inserts
//! one `AuditEvent` row, and classifies failures per the retry policy.
//!
//! Validation and integrity failures are permanent — retrying them can't
//! help, so the handler gives up immediately after recording the outcome.
//! Anything else (a dropped connection, a momentarily unreachable pool)
//! is retried in-process up to [`RetryConfig::max_retries`] times with
//! the configured exponential backoff before the handler gives up and
//! lets the failure surface as a metric (§8 P7). Retrying inside the
//! handler, rather than relying on the queue backend's own redelivery,
//! keeps the backoff schedule exactly as specified regardless of which
//! apalis backend is wired up.

use apalis::prelude::*;
use nimbus_common::{get_metrics, AuditJobOutcome};
use nimbus_db::entities::audit_event::{self, AuditStatus};
use nimbus_db::repositories::audit_event::AuditEventRepository;
use sea_orm::ActiveValue::Set;
use tracing::{error, warn};

use crate::jobs::AuditJob;
use crate::retry::RetryConfig;

/// Context for the audit worker.
#[derive(Clone)]
pub struct AuditWorkerContext {
    pub events: AuditEventRepository,
    pub retry: RetryConfig,
}

impl AuditWorkerContext {
    /// Retry policy per §4.C9: three attempts beyond the first, 60s base
    /// backoff. Distinct from `RetryConfig::default()`, which is tuned for
    /// delivery-style retries elsewhere in this crate.
    #[must_use]
    pub fn new(events: AuditEventRepository) -> Self {
        Self {
            events,
            retry: RetryConfig {
                max_retries: 3,
                initial_delay: std::time::Duration::from_secs(60),
                ..RetryConfig::default()
            },
        }
    }
}

/// Classification of a failed insert attempt.
enum Failure {
    /// Required field missing/malformed — never retried.
    Validation(String),
    /// Foreign-key or other integrity violation — never retried.
    Integrity(String),
    /// Everything else — retried per `RetryConfig`.
    Other(String),
}

fn validate(job: &AuditJob) -> Option<Failure> {
    if job.request_id.trim().is_empty() {
        return Some(Failure::Validation("request_id is empty".to_string()));
    }
    if job.action.trim().is_empty() {
        return Some(Failure::Validation("action is empty".to_string()));
    }
    if job.resource_type.trim().is_empty() {
        return Some(Failure::Validation("resource_type is empty".to_string()));
    }
    if job.resource_id.trim().is_empty() {
        return Some(Failure::Validation("resource_id is empty".to_string()));
    }
    if !matches!(job.status.as_str(), "success" | "failure" | "error") {
        return Some(Failure::Validation(format!(
            "unknown status {:?}",
            job.status
        )));
    }
    None
}

fn classify_db_error(err: &nimbus_common::AppError) -> Failure {
    match err {
        nimbus_common::AppError::IntegrityError(msg) => Failure::Integrity(msg.clone()),
        other => Failure::Other(other.to_string()),
    }
}

fn to_active_model(job: &AuditJob, ids: &nimbus_common::IdGenerator) -> audit_event::ActiveModel {
    let status = match job.status.as_str() {
        "success" => AuditStatus::Success,
        "failure" => AuditStatus::Failure,
        _ => AuditStatus::Error,
    };

    audit_event::ActiveModel {
        id: Set(ids.generate()),
        request_id: Set(job.request_id.clone()),
        user_id: Set(job.user_id.clone()),
        action: Set(job.action.clone()),
        resource_type: Set(job.resource_type.clone()),
        resource_id: Set(job.resource_id.clone()),
        status: Set(status),
        ip_address: Set(job.ip_address.clone()),
        user_agent: Set(job.user_agent.clone()),
        metadata: Set(job.metadata.clone()),
        error_message: Set(job.error_message.clone()),
        processing_time_ms: Set(job.processing_time_ms),
        created_at: Set(chrono::Utc::now().into()),
    }
}

/// Worker function for processing audit events.
///
/// # Errors
/// Returns an error only once the in-process retry budget for a
/// retryable failure is exhausted; permanent failures are logged and
/// return `Ok(())` so the job is not redelivered by the queue backend.
pub async fn audit_worker(job: AuditJob, ctx: Data<AuditWorkerContext>) -> Result<(), Error> {
    let ids = nimbus_common::IdGenerator::new();

    if let Some(failure) = validate(&job) {
        let reason = match failure {
            Failure::Validation(msg) | Failure::Integrity(msg) | Failure::Other(msg) => msg,
        };
        warn!(request_id = %job.request_id, reason = %reason, "audit job rejected (permanent)");
        get_metrics().record_audit_job_outcome(AuditJobOutcome::FailedPermanent);
        return Ok(());
    }

    let mut attempt = 0_u32;
    loop {
        match ctx.events.create(to_active_model(&job, &ids)).await {
            Ok(_) => {
                get_metrics().record_audit_job_outcome(AuditJobOutcome::Processed);
                return Ok(());
            }
            Err(err) => match classify_db_error(&err) {
                Failure::Validation(msg) | Failure::Integrity(msg) => {
                    error!(request_id = %job.request_id, reason = %msg, "audit job failed permanently");
                    get_metrics().record_audit_job_outcome(AuditJobOutcome::FailedPermanent);
                    return Ok(());
                }
                Failure::Other(msg) => {
                    if !ctx.retry.should_retry(attempt) {
                        error!(
                            request_id = %job.request_id,
                            reason = %msg,
                            attempts = attempt,
                            "audit job exhausted retries"
                        );
                        get_metrics().record_audit_job_outcome(AuditJobOutcome::FailedRetryable);
                        return Ok(());
                    }

                    let delay = ctx.retry.delay_for_attempt(attempt);
                    warn!(
                        request_id = %job.request_id,
                        reason = %msg,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "audit insert failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> AuditJob {
        AuditJob {
            request_id: "req-1".to_string(),
            user_id: Some("u1".to_string()),
            action: "file.upload".to_string(),
            resource_type: "file".to_string(),
            resource_id: "f1".to_string(),
            status: "success".to_string(),
            ip_address: None,
            user_agent: None,
            metadata: serde_json::json!({}),
            error_message: None,
            processing_time_ms: 5,
        }
    }

    #[test]
    fn validate_rejects_empty_request_id() {
        let mut job = sample();
        job.request_id = String::new();
        assert!(matches!(validate(&job), Some(Failure::Validation(_))));
    }

    #[test]
    fn validate_rejects_unknown_status() {
        let mut job = sample();
        job.status = "pending".to_string();
        assert!(matches!(validate(&job), Some(Failure::Validation(_))));
    }

    #[test]
    fn validate_accepts_well_formed_job() {
        assert!(validate(&sample()).is_none());
    }
}
