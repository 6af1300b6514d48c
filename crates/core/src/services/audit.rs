//! Audit event producer contract (§4.C9, first sink).
//!
//! The Tree Engine depends only on this trait; the durable, at-least-once
//! job submission (apalis + Redis) lives in `nimbus-queue`, which depends
//! on `nimbus-core` — not the other way around. This keeps the business
//! logic ignorant of which queue driver backs it.

use async_trait::async_trait;
use serde_json::Value;

/// One audit-worthy action, ready to be enqueued as a durable job.
///
/// Fields mirror the job payload named in §4.C9: `request_id` identifies
/// the originating HTTP request (out of scope here, supplied by the
/// caller), the rest describe what happened.
#[derive(Debug, Clone)]
pub struct AuditEventInput {
    pub request_id: String,
    pub user_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub status: AuditStatus,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Value,
    pub error_message: Option<String>,
    pub processing_time_ms: i64,
}

/// Per-request context threaded through the Tree Engine purely so it can
/// be stamped onto the audit event; the engine itself never inspects it.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Outcome recorded on the audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Success,
    Failure,
}

impl AuditStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Producer side of the audit queue: enqueues exactly one job per call.
/// Implementors MUST NOT block the caller on the job actually being
/// processed — this is a submission contract, not a synchronous write.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEventInput);
}

/// Handle-erased audit sink, shared across request tasks.
pub type AuditSinkHandle = std::sync::Arc<dyn AuditSink>;

/// Discards every event. Used in tests and wherever the audit queue isn't
/// wired up (a `TreeEngine` must still be constructible without it).
#[derive(Clone, Default)]
pub struct NoOpAuditSink;

#[async_trait]
impl AuditSink for NoOpAuditSink {
    async fn record(&self, _event: AuditEventInput) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    pub struct CountingAuditSink {
        pub count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AuditSink for CountingAuditSink {
        async fn record(&self, _event: AuditEventInput) {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn noop_sink_accepts_events_silently() {
        let sink = NoOpAuditSink;
        sink.record(AuditEventInput {
            request_id: "r1".to_string(),
            user_id: "u1".to_string(),
            action: "create_folder".to_string(),
            resource_type: "file".to_string(),
            resource_id: "f1".to_string(),
            status: AuditStatus::Success,
            ip_address: None,
            user_agent: None,
            metadata: Value::Null,
            error_message: None,
            processing_time_ms: 5,
        })
        .await;
    }
}
