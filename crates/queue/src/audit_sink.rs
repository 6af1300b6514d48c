//! Redis-backed audit queue producer (§4.C9, first sink).
//!
//! Implements [`nimbus_core::AuditSink`] over an apalis-redis job storage:
//! the storage handle wraps a `push`, so recording an event is just
//! enqueueing a job for [`crate::workers::audit_worker`] to persist.

use async_trait::async_trait;
use nimbus_common::get_metrics;
use nimbus_core::{AuditEventInput, AuditSink, AuditStatus};

use crate::jobs::AuditJob;

/// Redis-backed audit event producer.
#[derive(Clone)]
pub struct RedisAuditSink {
    storage: apalis_redis::RedisStorage<AuditJob>,
}

impl RedisAuditSink {
    #[must_use]
    pub const fn new(storage: apalis_redis::RedisStorage<AuditJob>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl AuditSink for RedisAuditSink {
    async fn record(&self, event: AuditEventInput) {
        use apalis::prelude::*;

        let job = AuditJob {
            request_id: event.request_id,
            user_id: Some(event.user_id),
            action: event.action,
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            status: match event.status {
                AuditStatus::Success => "success".to_string(),
                AuditStatus::Failure => "failure".to_string(),
            },
            ip_address: event.ip_address,
            user_agent: event.user_agent,
            metadata: event.metadata,
            error_message: event.error_message,
            processing_time_ms: event.processing_time_ms,
        };

        // A call to `record` is a submission contract, not a synchronous
        // write (§4.C9): a push failure is logged, never propagated to
        // the caller, which by now has already committed its transaction.
        match self.storage.clone().push(job).await {
            Ok(_) => get_metrics().record_audit_job_enqueued(),
            Err(err) => tracing::error!(error = %err, "failed to enqueue audit job"),
        }
    }
}
