//! Audit event job payload (§4.C9, first sink).
//!
//! Mirrors [`nimbus_core::AuditEventInput`] field-for-field but as an
//! owned, `Serialize`/`Deserialize` struct — the shape that actually
//! crosses the Redis wire, since the core trait object can't be
//! serialized directly.

use serde::{Deserialize, Serialize};

/// One audit-worthy action, durably enqueued for the audit worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditJob {
    pub request_id: String,
    pub user_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    /// "success" | "failure" | "error" (§3 `AuditEvent.status`).
    pub status: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
    pub processing_time_ms: i64,
}
