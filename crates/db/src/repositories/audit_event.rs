//! Audit event repository (C9 Event Producer's durable store).

use std::sync::Arc;

use crate::entities::audit_event::{self, Entity as AuditEvent};
use nimbus_common::{AppError, AppResult};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect};

#[derive(Clone)]
pub struct AuditEventRepository {
    db: Arc<DatabaseConnection>,
}

impl AuditEventRepository {
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create(&self, model: audit_event::ActiveModel) -> AppResult<audit_event::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn find_by_request_id(
        &self,
        request_id: &str,
    ) -> AppResult<Vec<audit_event::Model>> {
        AuditEvent::find()
            .filter(audit_event::Column::RequestId.eq(request_id))
            .order_by_asc(audit_event::Column::CreatedAt)
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn find_by_user(
        &self,
        user_id: &str,
        limit: u64,
    ) -> AppResult<Vec<audit_event::Model>> {
        AuditEvent::find()
            .filter(audit_event::Column::UserId.eq(user_id))
            .order_by_desc(audit_event::Column::CreatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase};

    fn sample(id: &str, request_id: &str) -> audit_event::Model {
        audit_event::Model {
            id: id.to_string(),
            request_id: request_id.to_string(),
            user_id: Some("user1".to_string()),
            action: "file.upload".to_string(),
            resource_type: "file".to_string(),
            resource_id: "f1".to_string(),
            status: audit_event::AuditStatus::Success,
            ip_address: None,
            user_agent: None,
            metadata: serde_json::json!({}),
            error_message: None,
            processing_time_ms: 5,
            created_at: Utc::now().into(),
        }
    }

    #[tokio::test]
    async fn find_by_request_id_returns_rows() {
        let event = sample("a1", "req-1");
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[event.clone()]])
                .into_connection(),
        );

        let repo = AuditEventRepository::new(db);
        let result = repo.find_by_request_id("req-1").await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].action, "file.upload");
    }
}
