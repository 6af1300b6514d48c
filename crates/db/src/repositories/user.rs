//! User repository.

use std::sync::Arc;

use crate::entities::user::{self, Entity as User};
use nimbus_common::{AppError, AppResult};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};

/// User repository for database operations.
#[derive(Clone)]
pub struct UserRepository {
    db: Arc<DatabaseConnection>,
}

impl UserRepository {
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<user::Model>> {
        User::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn get_by_id(&self, id: &str) -> AppResult<user::Model> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {id}")))
    }

    pub async fn find_by_email(&self, email: &str) -> AppResult<Option<user::Model>> {
        User::find()
            .filter(user::Column::Email.eq(email))
            .one(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn create(&self, model: user::ActiveModel) -> AppResult<user::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn update(&self, model: user::ActiveModel) -> AppResult<user::Model> {
        model
            .update(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    /// Every user with custom-drive sync turned on (§4.C11 startup:
    /// one watcher per such user).
    pub async fn find_custom_drive_enabled(&self) -> AppResult<Vec<user::Model>> {
        User::find()
            .filter(user::Column::CustomDriveEnabled.eq(true))
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    /// Enable custom-drive mode for a user (§4.C11).
    pub async fn set_custom_drive(
        &self,
        user_id: &str,
        enabled: bool,
        path: Option<String>,
        ignore_patterns: Vec<String>,
    ) -> AppResult<user::Model> {
        let user = self.get_by_id(user_id).await?;
        let mut active: user::ActiveModel = user.into();
        active.custom_drive_enabled = Set(enabled);
        active.custom_drive_path = Set(path);
        active.custom_drive_ignore_patterns =
            Set(serde_json::to_value(ignore_patterns).unwrap_or(serde_json::Value::Null));
        active
            .update(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn create_test_user(id: &str, email: &str) -> user::Model {
        user::Model {
            id: id.to_string(),
            email: email.to_string(),
            password_hash: Some("hash".to_string()),
            created_at: Utc::now().into(),
            storage_limit_bytes: 10 * 1024 * 1024 * 1024,
            custom_drive_enabled: false,
            custom_drive_path: None,
            custom_drive_ignore_patterns: serde_json::json!([]),
        }
    }

    #[tokio::test]
    async fn find_by_id_found() {
        let user = create_test_user("user1", "a@example.com");
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[user.clone()]])
                .into_connection(),
        );

        let repo = UserRepository::new(db);
        let result = repo.find_by_id("user1").await.unwrap();
        assert_eq!(result.unwrap().email, "a@example.com");
    }

    #[tokio::test]
    async fn get_by_id_not_found_returns_error() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<user::Model>::new()])
                .into_connection(),
        );

        let repo = UserRepository::new(db);
        let result = repo.get_by_id("missing").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn create_user() {
        let user = create_test_user("user1", "new@example.com");
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[user.clone()]])
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 1,
                }])
                .into_connection(),
        );

        let repo = UserRepository::new(db);
        let active = user::ActiveModel {
            id: Set("user1".to_string()),
            email: Set("new@example.com".to_string()),
            ..Default::default()
        };

        let result = repo.create(active).await.unwrap();
        assert_eq!(result.email, "new@example.com");
    }

}
