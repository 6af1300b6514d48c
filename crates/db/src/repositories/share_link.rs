//! Share-link repository (C8).

use std::sync::Arc;

use crate::entities::share_link::{self, Entity as ShareLink};
use crate::entities::share_link_file;
use nimbus_common::{AppError, AppResult};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, TransactionTrait,
};

#[derive(Clone)]
pub struct ShareLinkRepository {
    db: Arc<DatabaseConnection>,
}

impl ShareLinkRepository {
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_token(&self, token: &str) -> AppResult<Option<share_link::Model>> {
        ShareLink::find()
            .filter(share_link::Column::Token.eq(token))
            .one(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn get_by_token(&self, token: &str) -> AppResult<share_link::Model> {
        self.find_by_token(token)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("share link {token}")))
    }

    pub async fn find_by_id_owned(
        &self,
        id: &str,
        user_id: &str,
    ) -> AppResult<share_link::Model> {
        ShareLink::find_by_id(id)
            .filter(share_link::Column::UserId.eq(user_id))
            .one(self.db.as_ref())
            .await
            .map_err(AppError::from)?
            .ok_or_else(|| AppError::NotFound(format!("share link {id}")))
    }

    pub async fn find_by_user(&self, user_id: &str) -> AppResult<Vec<share_link::Model>> {
        ShareLink::find()
            .filter(share_link::Column::UserId.eq(user_id))
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    /// File IDs attached to a share link, used to resolve what a token
    /// grants read access to (§4.C8).
    pub async fn attached_file_ids(&self, share_link_id: &str) -> AppResult<Vec<String>> {
        use sea_orm::{FromQueryResult, QuerySelect};

        #[derive(FromQueryResult)]
        struct FileIdOnly {
            file_id: String,
        }

        let rows = share_link_file::Entity::find()
            .filter(share_link_file::Column::ShareLinkId.eq(share_link_id))
            .select_only()
            .column(share_link_file::Column::FileId)
            .into_model::<FileIdOnly>()
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)?;

        Ok(rows.into_iter().map(|r| r.file_id).collect())
    }

    /// Create a share link and attach the given file IDs in one
    /// transaction (§4.C8 create).
    pub async fn create_with_files(
        &self,
        model: share_link::ActiveModel,
        file_ids: &[String],
    ) -> AppResult<share_link::Model> {
        let txn = self.db.begin().await.map_err(AppError::from)?;

        let created = model.insert(&txn).await.map_err(AppError::from)?;

        for file_id in file_ids {
            share_link_file::ActiveModel {
                share_link_id: Set(created.id.clone()),
                file_id: Set(file_id.clone()),
            }
            .insert(&txn)
            .await
            .map_err(AppError::from)?;
        }

        txn.commit().await.map_err(AppError::from)?;
        Ok(created)
    }

    pub async fn delete(&self, id: &str, user_id: &str) -> AppResult<()> {
        let link = self.find_by_id_owned(id, user_id).await?;
        ShareLink::delete_by_id(link.id)
            .exec(self.db.as_ref())
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    /// Find a share link owned by `user_id` that already has at least
    /// one of `file_ids` attached, used by `mint_or_reuse` (§4.C8) to
    /// decide whether to extend an existing link rather than mint a new
    /// token.
    pub async fn find_owning_any(
        &self,
        user_id: &str,
        file_ids: &[String],
    ) -> AppResult<Option<share_link::Model>> {
        if file_ids.is_empty() {
            return Ok(None);
        }

        let junction = share_link_file::Entity::find()
            .filter(share_link_file::Column::FileId.is_in(file_ids.to_vec()))
            .one(self.db.as_ref())
            .await
            .map_err(AppError::from)?;

        let Some(junction) = junction else {
            return Ok(None);
        };

        ShareLink::find_by_id(junction.share_link_id)
            .filter(share_link::Column::UserId.eq(user_id))
            .one(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    /// Attach additional file IDs to an existing link, ignoring any that
    /// are already attached (idempotent extend for `mint_or_reuse`).
    pub async fn attach_files(&self, share_link_id: &str, file_ids: &[String]) -> AppResult<()> {
        let existing = self.attached_file_ids(share_link_id).await?;

        for file_id in file_ids {
            if existing.contains(file_id) {
                continue;
            }
            share_link_file::ActiveModel {
                share_link_id: Set(share_link_id.to_string()),
                file_id: Set(file_id.clone()),
            }
            .insert(self.db.as_ref())
            .await
            .map_err(AppError::from)?;
        }

        Ok(())
    }

    /// Detach `file_ids` from a link and delete the link itself once its
    /// last junction row is gone (§4.C8 `revoke`). Returns the number of
    /// junction rows remaining after the detach.
    pub async fn detach_files(&self, share_link_id: &str, file_ids: &[String]) -> AppResult<u64> {
        share_link_file::Entity::delete_many()
            .filter(share_link_file::Column::ShareLinkId.eq(share_link_id))
            .filter(share_link_file::Column::FileId.is_in(file_ids.to_vec()))
            .exec(self.db.as_ref())
            .await
            .map_err(AppError::from)?;

        let remaining = self.attached_file_ids(share_link_id).await?.len() as u64;

        if remaining == 0 {
            ShareLink::delete_by_id(share_link_id.to_string())
                .exec(self.db.as_ref())
                .await
                .map_err(AppError::from)?;
        }

        Ok(remaining)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase};

    fn sample(id: &str, token: &str, user_id: &str) -> share_link::Model {
        share_link::Model {
            id: id.to_string(),
            token: token.to_string(),
            user_id: user_id.to_string(),
            expires_at: None,
            created_at: Utc::now().into(),
        }
    }

    #[tokio::test]
    async fn find_by_token_found() {
        let link = sample("sl1", "abcxyz123456", "user1");
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[link.clone()]])
                .into_connection(),
        );

        let repo = ShareLinkRepository::new(db);
        let result = repo.find_by_token("abcxyz123456").await.unwrap();
        assert_eq!(result.unwrap().user_id, "user1");
    }

    #[tokio::test]
    async fn get_by_token_missing_is_not_found() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<share_link::Model>::new()])
                .into_connection(),
        );

        let repo = ShareLinkRepository::new(db);
        let result = repo.get_by_token("missing").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn is_expired_checks_past_timestamp() {
        let past = sample("sl1", "tok", "u1");
        let mut expired = past.clone();
        expired.expires_at = Some((Utc::now() - chrono::Duration::days(1)).into());
        assert!(expired.is_expired(Utc::now().into()));
        assert!(!past.is_expired(Utc::now().into()));
    }

    #[tokio::test]
    async fn find_owning_any_returns_empty_for_no_candidate_ids() {
        let db = Arc::new(MockDatabase::new(DatabaseBackend::Postgres).into_connection());
        let repo = ShareLinkRepository::new(db);
        let result = repo.find_owning_any("user1", &[]).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn find_owning_any_finds_link_via_junction() {
        let link = sample("sl1", "abcxyz123456", "user1");
        let junction = share_link_file::Model {
            share_link_id: "sl1".to_string(),
            file_id: "f1".to_string(),
        };
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[junction]])
                .append_query_results([[link.clone()]])
                .into_connection(),
        );

        let repo = ShareLinkRepository::new(db);
        let result = repo
            .find_owning_any("user1", &["f1".to_string()])
            .await
            .unwrap();
        assert_eq!(result.unwrap().id, "sl1");
    }

    #[tokio::test]
    async fn detach_files_deletes_link_once_last_junction_removed() {
        use sea_orm::MockExecResult;

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 1,
                }])
                .append_query_results([Vec::<share_link_file::Model>::new()])
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 1,
                }])
                .into_connection(),
        );

        let repo = ShareLinkRepository::new(db);
        let remaining = repo
            .detach_files("sl1", &["f1".to_string()])
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn detach_files_keeps_link_when_junctions_remain() {
        use sea_orm::MockExecResult;

        let remaining_junction = share_link_file::Model {
            share_link_id: "sl1".to_string(),
            file_id: "f2".to_string(),
        };
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 1,
                }])
                .append_query_results([[remaining_junction]])
                .into_connection(),
        );

        let repo = ShareLinkRepository::new(db);
        let remaining = repo
            .detach_files("sl1", &["f1".to_string()])
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
