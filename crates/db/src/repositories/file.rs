//! File/folder repository — C1 Metadata Store's implementation over the
//! unified `file` table.

use std::sync::Arc;

use crate::entities::file::{self, Entity as File, FileType};
use chrono::{DateTime, Utc};
use nimbus_common::{AppError, AppResult};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    DatabaseTransaction, EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Statement, TransactionTrait,
};

/// Whitelisted sort columns for listings (§4.C7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Name,
    Size,
    Modified,
    DeletedAt,
}

impl SortBy {
    #[must_use]
    pub const fn column(self) -> file::Column {
        match self {
            Self::Name => file::Column::Name,
            Self::Size => file::Column::Size,
            Self::Modified => file::Column::Modified,
            Self::DeletedAt => file::Column::DeletedAt,
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Repository for the unified `file` table (files and folders alike).
#[derive(Clone)]
pub struct FileRepository {
    db: Arc<DatabaseConnection>,
}

impl FileRepository {
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Begin a transaction for multi-row mutations (§4.C1: read-committed,
    /// caller retries on serialisation failure).
    pub async fn begin(&self) -> AppResult<DatabaseTransaction> {
        self.db.begin().await.map_err(AppError::from)
    }

    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<file::Model>> {
        File::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    /// Fetch a row scoped to its owner; used by every public mutation so
    /// a caller can never touch another user's row by guessing an ID.
    pub async fn get_owned(&self, id: &str, user_id: &str) -> AppResult<file::Model> {
        File::find_by_id(id)
            .filter(file::Column::UserId.eq(user_id))
            .one(self.db.as_ref())
            .await
            .map_err(AppError::from)?
            .ok_or_else(|| AppError::NotFound(format!("file {id}")))
    }

    pub async fn find_by_ids_owned(
        &self,
        ids: &[String],
        user_id: &str,
    ) -> AppResult<Vec<file::Model>> {
        File::find()
            .filter(file::Column::Id.is_in(ids.to_vec()))
            .filter(file::Column::UserId.eq(user_id))
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    /// Unscoped by owner — used only to resolve a validated share token
    /// to the files it grants access to (§4.C8 `resolve`), where the
    /// requester is not necessarily the owner.
    pub async fn find_by_ids(&self, ids: &[String]) -> AppResult<Vec<file::Model>> {
        File::find()
            .filter(file::Column::Id.is_in(ids.to_vec()))
            .filter(file::Column::DeletedAt.is_null())
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    /// List the direct children of `parent_id` (`None` = root) for a
    /// user, optionally including trashed rows.
    pub async fn find_children(
        &self,
        user_id: &str,
        parent_id: Option<&str>,
        include_deleted: bool,
        sort: SortBy,
        order: SortOrder,
    ) -> AppResult<Vec<file::Model>> {
        let mut query = File::find().filter(file::Column::UserId.eq(user_id));

        query = match parent_id {
            Some(pid) => query.filter(file::Column::ParentId.eq(pid)),
            None => query.filter(file::Column::ParentId.is_null()),
        };

        query = if include_deleted {
            query.filter(file::Column::DeletedAt.is_not_null())
        } else {
            query.filter(file::Column::DeletedAt.is_null())
        };

        let column = sort.column();
        query = match order {
            SortOrder::Asc => query.order_by_asc(column),
            SortOrder::Desc => query.order_by_desc(column),
        };

        query.all(self.db.as_ref()).await.map_err(AppError::from)
    }

    pub async fn find_starred(&self, user_id: &str) -> AppResult<Vec<file::Model>> {
        File::find()
            .filter(file::Column::UserId.eq(user_id))
            .filter(file::Column::Starred.eq(true))
            .filter(file::Column::DeletedAt.is_null())
            .order_by_desc(file::Column::Modified)
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn find_shared(&self, user_id: &str) -> AppResult<Vec<file::Model>> {
        File::find()
            .filter(file::Column::UserId.eq(user_id))
            .filter(file::Column::Shared.eq(true))
            .filter(file::Column::DeletedAt.is_null())
            .order_by_desc(file::Column::Modified)
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn find_trash(&self, user_id: &str) -> AppResult<Vec<file::Model>> {
        File::find()
            .filter(file::Column::UserId.eq(user_id))
            .filter(file::Column::DeletedAt.is_not_null())
            .order_by_desc(file::Column::DeletedAt)
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    /// Every trashed row older than `cutoff`, across all users (§4.C10
    /// trash expiry). Unscoped by owner — callers group by `user_id`
    /// before handing ids to a per-user mutation.
    pub async fn find_expired_trash(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<file::Model>> {
        File::find()
            .filter(file::Column::DeletedAt.is_not_null())
            .filter(file::Column::DeletedAt.lt(cutoff.fixed_offset()))
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    /// Every non-deleted row with a relative (local-driver or S3) storage
    /// key, across all users (§4.C10 orphan reconciliation). Custom-drive
    /// rows have an absolute path and logical folders have none, so both
    /// are excluded by the leading-`/` check.
    pub async fn find_all_storage_keyed(&self) -> AppResult<Vec<file::Model>> {
        File::find()
            .filter(file::Column::DeletedAt.is_null())
            .filter(file::Column::Path.is_not_null())
            .filter(file::Column::Path.not_like("/%"))
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn find_by_parent_and_name(
        &self,
        user_id: &str,
        parent_id: Option<&str>,
        name: &str,
        include_deleted: bool,
    ) -> AppResult<Vec<file::Model>> {
        let mut query = File::find()
            .filter(file::Column::UserId.eq(user_id))
            .filter(file::Column::Name.eq(name));

        query = match parent_id {
            Some(pid) => query.filter(file::Column::ParentId.eq(pid)),
            None => query.filter(file::Column::ParentId.is_null()),
        };

        if !include_deleted {
            query = query.filter(file::Column::DeletedAt.is_null());
        }

        query.all(self.db.as_ref()).await.map_err(AppError::from)
    }

    /// All sibling names under `parent_id`, used by the ` (N)` suffix
    /// scheme to find the first free name.
    /// Every non-deleted row for a user, regardless of parent (§4.C11
    /// sync diff base). Small enough per-user to hold in memory; a
    /// custom-drive tree is bounded by one filesystem subtree.
    pub async fn find_all_owned(&self, user_id: &str) -> AppResult<Vec<file::Model>> {
        File::find()
            .filter(file::Column::UserId.eq(user_id))
            .filter(file::Column::DeletedAt.is_null())
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn sibling_names(
        &self,
        user_id: &str,
        parent_id: Option<&str>,
    ) -> AppResult<Vec<String>> {
        let mut query = File::find()
            .filter(file::Column::UserId.eq(user_id))
            .filter(file::Column::DeletedAt.is_null())
            .select_only()
            .column(file::Column::Name);

        query = match parent_id {
            Some(pid) => query.filter(file::Column::ParentId.eq(pid)),
            None => query.filter(file::Column::ParentId.is_null()),
        };

        #[derive(FromQueryResult)]
        struct NameOnly {
            name: String,
        }

        let rows = query
            .into_model::<NameOnly>()
            .all(self.db.as_ref())
            .await
            .map_err(AppError::from)?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    pub async fn create(&self, model: file::ActiveModel) -> AppResult<file::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn create_in_txn(
        &self,
        txn: &DatabaseTransaction,
        model: file::ActiveModel,
    ) -> AppResult<file::Model> {
        model.insert(txn).await.map_err(AppError::from)
    }

    pub async fn update(&self, model: file::ActiveModel) -> AppResult<file::Model> {
        model
            .update(self.db.as_ref())
            .await
            .map_err(AppError::from)
    }

    pub async fn update_in_txn(
        &self,
        txn: &DatabaseTransaction,
        model: file::ActiveModel,
    ) -> AppResult<file::Model> {
        model.update(txn).await.map_err(AppError::from)
    }

    pub async fn delete_many_in_txn(
        &self,
        txn: &DatabaseTransaction,
        ids: &[String],
    ) -> AppResult<u64> {
        let result = File::delete_many()
            .filter(file::Column::Id.is_in(ids.to_vec()))
            .exec(txn)
            .await
            .map_err(AppError::from)?;
        Ok(result.rows_affected)
    }

    /// Transactional bulk `deleted_at` set/clear over a concrete ID list
    /// — used by soft-delete and restore (§4.C6).
    pub async fn set_deleted_at_many(
        &self,
        txn: &DatabaseTransaction,
        ids: &[String],
        deleted_at: Option<DateTime<Utc>>,
    ) -> AppResult<u64> {
        use sea_orm::sea_query::Expr;

        let mut update = File::update_many().filter(file::Column::Id.is_in(ids.to_vec()));
        update = update.col_expr(
            file::Column::DeletedAt,
            Expr::value(deleted_at.map(|dt| dt.fixed_offset())),
        );
        let result = update.exec(txn).await.map_err(AppError::from)?;
        Ok(result.rows_affected)
    }

    /// All descendant IDs reachable from `root_id` via `parent_id` links
    /// (§4.C1, P1). Implemented with a recursive CTE — sea-orm's query
    /// builder cannot express transitive closure directly.
    pub async fn descendants(
        &self,
        root_id: &str,
        user_id: &str,
        include_deleted: bool,
    ) -> AppResult<Vec<String>> {
        let deleted_clause = if include_deleted {
            ""
        } else {
            "AND f.deleted_at IS NULL"
        };

        let sql = format!(
            r#"
            WITH RECURSIVE descendants AS (
                SELECT f.id FROM file f
                WHERE f.id = $1 AND f.user_id = $2 {deleted_clause}
                UNION ALL
                SELECT f.id FROM file f
                INNER JOIN descendants d ON f.parent_id = d.id
                WHERE f.user_id = $2 {deleted_clause}
            )
            SELECT id FROM descendants WHERE id != $1
            "#
        );

        let rows = self
            .db
            .query_all(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                &sql,
                [root_id.into(), user_id.into()],
            ))
            .await
            .map_err(AppError::from)?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("", "id").map_err(AppError::from)?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Sum of `size` over non-deleted descendant files (I6, §4.C7).
    pub async fn folder_size(&self, folder_id: &str, user_id: &str) -> AppResult<i64> {
        let sql = r#"
            WITH RECURSIVE descendants AS (
                SELECT f.id FROM file f
                WHERE f.id = $1 AND f.user_id = $2
                UNION ALL
                SELECT f.id FROM file f
                INNER JOIN descendants d ON f.parent_id = d.id
                WHERE f.user_id = $2 AND f.deleted_at IS NULL
            )
            SELECT COALESCE(SUM(f.size), 0) AS total
            FROM file f
            INNER JOIN descendants d ON f.id = d.id
            WHERE f.file_type = 'file' AND f.deleted_at IS NULL AND f.id != $1
        "#;

        #[derive(FromQueryResult)]
        struct SumResult {
            total: i64,
        }

        let result = SumResult::find_by_statement(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            sql,
            [folder_id.into(), user_id.into()],
        ))
        .one(self.db.as_ref())
        .await
        .map_err(AppError::from)?;

        Ok(result.map(|r| r.total).unwrap_or(0))
    }

    /// Total bytes across all of a user's non-deleted files (§4.C7 stats,
    /// quota checks).
    pub async fn total_storage_used(&self, user_id: &str) -> AppResult<i64> {
        #[derive(FromQueryResult)]
        struct SumResult {
            total: Option<i64>,
        }

        let result = File::find()
            .filter(file::Column::UserId.eq(user_id))
            .filter(file::Column::FileType.eq(FileType::File))
            .filter(file::Column::DeletedAt.is_null())
            .select_only()
            .column_as(file::Column::Size.sum(), "total")
            .into_model::<SumResult>()
            .one(self.db.as_ref())
            .await
            .map_err(AppError::from)?;

        Ok(result.and_then(|r| r.total).unwrap_or(0))
    }

    /// Aggregate stats for §4.C7: total files, folders, top-level shared,
    /// starred.
    pub async fn stats(&self, user_id: &str) -> AppResult<FileStats> {
        let total_files = File::find()
            .filter(file::Column::UserId.eq(user_id))
            .filter(file::Column::FileType.eq(FileType::File))
            .filter(file::Column::DeletedAt.is_null())
            .count(self.db.as_ref())
            .await
            .map_err(AppError::from)?;

        let total_folders = File::find()
            .filter(file::Column::UserId.eq(user_id))
            .filter(file::Column::FileType.eq(FileType::Folder))
            .filter(file::Column::DeletedAt.is_null())
            .count(self.db.as_ref())
            .await
            .map_err(AppError::from)?;

        let starred_count = File::find()
            .filter(file::Column::UserId.eq(user_id))
            .filter(file::Column::Starred.eq(true))
            .filter(file::Column::DeletedAt.is_null())
            .count(self.db.as_ref())
            .await
            .map_err(AppError::from)?;

        // Top-level shared only: shared AND (parent is null OR parent not shared).
        let sql = r#"
            SELECT COUNT(*) AS count FROM file f
            WHERE f.user_id = $1 AND f.shared = true AND f.deleted_at IS NULL
            AND (
                f.parent_id IS NULL
                OR NOT EXISTS (
                    SELECT 1 FROM file p WHERE p.id = f.parent_id AND p.shared = true
                )
            )
        "#;

        #[derive(FromQueryResult)]
        struct CountResult {
            count: i64,
        }

        let shared_count = CountResult::find_by_statement(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            sql,
            [user_id.into()],
        ))
        .one(self.db.as_ref())
        .await
        .map_err(AppError::from)?
        .map(|r| r.count)
        .unwrap_or(0);

        Ok(FileStats {
            total_files,
            total_folders,
            shared_count,
            starred_count: starred_count as i64,
        })
    }

    /// Fuzzy name search (§4.C7): prefix match for short queries, prefix
    /// + trigram similarity beyond two characters.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: u64,
    ) -> AppResult<Vec<file::Model>> {
        let like_pattern = format!("{}%", query.to_lowercase().replace('%', "\\%"));

        let sql = if query.chars().count() <= 2 {
            r#"
            SELECT * FROM file
            WHERE user_id = $1 AND deleted_at IS NULL AND lower(name) LIKE $2
            ORDER BY
                (lower(name) = $3) DESC,
                modified DESC
            LIMIT $4
            "#
        } else {
            r#"
            SELECT * FROM file
            WHERE user_id = $1 AND deleted_at IS NULL
            AND (lower(name) LIKE $2 OR similarity(lower(name), $3) > 0.15)
            ORDER BY
                (lower(name) = $3) DESC,
                (lower(name) LIKE $2) DESC,
                similarity(lower(name), $3) DESC,
                modified DESC
            LIMIT $4
            "#
        };

        let rows = file::Model::find_by_statement(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            sql,
            [
                user_id.into(),
                like_pattern.into(),
                query.to_lowercase().into(),
                (limit as i64).into(),
            ],
        ))
        .all(self.db.as_ref())
        .await
        .map_err(AppError::from)?;

        Ok(rows)
    }
}

/// Aggregate stats returned by §4.C7.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub total_files: u64,
    pub total_folders: u64,
    pub shared_count: i64,
    pub starred_count: i64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_file(id: &str, user_id: &str, name: &str) -> file::Model {
        file::Model {
            id: id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            file_type: FileType::File,
            parent_id: None,
            size: 128,
            mime_type: Some("text/plain".to_string()),
            path: Some(format!("{id}.bin")),
            starred: false,
            shared: false,
            modified: Utc::now().into(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn get_owned_missing_is_not_found() {
        let db = Arc::new(
            sea_orm::MockDatabase::new(sea_orm::DatabaseBackend::Postgres)
                .append_query_results([Vec::<file::Model>::new()])
                .into_connection(),
        );
        let repo = FileRepository::new(db);
        let result = repo.get_owned("missing", "u1").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn get_owned_found_returns_row() {
        let row = sample_file("f1", "u1", "a.txt");
        let db = Arc::new(
            sea_orm::MockDatabase::new(sea_orm::DatabaseBackend::Postgres)
                .append_query_results([[row.clone()]])
                .into_connection(),
        );
        let repo = FileRepository::new(db);
        let result = repo.get_owned("f1", "u1").await.unwrap();
        assert_eq!(result.name, "a.txt");
    }

    #[tokio::test]
    async fn find_by_ids_is_not_owner_scoped() {
        let row = sample_file("f1", "someone-else", "shared.txt");
        let db = Arc::new(
            sea_orm::MockDatabase::new(sea_orm::DatabaseBackend::Postgres)
                .append_query_results([[row.clone()]])
                .into_connection(),
        );
        let repo = FileRepository::new(db);
        let result = repo.find_by_ids(&["f1".to_string()]).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].user_id, "someone-else");
    }

    #[test]
    fn sort_by_maps_to_the_whitelisted_column() {
        assert_eq!(SortBy::Name.column(), file::Column::Name);
        assert_eq!(SortBy::DeletedAt.column(), file::Column::DeletedAt);
    }
}
