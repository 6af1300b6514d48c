//! Listing & Search (C7): cached directory listings, trash listing,
//! fuzzy search, and aggregate stats over [`FileRepository`].
//!
//! Every read here is cache-first with a short TTL (§4.C3); on a cache
//! miss the repository's query runs and the result is written back
//! before returning. Folder rows in a size-sorted listing need their
//! computed size filled in before the final in-process sort, since
//! `size` is stored as 0 for folders in the DB (§4.C7).

use nimbus_common::AppResult;
use nimbus_db::entities::file;
use nimbus_db::repositories::file::{FileRepository, FileStats, SortBy, SortOrder};

use super::cache::{get_json, keys as cache_keys, set_json, ttl, CacheHandle};

/// Maximum `limit` accepted by [`ListingService::search`] (§6
/// `/api/files/search`).
const MAX_SEARCH_LIMIT: u64 = 500;

fn sort_by_str(sort: SortBy) -> &'static str {
    match sort {
        SortBy::Name => "name",
        SortBy::Size => "size",
        SortBy::Modified => "modified",
        SortBy::DeletedAt => "deletedAt",
    }
}

fn order_str(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Asc => "asc",
        SortOrder::Desc => "desc",
    }
}

/// Read-side wrapper over [`FileRepository`] (§4.C7).
#[derive(Clone)]
pub struct ListingService {
    files: FileRepository,
    cache: CacheHandle,
}

impl ListingService {
    #[must_use]
    pub const fn new(files: FileRepository, cache: CacheHandle) -> Self {
        Self { files, cache }
    }

    /// List the direct children of `parent_id`, sorted per `sort`/`order`.
    pub async fn list_directory(
        &self,
        user_id: &str,
        parent_id: Option<&str>,
        sort: SortBy,
        order: SortOrder,
    ) -> AppResult<Vec<file::Model>> {
        let key = cache_keys::file_listing(user_id, parent_id, sort_by_str(sort), order_str(order));
        if let Some(cached) = get_json::<Vec<file::Model>>(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let mut rows = self
            .files
            .find_children(user_id, parent_id, false, sort, order)
            .await?;

        if matches!(sort, SortBy::Size) {
            self.fill_folder_sizes(user_id, &mut rows).await?;
            match order {
                SortOrder::Asc => rows.sort_by_key(|r| r.size),
                SortOrder::Desc => rows.sort_by_key(|r| std::cmp::Reverse(r.size)),
            }
        }

        set_json(self.cache.as_ref(), &key, &rows, ttl::FILE_LISTING).await;
        Ok(rows)
    }

    /// Starred files, most-recently-modified first.
    pub async fn list_starred(&self, user_id: &str) -> AppResult<Vec<file::Model>> {
        let key = cache_keys::starred_listing(user_id, "modified", "desc");
        if let Some(cached) = get_json::<Vec<file::Model>>(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let rows = self.files.find_starred(user_id).await?;
        set_json(self.cache.as_ref(), &key, &rows, ttl::FILE_LISTING).await;
        Ok(rows)
    }

    /// Shared files, most-recently-modified first.
    pub async fn list_shared(&self, user_id: &str) -> AppResult<Vec<file::Model>> {
        let key = cache_keys::shared_listing(user_id, "modified", "desc");
        if let Some(cached) = get_json::<Vec<file::Model>>(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let rows = self.files.find_shared(user_id).await?;
        set_json(self.cache.as_ref(), &key, &rows, ttl::FILE_LISTING).await;
        Ok(rows)
    }

    /// Trashed rows sorted per the listing vocabulary plus `deletedAt`;
    /// size-sort is never offered here (§4.C7 "no SQL-size sort").
    pub async fn list_trash(
        &self,
        user_id: &str,
        sort: SortBy,
        order: SortOrder,
    ) -> AppResult<Vec<file::Model>> {
        let key = cache_keys::trash_listing(user_id, sort_by_str(sort), order_str(order));
        if let Some(cached) = get_json::<Vec<file::Model>>(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let mut rows = self.files.find_trash(user_id).await?;
        match (sort, order) {
            (SortBy::Name, SortOrder::Asc) => rows.sort_by(|a, b| a.name.cmp(&b.name)),
            (SortBy::Name, SortOrder::Desc) => rows.sort_by(|a, b| b.name.cmp(&a.name)),
            (SortBy::Size, SortOrder::Asc) => rows.sort_by_key(|r| r.size),
            (SortBy::Size, SortOrder::Desc) => rows.sort_by_key(|r| std::cmp::Reverse(r.size)),
            (SortBy::Modified, SortOrder::Asc) => rows.sort_by_key(|r| r.modified),
            (SortBy::Modified, SortOrder::Desc) => {
                rows.sort_by_key(|r| std::cmp::Reverse(r.modified));
            }
            (SortBy::DeletedAt, SortOrder::Asc) => rows.sort_by_key(|r| r.deleted_at),
            (SortBy::DeletedAt, SortOrder::Desc) => {
                rows.sort_by_key(|r| std::cmp::Reverse(r.deleted_at));
            }
        }

        set_json(self.cache.as_ref(), &key, &rows, ttl::FILE_LISTING).await;
        Ok(rows)
    }

    /// Fuzzy name search, clamped to [`MAX_SEARCH_LIMIT`] (§6
    /// `/api/files/search`).
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: u64,
    ) -> AppResult<Vec<file::Model>> {
        let limit = limit.min(MAX_SEARCH_LIMIT);
        let key = cache_keys::search(user_id, query, limit);
        if let Some(cached) = get_json::<Vec<file::Model>>(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let rows = self.files.search(user_id, query, limit).await?;
        set_json(self.cache.as_ref(), &key, &rows, ttl::SEARCH).await;
        Ok(rows)
    }

    /// Aggregate totals (§4.C7 stats).
    pub async fn stats(&self, user_id: &str) -> AppResult<FileStats> {
        let key = cache_keys::stats(user_id);
        if let Some(cached) = get_json::<FileStats>(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let stats = self.files.stats(user_id).await?;
        set_json(self.cache.as_ref(), &key, &stats, ttl::STATS).await;
        Ok(stats)
    }

    /// Recursive byte total under a folder, cached 300 s (§4.C7).
    pub async fn folder_size(&self, user_id: &str, folder_id: &str) -> AppResult<i64> {
        let cache_key = cache_keys::folder_size(user_id, folder_id);
        if let Some(cached) = get_json::<i64>(self.cache.as_ref(), &cache_key).await {
            return Ok(cached);
        }

        let size = self.files.folder_size(folder_id, user_id).await?;
        set_json(self.cache.as_ref(), &cache_key, &size, ttl::FOLDER_SIZE).await;
        Ok(size)
    }

    async fn fill_folder_sizes(&self, user_id: &str, rows: &mut [file::Model]) -> AppResult<()> {
        for row in rows.iter_mut() {
            if row.file_type == file::FileType::Folder {
                row.size = self.folder_size(user_id, &row.id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::NoOpCache;
    use std::sync::Arc;

    #[test]
    fn sort_and_order_strings_match_cache_key_vocabulary() {
        assert_eq!(sort_by_str(SortBy::DeletedAt), "deletedAt");
        assert_eq!(order_str(SortOrder::Asc), "asc");
    }

    #[tokio::test]
    async fn noop_cache_keeps_listing_service_constructible() {
        // A `ListingService` must be usable in tests without a live DB or
        // Redis; this only exercises construction, not a live query.
        let db = Arc::new(
            sea_orm::MockDatabase::new(sea_orm::DatabaseBackend::Postgres).into_connection(),
        );
        let files = FileRepository::new(db);
        let _service = ListingService::new(files, Arc::new(NoOpCache));
    }
}
