//! Tree Engine (C6): create/upload/rename/move/copy/trash/restore/purge
//! and star/share, each performing cache invalidation and audit emission
//! as a side effect of a successful mutation (§4.C3, §4.C9).
//!
//! Ownership checks, duplicate-name handling, and the `ActiveModel`
//! update idiom are shared across every mutation here; what varies is the
//! recursive tree traversal, the trash lifecycle, and the
//! custom-drive/local-driver path split.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::Utc;
use nimbus_common::encryption::DataKey;
use nimbus_common::id::IdGenerator;
use nimbus_common::{AppError, AppResult};
use nimbus_db::entities::file::{self, FileType};
use nimbus_db::repositories::file::FileRepository;
use nimbus_db::repositories::user::UserRepository;
use sea_orm::ActiveValue::Set;
use serde_json::json;
use tokio::io::AsyncRead;

use super::audit::{AuditEventInput, AuditSinkHandle, AuditStatus, RequestContext};
use super::blob_store::{BlobReader, BlobStoreHandle};
use super::cache::{keys as cache_keys, CacheHandle};
use super::event_publisher::{ChangeKind, SseBroadcaster, StreamEvent};
use super::path_resolver::{self, PathKind};

/// Upper bound on the ` (N)` duplicate-name suffix scheme (§4.C6).
const MAX_NAME_SUFFIX: u32 = 10_000;

/// A newly uploaded file's bytes, handed to [`TreeEngine::upload_file`].
/// The declared `size` is authoritative for quota accounting; the reader
/// is consumed exactly once regardless of which branch handles it.
pub struct UploadSource {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub size: i64,
}

/// The storage engine's tree mutations (§4.C6).
#[derive(Clone)]
pub struct TreeEngine {
    files: FileRepository,
    users: UserRepository,
    blobs: BlobStoreHandle,
    data_key: DataKey,
    cache: CacheHandle,
    events: SseBroadcaster,
    audit: AuditSinkHandle,
    ids: IdGenerator,
    upload_root: PathBuf,
    /// True when the active blob driver is the local disk (bytes are
    /// encrypted at rest); false for S3, which stores bytes as-is
    /// (§4.C5: "applied only to local-driver bytes").
    encrypts_at_rest: bool,
}

impl TreeEngine {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        files: FileRepository,
        users: UserRepository,
        blobs: BlobStoreHandle,
        data_key: DataKey,
        cache: CacheHandle,
        events: SseBroadcaster,
        audit: AuditSinkHandle,
        upload_root: impl Into<PathBuf>,
        encrypts_at_rest: bool,
    ) -> Self {
        Self {
            files,
            users,
            blobs,
            data_key,
            cache,
            events,
            audit,
            ids: IdGenerator::new(),
            upload_root: upload_root.into(),
            encrypts_at_rest,
        }
    }

    // ---------------------------------------------------------------
    // Create folder
    // ---------------------------------------------------------------

    pub async fn create_folder(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> AppResult<file::Model> {
        if let Some(pid) = parent_id {
            self.files.get_owned(pid, user_id).await?;
        }

        let user = self.users.get_by_id(user_id).await?;
        let id = self.ids.generate();
        let now = Utc::now();

        let path = if user.custom_drive_enabled {
            let parent_dir = self.custom_drive_dir_for(user_id, parent_id).await?;
            let unique_name = unique_fs_name(&parent_dir, name).await?;
            let dir = parent_dir.join(&unique_name);

            if tokio::fs::create_dir(&dir).await.is_err() {
                return Err(AppError::Conflict(format!(
                    "could not create directory {}",
                    dir.display()
                )));
            }
            Some(dir.to_string_lossy().into_owned())
        } else {
            None
        };

        let active = file::ActiveModel {
            id: Set(id.clone()),
            user_id: Set(user_id.to_string()),
            name: Set(name.to_string()),
            file_type: Set(FileType::Folder),
            parent_id: Set(parent_id.map(str::to_string)),
            size: Set(0),
            mime_type: Set(None),
            path: Set(path.clone()),
            starred: Set(false),
            shared: Set(false),
            modified: Set(now.into()),
            deleted_at: Set(None),
        };

        let created = match self.files.create(active).await {
            Ok(row) => row,
            Err(e) => {
                if let Some(dir) = &path {
                    let _ = tokio::fs::remove_dir(dir).await;
                }
                return Err(e);
            }
        };

        self.invalidate_listing(user_id, [parent_id.map(str::to_string)])
            .await;
        self.cache.delete(&cache_keys::stats(user_id)).await;
        self.cache.delete(&cache_keys::storage(user_id)).await;
        self.emit(
            ctx,
            user_id,
            "create_folder",
            &created.id,
            AuditStatus::Success,
            json!({"name": name, "parentId": parent_id}),
        )
        .await;
        self.publish(user_id, ChangeKind::Created, &created.id, parent_id)
            .await;

        Ok(created)
    }

    // ---------------------------------------------------------------
    // Upload file
    // ---------------------------------------------------------------

    pub async fn upload_file(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        name: &str,
        mime_type: Option<String>,
        parent_id: Option<&str>,
        source: UploadSource,
    ) -> AppResult<file::Model> {
        if let Some(pid) = parent_id {
            self.files.get_owned(pid, user_id).await?;
        }

        let user = self.users.get_by_id(user_id).await?;

        let id = self.ids.generate();
        let now = Utc::now();

        let path = if user.custom_drive_enabled {
            let parent_dir = self.custom_drive_dir_for(user_id, parent_id).await?;
            let unique_name = unique_fs_name(&parent_dir, name).await?;
            let dest = parent_dir.join(&unique_name);

            let write_result = write_plain_file(&dest, source.reader).await;
            if let Err(e) = write_result {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(e);
            }
            dest.to_string_lossy().into_owned()
        } else {
            // Custom-drive users are exempt from the byte quota (§7:
            // their limit is the underlying filesystem).
            let used = self.files.total_storage_used(user_id).await?;
            if used + source.size > user.storage_limit_bytes {
                return Err(AppError::QuotaExceeded);
            }

            let ext = split_ext(name).1;
            let key = match ext {
                Some(ext) => format!("{}.{ext}", self.ids.generate()),
                None => self.ids.generate(),
            };

            let write_result = if self.encrypts_at_rest {
                self.encrypt_into_blob(&key, source.reader).await
            } else {
                self.blobs.put(&key, source.reader).await
            };
            if let Err(e) = write_result {
                let _ = self.blobs.delete(&key).await;
                return Err(e);
            }
            key
        };

        let active = file::ActiveModel {
            id: Set(id.clone()),
            user_id: Set(user_id.to_string()),
            name: Set(name.to_string()),
            file_type: Set(FileType::File),
            parent_id: Set(parent_id.map(str::to_string)),
            size: Set(source.size),
            mime_type: Set(mime_type),
            path: Set(Some(path)),
            starred: Set(false),
            shared: Set(false),
            modified: Set(now.into()),
            deleted_at: Set(None),
        };

        let created = self.files.create(active).await?;

        self.invalidate_listing(user_id, [parent_id.map(str::to_string)])
            .await;
        self.cache.delete(&cache_keys::stats(user_id)).await;
        self.cache.delete(&cache_keys::storage(user_id)).await;
        self.emit(
            ctx,
            user_id,
            "upload_file",
            &created.id,
            AuditStatus::Success,
            json!({"name": name, "parentId": parent_id, "size": source.size}),
        )
        .await;
        self.publish(user_id, ChangeKind::Created, &created.id, parent_id)
            .await;

        Ok(created)
    }

    // ---------------------------------------------------------------
    // Rename
    // ---------------------------------------------------------------

    pub async fn rename(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        id: &str,
        new_name: &str,
    ) -> AppResult<file::Model> {
        let row = self.files.get_owned(id, user_id).await?;

        let new_path = match path_resolver::classify(row.path.as_deref()) {
            PathKind::AbsoluteCustom => {
                let old_path = PathBuf::from(row.path.as_ref().expect("checked by classify"));
                let parent_dir = old_path
                    .parent()
                    .ok_or_else(|| AppError::InvalidPath("row has no parent directory".to_string()))?
                    .to_path_buf();
                let new_path = path_resolver::safe_join(&parent_dir, new_name)?;

                if tokio::fs::metadata(&new_path).await.is_ok() {
                    return Err(AppError::Conflict(format!(
                        "{} already exists",
                        new_path.display()
                    )));
                }
                tokio::fs::rename(&old_path, &new_path)
                    .await
                    .map_err(AppError::from)?;
                Some(new_path.to_string_lossy().into_owned())
            }
            PathKind::LogicalFolder | PathKind::StorageKey => row.path.clone(),
        };

        let parent_id = row.parent_id.clone();
        let mut active: file::ActiveModel = row.into();
        active.name = Set(new_name.to_string());
        active.path = Set(new_path);
        active.modified = Set(Utc::now().into());
        let updated = self.files.update(active).await?;

        self.invalidate_listing(user_id, [parent_id.clone()]).await;
        self.cache
            .delete(&cache_keys::single_file(&updated.id, user_id))
            .await;
        self.cache.delete(&cache_keys::stats(user_id)).await;
        self.cache.delete(&cache_keys::storage(user_id)).await;
        self.emit(
            ctx,
            user_id,
            "rename",
            &updated.id,
            AuditStatus::Success,
            json!({"newName": new_name}),
        )
        .await;
        self.publish(user_id, ChangeKind::Renamed, &updated.id, parent_id.as_deref())
            .await;

        Ok(updated)
    }

    // ---------------------------------------------------------------
    // Move
    // ---------------------------------------------------------------

    pub async fn move_files(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        ids: &[String],
        target_parent_id: Option<&str>,
    ) -> AppResult<Vec<file::Model>> {
        if let Some(pid) = target_parent_id {
            self.files.get_owned(pid, user_id).await?;
        }

        let rows = self.files.find_by_ids_owned(ids, user_id).await?;
        if rows.len() != ids.len() {
            return Err(AppError::NotFound("one or more files".to_string()));
        }

        let mut affected_parents: Vec<Option<String>> = vec![target_parent_id.map(str::to_string)];
        let mut updated_rows = Vec::with_capacity(rows.len());

        let txn = self.files.begin().await?;
        for row in rows {
            affected_parents.push(row.parent_id.clone());

            let new_path = match path_resolver::classify(row.path.as_deref()) {
                PathKind::AbsoluteCustom => {
                    let old_path = PathBuf::from(row.path.as_ref().expect("checked"));
                    let target_dir = self
                        .custom_drive_dir_for(user_id, target_parent_id)
                        .await?;
                    let desired_name = old_path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or(&row.name);
                    let unique_name = unique_fs_name(&target_dir, desired_name).await?;
                    let dest = target_dir.join(&unique_name);

                    if let Err(e) = tokio::fs::rename(&old_path, &dest).await {
                        return Err(AppError::from(e));
                    }
                    Some(dest.to_string_lossy().into_owned())
                }
                PathKind::LogicalFolder | PathKind::StorageKey => row.path.clone(),
            };

            let mut active: file::ActiveModel = row.into();
            active.parent_id = Set(target_parent_id.map(str::to_string));
            active.path = Set(new_path);
            active.modified = Set(Utc::now().into());
            let updated = self.files.update_in_txn(&txn, active).await?;
            updated_rows.push(updated);
        }
        txn.commit().await.map_err(AppError::from)?;

        self.invalidate_listing(user_id, affected_parents).await;
        self.cache.delete(&cache_keys::stats(user_id)).await;
        self.cache.delete(&cache_keys::storage(user_id)).await;

        for row in &updated_rows {
            self.cache
                .delete(&cache_keys::single_file(&row.id, user_id))
                .await;
            self.emit(
                ctx,
                user_id,
                "move",
                &row.id,
                AuditStatus::Success,
                json!({"targetParentId": target_parent_id}),
            )
            .await;
            self.publish(user_id, ChangeKind::Moved, &row.id, row.parent_id.as_deref())
                .await;
        }

        Ok(updated_rows)
    }

    // ---------------------------------------------------------------
    // Copy
    // ---------------------------------------------------------------

    pub async fn copy_files(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        ids: &[String],
        target_parent_id: Option<&str>,
    ) -> AppResult<Vec<file::Model>> {
        if let Some(pid) = target_parent_id {
            self.files.get_owned(pid, user_id).await?;
        }

        let mut created_rows = Vec::new();
        for root_id in ids {
            let row = self.files.get_owned(root_id, user_id).await?;
            let new_root = self
                .copy_one_recursive(ctx, user_id, &row, target_parent_id)
                .await?;
            created_rows.push(new_root);
        }

        self.invalidate_listing(user_id, [target_parent_id.map(str::to_string)])
            .await;
        self.cache.delete(&cache_keys::stats(user_id)).await;
        self.cache.delete(&cache_keys::storage(user_id)).await;

        Ok(created_rows)
    }

    /// Copy `row` (and, if it's a folder, every descendant depth-first)
    /// under `target_parent_id`, returning the newly created root row.
    ///
    /// Written as a plain fn returning a boxed future (rather than
    /// `async fn`) so the self-call below doesn't produce an
    /// infinitely-sized future type — the same shape as
    /// `blob_store::collect_keys`.
    fn copy_one_recursive<'a>(
        &'a self,
        ctx: &'a RequestContext,
        user_id: &'a str,
        row: &'a file::Model,
        target_parent_id: Option<&'a str>,
    ) -> Pin<Box<dyn std::future::Future<Output = AppResult<file::Model>> + Send + 'a>> {
        Box::pin(async move {
            let siblings = self.files.sibling_names(user_id, target_parent_id).await?;
            let unique_display_name = unique_name(&siblings, &row.name)?;

            let new_id = self.ids.generate();
            let original_modified = row.modified;

            let new_path = match path_resolver::classify(row.path.as_deref()) {
                PathKind::LogicalFolder => None,
                PathKind::AbsoluteCustom => {
                    let target_dir = self
                        .custom_drive_dir_for(user_id, target_parent_id)
                        .await?;
                    let unique_fs = unique_fs_name(&target_dir, &row.name).await?;
                    let dest = target_dir.join(&unique_fs);

                    if row.file_type == FileType::Folder {
                        tokio::fs::create_dir(&dest).await.map_err(AppError::from)?;
                    } else {
                        let source = PathBuf::from(row.path.as_ref().expect("checked"));
                        tokio::fs::copy(&source, &dest)
                            .await
                            .map_err(AppError::from)?;
                    }
                    Some(dest.to_string_lossy().into_owned())
                }
                PathKind::StorageKey => {
                    let old_key = row.path.as_ref().expect("checked");
                    let ext = split_ext(&row.name).1;
                    let new_key = match ext {
                        Some(ext) => format!("{new_id}.{ext}"),
                        None => new_id.clone(),
                    };

                    let copy_result = if self.encrypts_at_rest {
                        self.copy_encrypted_blob(old_key, &new_key).await
                    } else {
                        let reader = self.blobs.get(old_key).await?;
                        self.blobs.put(&new_key, reader).await
                    };
                    if let Err(e) = copy_result {
                        let _ = self.blobs.delete(&new_key).await;
                        return Err(e);
                    }
                    Some(new_key)
                }
            };

            let active = file::ActiveModel {
                id: Set(new_id.clone()),
                user_id: Set(user_id.to_string()),
                name: Set(unique_display_name),
                file_type: Set(row.file_type),
                parent_id: Set(target_parent_id.map(str::to_string)),
                size: Set(row.size),
                mime_type: Set(row.mime_type.clone()),
                path: Set(new_path.clone()),
                starred: Set(false),
                shared: Set(false),
                modified: Set(original_modified),
                deleted_at: Set(None),
            };

            let created = match self.files.create(active).await {
                Ok(created) => created,
                Err(e) => {
                    if let PathKind::StorageKey = path_resolver::classify(row.path.as_deref()) {
                        if let Some(key) = &new_path {
                            let _ = self.blobs.delete(key).await;
                        }
                    }
                    return Err(e);
                }
            };

            // Some backends stamp `modified` via an insert trigger; issue a
            // corrective update so the copy preserves the source timestamp
            // (tolerance +/-1s, §4.C6 Copy).
            let created = if (created.modified.timestamp() - original_modified.timestamp()).abs() > 1
            {
                let mut active: file::ActiveModel = created.into();
                active.modified = Set(original_modified);
                self.files.update(active).await?
            } else {
                created
            };

            self.emit(
                ctx,
                user_id,
                "copy",
                &created.id,
                AuditStatus::Success,
                json!({"sourceId": row.id, "targetParentId": target_parent_id}),
            )
            .await;
            self.publish(user_id, ChangeKind::Copied, &created.id, target_parent_id)
                .await;

            if row.file_type == FileType::Folder {
                let children = self
                    .files
                    .find_children(
                        user_id,
                        Some(&row.id),
                        false,
                        nimbus_db::repositories::file::SortBy::Name,
                        nimbus_db::repositories::file::SortOrder::Asc,
                    )
                    .await?;
                for child in children {
                    self.copy_one_recursive(ctx, user_id, &child, Some(&created.id))
                        .await?;
                }
            }

            Ok(created)
        })
    }

    // ---------------------------------------------------------------
    // Soft-delete / restore / permanent delete
    // ---------------------------------------------------------------

    pub async fn soft_delete(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        ids: &[String],
    ) -> AppResult<()> {
        let roots = self.files.find_by_ids_owned(ids, user_id).await?;
        if roots.len() != ids.len() {
            return Err(AppError::NotFound("one or more files".to_string()));
        }

        let mut all_ids: Vec<String> = roots.iter().map(|r| r.id.clone()).collect();
        for root in &roots {
            let descendants = self.files.descendants(&root.id, user_id, false).await?;
            all_ids.extend(descendants);
        }
        all_ids.sort();
        all_ids.dedup();

        let folder_ids: Vec<String> = roots
            .iter()
            .filter(|r| r.file_type == FileType::Folder)
            .map(|r| r.id.clone())
            .collect();

        let txn = self.files.begin().await?;
        self.files
            .set_deleted_at_many(&txn, &all_ids, Some(Utc::now()))
            .await?;
        txn.commit().await.map_err(AppError::from)?;

        let parents: Vec<Option<String>> = roots.iter().map(|r| r.parent_id.clone()).collect();
        self.invalidate_listing(user_id, parents).await;
        self.cache.delete(&cache_keys::stats(user_id)).await;
        self.cache.delete(&cache_keys::storage(user_id)).await;
        self.cache
            .delete_prefix(&cache_keys::trash_prefix(user_id))
            .await;
        for folder_id in &folder_ids {
            self.cache
                .delete_prefix(&cache_keys::folder_size_prefix(user_id, folder_id))
                .await;
        }

        for root in &roots {
            self.emit(
                ctx,
                user_id,
                "soft_delete",
                &root.id,
                AuditStatus::Success,
                json!({}),
            )
            .await;
            self.publish(user_id, ChangeKind::Deleted, &root.id, root.parent_id.as_deref())
                .await;
        }

        Ok(())
    }

    pub async fn restore(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        ids: &[String],
    ) -> AppResult<()> {
        let roots = self.files.find_by_ids_owned(ids, user_id).await?;
        if roots.len() != ids.len() {
            return Err(AppError::NotFound("one or more files".to_string()));
        }

        let mut candidate_ids: Vec<String> = roots.iter().map(|r| r.id.clone()).collect();
        for root in &roots {
            let descendants = self.files.descendants(&root.id, user_id, true).await?;
            candidate_ids.extend(descendants);
        }
        candidate_ids.sort();
        candidate_ids.dedup();

        let mut rows = self.files.find_by_ids_owned(&candidate_ids, user_id).await?;
        rows.retain(file::Model::is_deleted);
        // Ancestors first: null-parent rows, then ordered by id for a
        // deterministic, stable processing order (§4.C6 Restore).
        rows.sort_by(|a, b| match (&a.parent_id, &b.parent_id) {
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            _ => a.id.cmp(&b.id),
        });

        let txn = self.files.begin().await?;
        let mut restored_ids = std::collections::HashSet::new();
        let mut touched_parents: Vec<Option<String>> = Vec::new();

        for row in rows {
            let target_parent_id = match &row.parent_id {
                Some(pid) => {
                    let parent_still_valid = self
                        .files
                        .find_by_id(pid)
                        .await?
                        .is_some_and(|p| !p.is_deleted() || restored_ids.contains(&p.id));
                    if parent_still_valid {
                        Some(pid.clone())
                    } else {
                        None
                    }
                }
                None => None,
            };

            let siblings = self
                .files
                .sibling_names(user_id, target_parent_id.as_deref())
                .await?;
            let final_name = unique_name(&siblings, &row.name)?;

            touched_parents.push(target_parent_id.clone());
            let row_id = row.id.clone();
            let mut active: file::ActiveModel = row.into();
            active.deleted_at = Set(None);
            active.parent_id = Set(target_parent_id);
            active.name = Set(final_name);
            active.modified = Set(Utc::now().into());
            self.files.update_in_txn(&txn, active).await?;
            restored_ids.insert(row_id);
        }
        txn.commit().await.map_err(AppError::from)?;

        self.invalidate_listing(user_id, touched_parents).await;
        self.cache.delete(&cache_keys::stats(user_id)).await;
        self.cache.delete(&cache_keys::storage(user_id)).await;
        self.cache
            .delete_prefix(&cache_keys::trash_prefix(user_id))
            .await;

        for root in &roots {
            self.emit(
                ctx,
                user_id,
                "restore",
                &root.id,
                AuditStatus::Success,
                json!({}),
            )
            .await;
            self.publish(user_id, ChangeKind::Restored, &root.id, root.parent_id.as_deref())
                .await;
        }

        Ok(())
    }

    pub async fn permanent_delete(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        ids: &[String],
    ) -> AppResult<()> {
        let roots = self.files.find_by_ids_owned(ids, user_id).await?;
        if roots.len() != ids.len() {
            return Err(AppError::NotFound("one or more files".to_string()));
        }

        let mut all_ids: Vec<String> = roots.iter().map(|r| r.id.clone()).collect();
        for root in &roots {
            let descendants = self.files.descendants(&root.id, user_id, true).await?;
            all_ids.extend(descendants);
        }
        all_ids.sort();
        all_ids.dedup();

        let rows = self.files.find_by_ids_owned(&all_ids, user_id).await?;

        let mut custom_drive_dirs: Vec<String> = Vec::new();
        for row in &rows {
            match path_resolver::classify(row.path.as_deref()) {
                PathKind::StorageKey => {
                    let key = row.path.as_ref().expect("checked");
                    let _ = self.blobs.delete(key).await;
                }
                PathKind::AbsoluteCustom => {
                    let path = row.path.clone().expect("checked");
                    if row.file_type == FileType::Folder {
                        custom_drive_dirs.push(path);
                    } else {
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                }
                PathKind::LogicalFolder => {}
            }
        }

        // Deepest directories first so `rmdir` on an emptied parent
        // succeeds (§4.C6 Permanent delete).
        custom_drive_dirs.sort_by_key(|p| std::cmp::Reverse(p.len()));
        for dir in &custom_drive_dirs {
            let _ = tokio::fs::remove_dir(dir).await;
        }

        let txn = self.files.begin().await?;
        self.files.delete_many_in_txn(&txn, &all_ids).await?;
        txn.commit().await.map_err(AppError::from)?;

        let parents: Vec<Option<String>> = roots.iter().map(|r| r.parent_id.clone()).collect();
        self.invalidate_listing(user_id, parents).await;
        self.cache.delete(&cache_keys::stats(user_id)).await;
        self.cache.delete(&cache_keys::storage(user_id)).await;
        self.cache
            .delete_prefix(&cache_keys::trash_prefix(user_id))
            .await;

        for root in &roots {
            self.emit(
                ctx,
                user_id,
                "permanent_delete",
                &root.id,
                AuditStatus::Success,
                json!({}),
            )
            .await;
            self.publish(
                user_id,
                ChangeKind::PurgedPermanently,
                &root.id,
                root.parent_id.as_deref(),
            )
            .await;
        }

        Ok(())
    }

    // ---------------------------------------------------------------
    // Star / share
    // ---------------------------------------------------------------

    pub async fn set_starred(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        id: &str,
        starred: bool,
    ) -> AppResult<file::Model> {
        let row = self.files.get_owned(id, user_id).await?;
        let parent_id = row.parent_id.clone();
        let mut active: file::ActiveModel = row.into();
        active.starred = Set(starred);
        active.modified = Set(Utc::now().into());
        let updated = self.files.update(active).await?;

        self.cache
            .delete_prefix(&cache_keys::starred_prefix(user_id))
            .await;
        self.cache.delete(&cache_keys::stats(user_id)).await;

        let kind = if starred {
            ChangeKind::Starred
        } else {
            ChangeKind::Unstarred
        };
        self.emit(
            ctx,
            user_id,
            "set_starred",
            &updated.id,
            AuditStatus::Success,
            json!({"starred": starred}),
        )
        .await;
        self.publish(user_id, kind, &updated.id, parent_id.as_deref())
            .await;

        Ok(updated)
    }

    pub async fn set_shared(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        id: &str,
        shared: bool,
    ) -> AppResult<file::Model> {
        let row = self.files.get_owned(id, user_id).await?;
        let parent_id = row.parent_id.clone();

        let mut all_ids = vec![row.id.clone()];
        if row.file_type == FileType::Folder {
            all_ids.extend(self.files.descendants(&row.id, user_id, false).await?);
        }

        let txn = self.files.begin().await?;
        for descendant_id in &all_ids {
            let descendant = self.files.get_owned(descendant_id, user_id).await?;
            let mut active: file::ActiveModel = descendant.into();
            active.shared = Set(shared);
            active.modified = Set(Utc::now().into());
            self.files.update_in_txn(&txn, active).await?;
        }
        txn.commit().await.map_err(AppError::from)?;

        let updated = self.files.get_owned(id, user_id).await?;

        self.cache
            .delete_prefix(&cache_keys::shared_prefix(user_id))
            .await;
        self.cache.delete(&cache_keys::stats(user_id)).await;

        let kind = if shared {
            ChangeKind::Shared
        } else {
            ChangeKind::Unshared
        };
        self.emit(
            ctx,
            user_id,
            "set_shared",
            &updated.id,
            AuditStatus::Success,
            json!({"shared": shared}),
        )
        .await;
        self.publish(user_id, kind, &updated.id, parent_id.as_deref())
            .await;

        Ok(updated)
    }

    // ---------------------------------------------------------------
    // Internal helpers
    // ---------------------------------------------------------------

    /// Absolute on-disk directory corresponding to `parent_id` for a
    /// custom-drive user; `None` resolves to the user's configured root.
    async fn custom_drive_dir_for(
        &self,
        user_id: &str,
        parent_id: Option<&str>,
    ) -> AppResult<PathBuf> {
        let user = self.users.get_by_id(user_id).await?;
        let root = user
            .custom_drive_path
            .ok_or_else(|| AppError::InvalidPath("custom drive has no configured path".to_string()))?;

        match parent_id {
            None => Ok(PathBuf::from(root)),
            Some(pid) => {
                let parent = self.files.get_owned(pid, user_id).await?;
                match parent.path {
                    Some(path) => Ok(PathBuf::from(path)),
                    None => Err(AppError::InvalidPath(
                        "parent folder has no on-disk location".to_string(),
                    )),
                }
            }
        }
    }

    async fn encrypt_into_blob(&self, key: &str, plain: BlobReader) -> AppResult<()> {
        let (cipher_reader, cipher_writer) = tokio::io::duplex(128 * 1024);
        let data_key = self.data_key.clone();
        let encrypt_task =
            tokio::spawn(async move { data_key.encrypt_stream(plain, cipher_writer).await });

        self.blobs.put(key, Box::pin(cipher_reader)).await?;
        encrypt_task
            .await
            .map_err(|e| AppError::Internal(format!("encrypt task panicked: {e}")))??;
        Ok(())
    }

    async fn copy_encrypted_blob(&self, old_key: &str, new_key: &str) -> AppResult<()> {
        let source = self.blobs.get(old_key).await?;
        let (dest_reader, dest_writer) = tokio::io::duplex(128 * 1024);
        let data_key = self.data_key.clone();
        let copy_task =
            tokio::spawn(async move { data_key.copy_encrypted(source, dest_writer).await });

        self.blobs.put(new_key, Box::pin(dest_reader)).await?;
        copy_task
            .await
            .map_err(|e| AppError::Internal(format!("copy task panicked: {e}")))??;
        Ok(())
    }

    async fn invalidate_listing(
        &self,
        user_id: &str,
        parents: impl IntoIterator<Item = Option<String>>,
    ) {
        let mut seen = std::collections::HashSet::new();
        for parent in parents {
            if seen.insert(parent.clone()) {
                self.cache
                    .delete_prefix(&cache_keys::file_listing_prefix(user_id, parent.as_deref()))
                    .await;
            }
        }
        self.cache
            .delete_prefix(&cache_keys::search_prefix(user_id))
            .await;
    }

    async fn emit(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        action: &str,
        resource_id: &str,
        status: AuditStatus,
        metadata: serde_json::Value,
    ) {
        self.audit
            .record(AuditEventInput {
                request_id: ctx.request_id.clone(),
                user_id: user_id.to_string(),
                action: action.to_string(),
                resource_type: "file".to_string(),
                resource_id: resource_id.to_string(),
                status,
                ip_address: ctx.ip_address.clone(),
                user_agent: ctx.user_agent.clone(),
                metadata,
                error_message: None,
                processing_time_ms: 0,
            })
            .await;
    }

    async fn publish(
        &self,
        user_id: &str,
        change_kind: ChangeKind,
        id: &str,
        parent_id: Option<&str>,
    ) {
        self.events
            .publish(StreamEvent {
                user_id: user_id.to_string(),
                change_kind,
                id: id.to_string(),
                parent_id: parent_id.map(str::to_string),
            })
            .await;
    }
}

/// Write a plain (unencrypted) byte stream to an absolute destination —
/// custom-drive uploads are never encrypted (§4.C5).
async fn write_plain_file(dest: &Path, mut reader: BlobReader) -> AppResult<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::File::create(dest).await.map_err(AppError::from)?;
    tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(AppError::from)?;
    file.sync_all().await.map_err(AppError::from)?;
    Ok(())
}

/// List the entries of `dir`, returning an empty set for a not-yet-
/// created directory rather than failing.
async fn unique_fs_name(dir: &Path, desired: &str) -> AppResult<String> {
    let mut existing = Vec::new();
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await.map_err(AppError::from)? {
                if let Some(name) = entry.file_name().to_str() {
                    existing.push(name.to_string());
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(AppError::from(e)),
    }
    unique_name(&existing, desired)
}

/// The ` (N)` duplicate-name suffix scheme (§4.C6), shared by folder
/// creation, copy, and restore conflict resolution.
fn unique_name(existing: &[String], desired: &str) -> AppResult<String> {
    if !existing.iter().any(|n| n == desired) {
        return Ok(desired.to_string());
    }

    let (stem, ext) = split_ext(desired);
    for n in 1..=MAX_NAME_SUFFIX {
        let candidate = match &ext {
            Some(e) => format!("{stem} ({n}).{e}"),
            None => format!("{stem} ({n})"),
        };
        if !existing.iter().any(|n| n == &candidate) {
            return Ok(candidate);
        }
    }

    Err(AppError::Conflict(
        "too many duplicate names in destination".to_string(),
    ))
}

/// Splits `name` into (stem, extension); a leading dot (dotfiles) is not
/// treated as an extension separator.
fn split_ext(name: &str) -> (String, Option<String>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx < name.len() - 1 => {
            (name[..idx].to_string(), Some(name[idx + 1..].to_string()))
        }
        _ => (name.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_name_returns_desired_when_no_conflict() {
        let existing = vec!["a.txt".to_string(), "b.txt".to_string()];
        assert_eq!(unique_name(&existing, "c.txt").unwrap(), "c.txt");
    }

    #[test]
    fn unique_name_appends_suffix_on_conflict() {
        let existing = vec!["report.pdf".to_string()];
        assert_eq!(unique_name(&existing, "report.pdf").unwrap(), "report (1).pdf");
    }

    #[test]
    fn unique_name_finds_first_free_suffix() {
        let existing = vec![
            "x.txt".to_string(),
            "x (1).txt".to_string(),
            "x (2).txt".to_string(),
        ];
        assert_eq!(unique_name(&existing, "x.txt").unwrap(), "x (3).txt");
    }

    #[test]
    fn unique_name_handles_extensionless_names() {
        let existing = vec!["notes".to_string()];
        assert_eq!(unique_name(&existing, "notes").unwrap(), "notes (1)");
    }

    #[test]
    fn unique_name_treats_leading_dot_as_not_an_extension() {
        let existing = vec![".gitignore".to_string()];
        assert_eq!(unique_name(&existing, ".gitignore").unwrap(), ".gitignore (1)");
    }

    #[test]
    fn unique_name_fails_beyond_10000_duplicates() {
        let mut existing = vec!["x.txt".to_string()];
        for n in 1..=MAX_NAME_SUFFIX {
            existing.push(format!("x ({n}).txt"));
        }
        assert!(matches!(
            unique_name(&existing, "x.txt"),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn split_ext_separates_stem_and_extension() {
        assert_eq!(
            split_ext("archive.tar.gz"),
            ("archive.tar".to_string(), Some("gz".to_string()))
        );
        assert_eq!(split_ext("README"), ("README".to_string(), None));
    }
}
