//! File download streaming and folder-as-zip archiving (§4.C6 download,
//! §6 `/api/files/:id/download`).
//!
//! A single file streams its decrypted bytes directly. A folder is
//! archived on demand: every descendant is read (decrypting as needed)
//! and written into a zip, mirroring the folder's own tree shape. §5
//! requires a per-user mutex around this so one user can't run two
//! recursive archive builds at once and double the I/O for no benefit;
//! the lock map follows the same lazily-populated `RwLock<HashMap<..>>`
//! shape as [`super::event_publisher::SseBroadcaster`]'s per-user
//! channel map.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use nimbus_common::encryption::DataKey;
use nimbus_common::{AppError, AppResult};
use nimbus_db::entities::file::{self, FileType};
use nimbus_db::repositories::file::FileRepository;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, RwLock};

use super::blob_store::BlobStoreHandle;
use super::path_resolver::{self, PathKind};

/// A single downloadable file's bytes and the metadata needed to set
/// `Content-Type`/`Content-Disposition` (§6).
pub struct FileDownload {
    pub name: String,
    pub size: i64,
    pub mime_type: Option<String>,
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
}

/// Download streaming and zip archiving over [`FileRepository`] +
/// [`BlobStoreHandle`] (§4.C6, §5).
#[derive(Clone)]
pub struct DownloadService {
    files: FileRepository,
    blobs: BlobStoreHandle,
    data_key: DataKey,
    encrypts_at_rest: bool,
    zip_locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
}

impl DownloadService {
    #[must_use]
    pub fn new(
        files: FileRepository,
        blobs: BlobStoreHandle,
        data_key: DataKey,
        encrypts_at_rest: bool,
    ) -> Self {
        Self {
            files,
            blobs,
            data_key,
            encrypts_at_rest,
            zip_locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Stream a single file's plaintext bytes. Errors `InvalidPath` if
    /// `file_id` names a folder — callers should route those to
    /// [`Self::download_folder_as_zip`] instead (§6 download endpoint).
    pub async fn download_file(&self, user_id: &str, file_id: &str) -> AppResult<FileDownload> {
        let row = self.files.get_owned(file_id, user_id).await?;
        if row.file_type == FileType::Folder {
            return Err(AppError::InvalidPath(
                "cannot stream a folder directly; request a zip download".to_string(),
            ));
        }

        let reader = self.open_plain_reader(&row).await?;
        Ok(FileDownload {
            name: row.name,
            size: row.size,
            mime_type: row.mime_type,
            reader,
        })
    }

    /// Build a zip archive of `folder_id` and every descendant,
    /// preserving the relative tree shape, and return it alongside a
    /// suggested `<name>.zip` filename.
    ///
    /// Serialised per `user_id`: a second call from the same user while
    /// one is already running waits for it rather than running a
    /// concurrent recursive build (§5).
    pub async fn download_folder_as_zip(
        &self,
        user_id: &str,
        folder_id: &str,
    ) -> AppResult<(String, Vec<u8>)> {
        let root = self.files.get_owned(folder_id, user_id).await?;
        if root.file_type != FileType::Folder {
            return Err(AppError::InvalidPath("not a folder".to_string()));
        }

        let lock = self.lock_for(user_id).await;
        let _guard = lock.lock().await;

        let descendant_ids = self.files.descendants(folder_id, user_id, false).await?;
        let rows = self.files.find_by_ids_owned(&descendant_ids, user_id).await?;

        let mut by_id: HashMap<&str, &file::Model> =
            HashMap::with_capacity(rows.len() + 1);
        for row in &rows {
            by_id.insert(row.id.as_str(), row);
        }

        let mut buf = Vec::new();
        {
            let mut writer = ZipFileWriter::with_tokio(&mut buf);
            for row in &rows {
                if row.file_type == FileType::Folder {
                    continue;
                }

                let archive_path = archive_relative_path(&by_id, &root.id, row);
                let mut reader = self.open_plain_reader(row).await?;
                let mut data = Vec::with_capacity(row.size.max(0) as usize);
                reader
                    .read_to_end(&mut data)
                    .await
                    .map_err(AppError::from)?;

                let builder = ZipEntryBuilder::new(archive_path.into(), Compression::Deflate);
                writer
                    .write_entry_whole(builder, &data)
                    .await
                    .map_err(|e| AppError::Internal(format!("zip write failed: {e}")))?;
            }
            writer
                .close()
                .await
                .map_err(|e| AppError::Internal(format!("zip close failed: {e}")))?;
        }

        Ok((format!("{}.zip", root.name), buf))
    }

    async fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.zip_locks.read().await.get(user_id) {
            return lock.clone();
        }
        self.zip_locks
            .write()
            .await
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn open_plain_reader(&self, row: &file::Model) -> AppResult<Pin<Box<dyn AsyncRead + Send>>> {
        match path_resolver::classify(row.path.as_deref()) {
            PathKind::LogicalFolder => Err(AppError::Internal(
                "folder row has no blob to stream".to_string(),
            )),
            PathKind::AbsoluteCustom => {
                let path = row
                    .path
                    .as_deref()
                    .ok_or_else(|| AppError::Internal("custom-drive row missing path".to_string()))?;
                let file = tokio::fs::File::open(path).await.map_err(AppError::from)?;
                Ok(Box::pin(file))
            }
            PathKind::StorageKey => {
                let key = row
                    .path
                    .as_deref()
                    .ok_or_else(|| AppError::Internal("stored row missing path".to_string()))?;
                let cipher = self.blobs.get(key).await?;

                if !self.encrypts_at_rest {
                    return Ok(cipher);
                }

                let (plain_reader, plain_writer) = tokio::io::duplex(128 * 1024);
                let data_key = self.data_key.clone();
                tokio::spawn(async move {
                    let _ = data_key.decrypt_stream(cipher, plain_writer).await;
                });
                Ok(Box::pin(plain_reader))
            }
        }
    }
}

/// Path of `row` relative to `root_id`, walking up through `by_id`'s
/// ancestors and joining with `/` (zip archives always use forward
/// slashes regardless of host OS).
fn archive_relative_path(
    by_id: &HashMap<&str, &file::Model>,
    root_id: &str,
    row: &file::Model,
) -> String {
    let mut segments = vec![row.name.clone()];
    let mut current = row.parent_id.as_deref();
    while let Some(parent_id) = current {
        if parent_id == root_id {
            break;
        }
        let Some(parent) = by_id.get(parent_id) else {
            break;
        };
        segments.push(parent.name.clone());
        current = parent.parent_id.as_deref();
    }
    segments.reverse();
    segments.join("/")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(id: &str, name: &str, parent_id: Option<&str>, file_type: FileType) -> file::Model {
        file::Model {
            id: id.to_string(),
            user_id: "u1".to_string(),
            name: name.to_string(),
            file_type,
            parent_id: parent_id.map(str::to_string),
            size: 0,
            mime_type: None,
            path: None,
            starred: false,
            shared: false,
            modified: Utc::now().into(),
            deleted_at: None,
        }
    }

    #[test]
    fn archive_path_is_relative_to_the_archived_root() {
        let root = row("root", "Photos", None, FileType::Folder);
        let sub = row("sub", "2024", Some("root"), FileType::Folder);
        let leaf = row("leaf", "beach.jpg", Some("sub"), FileType::File);

        let mut by_id = HashMap::new();
        by_id.insert(root.id.as_str(), &root);
        by_id.insert(sub.id.as_str(), &sub);
        by_id.insert(leaf.id.as_str(), &leaf);

        assert_eq!(
            archive_relative_path(&by_id, &root.id, &leaf),
            "2024/beach.jpg"
        );
    }

    #[test]
    fn archive_path_of_a_direct_child_has_no_separator() {
        let root = row("root", "Photos", None, FileType::Folder);
        let leaf = row("leaf", "beach.jpg", Some("root"), FileType::File);

        let mut by_id = HashMap::new();
        by_id.insert(root.id.as_str(), &root);
        by_id.insert(leaf.id.as_str(), &leaf);

        assert_eq!(archive_relative_path(&by_id, &root.id, &leaf), "beach.jpg");
    }
}
