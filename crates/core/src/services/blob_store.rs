//! Blob store (C2): object-level read/write/delete/list/exists behind two
//! interchangeable drivers, local-disk and S3-compatible.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use nimbus_common::{AppError, AppResult};
use tokio::io::{AsyncRead, AsyncWrite};

/// A boxed, owned async reader — the unit of streamed blob content.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// One page of a `list_keys` scan.
pub struct KeyPage {
    pub keys: Vec<String>,
    /// Opaque continuation token; `None` means this was the last page.
    pub next: Option<String>,
}

/// Capability interface implemented by both drivers (§9 "Dynamic dispatch
/// of storage drivers" — selected once at startup from `STORAGE_DRIVER`).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `data` to `key`. On failure no partial object is visible
    /// under `key`.
    async fn put(&self, key: &str, data: Pin<Box<dyn AsyncRead + Send + '_>>) -> AppResult<()>;

    /// Open a readable stream over `key`. Fails `NotFound` if absent.
    async fn get(&self, key: &str) -> AppResult<BlobReader>;

    /// Idempotent: deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> AppResult<()>;

    async fn exists(&self, key: &str) -> AppResult<bool>;

    /// Restartable pagination; used only by reconciliation (C10).
    async fn list_keys(&self, page_size: usize, continuation: Option<String>)
        -> AppResult<KeyPage>;

    /// Best-effort atomic: rename on local-disk, copy-then-delete on S3.
    /// Must not lose bytes on failure.
    async fn rename(&self, old_key: &str, new_key: &str) -> AppResult<()>;
}

/// Handle-erased blob store, shared across request tasks.
pub type BlobStoreHandle = std::sync::Arc<dyn BlobStore>;

/// Local-disk driver: writes under a fixed `upload_root`, atomically via a
/// `.tmp` sibling + rename (§5 concurrency model).
#[derive(Clone)]
pub struct LocalBlobStore {
    upload_root: PathBuf,
}

impl LocalBlobStore {
    #[must_use]
    pub fn new(upload_root: impl Into<PathBuf>) -> Self {
        Self {
            upload_root: upload_root.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.upload_root.join(key)
    }

    fn tmp_path_for(&self, key: &str) -> PathBuf {
        self.upload_root.join(format!("{key}.tmp"))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, mut data: Pin<Box<dyn AsyncRead + Send + '_>>) -> AppResult<()> {
        let dest = self.path_for(key);
        let tmp = self.tmp_path_for(key);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::copy(&mut data, &mut file).await?;
            file.sync_all().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tokio::fs::rename(&tmp, &dest).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> AppResult<BlobReader> {
        let path = self.path_for(key);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("blob {key}"))
            } else {
                AppError::from(e)
            }
        })?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) | Err(_) if !path.exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    async fn list_keys(
        &self,
        page_size: usize,
        continuation: Option<String>,
    ) -> AppResult<KeyPage> {
        // The local driver lists the whole tree (bounded by disk, not
        // memory-dangerous the way an unbounded S3 bucket would be) and
        // slices it using the continuation token as a resume-after key.
        let mut keys = Vec::new();
        collect_keys(&self.upload_root, &self.upload_root, &mut keys).await?;
        keys.sort();

        let start = match &continuation {
            Some(after) => keys.iter().position(|k| k == after).map_or(0, |i| i + 1),
            None => 0,
        };

        let end = (start + page_size).min(keys.len());
        let page: Vec<String> = keys[start..end].to_vec();
        let next = if end < keys.len() {
            page.last().cloned()
        } else {
            None
        };

        Ok(KeyPage { keys: page, next })
    }

    async fn rename(&self, old_key: &str, new_key: &str) -> AppResult<()> {
        let old_path = self.path_for(old_key);
        let new_path = self.path_for(new_key);
        if let Some(parent) = new_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&old_path, &new_path).await?;
        Ok(())
    }
}

fn collect_keys<'a>(
    root: &'a Path,
    dir: &'a Path,
    out: &'a mut Vec<String>,
) -> Pin<Box<dyn std::future::Future<Output = AppResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                collect_keys(root, &path, out).await?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                if let Some(s) = rel.to_str() {
                    if !s.ends_with(".tmp") {
                        out.push(s.replace(std::path::MAIN_SEPARATOR, "/"));
                    }
                }
            }
        }
        Ok(())
    })
}

/// S3-compatible driver, addressed by endpoint+bucket+region with
/// path-style toggling.
#[derive(Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    #[must_use]
    pub const fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, mut data: Pin<Box<dyn AsyncRead + Send + '_>>) -> AppResult<()> {
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut data, &mut buf).await?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(buf))
            .send()
            .await
            .map_err(|e| AppError::Unavailable(format!("s3 put failed: {e}")))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> AppResult<BlobReader> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let svc = e.as_service_error();
                if svc.is_some_and(|e| e.is_no_such_key()) {
                    AppError::NotFound(format!("blob {key}"))
                } else {
                    AppError::Unavailable(format!("s3 get failed: {e}"))
                }
            })?;

        let reader = output.body.into_async_read();
        Ok(Box::pin(reader))
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::Unavailable(format!("s3 delete failed: {e}")))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().is_some_and(|e| e.is_not_found()) {
                    Ok(false)
                } else {
                    Err(AppError::Unavailable(format!("s3 head failed: {e}")))
                }
            }
        }
    }

    async fn list_keys(
        &self,
        page_size: usize,
        continuation: Option<String>,
    ) -> AppResult<KeyPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(page_size as i32);

        if let Some(token) = continuation {
            request = request.continuation_token(token);
        }

        let output = request
            .send()
            .await
            .map_err(|e| AppError::Unavailable(format!("s3 list failed: {e}")))?;

        let keys = output
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(String::from))
            .collect();

        Ok(KeyPage {
            keys,
            next: output.next_continuation_token().map(String::from),
        })
    }

    async fn rename(&self, old_key: &str, new_key: &str) -> AppResult<()> {
        // S3 has no native rename; copy then delete, as the contract allows.
        let copy_source = format!("{}/{}", self.bucket, old_key);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(new_key)
            .send()
            .await
            .map_err(|e| AppError::Unavailable(format!("s3 copy failed: {e}")))?;

        self.delete(old_key).await
    }
}

/// Adapter so callers holding a `tokio::io::AsyncWrite` destination (e.g.
/// the HTTP download path) can pull bytes out of a [`BlobReader`] without
/// depending on this module's internals.
pub async fn copy_to_writer<W: AsyncWrite + Unpin>(
    mut reader: BlobReader,
    mut writer: W,
) -> AppResult<u64> {
    Ok(tokio::io::copy(&mut reader, &mut writer).await?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store() -> (LocalBlobStore, tempfile_dir::TempDir) {
        let dir = tempfile_dir::TempDir::new();
        (LocalBlobStore::new(dir.path().to_path_buf()), dir)
    }

    // Minimal self-cleaning tempdir so this crate doesn't need a dev-dep
    // on the `tempfile` crate for a handful of blob-store tests.
    mod tempfile_dir {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let path = std::env::temp_dir().join(format!(
                    "nimbus-blobstore-test-{}",
                    nanoid::nanoid!(8)
                ));
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let (store, _dir) = store().await;
        let data: Pin<Box<dyn AsyncRead + Send>> = Box::pin(std::io::Cursor::new(b"hello".to_vec()));
        store.put("a/b.txt", data).await.unwrap();

        let mut out = Vec::new();
        let mut reader = store.get("a/b.txt").await.unwrap();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (store, _dir) = store().await;
        let result = store.get("missing").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let (store, _dir) = store().await;
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn exists_reflects_put_and_delete() {
        let (store, _dir) = store().await;
        assert!(!store.exists("k").await.unwrap());
        let data: Pin<Box<dyn AsyncRead + Send>> = Box::pin(std::io::Cursor::new(b"x".to_vec()));
        store.put("k", data).await.unwrap();
        assert!(store.exists("k").await.unwrap());
        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn rename_moves_bytes() {
        let (store, _dir) = store().await;
        let data: Pin<Box<dyn AsyncRead + Send>> = Box::pin(std::io::Cursor::new(b"payload".to_vec()));
        store.put("old", data).await.unwrap();
        store.rename("old", "new").await.unwrap();
        assert!(!store.exists("old").await.unwrap());
        assert!(store.exists("new").await.unwrap());
    }

    #[tokio::test]
    async fn list_keys_paginates() {
        let (store, _dir) = store().await;
        for name in ["a", "b", "c"] {
            let data: Pin<Box<dyn AsyncRead + Send>> =
                Box::pin(std::io::Cursor::new(name.as_bytes().to_vec()));
            store.put(name, data).await.unwrap();
        }

        let page1 = store.list_keys(2, None).await.unwrap();
        assert_eq!(page1.keys.len(), 2);
        assert!(page1.next.is_some());

        let page2 = store.list_keys(2, page1.next).await.unwrap();
        assert_eq!(page2.keys.len(), 1);
        assert!(page2.next.is_none());
    }
}
