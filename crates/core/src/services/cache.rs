//! Cache (C3): key/value cache with TTL, prefix-scan invalidation, and
//! graceful bypass on unavailability.
//!
//! A cache miss or backend outage never surfaces as an error to callers —
//! every read falls through to the authoritative source; only
//! [`Cache::set`] on a write path can raise [`AppError::Unavailable`],
//! and even that is advisory: the cache may lag briefly but must
//! eventually converge.

use std::time::Duration;

use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::Config as RedisConfig;
use fred::types::scan::{ScanType, Scanner};
use futures::TryStreamExt;
use nimbus_common::{get_metrics, AppResult};
use serde::{de::DeserializeOwned, Serialize};

/// Canonical TTLs (§4.C3).
pub mod ttl {
    use std::time::Duration;

    pub const FILE_LISTING: Duration = Duration::from_secs(60);
    pub const SINGLE_FILE: Duration = Duration::from_secs(300);
    pub const FOLDER_SIZE: Duration = Duration::from_secs(300);
    pub const SEARCH: Duration = Duration::from_secs(120);
    pub const STATS: Duration = Duration::from_secs(300);
    pub const CUSTOM_DRIVE_SETTINGS: Duration = Duration::from_secs(60);
}

/// Key/value cache with TTL and prefix-pattern invalidation.
///
/// Implementors MUST treat every I/O failure as a cache miss on reads —
/// never propagate it to the caller.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a raw value. Returns `Ok(None)` on miss OR backend outage.
    async fn get_raw(&self, key: &str) -> Option<String>;

    /// Store a raw value with a TTL. Best-effort: failures are logged,
    /// not surfaced, since a cache write failing never blocks a commit.
    async fn set_raw(&self, key: &str, value: String, ttl: Duration);

    /// Delete one exact key. Idempotent.
    async fn delete(&self, key: &str);

    /// Delete every key matching `prefix*` via a non-blocking scan.
    async fn delete_prefix(&self, prefix: &str);
}

/// Handle-erased cache, shared across request tasks.
pub type CacheHandle = std::sync::Arc<dyn Cache>;

/// Typed convenience wrapper over [`Cache::get_raw`]/[`Cache::set_raw`]
/// for JSON-serializable values.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let raw = cache.get_raw(key).await;
    let hit = raw.is_some();
    get_metrics().record_cache_access(hit);
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// Typed convenience wrapper over [`Cache::set_raw`].
pub async fn set_json<T: Serialize + Sync>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
    if let Ok(serialized) = serde_json::to_string(value) {
        cache.set_raw(key, serialized, ttl).await;
    }
}

/// Redis-backed cache implementation.
#[derive(Clone)]
pub struct RedisCache {
    client: Client,
    key_prefix: String,
}

impl RedisCache {
    /// Connect to Redis. Connection failures here are fatal at startup
    /// (§5 "global mutable state... initialise eagerly at startup");
    /// outages discovered later degrade gracefully per-call instead.
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>) -> AppResult<Self> {
        let config = RedisConfig::from_url(redis_url)
            .map_err(|e| nimbus_common::AppError::Unavailable(format!("invalid redis url: {e}")))?;
        let client = Client::new(config, None, None, None);
        client
            .init()
            .await
            .map_err(|e| nimbus_common::AppError::Unavailable(format!("redis connect failed: {e}")))?;

        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        match self.client.get::<Option<String>, _>(self.namespaced(key)).await {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, key = %key, "cache read bypassed, falling back to source");
                get_metrics().record_cache_bypassed();
                None
            }
        }
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) {
        let result: Result<(), _> = self
            .client
            .set(
                self.namespaced(key),
                value,
                Some(fred::types::Expiration::EX(ttl.as_secs() as i64)),
                None,
                false,
            )
            .await;

        if let Err(e) = result {
            tracing::debug!(error = %e, key = %key, "cache write bypassed");
            get_metrics().record_cache_bypassed();
        }
    }

    async fn delete(&self, key: &str) {
        let _: Result<i64, _> = self.client.del(self.namespaced(key)).await;
    }

    async fn delete_prefix(&self, prefix: &str) {
        let pattern = format!("{}*", self.namespaced(prefix));
        let mut scan_stream = self.client.scan(pattern, Some(200), Some(ScanType::String));

        while let Ok(Some(mut page)) = scan_stream.try_next().await {
            if let Some(keys) = page.take_results() {
                if keys.is_empty() {
                    continue;
                }
                let _: Result<i64, _> = self.client.del(keys).await;
            }
            let _ = page.next();
        }
    }
}

/// No-op cache: every read misses, every write is discarded. Used in
/// tests and when the deployment runs without Redis configured.
#[derive(Clone, Default)]
pub struct NoOpCache;

#[async_trait]
impl Cache for NoOpCache {
    async fn get_raw(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set_raw(&self, _key: &str, _value: String, _ttl: Duration) {}

    async fn delete(&self, _key: &str) {}

    async fn delete_prefix(&self, _prefix: &str) {}
}

/// Canonical cache key construction (§4.C3).
pub mod keys {
    /// `files:<uid>:<parent_or_"root">:<sortby>:<order>`
    #[must_use]
    pub fn file_listing(uid: &str, parent: Option<&str>, sort_by: &str, order: &str) -> String {
        format!("files:{uid}:{}:{sort_by}:{order}", parent.unwrap_or("root"))
    }

    #[must_use]
    pub fn single_file(fid: &str, uid: &str) -> String {
        format!("file:{fid}:{uid}")
    }

    #[must_use]
    pub fn folder_size(uid: &str, fid: &str) -> String {
        format!("folder:{uid}:{fid}:size")
    }

    /// Emails and free-text queries MUST be hashed, never stored plaintext
    /// in keys (§4.C3).
    #[must_use]
    pub fn hash(input: &str) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(input.as_bytes());
        format!("{digest:x}")[..16].to_string()
    }

    #[must_use]
    pub fn search(uid: &str, query: &str, limit: u64) -> String {
        format!("search:{uid}:{}:{limit}", hash(query))
    }

    #[must_use]
    pub fn stats(uid: &str) -> String {
        format!("stats:{uid}")
    }

    #[must_use]
    pub fn storage(uid: &str) -> String {
        format!("storage:{uid}")
    }

    #[must_use]
    pub fn starred_listing(uid: &str, sort_by: &str, order: &str) -> String {
        format!("files:{uid}:starred:{sort_by}:{order}")
    }

    #[must_use]
    pub fn shared_listing(uid: &str, sort_by: &str, order: &str) -> String {
        format!("files:{uid}:shared:{sort_by}:{order}")
    }

    #[must_use]
    pub fn trash_listing(uid: &str, sort_by: &str, order: &str) -> String {
        format!("files:{uid}:trash:{sort_by}:{order}")
    }

    #[must_use]
    pub fn custom_drive_settings(uid: &str) -> String {
        format!("user:{uid}:customdrive")
    }

    /// Prefix used to invalidate every listing variant for a parent in
    /// one scan, regardless of sort/order.
    #[must_use]
    pub fn file_listing_prefix(uid: &str, parent: Option<&str>) -> String {
        format!("files:{uid}:{}:", parent.unwrap_or("root"))
    }

    #[must_use]
    pub fn search_prefix(uid: &str) -> String {
        format!("search:{uid}:")
    }

    #[must_use]
    pub fn starred_prefix(uid: &str) -> String {
        format!("files:{uid}:starred:")
    }

    #[must_use]
    pub fn shared_prefix(uid: &str) -> String {
        format!("files:{uid}:shared:")
    }

    #[must_use]
    pub fn trash_prefix(uid: &str) -> String {
        format!("files:{uid}:trash:")
    }

    #[must_use]
    pub fn folder_size_prefix(uid: &str, fid: &str) -> String {
        format!("folder:{uid}:{fid}:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_cache_always_misses() {
        let cache = NoOpCache;
        cache.set_raw("k", "v".to_string(), Duration::from_secs(60)).await;
        assert_eq!(cache.get_raw("k").await, None);
    }

    #[test]
    fn key_hashing_never_stores_raw_query() {
        let hashed = keys::hash("someone@example.com");
        assert!(!hashed.contains('@'));
        assert_eq!(hashed.len(), 16);
    }

    #[test]
    fn file_listing_key_defaults_parent_to_root() {
        assert_eq!(
            keys::file_listing("u1", None, "modified", "desc"),
            "files:u1:root:modified:desc"
        );
        assert_eq!(
            keys::file_listing("u1", Some("f1"), "name", "asc"),
            "files:u1:f1:name:asc"
        );
    }

    #[test]
    fn prefix_helpers_match_their_key_builders() {
        assert!(keys::file_listing("u1", Some("f1"), "name", "asc")
            .starts_with(&keys::file_listing_prefix("u1", Some("f1"))));
        assert!(keys::starred_listing("u1", "name", "asc").starts_with(&keys::starred_prefix("u1")));
        assert!(keys::shared_listing("u1", "name", "asc").starts_with(&keys::shared_prefix("u1")));
        assert!(keys::trash_listing("u1", "name", "asc").starts_with(&keys::trash_prefix("u1")));
    }
}
