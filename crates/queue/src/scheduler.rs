//! Background maintenance jobs (§4.C10): trash expiry and orphan
//! reconciliation between the metadata store and the blob store.
//!
//! One `tokio::spawn`ed `interval` loop per job, a trait so the concrete
//! implementation stays testable without a live DB.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nimbus_core::{classify, BlobStoreHandle, PathKind, RequestContext, TreeEngine};
use nimbus_db::repositories::file::FileRepository;
use tokio::time::interval;

/// Scheduler configuration (§6 environment: trash retention default 15
/// days; reconciliation cadence is an implementation choice, not an
/// environment variable).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the trash-expiry sweep runs.
    pub trash_expiry_interval: Duration,
    /// How long a trashed row survives before it is eligible for purge.
    pub trash_retention_days: i64,
    /// How often orphan reconciliation runs.
    pub reconciliation_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            trash_expiry_interval: Duration::from_secs(3600),
            trash_retention_days: 15,
            reconciliation_interval: Duration::from_secs(6 * 3600),
        }
    }
}

/// Job executor trait for the two background jobs (§4.C10). A trait, not
/// inherent methods on a concrete struct, so tests can swap in a fake
/// without a database.
#[async_trait::async_trait]
pub trait JobExecutor: Send + Sync {
    /// Purge trashed rows older than the configured retention; returns
    /// the number of rows deleted.
    async fn trash_expiry(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>>;

    /// Reconcile blob store contents against metadata rows; returns the
    /// number of orphans resolved (blobs deleted + rows deleted).
    async fn reconcile_orphans(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>>;
}

/// Run both scheduled jobs as detached tasks.
pub fn run_scheduler<E: JobExecutor + 'static>(config: SchedulerConfig, executor: Arc<E>) {
    let trash_executor = Arc::clone(&executor);
    let trash_interval_duration = config.trash_expiry_interval;
    tokio::spawn(async move {
        let mut ticker = interval(trash_interval_duration);
        loop {
            ticker.tick().await;
            match trash_executor.trash_expiry().await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!(count, "purged expired trash rows");
                    }
                    nimbus_common::get_metrics().record_trash_expiry_purged(count);
                }
                Err(e) => tracing::error!(error = %e, "trash expiry sweep failed"),
            }
        }
    });

    let reconcile_interval_duration = config.reconciliation_interval;
    tokio::spawn(async move {
        let mut ticker = interval(reconcile_interval_duration);
        loop {
            ticker.tick().await;
            match executor.reconcile_orphans().await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!(count, "resolved orphaned blobs/rows");
                    }
                    nimbus_common::get_metrics().record_orphans_reconciled(count);
                }
                Err(e) => tracing::error!(error = %e, "orphan reconciliation failed"),
            }
        }
    });
}

/// Concrete [`JobExecutor`] wired to a real DB and blob store.
pub struct MaintenanceExecutor {
    files: FileRepository,
    blobs: BlobStoreHandle,
    tree: TreeEngine,
    retention: ChronoDuration,
}

impl MaintenanceExecutor {
    #[must_use]
    pub fn new(
        files: FileRepository,
        blobs: BlobStoreHandle,
        tree: TreeEngine,
        retention_days: i64,
    ) -> Self {
        Self {
            files,
            blobs,
            tree,
            retention: ChronoDuration::days(retention_days),
        }
    }

    fn system_ctx() -> RequestContext {
        RequestContext {
            request_id: "scheduler".to_string(),
            ip_address: None,
            user_agent: None,
        }
    }
}

#[async_trait::async_trait]
impl JobExecutor for MaintenanceExecutor {
    /// §4.C10 trash expiry: selects rows with `deleted_at` older than the
    /// retention window, deletes their bytes first (tolerating missing
    /// blobs), deletes absolute-path folders deepest-first, then deletes
    /// the rows — all via [`TreeEngine::permanent_delete`] so cache
    /// invalidation and audit emission stay uniform with a user-initiated
    /// purge.
    async fn trash_expiry(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let cutoff: DateTime<Utc> = Utc::now() - self.retention;
        let expired = self.files.find_expired_trash(cutoff).await?;

        let mut by_user: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();
        for row in &expired {
            by_user.entry(row.user_id.clone()).or_default().push(row.id.clone());
        }

        let ctx = Self::system_ctx();
        let mut purged = 0_u64;
        for (user_id, ids) in by_user {
            match self.tree.permanent_delete(&ctx, &user_id, &ids).await {
                Ok(()) => purged += ids.len() as u64,
                Err(e) => {
                    // Per-item tolerance (§4.C10): one user's failure
                    // (e.g. a row deleted concurrently) must not abort
                    // the sweep for everyone else.
                    tracing::warn!(user_id = %user_id, error = %e, "trash expiry failed for user, continuing");
                }
            }
        }

        Ok(purged)
    }

    /// §4.C10 orphan reconciliation: diff the blob store's key space
    /// against the metadata store's relative-path rows; delete blobs with
    /// no row and rows whose blob is missing. Custom-drive (absolute)
    /// rows and logical folders are excluded by construction —
    /// [`FileRepository::find_all_storage_keyed`] only returns relative
    /// storage-key rows.
    async fn reconcile_orphans(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let rows = self.files.find_all_storage_keyed().await?;
        let mut db_keys: HashSet<String> = HashSet::with_capacity(rows.len());
        for row in &rows {
            if let PathKind::StorageKey = classify(row.path.as_deref()) {
                db_keys.insert(row.path.clone().expect("checked by classify"));
            }
        }

        let mut blob_keys: HashSet<String> = HashSet::new();
        let mut continuation = None;
        loop {
            let page = self.blobs.list_keys(1000, continuation).await?;
            blob_keys.extend(page.keys);
            match page.next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        let mut resolved = 0_u64;

        for key in blob_keys.difference(&db_keys) {
            match self.blobs.delete(key).await {
                Ok(()) => resolved += 1,
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to delete orphaned blob"),
            }
        }

        let txn = self.files.begin().await?;
        let orphan_row_ids: Vec<String> = rows
            .iter()
            .filter(|row| {
                row.path
                    .as_deref()
                    .is_some_and(|key| !blob_keys.contains(key))
            })
            .map(|row| row.id.clone())
            .collect();
        if !orphan_row_ids.is_empty() {
            resolved += self.files.delete_many_in_txn(&txn, &orphan_row_ids).await?;
        }
        txn.commit().await?;

        Ok(resolved)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default_matches_spec_retention() {
        let config = SchedulerConfig::default();
        assert_eq!(config.trash_retention_days, 15);
        assert_eq!(config.trash_expiry_interval, Duration::from_secs(3600));
    }

    struct CountingExecutor {
        trash_calls: std::sync::atomic::AtomicU64,
    }

    #[async_trait::async_trait]
    impl JobExecutor for CountingExecutor {
        async fn trash_expiry(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
            self.trash_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(0)
        }

        async fn reconcile_orphans(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
            Ok(0)
        }
    }

    #[tokio::test(flavor = "multi_thread", start_paused = true)]
    async fn run_scheduler_invokes_trash_expiry_on_tick() {
        let executor = Arc::new(CountingExecutor {
            trash_calls: std::sync::atomic::AtomicU64::new(0),
        });
        run_scheduler(
            SchedulerConfig {
                trash_expiry_interval: Duration::from_secs(10),
                reconciliation_interval: Duration::from_secs(3600),
                ..SchedulerConfig::default()
            },
            Arc::clone(&executor),
        );

        tokio::time::advance(Duration::from_secs(25)).await;
        tokio::task::yield_now().await;

        assert!(executor.trash_calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }
}
