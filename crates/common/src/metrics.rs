//! Metrics collection for the storage engine.
//!
//! Provides application-level counters for monitoring performance and
//! observing the audit-event pipeline (P7: "for every audit event
//! emitted, the corresponding DB row eventually appears OR the event's
//! failure reason is recorded by the metrics counter").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics instance.
static METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance.
pub fn get_metrics() -> &'static Arc<Metrics> {
    METRICS.get_or_init(|| Arc::new(Metrics::new()))
}

/// Initialize global metrics with custom instance.
pub fn init_metrics(metrics: Arc<Metrics>) -> Result<(), Arc<Metrics>> {
    METRICS.set(metrics)
}

/// Application metrics collector.
#[derive(Debug)]
pub struct Metrics {
    // === Request Metrics ===
    /// Total HTTP requests received
    pub http_requests_total: AtomicU64,
    /// Active HTTP requests
    pub http_requests_active: AtomicU64,
    /// HTTP requests by status code category (2xx, 4xx, 5xx)
    pub http_requests_2xx: AtomicU64,
    pub http_requests_4xx: AtomicU64,
    pub http_requests_5xx: AtomicU64,
    /// Total request latency in microseconds
    pub http_request_latency_us_total: AtomicU64,
    /// Request count for average calculation
    pub http_request_latency_count: AtomicU64,

    // === Database Metrics ===
    /// Total database queries executed
    pub db_queries_total: AtomicU64,
    /// Database query errors
    pub db_errors_total: AtomicU64,
    /// Total database query time in microseconds
    pub db_query_time_us_total: AtomicU64,
    /// Database query count for average calculation
    pub db_query_count: AtomicU64,

    // === Cache Metrics (§4.C3) ===
    /// Cache reads that hit
    pub cache_hits: AtomicU64,
    /// Cache reads that missed or fell through on outage
    pub cache_misses: AtomicU64,
    /// Cache backend outages observed (graceful bypass triggered)
    pub cache_bypassed: AtomicU64,

    // === Audit Event Pipeline Metrics (§4.C9) ===
    /// Audit jobs enqueued by the producer
    pub audit_jobs_enqueued: AtomicU64,
    /// Audit jobs that inserted their `AuditEvent` row successfully
    pub audit_jobs_processed: AtomicU64,
    /// Audit jobs that failed permanently (validation/integrity — no retry)
    pub audit_jobs_failed_permanent: AtomicU64,
    /// Audit jobs that failed but remain retryable
    pub audit_jobs_failed_retryable: AtomicU64,

    // === Background Job Metrics (§4.C10) ===
    /// Rows purged by the trash-expiry sweep
    pub trash_expiry_rows_purged: AtomicU64,
    /// Orphans (blob-without-row or row-without-blob) reconciled
    pub orphans_reconciled: AtomicU64,

    // === Custom-Drive Sync Metrics (§4.C11) ===
    /// Reconciliation passes that found and applied at least one change
    pub custom_drive_sync_runs: AtomicU64,

    // === Real-time Metrics ===
    /// Active SSE connections
    pub sse_connections_active: AtomicU64,

    // === Search Metrics ===
    /// Full-text searches performed
    pub search_queries_total: AtomicU64,
    /// Full-text search time in microseconds
    pub search_time_us_total: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            http_requests_total: AtomicU64::new(0),
            http_requests_active: AtomicU64::new(0),
            http_requests_2xx: AtomicU64::new(0),
            http_requests_4xx: AtomicU64::new(0),
            http_requests_5xx: AtomicU64::new(0),
            http_request_latency_us_total: AtomicU64::new(0),
            http_request_latency_count: AtomicU64::new(0),

            db_queries_total: AtomicU64::new(0),
            db_errors_total: AtomicU64::new(0),
            db_query_time_us_total: AtomicU64::new(0),
            db_query_count: AtomicU64::new(0),

            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_bypassed: AtomicU64::new(0),

            audit_jobs_enqueued: AtomicU64::new(0),
            audit_jobs_processed: AtomicU64::new(0),
            audit_jobs_failed_permanent: AtomicU64::new(0),
            audit_jobs_failed_retryable: AtomicU64::new(0),

            trash_expiry_rows_purged: AtomicU64::new(0),
            orphans_reconciled: AtomicU64::new(0),

            custom_drive_sync_runs: AtomicU64::new(0),

            sse_connections_active: AtomicU64::new(0),

            search_queries_total: AtomicU64::new(0),
            search_time_us_total: AtomicU64::new(0),
        }
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, status_code: u16, latency: Duration) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);

        match status_code {
            200..=299 => self.http_requests_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.http_requests_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.http_requests_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };

        self.http_request_latency_us_total
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.http_request_latency_count
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Start tracking an active request.
    pub fn start_request(&self) {
        self.http_requests_active.fetch_add(1, Ordering::Relaxed);
    }

    /// End tracking an active request.
    pub fn end_request(&self) {
        self.http_requests_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a database query.
    pub fn record_db_query(&self, duration: Duration, is_error: bool) {
        self.db_queries_total.fetch_add(1, Ordering::Relaxed);
        self.db_query_time_us_total
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.db_query_count.fetch_add(1, Ordering::Relaxed);

        if is_error {
            self.db_errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a cache read outcome.
    pub fn record_cache_access(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record that the cache backend was unreachable and the caller fell
    /// back to the source of truth.
    pub fn record_cache_bypassed(&self) {
        self.cache_bypassed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that an audit job was enqueued by the producer.
    pub fn record_audit_job_enqueued(&self) {
        self.audit_jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the terminal outcome of an audit job handler invocation.
    pub fn record_audit_job_outcome(&self, outcome: AuditJobOutcome) {
        match outcome {
            AuditJobOutcome::Processed => {
                self.audit_jobs_processed.fetch_add(1, Ordering::Relaxed);
            }
            AuditJobOutcome::FailedPermanent => {
                self.audit_jobs_failed_permanent
                    .fetch_add(1, Ordering::Relaxed);
            }
            AuditJobOutcome::FailedRetryable => {
                self.audit_jobs_failed_retryable
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record rows purged by the trash-expiry sweep.
    pub fn record_trash_expiry_purged(&self, count: u64) {
        self.trash_expiry_rows_purged
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record orphans reconciled by the C10 reconciliation job.
    pub fn record_orphans_reconciled(&self, count: u64) {
        self.orphans_reconciled.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a custom-drive reconciliation pass that applied a change.
    pub fn record_custom_drive_sync(&self) {
        self.custom_drive_sync_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a search query.
    pub fn record_search(&self, duration: Duration) {
        self.search_queries_total.fetch_add(1, Ordering::Relaxed);
        self.search_time_us_total
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            http_requests_total: self.http_requests_total.load(Ordering::Relaxed),
            http_requests_active: self.http_requests_active.load(Ordering::Relaxed),
            http_requests_2xx: self.http_requests_2xx.load(Ordering::Relaxed),
            http_requests_4xx: self.http_requests_4xx.load(Ordering::Relaxed),
            http_requests_5xx: self.http_requests_5xx.load(Ordering::Relaxed),
            http_request_latency_avg_us: self.average_latency_us(),

            db_queries_total: self.db_queries_total.load(Ordering::Relaxed),
            db_errors_total: self.db_errors_total.load(Ordering::Relaxed),
            db_query_avg_time_us: self.average_db_query_time_us(),

            cache_hit_rate: self.cache_hit_rate(),
            cache_bypassed: self.cache_bypassed.load(Ordering::Relaxed),

            audit_jobs_enqueued: self.audit_jobs_enqueued.load(Ordering::Relaxed),
            audit_jobs_processed: self.audit_jobs_processed.load(Ordering::Relaxed),
            audit_jobs_failed_permanent: self
                .audit_jobs_failed_permanent
                .load(Ordering::Relaxed),
            audit_jobs_failed_retryable: self
                .audit_jobs_failed_retryable
                .load(Ordering::Relaxed),

            trash_expiry_rows_purged: self.trash_expiry_rows_purged.load(Ordering::Relaxed),
            orphans_reconciled: self.orphans_reconciled.load(Ordering::Relaxed),

            custom_drive_sync_runs: self.custom_drive_sync_runs.load(Ordering::Relaxed),

            sse_connections_active: self.sse_connections_active.load(Ordering::Relaxed),

            search_queries_total: self.search_queries_total.load(Ordering::Relaxed),
            search_avg_time_us: self.average_search_time_us(),
        }
    }

    /// Calculate average HTTP request latency.
    fn average_latency_us(&self) -> u64 {
        let total = self.http_request_latency_us_total.load(Ordering::Relaxed);
        let count = self.http_request_latency_count.load(Ordering::Relaxed);
        if count > 0 {
            total / count
        } else {
            0
        }
    }

    /// Calculate average database query time.
    fn average_db_query_time_us(&self) -> u64 {
        let total = self.db_query_time_us_total.load(Ordering::Relaxed);
        let count = self.db_query_count.load(Ordering::Relaxed);
        if count > 0 {
            total / count
        } else {
            0
        }
    }

    /// Calculate cache hit rate.
    fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Calculate average search time.
    fn average_search_time_us(&self) -> u64 {
        let total = self.search_time_us_total.load(Ordering::Relaxed);
        let count = self.search_queries_total.load(Ordering::Relaxed);
        if count > 0 {
            total / count
        } else {
            0
        }
    }

    /// Export metrics in Prometheus format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP nimbus_http_requests_total Total HTTP requests\n");
        output.push_str("# TYPE nimbus_http_requests_total counter\n");
        output.push_str(&format!(
            "nimbus_http_requests_total {}\n",
            snapshot.http_requests_total
        ));

        output.push_str("# HELP nimbus_http_requests_by_status HTTP requests by status\n");
        output.push_str("# TYPE nimbus_http_requests_by_status counter\n");
        output.push_str(&format!(
            "nimbus_http_requests_by_status{{status=\"2xx\"}} {}\n",
            snapshot.http_requests_2xx
        ));
        output.push_str(&format!(
            "nimbus_http_requests_by_status{{status=\"4xx\"}} {}\n",
            snapshot.http_requests_4xx
        ));
        output.push_str(&format!(
            "nimbus_http_requests_by_status{{status=\"5xx\"}} {}\n",
            snapshot.http_requests_5xx
        ));

        output.push_str("# HELP nimbus_db_queries_total Total database queries\n");
        output.push_str("# TYPE nimbus_db_queries_total counter\n");
        output.push_str(&format!(
            "nimbus_db_queries_total {}\n",
            snapshot.db_queries_total
        ));

        output.push_str("# HELP nimbus_cache_hit_rate Cache hit rate\n");
        output.push_str("# TYPE nimbus_cache_hit_rate gauge\n");
        output.push_str(&format!(
            "nimbus_cache_hit_rate {:.4}\n",
            snapshot.cache_hit_rate
        ));

        output.push_str("# HELP nimbus_audit_jobs_enqueued Audit jobs enqueued\n");
        output.push_str("# TYPE nimbus_audit_jobs_enqueued counter\n");
        output.push_str(&format!(
            "nimbus_audit_jobs_enqueued {}\n",
            snapshot.audit_jobs_enqueued
        ));

        output.push_str("# HELP nimbus_audit_jobs_processed Audit jobs processed\n");
        output.push_str("# TYPE nimbus_audit_jobs_processed counter\n");
        output.push_str(&format!(
            "nimbus_audit_jobs_processed {}\n",
            snapshot.audit_jobs_processed
        ));

        output.push_str(
            "# HELP nimbus_audit_jobs_failed_permanent Audit jobs permanently failed\n",
        );
        output.push_str("# TYPE nimbus_audit_jobs_failed_permanent counter\n");
        output.push_str(&format!(
            "nimbus_audit_jobs_failed_permanent {}\n",
            snapshot.audit_jobs_failed_permanent
        ));

        output.push_str(
            "# HELP nimbus_audit_jobs_failed_retryable Audit jobs that remain retryable\n",
        );
        output.push_str("# TYPE nimbus_audit_jobs_failed_retryable counter\n");
        output.push_str(&format!(
            "nimbus_audit_jobs_failed_retryable {}\n",
            snapshot.audit_jobs_failed_retryable
        ));

        output.push_str("# HELP nimbus_sse_connections Active SSE connections\n");
        output.push_str("# TYPE nimbus_sse_connections gauge\n");
        output.push_str(&format!(
            "nimbus_sse_connections {}\n",
            snapshot.sse_connections_active
        ));

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal outcome of dispatching a single audit job (§4.C9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditJobOutcome {
    /// The `AuditEvent` row was inserted successfully.
    Processed,
    /// Validation or integrity failure — never retried.
    FailedPermanent,
    /// Transient failure — still eligible for retry.
    FailedRetryable,
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub http_requests_total: u64,
    pub http_requests_active: u64,
    pub http_requests_2xx: u64,
    pub http_requests_4xx: u64,
    pub http_requests_5xx: u64,
    pub http_request_latency_avg_us: u64,

    pub db_queries_total: u64,
    pub db_errors_total: u64,
    pub db_query_avg_time_us: u64,

    pub cache_hit_rate: f64,
    pub cache_bypassed: u64,

    pub audit_jobs_enqueued: u64,
    pub audit_jobs_processed: u64,
    pub audit_jobs_failed_permanent: u64,
    pub audit_jobs_failed_retryable: u64,

    pub trash_expiry_rows_purged: u64,
    pub orphans_reconciled: u64,

    pub custom_drive_sync_runs: u64,

    pub sse_connections_active: u64,

    pub search_queries_total: u64,
    pub search_avg_time_us: u64,
}

/// Timer guard for measuring operation duration.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.http_requests_total.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.audit_jobs_processed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_http_request() {
        let metrics = Metrics::new();

        metrics.record_http_request(200, Duration::from_millis(50));
        metrics.record_http_request(404, Duration::from_millis(10));
        metrics.record_http_request(500, Duration::from_millis(100));

        assert_eq!(metrics.http_requests_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.http_requests_2xx.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.http_requests_4xx.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.http_requests_5xx.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_active_request_tracking() {
        let metrics = Metrics::new();

        metrics.start_request();
        metrics.start_request();
        assert_eq!(metrics.http_requests_active.load(Ordering::Relaxed), 2);

        metrics.end_request();
        assert_eq!(metrics.http_requests_active.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_record_db_query() {
        let metrics = Metrics::new();

        metrics.record_db_query(Duration::from_micros(500), false);
        metrics.record_db_query(Duration::from_micros(1000), true);

        assert_eq!(metrics.db_queries_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.db_errors_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = Metrics::new();

        metrics.record_cache_access(true);
        metrics.record_cache_access(true);
        metrics.record_cache_access(true);
        metrics.record_cache_access(false);

        let rate = metrics.cache_hit_rate();
        assert!((rate - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_cache_hit_rate_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.cache_hit_rate(), 0.0);
    }

    #[test]
    fn audit_job_outcomes_are_tallied_independently() {
        let metrics = Metrics::new();
        metrics.record_audit_job_enqueued();
        metrics.record_audit_job_outcome(AuditJobOutcome::Processed);
        metrics.record_audit_job_outcome(AuditJobOutcome::FailedRetryable);
        metrics.record_audit_job_outcome(AuditJobOutcome::FailedPermanent);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.audit_jobs_enqueued, 1);
        assert_eq!(snapshot.audit_jobs_processed, 1);
        assert_eq!(snapshot.audit_jobs_failed_retryable, 1);
        assert_eq!(snapshot.audit_jobs_failed_permanent, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.record_http_request(200, Duration::from_millis(50));

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("nimbus_http_requests_total 1"));
        assert!(prometheus.contains("nimbus_http_requests_by_status{status=\"2xx\"} 1"));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(10));
        let elapsed = timer.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
    }
}
