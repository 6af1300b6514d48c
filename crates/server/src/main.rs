//! Nimbus storage engine server entry point.
//!
//! Loads configuration, opens the DB pool and runs migrations, connects
//! the cache and audit job queue, selects a blob store driver, wires the
//! core services, spawns the background jobs (C10) and custom-drive sync
//! (C11), and serves the axum app with graceful shutdown (§5, §9 "global
//! mutable state... initialise eagerly at startup").

use std::net::SocketAddr;
use std::sync::Arc;

use apalis::prelude::*;
use axum::Router;
use nimbus_api::middleware::AppState;
use nimbus_common::encryption::DataKey;
use nimbus_common::config::{Config, StorageDriver};
use nimbus_core::{
    BlobStoreHandle, CacheHandle, DownloadService, ListingService, LocalBlobStore, NoOpCache,
    RedisCache, S3BlobStore, ShareService, SseBroadcaster, TreeEngine,
};
use nimbus_db::repositories::audit_event::AuditEventRepository;
use nimbus_db::repositories::file::FileRepository;
use nimbus_db::repositories::share_link::ShareLinkRepository;
use nimbus_db::repositories::user::UserRepository;
use nimbus_queue::workers::AuditWorkerContext;
use nimbus_queue::{
    audit_worker, run_scheduler, AuditJob, CustomDriveSync, MaintenanceExecutor, RedisAuditSink,
    SchedulerConfig, SyncConfig,
};
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

/// Builds the active blob store driver from `config.storage.driver`
/// (§9 "dynamic dispatch of storage drivers" — selected once at startup).
/// Returns the handle plus whether the driver encrypts at rest (§4.C5:
/// only the local driver does).
async fn build_blob_store(config: &Config) -> Result<(BlobStoreHandle, bool), Box<dyn std::error::Error>> {
    match config.storage.driver {
        StorageDriver::Local => {
            tokio::fs::create_dir_all(&config.storage.upload_dir).await?;
            let store = LocalBlobStore::new(config.storage.upload_dir.clone());
            Ok((Arc::new(store), true))
        }
        StorageDriver::S3 => {
            use aws_config::Region;
            use aws_sdk_s3::config::Credentials;

            let bucket = config
                .storage
                .s3_bucket
                .clone()
                .ok_or("STORAGE_DRIVER=s3 requires S3_BUCKET")?;
            let endpoint = config
                .storage
                .s3_endpoint
                .clone()
                .ok_or("STORAGE_DRIVER=s3 requires S3_ENDPOINT")?;
            let region = config.storage.s3_region.clone().unwrap_or_else(|| "us-east-1".to_string());
            let access_key = config
                .storage
                .s3_access_key
                .clone()
                .ok_or("STORAGE_DRIVER=s3 requires S3_ACCESS_KEY")?;
            let secret_key = config
                .storage
                .s3_secret_key
                .clone()
                .ok_or("STORAGE_DRIVER=s3 requires S3_SECRET_KEY")?;

            let credentials = Credentials::new(access_key, secret_key, None, None, "nimbus-config");
            let s3_config = aws_sdk_s3::Config::builder()
                .endpoint_url(endpoint)
                .region(Region::new(region))
                .credentials_provider(credentials)
                .force_path_style(config.storage.s3_force_path_style)
                .build();

            let client = aws_sdk_s3::Client::from_conf(s3_config);
            Ok((Arc::new(S3BlobStore::new(client, bucket)), false))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nimbus=debug,tower_http=debug".into()),
        )
        .init();

    info!("Starting nimbus-server...");

    let config = Config::load()?;

    let db = nimbus_db::init(&config).await?;
    info!("Connected to database");

    info!("Running database migrations...");
    nimbus_db::migrate(&db).await?;
    info!("Migrations completed");

    let db = Arc::new(db);
    let files = FileRepository::new(Arc::clone(&db));
    let users = UserRepository::new(Arc::clone(&db));
    let share_links = ShareLinkRepository::new(Arc::clone(&db));
    let audit_events = AuditEventRepository::new(Arc::clone(&db));

    // Cache (C3) — a reachable-but-degraded Redis falls back to the
    // source of truth per-call; only a connect failure at startup is
    // fatal, so an operator who genuinely has no Redis can run without
    // one rather than have every request pay a per-call connect retry.
    let cache_url = format!(
        "redis://{}{}:{}/{}",
        config
            .cache
            .password
            .as_ref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default(),
        config.cache.host,
        config.cache.port,
        config.cache.db
    );
    let cache: CacheHandle = match RedisCache::connect(&cache_url, config.cache.prefix.clone()).await
    {
        Ok(redis) => {
            info!("Connected to cache");
            Arc::new(redis)
        }
        Err(e) => {
            tracing::warn!(error = %e, "cache unavailable at startup, running with a no-op cache");
            Arc::new(NoOpCache)
        }
    };

    // Blob store (C2).
    let (blobs, encrypts_at_rest) = build_blob_store(&config).await?;
    info!(driver = ?config.storage.driver, "blob store ready");

    // Encryption (C5).
    let data_key = DataKey::from_base64(&config.storage.encryption_key)?;

    // Audit queue (C9, first sink) — apalis over Redis.
    let redis_conn = redis::Client::open(config.audit.queue_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_conn).await?;
    let audit_storage = apalis_redis::RedisStorage::<AuditJob>::new(redis_conn);
    info!("Connected to audit job queue");

    let audit_sink = Arc::new(RedisAuditSink::new(audit_storage.clone()));
    let events = SseBroadcaster::new();

    // Core services (C6-C8).
    let tree = TreeEngine::new(
        files.clone(),
        users.clone(),
        Arc::clone(&blobs),
        data_key.clone(),
        Arc::clone(&cache),
        events.clone(),
        audit_sink.clone(),
        config.storage.upload_dir.clone(),
        encrypts_at_rest,
    );
    let listing = ListingService::new(files.clone(), Arc::clone(&cache));
    let share = ShareService::new(files.clone(), share_links);
    let download = DownloadService::new(files.clone(), Arc::clone(&blobs), data_key, encrypts_at_rest);

    let state = AppState {
        tree: tree.clone(),
        listing,
        share,
        download,
        users: users.clone(),
        events: events.clone(),
    };

    // Background jobs (C10): trash expiry + orphan reconciliation.
    let maintenance = Arc::new(MaintenanceExecutor::new(
        files.clone(),
        Arc::clone(&blobs),
        tree,
        config.trash.retention_days,
    ));
    run_scheduler(SchedulerConfig::default(), maintenance);
    info!("Background maintenance jobs scheduled");

    // Custom-drive sync (C11): one watcher per custom-drive-enabled user.
    let custom_drive_sync = Arc::new(CustomDriveSync::new(
        files,
        users,
        Arc::clone(&cache),
        events,
        audit_sink,
    ));
    custom_drive_sync.spawn_all(SyncConfig::default());
    info!("Custom-drive sync watchers starting");

    // Audit worker (C9 consumer side) — validates, inserts one row,
    // retries transient failures per §4.C9.
    let audit_worker_ctx = AuditWorkerContext::new(audit_events);
    tokio::spawn(async move {
        let monitor = Monitor::new().register(
            WorkerBuilder::new("audit")
                .data(audit_worker_ctx)
                .backend(audit_storage)
                .build_fn(audit_worker),
        );

        if let Err(e) = monitor.run().await {
            tracing::error!(error = %e, "audit worker failed");
        }
    });
    info!("Audit worker started");

    let app = Router::new()
        .merge(nimbus_api::router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            nimbus_api::middleware::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}
