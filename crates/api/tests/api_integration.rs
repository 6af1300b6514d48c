//! Router-level integration tests for the storage engine's HTTP surface
//! (§6): auth handoff, request validation, and a couple of end-to-end
//! happy paths against a mocked database.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::redundant_clone)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware as axum_middleware;
use axum::Router;
use chrono::Utc;
use nimbus_common::encryption::DataKey;
use nimbus_core::{
    DownloadService, ListingService, NoOpAuditSink, NoOpCache, ShareService, SseBroadcaster,
    TreeEngine,
};
use nimbus_db::entities::file::{self, FileType};
use nimbus_db::entities::user;
use nimbus_db::repositories::file::FileRepository;
use nimbus_db::repositories::share_link::ShareLinkRepository;
use nimbus_db::repositories::user::UserRepository;
use nimbus_core::LocalBlobStore;
use sea_orm::{DatabaseBackend, MockDatabase};
use tower::ServiceExt;

/// 32 zero bytes, base64-encoded — not a real key, just enough to
/// construct a [`DataKey`] for tests that never decrypt real ciphertext.
const TEST_ENCRYPTION_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

fn sample_user(id: &str) -> user::Model {
    user::Model {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        password_hash: None,
        created_at: Utc::now().into(),
        storage_limit_bytes: 10 * 1024 * 1024 * 1024,
        custom_drive_enabled: false,
        custom_drive_path: None,
        custom_drive_ignore_patterns: serde_json::json!([]),
    }
}

fn sample_file(id: &str, name: &str) -> file::Model {
    file::Model {
        id: id.to_string(),
        user_id: "u1".to_string(),
        name: name.to_string(),
        file_type: FileType::File,
        parent_id: None,
        size: 42,
        mime_type: Some("text/plain".to_string()),
        path: Some("some-storage-key".to_string()),
        starred: false,
        shared: false,
        modified: Utc::now().into(),
        deleted_at: None,
    }
}

/// Builds a router wired to a [`MockDatabase`] that will answer, in
/// order, the queries `query_results` enumerates. Every handler hits the
/// auth middleware's user lookup first, so tests always seed that as the
/// first result.
fn build_app(mock: MockDatabase) -> Router {
    let db = Arc::new(mock.into_connection());
    let files = FileRepository::new(Arc::clone(&db));
    let users = UserRepository::new(Arc::clone(&db));
    let share_links = ShareLinkRepository::new(Arc::clone(&db));

    let cache: nimbus_core::CacheHandle = Arc::new(NoOpCache);
    let events = SseBroadcaster::new();
    let audit: nimbus_core::AuditSinkHandle = Arc::new(NoOpAuditSink);
    let data_key = DataKey::from_base64(TEST_ENCRYPTION_KEY).expect("valid test key");
    let blobs: nimbus_core::BlobStoreHandle = Arc::new(LocalBlobStore::new(std::env::temp_dir()));

    let tree = TreeEngine::new(
        files.clone(),
        users.clone(),
        blobs.clone(),
        data_key.clone(),
        cache.clone(),
        events.clone(),
        audit,
        std::env::temp_dir(),
        true,
    );
    let listing = ListingService::new(files.clone(), cache);
    let share = ShareService::new(files.clone(), share_links);
    let download = DownloadService::new(files, blobs, data_key, true);

    let state = nimbus_api::middleware::AppState {
        tree,
        listing,
        share,
        download,
        users,
        events,
    };

    nimbus_api::router()
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            nimbus_api::middleware::auth_middleware,
        ))
        .with_state(state)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body readable");
    serde_json::from_slice(&bytes).expect("response body is JSON")
}

#[tokio::test]
async fn missing_auth_header_rejects_with_401() {
    let app = build_app(MockDatabase::new(DatabaseBackend::Postgres));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/files")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("router handles request");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = build_app(MockDatabase::new(DatabaseBackend::Postgres));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/not-a-real-endpoint")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("router handles request");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_folder_rejects_empty_name_before_touching_the_tree() {
    let user = sample_user("u1");
    let mock = MockDatabase::new(DatabaseBackend::Postgres).append_query_results([[user]]);
    let app = build_app(mock);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/files/folder")
                .header("X-User-Id", "u1")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name":"   "}"#))
                .expect("request builds"),
        )
        .await
        .expect("router handles request");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn search_rejects_empty_query_before_touching_the_database() {
    let user = sample_user("u1");
    let mock = MockDatabase::new(DatabaseBackend::Postgres).append_query_results([[user]]);
    let app = build_app(mock);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/files/search?q=")
                .header("X-User-Id", "u1")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("router handles request");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_files_returns_the_configured_rows() {
    let user = sample_user("u1");
    let row = sample_file("f1", "notes.txt");
    let mock = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([[user]])
        .append_query_results([[row]]);
    let app = build_app(mock);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/files")
                .header("X-User-Id", "u1")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("router handles request");

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let files = body["files"].as_array().expect("files is an array");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], "notes.txt");
    assert!(files[0].get("path").is_none(), "storage key must not leak");
}

#[tokio::test]
async fn share_resolution_rejects_a_malformed_token_without_querying_the_database() {
    let app = build_app(MockDatabase::new(DatabaseBackend::Postgres));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/s/short")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("router handles request");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
