//! The storage engine's HTTP surface (§6): `/api/files/*` and the public
//! `/s/:token` share-resolution route. Everything here is request
//! parsing and response shaping; the mutations themselves live in
//! `nimbus-core`'s `TreeEngine`/`ListingService`/`ShareService`/
//! `DownloadService`.

use std::collections::HashMap;
use std::pin::Pin;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream;
use nimbus_common::id::IdGenerator;
use nimbus_common::{AppError, AppResult};
use nimbus_core::{RequestContext, UploadSource};
use nimbus_db::entities::file::{self, FileType};
use nimbus_db::repositories::file::{SortBy, SortOrder};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::extractors::AuthUser;
use crate::middleware::AppState;

/// Builds the full router mounted by the server binary: `/api/files/*`
/// plus the public `/s/{token}` share-resolution route (outside the
/// `/api` prefix, since a share link is handed out as a bare URL).
pub fn router() -> Router<AppState> {
    let files = Router::new()
        .route("/", get(list_files))
        .route("/stats", get(stats))
        .route("/search", get(search))
        .route("/folder", post(create_folder))
        .route("/upload", post(upload))
        .route("/move", post(move_files))
        .route("/copy", post(copy_files))
        .route("/rename", post(rename))
        .route("/star", post(star))
        .route("/share", post(share))
        .route("/delete", post(delete))
        .route("/trash", get(trash_list))
        .route("/trash/restore", post(trash_restore))
        .route("/trash/delete", post(trash_delete))
        .route("/{id}/download", get(download))
        .route("/events", get(crate::sse::file_events));

    Router::new()
        .nest("/api/files", files)
        .route("/s/{token}", get(resolve_share))
}

// ---------------------------------------------------------------------
// Response shapes (§6)
// ---------------------------------------------------------------------

/// A file or folder row as it crosses the wire. `path` (the on-disk
/// storage key or custom-drive absolute path) is deliberately excluded
/// — it's an implementation detail, not part of the public contract.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: &'static str,
    pub parent_id: Option<String>,
    pub size: i64,
    pub mime_type: Option<String>,
    pub starred: bool,
    pub shared: bool,
    pub modified: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

impl From<file::Model> for FileResponse {
    fn from(f: file::Model) -> Self {
        Self {
            id: f.id,
            name: f.name,
            file_type: match f.file_type {
                FileType::File => "file",
                FileType::Folder => "folder",
            },
            parent_id: f.parent_id,
            size: f.size,
            mime_type: f.mime_type,
            starred: f.starred,
            shared: f.shared,
            modified: f.modified.to_rfc3339(),
            deleted_at: f.deleted_at.map(|d| d.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
pub struct FilesResponse {
    pub files: Vec<FileResponse>,
}

impl FilesResponse {
    fn from_rows(rows: Vec<file::Model>) -> Self {
        Self {
            files: rows.into_iter().map(FileResponse::from).collect(),
        }
    }
}

#[derive(Serialize)]
pub struct FileResponseBody {
    pub file: FileResponse,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_files: u64,
    pub total_folders: u64,
    pub shared_count: i64,
    pub starred_count: i64,
}

impl From<nimbus_db::repositories::file::FileStats> for StatsResponse {
    fn from(s: nimbus_db::repositories::file::FileStats) -> Self {
        Self {
            total_files: s.total_files,
            total_folders: s.total_folders,
            shared_count: s.shared_count,
            starred_count: s.starred_count,
        }
    }
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize)]
pub struct LinksResponse {
    pub links: HashMap<String, String>,
}

// ---------------------------------------------------------------------
// Query parsing
// ---------------------------------------------------------------------

fn parse_sort_by(raw: Option<&str>) -> AppResult<SortBy> {
    match raw.unwrap_or("modified") {
        "name" => Ok(SortBy::Name),
        "size" => Ok(SortBy::Size),
        "modified" => Ok(SortBy::Modified),
        "deletedAt" => Ok(SortBy::DeletedAt),
        other => Err(AppError::Validation(format!("unknown sortBy {other:?}"))),
    }
}

fn parse_order(raw: Option<&str>) -> AppResult<SortOrder> {
    match raw.unwrap_or("desc") {
        "asc" => Ok(SortOrder::Asc),
        "desc" => Ok(SortOrder::Desc),
        other => Err(AppError::Validation(format!("unknown order {other:?}"))),
    }
}

/// Builds the per-request context stamped onto audit events (§4.C9):
/// `X-Request-Id` if the caller (or an upstream proxy) supplied one,
/// otherwise a freshly minted id; client IP from `X-Forwarded-For`;
/// user agent straight off the header.
fn request_context(headers: &HeaderMap) -> RequestContext {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| IdGenerator::new().generate());

    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    RequestContext {
        request_id,
        ip_address,
        user_agent,
    }
}

/// Wraps an in-memory byte buffer as the `AsyncRead` the Tree Engine's
/// upload path expects, via a single-item stream — multipart fields are
/// already fully buffered by the time a handler sees them, so there's no
/// true streaming to preserve here.
fn bytes_reader(data: Vec<u8>) -> Pin<Box<dyn AsyncRead + Send>> {
    let once = stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(data)) });
    Box::pin(StreamReader::new(once))
}

/// RFC 5987 `Content-Disposition` filename, so non-ASCII names survive
/// the trip.
fn content_disposition(name: &str) -> String {
    format!("attachment; filename*=UTF-8''{}", urlencoding::encode(name))
}

// ---------------------------------------------------------------------
// Listing & search (§4.C7)
// ---------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    parent_id: Option<String>,
    sort_by: Option<String>,
    order: Option<String>,
}

async fn list_files(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<FilesResponse>> {
    let sort = parse_sort_by(q.sort_by.as_deref())?;
    let order = parse_order(q.order.as_deref())?;
    let rows = state
        .listing
        .list_directory(&user.id, q.parent_id.as_deref(), sort, order)
        .await?;
    Ok(Json(FilesResponse::from_rows(rows)))
}

async fn stats(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<StatsResponse>> {
    let stats = state.listing.stats(&user.id).await?;
    Ok(Json(StatsResponse::from(stats)))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    limit: Option<u64>,
}

async fn search(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> AppResult<Json<FilesResponse>> {
    if q.q.trim().is_empty() {
        return Err(AppError::Validation("q must not be empty".to_string()));
    }
    let rows = state
        .listing
        .search(&user.id, &q.q, q.limit.unwrap_or(100))
        .await?;
    Ok(Json(FilesResponse::from_rows(rows)))
}

// ---------------------------------------------------------------------
// Create folder / upload (§4.C6)
// ---------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateFolderRequest {
    name: String,
    parent_id: Option<String>,
}

async fn create_folder(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateFolderRequest>,
) -> AppResult<Json<FileResponseBody>> {
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".to_string()));
    }
    let ctx = request_context(&headers);
    let created = state
        .tree
        .create_folder(&ctx, &user.id, &req.name, req.parent_id.as_deref())
        .await?;
    Ok(Json(FileResponseBody {
        file: created.into(),
    }))
}

async fn upload(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<Json<FileResponseBody>> {
    let mut data: Option<Vec<u8>> = None;
    let mut name: Option<String> = None;
    let mut mime_type: Option<String> = None;
    let mut parent_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                name = field.file_name().map(str::to_string);
                mime_type = field.content_type().map(str::to_string);
                data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::Validation(e.to_string()))?
                        .to_vec(),
                );
            }
            "name" => {
                let text = field.text().await.map_err(|e| AppError::Validation(e.to_string()))?;
                if !text.is_empty() {
                    name = Some(text);
                }
            }
            "parentId" => {
                let text = field.text().await.map_err(|e| AppError::Validation(e.to_string()))?;
                if !text.is_empty() {
                    parent_id = Some(text);
                }
            }
            _ => {}
        }
    }

    let data = data.ok_or_else(|| AppError::Validation("file is required".to_string()))?;
    let name = name.unwrap_or_else(|| "unnamed".to_string());
    let size = data.len() as i64;

    let ctx = request_context(&headers);
    let source = UploadSource {
        reader: bytes_reader(data),
        size,
    };
    let created = state
        .tree
        .upload_file(&ctx, &user.id, &name, mime_type, parent_id.as_deref(), source)
        .await?;

    Ok(Json(FileResponseBody {
        file: created.into(),
    }))
}

// ---------------------------------------------------------------------
// Move / copy / rename (§4.C6)
// ---------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetRequest {
    ids: Vec<String>,
    parent_id: Option<String>,
}

async fn move_files(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TargetRequest>,
) -> AppResult<Json<FilesResponse>> {
    let ctx = request_context(&headers);
    let rows = state
        .tree
        .move_files(&ctx, &user.id, &req.ids, req.parent_id.as_deref())
        .await?;
    Ok(Json(FilesResponse::from_rows(rows)))
}

async fn copy_files(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TargetRequest>,
) -> AppResult<Json<FilesResponse>> {
    let ctx = request_context(&headers);
    let rows = state
        .tree
        .copy_files(&ctx, &user.id, &req.ids, req.parent_id.as_deref())
        .await?;
    Ok(Json(FilesResponse::from_rows(rows)))
}

#[derive(Deserialize)]
struct RenameRequest {
    id: String,
    name: String,
}

async fn rename(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RenameRequest>,
) -> AppResult<Json<FileResponseBody>> {
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".to_string()));
    }
    let ctx = request_context(&headers);
    let updated = state.tree.rename(&ctx, &user.id, &req.id, &req.name).await?;
    Ok(Json(FileResponseBody {
        file: updated.into(),
    }))
}

// ---------------------------------------------------------------------
// Star / share (§4.C6, §4.C8)
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct StarRequest {
    ids: Vec<String>,
    starred: bool,
}

async fn star(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StarRequest>,
) -> AppResult<Json<SuccessResponse>> {
    let ctx = request_context(&headers);
    for id in &req.ids {
        state.tree.set_starred(&ctx, &user.id, id, req.starred).await?;
    }
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Deserialize)]
struct ShareRequest {
    ids: Vec<String>,
    shared: bool,
}

async fn share(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ShareRequest>,
) -> AppResult<Json<LinksResponse>> {
    let ctx = request_context(&headers);
    for id in &req.ids {
        state.tree.set_shared(&ctx, &user.id, id, req.shared).await?;
    }

    let mut links = HashMap::new();
    if req.shared {
        let link = state.share.mint_or_reuse(&user.id, &req.ids).await?;
        for id in &req.ids {
            links.insert(id.clone(), link.token.clone());
        }
    } else {
        state.share.revoke(&user.id, &req.ids).await?;
    }

    Ok(Json(LinksResponse { links }))
}

// ---------------------------------------------------------------------
// Trash (§4.C6)
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct IdsRequest {
    ids: Vec<String>,
}

async fn delete(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<IdsRequest>,
) -> AppResult<Json<SuccessResponse>> {
    let ctx = request_context(&headers);
    state.tree.soft_delete(&ctx, &user.id, &req.ids).await?;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Deserialize)]
struct TrashQuery {
    sort_by: Option<String>,
    order: Option<String>,
}

async fn trash_list(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(q): Query<TrashQuery>,
) -> AppResult<Json<FilesResponse>> {
    let sort = parse_sort_by(q.sort_by.as_deref())?;
    let order = parse_order(q.order.as_deref())?;
    let rows = state.listing.list_trash(&user.id, sort, order).await?;
    Ok(Json(FilesResponse::from_rows(rows)))
}

async fn trash_restore(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<IdsRequest>,
) -> AppResult<Json<SuccessResponse>> {
    let ctx = request_context(&headers);
    state.tree.restore(&ctx, &user.id, &req.ids).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn trash_delete(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<IdsRequest>,
) -> AppResult<Json<SuccessResponse>> {
    let ctx = request_context(&headers);
    state.tree.permanent_delete(&ctx, &user.id, &req.ids).await?;
    Ok(Json(SuccessResponse { success: true }))
}

// ---------------------------------------------------------------------
// Download (§4.C6, §5)
// ---------------------------------------------------------------------

async fn download(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    match state.download.download_file(&user.id, &id).await {
        Ok(file) => {
            let body = Body::from_stream(ReaderStream::new(file.reader));
            let response = Response::builder()
                .header(
                    header::CONTENT_TYPE,
                    file.mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
                )
                .header(header::CONTENT_LENGTH, file.size.to_string())
                .header(header::CONTENT_DISPOSITION, content_disposition(&file.name))
                .body(body)
                .map_err(|e| AppError::Internal(e.to_string()))?;
            Ok(response)
        }
        Err(AppError::InvalidPath(_)) => {
            let (name, bytes) = state.download.download_folder_as_zip(&user.id, &id).await?;
            let response = Response::builder()
                .header(header::CONTENT_TYPE, "application/zip")
                .header(header::CONTENT_LENGTH, bytes.len().to_string())
                .header(header::CONTENT_DISPOSITION, content_disposition(&name))
                .body(Body::from(bytes))
                .map_err(|e| AppError::Internal(e.to_string()))?;
            Ok(response)
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------
// Public share resolution (§4.C8)
// ---------------------------------------------------------------------

async fn resolve_share(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<Json<FilesResponse>> {
    let rows = state.share.resolve(&token).await?;
    Ok(Json(FilesResponse::from_rows(rows)))
}
