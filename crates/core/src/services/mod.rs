//! Business logic services (§4 C2-C9).

pub mod audit;
pub mod blob_store;
pub mod cache;
pub mod download;
pub mod event_publisher;
pub mod listing;
pub mod path_resolver;
pub mod share;
pub mod tree;

pub use audit::{
    AuditEventInput, AuditSink, AuditSinkHandle, AuditStatus, NoOpAuditSink, RequestContext,
};
pub use blob_store::{BlobReader, BlobStore, BlobStoreHandle, KeyPage, LocalBlobStore, S3BlobStore};
pub use cache::{Cache, CacheHandle, NoOpCache, RedisCache};
pub use download::{DownloadService, FileDownload};
pub use event_publisher::{ChangeKind, SseBroadcaster, StreamEvent};
pub use listing::ListingService;
pub use path_resolver::{classify, is_encrypted, resolve_for_read, safe_join, PathKind};
pub use share::ShareService;
pub use tree::{TreeEngine, UploadSource};
