//! Background job queue and scheduled maintenance for the storage engine
//! (§4.C9 audit sink, §4.C10 background jobs, §4.C11 custom-drive sync).

pub mod audit_sink;
pub mod custom_drive_sync;
pub mod jobs;
pub mod retry;
pub mod scheduler;
pub mod workers;

pub use audit_sink::RedisAuditSink;
pub use custom_drive_sync::{CustomDriveSync, SyncConfig};
pub use jobs::*;
pub use retry::{DeadLetterEntry, RetryConfig};
pub use scheduler::{run_scheduler, JobExecutor, MaintenanceExecutor, SchedulerConfig};
pub use workers::*;
