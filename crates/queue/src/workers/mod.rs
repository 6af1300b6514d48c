//! Job workers.

#![allow(missing_docs)]

mod audit;

pub use audit::{audit_worker, AuditWorkerContext};
