//! Database migrations.
//!
//! Schema migrations for the storage engine core.

#![allow(missing_docs)]

use sea_orm_migration::prelude::*;

mod m20250101_000001_create_user_table;
mod m20250101_000002_create_file_table;
mod m20250101_000003_create_share_link_tables;
mod m20250101_000004_create_audit_event_table;
mod m20250101_000005_add_file_name_search_index;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_user_table::Migration),
            Box::new(m20250101_000002_create_file_table::Migration),
            Box::new(m20250101_000003_create_share_link_tables::Migration),
            Box::new(m20250101_000004_create_audit_event_table::Migration),
            Box::new(m20250101_000005_add_file_name_search_index::Migration),
        ]
    }
}
