//! Audit event entity (§3, §4.C9).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Outcome recorded for an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum AuditStatus {
    #[sea_orm(string_value = "success")]
    Success,
    #[sea_orm(string_value = "failure")]
    Failure,
    #[sea_orm(string_value = "error")]
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "audit_event")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(indexed)]
    pub request_id: String,

    #[sea_orm(nullable, indexed)]
    pub user_id: Option<String>,

    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub status: AuditStatus,

    #[sea_orm(nullable)]
    pub ip_address: Option<String>,

    #[sea_orm(nullable)]
    pub user_agent: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Json,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    pub processing_time_ms: i64,

    #[sea_orm(indexed)]
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
