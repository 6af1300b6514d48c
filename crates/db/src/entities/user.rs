//! User entity (§3).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user")]
pub struct Model {
    /// Opaque 16-character ID.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(unique)]
    pub email: String,

    /// Absent for users provisioned without local password auth (out of
    /// scope here — see §1 Non-goals).
    #[sea_orm(nullable)]
    pub password_hash: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    /// Byte quota; read-only input to C6's quota check (§1 Non-goals: no
    /// quota accounting beyond this configured limit).
    pub storage_limit_bytes: i64,

    #[sea_orm(default_value = false)]
    pub custom_drive_enabled: bool,

    /// Absolute path watched by C11 when custom-drive is enabled.
    #[sea_orm(nullable)]
    pub custom_drive_path: Option<String>,

    /// Ordered glob patterns; entries matching any pattern are ignored by
    /// C11's sync.
    #[sea_orm(column_type = "JsonBinary")]
    pub custom_drive_ignore_patterns: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::file::Entity")]
    Files,

    #[sea_orm(has_many = "super::share_link::Entity")]
    ShareLinks,
}

impl Related<super::file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Files.def()
    }
}

impl Related<super::share_link::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ShareLinks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parsed ignore-pattern list (§4.C11); falls back to empty on a
    /// malformed column rather than failing the caller.
    #[must_use]
    pub fn ignore_patterns(&self) -> Vec<String> {
        serde_json::from_value(self.custom_drive_ignore_patterns.clone()).unwrap_or_default()
    }
}
