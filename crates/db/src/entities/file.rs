//! Unified file/folder entity (§3, §9 "Inheritance-shaped File vs Folder").
//!
//! A single tagged-variant table replaces subtype polymorphism: `file_type`
//! discriminates file rows from folder rows and every behaviour that
//! differs between the two branches explicitly on it rather than through
//! separate types.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Discriminates a file row from a folder row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(8))")]
pub enum FileType {
    #[sea_orm(string_value = "file")]
    File,
    #[sea_orm(string_value = "folder")]
    Folder,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "file")]
pub struct Model {
    /// Opaque 16-character ID.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Owning user.
    #[sea_orm(indexed)]
    pub user_id: String,

    /// Display name (need not be unique within a parent — see I2).
    pub name: String,

    /// file | folder.
    pub file_type: FileType,

    /// Parent folder ID; null means root. Must refer to a folder owned
    /// by the same user (I1).
    #[sea_orm(nullable, indexed)]
    pub parent_id: Option<String>,

    /// Bytes; always 0 for folders.
    #[sea_orm(default_value = 0)]
    pub size: i64,

    /// MIME type; null for folders.
    #[sea_orm(nullable)]
    pub mime_type: Option<String>,

    /// Storage location (§3 "path semantics"):
    /// - `None` — purely logical folder, no on-disk analogue.
    /// - `Some(absolute)` — custom-drive entry; bytes live at that path.
    /// - `Some(relative)` — local-driver storage key or S3 key.
    #[sea_orm(column_type = "Text", nullable)]
    pub path: Option<String>,

    #[sea_orm(default_value = false)]
    pub starred: bool,

    #[sea_orm(default_value = false)]
    pub shared: bool,

    pub modified: DateTimeWithTimeZone,

    /// Non-null means the row is in the trash (I4).
    #[sea_orm(nullable, indexed)]
    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id",
        on_delete = "Cascade"
    )]
    User,

    #[sea_orm(
        belongs_to = "Entity",
        from = "Column::ParentId",
        to = "Column::Id",
        on_delete = "Cascade"
    )]
    Parent,

    #[sea_orm(has_many = "super::share_link_file::Entity")]
    ShareLinkFiles,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::share_link_file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ShareLinkFiles.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// True iff this row is currently in the trash (I4).
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// True iff `path` denotes a custom-drive (absolute) location.
    #[must_use]
    pub fn is_custom_drive_path(&self) -> bool {
        self.path.as_deref().is_some_and(|p| p.starts_with('/'))
    }
}
