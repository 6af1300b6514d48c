//! Create the unified file/folder table (§3, §9).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(File::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(File::Id).string_len(32).not_null().primary_key())
                    .col(ColumnDef::new(File::UserId).string_len(32).not_null())
                    .col(ColumnDef::new(File::Name).string_len(1024).not_null())
                    .col(ColumnDef::new(File::FileType).string_len(8).not_null())
                    .col(ColumnDef::new(File::ParentId).string_len(32))
                    .col(ColumnDef::new(File::Size).big_integer().not_null().default(0))
                    .col(ColumnDef::new(File::MimeType).string_len(256))
                    .col(ColumnDef::new(File::Path).text())
                    .col(ColumnDef::new(File::Starred).boolean().not_null().default(false))
                    .col(ColumnDef::new(File::Shared).boolean().not_null().default(false))
                    .col(
                        ColumnDef::new(File::Modified)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(File::DeletedAt).timestamp_with_time_zone())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_file_user")
                            .from(File::Table, File::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_file_parent")
                            .from(File::Table, File::ParentId)
                            .to(File::Table, File::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Listing a folder's children is the hottest query path (§4.C7);
        // this composite index covers it directly, including the trash filter.
        manager
            .create_index(
                Index::create()
                    .name("idx_file_user_parent_deleted")
                    .table(File::Table)
                    .col(File::UserId)
                    .col(File::ParentId)
                    .col(File::DeletedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE INDEX IF NOT EXISTS idx_file_starred
                ON "file" (user_id)
                WHERE starred = true AND deleted_at IS NULL;
                "#,
            )
            .await?;

        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE INDEX IF NOT EXISTS idx_file_shared
                ON "file" (user_id)
                WHERE shared = true AND deleted_at IS NULL;
                "#,
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_file_deleted_at")
                    .table(File::Table)
                    .col(File::DeletedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(File::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum File {
    Table,
    Id,
    UserId,
    Name,
    FileType,
    ParentId,
    Size,
    MimeType,
    Path,
    Starred,
    Shared,
    Modified,
    DeletedAt,
}

#[derive(Iden)]
enum User {
    Table,
    Id,
}
