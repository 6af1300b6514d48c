//! Create `share_link` and `share_link_file` tables (§3, §4.C8).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ShareLink::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ShareLink::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ShareLink::Token).string_len(64).not_null())
                    .col(ColumnDef::new(ShareLink::UserId).string_len(32).not_null())
                    .col(ColumnDef::new(ShareLink::ExpiresAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(ShareLink::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_share_link_user")
                            .from(ShareLink::Table, ShareLink::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_share_link_token")
                    .table(ShareLink::Table)
                    .col(ShareLink::Token)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_share_link_user_id")
                    .table(ShareLink::Table)
                    .col(ShareLink::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ShareLinkFile::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ShareLinkFile::ShareLinkId).string_len(32).not_null())
                    .col(ColumnDef::new(ShareLinkFile::FileId).string_len(32).not_null())
                    .primary_key(
                        Index::create()
                            .col(ShareLinkFile::ShareLinkId)
                            .col(ShareLinkFile::FileId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_share_link_file_share_link")
                            .from(ShareLinkFile::Table, ShareLinkFile::ShareLinkId)
                            .to(ShareLink::Table, ShareLink::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_share_link_file_file")
                            .from(ShareLinkFile::Table, ShareLinkFile::FileId)
                            .to(File::Table, File::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_share_link_file_file_id")
                    .table(ShareLinkFile::Table)
                    .col(ShareLinkFile::FileId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ShareLinkFile::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ShareLink::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum ShareLink {
    Table,
    Id,
    Token,
    UserId,
    ExpiresAt,
    CreatedAt,
}

#[derive(Iden)]
enum ShareLinkFile {
    Table,
    ShareLinkId,
    FileId,
}

#[derive(Iden)]
enum User {
    Table,
    Id,
}

#[derive(Iden)]
enum File {
    Table,
    Id,
}
