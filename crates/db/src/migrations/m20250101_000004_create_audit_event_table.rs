//! Create `audit_event` table (§3, §4.C9).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AuditEvent::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuditEvent::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AuditEvent::RequestId).string_len(64).not_null())
                    .col(ColumnDef::new(AuditEvent::UserId).string_len(32))
                    .col(ColumnDef::new(AuditEvent::Action).string_len(128).not_null())
                    .col(ColumnDef::new(AuditEvent::ResourceType).string_len(32).not_null())
                    .col(ColumnDef::new(AuditEvent::ResourceId).string_len(64).not_null())
                    .col(ColumnDef::new(AuditEvent::Status).string_len(16).not_null())
                    .col(ColumnDef::new(AuditEvent::IpAddress).string_len(64))
                    .col(ColumnDef::new(AuditEvent::UserAgent).string_len(512))
                    .col(
                        ColumnDef::new(AuditEvent::Metadata)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(ColumnDef::new(AuditEvent::ErrorMessage).text())
                    .col(ColumnDef::new(AuditEvent::ProcessingTimeMs).big_integer().not_null())
                    .col(
                        ColumnDef::new(AuditEvent::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_audit_event_request_id")
                    .table(AuditEvent::Table)
                    .col(AuditEvent::RequestId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_audit_event_user_id")
                    .table(AuditEvent::Table)
                    .col(AuditEvent::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_audit_event_created_at")
                    .table(AuditEvent::Table)
                    .col(AuditEvent::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AuditEvent::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum AuditEvent {
    Table,
    Id,
    RequestId,
    UserId,
    Action,
    ResourceType,
    ResourceId,
    Status,
    IpAddress,
    UserAgent,
    Metadata,
    ErrorMessage,
    ProcessingTimeMs,
    CreatedAt,
}
