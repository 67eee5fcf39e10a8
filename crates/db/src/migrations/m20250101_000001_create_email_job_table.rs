//! Create `email_job` table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EmailJob::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EmailJob::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EmailJob::Recipients).json_binary().not_null())
                    .col(ColumnDef::new(EmailJob::Subject).text().not_null())
                    .col(ColumnDef::new(EmailJob::HtmlContent).text().not_null())
                    .col(ColumnDef::new(EmailJob::TextContent).text())
                    .col(ColumnDef::new(EmailJob::TemplateId).string_len(64))
                    .col(ColumnDef::new(EmailJob::TemplateData).json_binary())
                    .col(
                        ColumnDef::new(EmailJob::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EmailJob::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(EmailJob::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(EmailJob::MaxAttempts).integer().not_null())
                    .col(
                        ColumnDef::new(EmailJob::Deferrals)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EmailJob::ThrottleDeferrals)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EmailJob::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailJob::PerRecipientResult)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(EmailJob::ClaimedBy).string_len(64))
                    .col(ColumnDef::new(EmailJob::LeaseId).uuid())
                    .col(ColumnDef::new(EmailJob::VisibilityDeadline).timestamp_with_time_zone())
                    .col(ColumnDef::new(EmailJob::LastError).text())
                    .col(
                        ColumnDef::new(EmailJob::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(EmailJob::LastAttemptAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(EmailJob::CompletedAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        // Claim order: pending jobs that are due, highest priority first, then oldest
        manager
            .create_index(
                Index::create()
                    .name("idx_email_job_claim")
                    .table(EmailJob::Table)
                    .col(EmailJob::Status)
                    .col((EmailJob::Priority, IndexOrder::Desc))
                    .col(EmailJob::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // Stale claim sweep
        manager
            .create_index(
                Index::create()
                    .name("idx_email_job_status_visibility_deadline")
                    .table(EmailJob::Table)
                    .col(EmailJob::Status)
                    .col(EmailJob::VisibilityDeadline)
                    .to_owned(),
            )
            .await?;

        // Retention cleanup
        manager
            .create_index(
                Index::create()
                    .name("idx_email_job_status_completed_at")
                    .table(EmailJob::Table)
                    .col(EmailJob::Status)
                    .col(EmailJob::CompletedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EmailJob::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum EmailJob {
    Table,
    Id,
    Recipients,
    Subject,
    HtmlContent,
    TextContent,
    TemplateId,
    TemplateData,
    Priority,
    Status,
    Attempts,
    MaxAttempts,
    Deferrals,
    ThrottleDeferrals,
    ScheduledAt,
    PerRecipientResult,
    ClaimedBy,
    LeaseId,
    VisibilityDeadline,
    LastError,
    CreatedAt,
    LastAttemptAt,
    CompletedAt,
}
