//! Email job entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an email job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum EmailJobStatus {
    /// Waiting for a worker.
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Claimed by a worker.
    #[sea_orm(string_value = "processing")]
    Processing,
    /// Some recipients received the message, the rest failed for good.
    #[sea_orm(string_value = "partially_sent")]
    PartiallySent,
    /// Every recipient received the message.
    #[sea_orm(string_value = "sent")]
    Sent,
    /// No recipient received the message.
    #[sea_orm(string_value = "failed")]
    Failed,
    /// Withdrawn before any worker picked it up.
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl EmailJobStatus {
    /// Statuses a job never leaves.
    pub const TERMINAL: [Self; 4] = [Self::PartiallySent, Self::Sent, Self::Failed, Self::Cancelled];
}

/// A queued email with its recipients and delivery bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_job")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Ordered recipient list (`[{id, email, name}]`).
    #[sea_orm(column_type = "JsonBinary")]
    pub recipients: Json,

    #[sea_orm(column_type = "Text")]
    pub subject: String,

    #[sea_orm(column_type = "Text")]
    pub html_content: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub text_content: Option<String>,

    /// Template the content was rendered from, kept for audit.
    #[sea_orm(nullable)]
    pub template_id: Option<String>,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub template_data: Option<Json>,

    /// Higher values are claimed first.
    #[sea_orm(default_value = 0)]
    pub priority: i32,

    #[sea_orm(indexed)]
    pub status: EmailJobStatus,

    #[sea_orm(default_value = 0)]
    pub attempts: i32,

    pub max_attempts: i32,

    /// Times the send rate limit pushed the job back without consuming an attempt.
    #[sea_orm(default_value = 0)]
    pub deferrals: i32,

    /// Times provider throttling pushed the job back without consuming an attempt.
    #[sea_orm(default_value = 0)]
    pub throttle_deferrals: i32,

    /// Earliest time a worker may claim the job.
    pub scheduled_at: DateTimeWithTimeZone,

    /// Recipient id to delivery result.
    #[sea_orm(column_type = "JsonBinary")]
    pub per_recipient_result: Json,

    /// Worker holding the current claim.
    #[sea_orm(nullable)]
    pub claimed_by: Option<String>,

    /// Token of the current claim.
    #[sea_orm(nullable)]
    pub lease_id: Option<Uuid>,

    /// After this instant the claim is considered abandoned.
    #[sea_orm(nullable)]
    pub visibility_deadline: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    #[sea_orm(nullable)]
    pub last_attempt_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(nullable)]
    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
