//! Email job repository.

use std::sync::Arc;

use crate::entities::{EmailJob, email_job};
use chrono::{DateTime, Utc};
use scholar_common::{AppError, AppResult};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseBackend, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, Statement,
};
use uuid::Uuid;

use crate::entities::email_job::EmailJobStatus;

/// Atomically hands the best eligible pending job to one caller.
///
/// Rows locked by a concurrent claim are skipped instead of waited on.
const CLAIM_NEXT_SQL: &str = r#"
UPDATE "email_job"
SET "status" = 'processing',
    "claimed_by" = $1,
    "lease_id" = $2,
    "visibility_deadline" = $3,
    "last_attempt_at" = $4
WHERE "id" = (
    SELECT "id" FROM "email_job"
    WHERE "status" = 'pending' AND "scheduled_at" <= $4
    ORDER BY "priority" DESC, "created_at" ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING *
"#;

/// Counter incremented in the same statement as a leased update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseCounter {
    Attempts,
    Deferrals,
    ThrottleDeferrals,
}

impl LeaseCounter {
    const fn column(self) -> email_job::Column {
        match self {
            Self::Attempts => email_job::Column::Attempts,
            Self::Deferrals => email_job::Column::Deferrals,
            Self::ThrottleDeferrals => email_job::Column::ThrottleDeferrals,
        }
    }
}

/// Email job repository for database operations.
#[derive(Clone)]
pub struct EmailJobRepository {
    db: Arc<DatabaseConnection>,
}

impl EmailJobRepository {
    /// Create a new email job repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find an email job by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<email_job::Model>> {
        EmailJob::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Insert a new email job.
    pub async fn create(&self, model: email_job::ActiveModel) -> AppResult<email_job::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Claim the next due pending job for `worker_id`.
    ///
    /// Returns `None` when nothing is eligible at `now`.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease_id: Uuid,
        visibility_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Option<email_job::Model>> {
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            CLAIM_NEXT_SQL,
            [
                worker_id.into(),
                lease_id.into(),
                visibility_deadline.into(),
                now.into(),
            ],
        );

        EmailJob::find()
            .from_raw_sql(stmt)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Apply `changes` to a job only while `lease_id` still owns its claim,
    /// bumping `counter` by one in the same statement.
    ///
    /// Returns `false` when the lease was lost (reaped, or the job is gone).
    pub async fn update_leased(
        &self,
        id: &str,
        lease_id: Uuid,
        changes: email_job::ActiveModel,
        counter: Option<LeaseCounter>,
    ) -> AppResult<bool> {
        let mut update = EmailJob::update_many().set(changes);
        if let Some(counter) = counter {
            let column = counter.column();
            update = update.col_expr(column, Expr::col(column).add(1));
        }

        let result = update
            .filter(email_job::Column::Id.eq(id))
            .filter(email_job::Column::LeaseId.eq(lease_id))
            .filter(email_job::Column::Status.eq(EmailJobStatus::Processing))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Cancel a job that no worker has picked up yet.
    pub async fn cancel(&self, id: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let changes = email_job::ActiveModel {
            status: Set(EmailJobStatus::Cancelled),
            completed_at: Set(Some(now.into())),
            ..Default::default()
        };

        let result = EmailJob::update_many()
            .set(changes)
            .filter(email_job::Column::Id.eq(id))
            .filter(email_job::Column::Status.eq(EmailJobStatus::Pending))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected > 0)
    }

    /// Return abandoned claims (deadline before `now`) to the pending state.
    pub async fn reap_stale(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let changes = email_job::ActiveModel {
            status: Set(EmailJobStatus::Pending),
            claimed_by: Set(None),
            lease_id: Set(None),
            visibility_deadline: Set(None),
            last_error: Set(Some("claim expired before completion".to_string())),
            ..Default::default()
        };

        let result = EmailJob::update_many()
            .set(changes)
            .filter(email_job::Column::Status.eq(EmailJobStatus::Processing))
            .filter(email_job::Column::VisibilityDeadline.lt(now))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected)
    }

    /// Count jobs in a given status.
    pub async fn count_by_status(&self, status: EmailJobStatus) -> AppResult<u64> {
        EmailJob::find()
            .filter(email_job::Column::Status.eq(status))
            .count(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Delete terminal jobs completed before `cutoff` (cleanup).
    pub async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = EmailJob::delete_many()
            .filter(email_job::Column::Status.is_in(EmailJobStatus::TERMINAL))
            .filter(email_job::Column::CompletedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected)
    }
}
