//! `PostgreSQL` queue store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scholar_common::IdGenerator;
use scholar_core::{EmailJob, JobStatus, NewEmailJob, QueueStats, RecipientResult};
use scholar_db::entities::email_job::{self, EmailJobStatus};
use scholar_db::repositories::{EmailJobRepository, LeaseCounter};
use sea_orm::{DatabaseConnection, Set};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{ClaimedJob, DeferCause, JobOutcome, Lease, QueueError, QueueStore, earlier, later};

const ALL_STATUSES: [JobStatus; 6] = [
    JobStatus::Pending,
    JobStatus::Processing,
    JobStatus::PartiallySent,
    JobStatus::Sent,
    JobStatus::Failed,
    JobStatus::Cancelled,
];

/// Queue store backed by the `email_job` table.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of processes can share
/// one table.
#[derive(Clone)]
pub struct PgQueueStore {
    repo: EmailJobRepository,
    ids: IdGenerator,
}

impl PgQueueStore {
    /// Create a store over an open connection.
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            repo: EmailJobRepository::new(db),
            ids: IdGenerator::new(),
        }
    }

    async fn update_leased(
        &self,
        lease: &Lease,
        changes: email_job::ActiveModel,
        counter: LeaseCounter,
    ) -> Result<(), QueueError> {
        if self
            .repo
            .update_leased(&lease.job_id, lease.lease_id, changes, Some(counter))
            .await?
        {
            Ok(())
        } else {
            Err(QueueError::lease_lost(lease))
        }
    }
}

const fn to_db_status(status: JobStatus) -> EmailJobStatus {
    match status {
        JobStatus::Pending => EmailJobStatus::Pending,
        JobStatus::Processing => EmailJobStatus::Processing,
        JobStatus::PartiallySent => EmailJobStatus::PartiallySent,
        JobStatus::Sent => EmailJobStatus::Sent,
        JobStatus::Failed => EmailJobStatus::Failed,
        JobStatus::Cancelled => EmailJobStatus::Cancelled,
    }
}

const fn from_db_status(status: EmailJobStatus) -> JobStatus {
    match status {
        EmailJobStatus::Pending => JobStatus::Pending,
        EmailJobStatus::Processing => JobStatus::Processing,
        EmailJobStatus::PartiallySent => JobStatus::PartiallySent,
        EmailJobStatus::Sent => JobStatus::Sent,
        EmailJobStatus::Failed => JobStatus::Failed,
        EmailJobStatus::Cancelled => JobStatus::Cancelled,
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, QueueError> {
    serde_json::to_value(value).map_err(|e| QueueError::Storage(format!("encode: {e}")))
}

fn from_json<T: DeserializeOwned>(id: &str, value: serde_json::Value) -> Result<T, QueueError> {
    serde_json::from_value(value)
        .map_err(|e| QueueError::Storage(format!("corrupt email job {id}: {e}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

fn to_active_model(job: &EmailJob) -> Result<email_job::ActiveModel, QueueError> {
    Ok(email_job::ActiveModel {
        id: Set(job.id.clone()),
        recipients: Set(to_json(&job.recipients)?),
        subject: Set(job.subject.clone()),
        html_content: Set(job.html_content.clone()),
        text_content: Set(job.text_content.clone()),
        template_id: Set(job.template_id.clone()),
        template_data: Set(job.template_data.clone()),
        priority: Set(job.priority),
        status: Set(to_db_status(job.status)),
        attempts: Set(to_i32(job.attempts)),
        max_attempts: Set(to_i32(job.max_attempts)),
        deferrals: Set(to_i32(job.deferrals)),
        throttle_deferrals: Set(to_i32(job.throttle_deferrals)),
        scheduled_at: Set(job.scheduled_at.into()),
        per_recipient_result: Set(to_json(&job.per_recipient_result)?),
        claimed_by: Set(job.claimed_by.clone()),
        lease_id: Set(job.lease_id),
        visibility_deadline: Set(job.visibility_deadline.map(Into::into)),
        last_error: Set(job.last_error.clone()),
        created_at: Set(job.created_at.into()),
        last_attempt_at: Set(job.last_attempt_at.map(Into::into)),
        completed_at: Set(job.completed_at.map(Into::into)),
    })
}

fn from_model(model: email_job::Model) -> Result<EmailJob, QueueError> {
    let recipients = from_json(&model.id, model.recipients)?;
    let per_recipient_result = from_json(&model.id, model.per_recipient_result)?;

    Ok(EmailJob {
        id: model.id,
        recipients,
        subject: model.subject,
        html_content: model.html_content,
        text_content: model.text_content,
        template_id: model.template_id,
        template_data: model.template_data,
        priority: model.priority,
        status: from_db_status(model.status),
        attempts: to_u32(model.attempts),
        max_attempts: to_u32(model.max_attempts),
        deferrals: to_u32(model.deferrals),
        throttle_deferrals: to_u32(model.throttle_deferrals),
        scheduled_at: model.scheduled_at.with_timezone(&Utc),
        per_recipient_result,
        claimed_by: model.claimed_by,
        lease_id: model.lease_id,
        visibility_deadline: model.visibility_deadline.map(|t| t.with_timezone(&Utc)),
        last_error: model.last_error,
        created_at: model.created_at.with_timezone(&Utc),
        last_attempt_at: model.last_attempt_at.map(|t| t.with_timezone(&Utc)),
        completed_at: model.completed_at.map(|t| t.with_timezone(&Utc)),
    })
}

/// Changes that hand a claimed job back to the queue.
fn back_to_pending(
    scheduled_at: chrono::DateTime<Utc>,
    results: &BTreeMap<String, RecipientResult>,
    last_error: Option<String>,
) -> Result<email_job::ActiveModel, QueueError> {
    Ok(email_job::ActiveModel {
        status: Set(EmailJobStatus::Pending),
        scheduled_at: Set(scheduled_at.into()),
        per_recipient_result: Set(to_json(results)?),
        last_error: Set(last_error),
        claimed_by: Set(None),
        lease_id: Set(None),
        visibility_deadline: Set(None),
        ..Default::default()
    })
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(&self, job: NewEmailJob) -> Result<EmailJob, QueueError> {
        job.validate()?;
        let job = job.into_job(self.ids.generate(), Utc::now());

        let created = self.repo.create(to_active_model(&job)?).await?;
        debug!(job_id = %created.id, "Job enqueued");
        from_model(created)
    }

    async fn get(&self, id: &str) -> Result<Option<EmailJob>, QueueError> {
        self.repo.find_by_id(id).await?.map(from_model).transpose()
    }

    async fn cancel(&self, id: &str) -> Result<bool, QueueError> {
        Ok(self.repo.cancel(id, Utc::now()).await?)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let now = Utc::now();
        let lease_id = self.ids.generate_uuid_v4();

        let Some(model) = self
            .repo
            .claim_next(worker_id, lease_id, later(now, visibility_timeout), now)
            .await?
        else {
            return Ok(None);
        };

        if model.lease_id != Some(lease_id) {
            return Err(QueueError::Integrity {
                job_id: model.id,
                reason: "claimed row carries a different lease".to_string(),
            });
        }

        let job = from_model(model)?;
        Ok(Some(ClaimedJob {
            lease: Lease {
                job_id: job.id.clone(),
                lease_id,
                worker_id: worker_id.to_string(),
            },
            job,
        }))
    }

    async fn complete(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), QueueError> {
        let changes = email_job::ActiveModel {
            status: Set(to_db_status(outcome.status)),
            per_recipient_result: Set(to_json(&outcome.results)?),
            last_error: Set(outcome.error),
            completed_at: Set(Some(Utc::now().into())),
            claimed_by: Set(None),
            lease_id: Set(None),
            visibility_deadline: Set(None),
            ..Default::default()
        };
        self.update_leased(lease, changes, LeaseCounter::Attempts).await
    }

    async fn requeue(
        &self,
        lease: &Lease,
        delay: Duration,
        results: BTreeMap<String, RecipientResult>,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let changes = back_to_pending(later(Utc::now(), delay), &results, error)?;
        self.update_leased(lease, changes, LeaseCounter::Attempts).await
    }

    async fn defer(
        &self,
        lease: &Lease,
        cause: DeferCause,
        delay: Duration,
        results: BTreeMap<String, RecipientResult>,
        reason: Option<String>,
    ) -> Result<(), QueueError> {
        let changes = back_to_pending(later(Utc::now(), delay), &results, reason)?;
        let counter = match cause {
            DeferCause::RateLimit => LeaseCounter::Deferrals,
            DeferCause::ProviderThrottle => LeaseCounter::ThrottleDeferrals,
        };
        self.update_leased(lease, changes, counter).await
    }

    async fn reap_stale(&self) -> Result<u64, QueueError> {
        let reaped = self.repo.reap_stale(Utc::now()).await?;
        if reaped > 0 {
            info!(count = reaped, "Reaped stale claims");
        }
        Ok(reaped)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for status in ALL_STATUSES {
            let count = self.repo.count_by_status(to_db_status(status)).await?;
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Processing => stats.processing = count,
                JobStatus::PartiallySent => stats.partially_sent = count,
                JobStatus::Sent => stats.sent = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Cancelled => stats.cancelled = count,
            }
        }
        Ok(stats)
    }

    async fn clean(&self, retention: Duration) -> Result<u64, QueueError> {
        let cutoff = earlier(Utc::now(), retention);
        Ok(self.repo.delete_terminal_before(cutoff).await?)
    }
}
