//! Durable job storage.
//!
//! A [`QueueStore`] is the only place job state lives. Claims are exclusive
//! and carry a lease; every write-back names the lease it was claimed with, so
//! a worker whose claim was reaped cannot overwrite the job's newer state.

mod memory;
mod postgres;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scholar_common::AppError;
use scholar_core::{
    EmailJob, JobId, JobStatus, JobValidationError, NewEmailJob, QueueStats, RecipientResult,
};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryQueueStore;
pub use postgres::PgQueueStore;

/// Proof of ownership for a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Claimed job.
    pub job_id: JobId,
    /// Token written on the job by the claim; write-backs must match it.
    pub lease_id: Uuid,
    /// Worker that made the claim. For logs.
    pub worker_id: String,
}

/// A job handed to one worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Snapshot taken at claim time.
    pub job: EmailJob,
    /// Ownership of the claim.
    pub lease: Lease,
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// Terminal status to record.
    pub status: JobStatus,
    /// Final per-recipient results.
    pub results: BTreeMap<String, RecipientResult>,
    /// Last error of the final pass, if any.
    pub error: Option<String>,
}

/// Why a job went back to the queue without using an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferCause {
    /// The local send rate limit was reached. Counted in `deferrals`.
    RateLimit,
    /// The provider throttled our sends. Counted in `throttle_deferrals`.
    ProviderThrottle,
}

/// Queue operation failure.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A claim or write-back broke the single-owner rule.
    #[error("queue integrity violation on job {job_id}: {reason}")]
    Integrity { job_id: JobId, reason: String },

    #[error("queue storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    InvalidJob(#[from] JobValidationError),
}

impl QueueError {
    pub(crate) fn lease_lost(lease: &Lease) -> Self {
        Self::Integrity {
            job_id: lease.job_id.clone(),
            reason: format!(
                "lease {} held by {} no longer owns the job",
                lease.lease_id, lease.worker_id
            ),
        }
    }
}

impl From<AppError> for QueueError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(id) => Self::NotFound(id),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => Self::NotFound(format!("email job {id}")),
            QueueError::InvalidJob(e) => Self::Validation(e.to_string()),
            other => Self::Queue(other.to_string()),
        }
    }
}

/// At-least-once job queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Validate and store a new pending job, assigning its id.
    async fn enqueue(&self, job: NewEmailJob) -> Result<EmailJob, QueueError>;

    /// Snapshot of a job.
    async fn get(&self, id: &str) -> Result<Option<EmailJob>, QueueError>;

    /// Cancel a job that is still pending. Returns whether it was cancelled.
    async fn cancel(&self, id: &str) -> Result<bool, QueueError>;

    /// Claim the most urgent due job: highest priority, then oldest.
    async fn claim_next(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError>;

    /// Finish the job, using one attempt.
    async fn complete(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), QueueError>;

    /// Return the job to the queue after a failed attempt, using one attempt.
    async fn requeue(
        &self,
        lease: &Lease,
        delay: Duration,
        results: BTreeMap<String, RecipientResult>,
        error: Option<String>,
    ) -> Result<(), QueueError>;

    /// Return the job to the queue without using an attempt, counting the
    /// deferral against `cause`.
    async fn defer(
        &self,
        lease: &Lease,
        cause: DeferCause,
        delay: Duration,
        results: BTreeMap<String, RecipientResult>,
        reason: Option<String>,
    ) -> Result<(), QueueError>;

    /// Return claims past their visibility deadline to the queue.
    async fn reap_stale(&self) -> Result<u64, QueueError>;

    /// Job counts per status.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Delete finished jobs completed longer than `retention` ago.
    async fn clean(&self, retention: Duration) -> Result<u64, QueueError>;
}

/// `now + delay`, saturating.
pub(crate) fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - age`, saturating.
pub(crate) fn earlier(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_into_app_error() {
        let not_found: AppError = QueueError::NotFound("job1".into()).into();
        assert_eq!(not_found.error_code(), "NOT_FOUND");

        let invalid: AppError = QueueError::InvalidJob(JobValidationError::NoRecipients).into();
        assert!(invalid.is_client_error());

        let integrity: AppError = QueueError::Integrity {
            job_id: "job1".into(),
            reason: "double claim".into(),
        }
        .into();
        assert_eq!(integrity.error_code(), "QUEUE_ERROR");
    }

    #[test]
    fn test_huge_durations_saturate() {
        let now = Utc::now();
        assert_eq!(later(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(earlier(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(later(now, Duration::from_secs(5)), now + chrono::Duration::seconds(5));
    }
}
