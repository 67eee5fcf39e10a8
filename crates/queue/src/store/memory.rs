//! In-process queue store.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scholar_common::IdGenerator;
use scholar_core::{EmailJob, JobStatus, NewEmailJob, QueueStats, RecipientResult};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ClaimedJob, DeferCause, JobOutcome, Lease, QueueError, QueueStore, earlier, later};

#[derive(Debug)]
struct Entry {
    job: EmailJob,
    /// Insertion order, breaks `created_at` ties.
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<String, Entry>,
    next_seq: u64,
}

impl State {
    /// The job `lease` still owns, if any.
    fn leased(&mut self, lease: &Lease) -> Result<&mut EmailJob, QueueError> {
        let entry = self
            .jobs
            .get_mut(&lease.job_id)
            .ok_or_else(|| QueueError::NotFound(lease.job_id.clone()))?;
        let job = &mut entry.job;
        if job.status != JobStatus::Processing || job.lease_id != Some(lease.lease_id) {
            return Err(QueueError::lease_lost(lease));
        }
        Ok(job)
    }
}

/// Queue store held in memory.
///
/// Used when no database is configured and by tests. Jobs do not survive a
/// restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    state: Arc<Mutex<State>>,
    ids: IdGenerator,
}

impl MemoryQueueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn release(job: &mut EmailJob) {
    job.claimed_by = None;
    job.lease_id = None;
    job.visibility_deadline = None;
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, job: NewEmailJob) -> Result<EmailJob, QueueError> {
        job.validate()?;
        let job = job.into_job(self.ids.generate(), Utc::now());

        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            job.id.clone(),
            Entry {
                job: job.clone(),
                seq,
            },
        );

        debug!(job_id = %job.id, recipients = job.recipients.len(), "Job enqueued");
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<EmailJob>, QueueError> {
        Ok(self.state.lock().await.jobs.get(id).map(|e| e.job.clone()))
    }

    async fn cancel(&self, id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.jobs.get_mut(id) else {
            return Ok(false);
        };
        if entry.job.status != JobStatus::Pending {
            return Ok(false);
        }
        entry.job.status = JobStatus::Cancelled;
        entry.job.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let Some(entry) = state
            .jobs
            .values_mut()
            .filter(|e| e.job.status == JobStatus::Pending && e.job.scheduled_at <= now)
            .min_by_key(|e| (Reverse(e.job.priority), e.job.created_at, e.seq))
        else {
            return Ok(None);
        };

        let lease = Lease {
            job_id: entry.job.id.clone(),
            lease_id: self.ids.generate_uuid_v4(),
            worker_id: worker_id.to_string(),
        };
        let job = &mut entry.job;
        job.status = JobStatus::Processing;
        job.claimed_by = Some(worker_id.to_string());
        job.lease_id = Some(lease.lease_id);
        job.visibility_deadline = Some(later(now, visibility_timeout));
        job.last_attempt_at = Some(now);

        Ok(Some(ClaimedJob {
            job: job.clone(),
            lease,
        }))
    }

    async fn complete(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state.leased(lease)?;

        job.status = outcome.status;
        job.per_recipient_result = outcome.results;
        job.last_error = outcome.error;
        job.attempts = (job.attempts + 1).min(job.max_attempts);
        job.completed_at = Some(Utc::now());
        release(job);
        Ok(())
    }

    async fn requeue(
        &self,
        lease: &Lease,
        delay: Duration,
        results: BTreeMap<String, RecipientResult>,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state.leased(lease)?;

        job.status = JobStatus::Pending;
        job.per_recipient_result = results;
        job.last_error = error;
        job.attempts = (job.attempts + 1).min(job.max_attempts);
        job.scheduled_at = later(Utc::now(), delay);
        release(job);
        Ok(())
    }

    async fn defer(
        &self,
        lease: &Lease,
        cause: DeferCause,
        delay: Duration,
        results: BTreeMap<String, RecipientResult>,
        reason: Option<String>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state.leased(lease)?;

        job.status = JobStatus::Pending;
        job.per_recipient_result = results;
        job.last_error = reason;
        match cause {
            DeferCause::RateLimit => job.deferrals += 1,
            DeferCause::ProviderThrottle => job.throttle_deferrals += 1,
        }
        job.scheduled_at = later(Utc::now(), delay);
        release(job);
        Ok(())
    }

    async fn reap_stale(&self) -> Result<u64, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut reaped = 0;

        for entry in state.jobs.values_mut() {
            let job = &mut entry.job;
            if job.status == JobStatus::Processing
                && job.visibility_deadline.is_some_and(|deadline| deadline < now)
            {
                info!(
                    job_id = %job.id,
                    worker_id = job.claimed_by.as_deref().unwrap_or("unknown"),
                    "Reaping stale claim"
                );
                job.status = JobStatus::Pending;
                job.last_error = Some("claim expired before completion".to_string());
                release(job);
                reaped += 1;
            }
        }

        Ok(reaped)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for entry in state.jobs.values() {
            stats.record(entry.job.status);
        }
        Ok(stats)
    }

    async fn clean(&self, retention: Duration) -> Result<u64, QueueError> {
        let cutoff = earlier(Utc::now(), retention);
        let mut state = self.state.lock().await;
        let before = state.jobs.len();

        state.jobs.retain(|_, entry| {
            !(entry.job.status.is_terminal()
                && entry.job.completed_at.is_some_and(|done| done < cutoff))
        });

        Ok((before - state.jobs.len()) as u64)
    }
}
