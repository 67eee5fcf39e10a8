//! Email worker.
//!
//! One pass over a claimed job: every unresolved recipient gets at most one
//! send, then the job is completed, requeued or deferred as a whole. A pass
//! cut short by the rate limiter after a failed send still uses an attempt,
//! so a job with a failing recipient cannot be deferred forever.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use scholar_core::providers::ProviderKind;
use scholar_core::{BulkSweep, DispatchService, EmailJob, JobStatus, RecipientResult};
use tracing::{debug, error, info, warn};

use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::retry::RetryPolicy;
use crate::store::{ClaimedJob, DeferCause, JobOutcome, Lease, QueueError, QueueStore};

/// What happened to a processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResolution {
    /// The job reached a terminal status.
    Completed(JobStatus),
    /// The job went back to the queue and used an attempt.
    Requeued { delay: Duration },
    /// The job went back to the queue without using an attempt.
    Deferred { delay: Duration },
}

/// Processes claimed email jobs.
#[derive(Clone)]
pub struct EmailWorker {
    store: Arc<dyn QueueStore>,
    limiter: Arc<dyn RateLimiter>,
    dispatcher: DispatchService,
    retry: RetryPolicy,
}

impl EmailWorker {
    /// Create a worker.
    pub fn new(
        store: Arc<dyn QueueStore>,
        limiter: Arc<dyn RateLimiter>,
        dispatcher: DispatchService,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            limiter,
            dispatcher,
            retry,
        }
    }

    /// Provider the worker sends through.
    pub fn provider_kind(&self) -> ProviderKind {
        self.dispatcher.provider_kind()
    }

    /// Claim one due job and process it.
    ///
    /// Returns `None` when no job was due.
    pub async fn run_once(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<JobResolution>, QueueError> {
        match self.store.claim_next(worker_id, visibility_timeout).await? {
            Some(claimed) => self.process(claimed).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run one delivery pass over a claimed job and write the result back.
    pub async fn process(&self, claimed: ClaimedJob) -> Result<JobResolution, QueueError> {
        let ClaimedJob { job, lease } = claimed;

        debug!(
            job_id = %job.id,
            worker_id = %lease.worker_id,
            attempts = job.attempts,
            "Processing email job"
        );

        let job_id = job.id.as_str();
        let sweep = self
            .dispatcher
            .sweep(&job, move || self.admit(job_id))
            .await;

        let unresolved = sweep.unresolved();
        let retryable_failure = sweep.had_retryable_failure();
        let BulkSweep {
            results,
            throttled,
            unavailable,
            last_error,
            halted,
            ..
        } = sweep;

        // Stopped by the limiter before any send failed
        if let Some(delay) = halted.filter(|_| !retryable_failure) {
            self.store
                .defer(
                    &lease,
                    DeferCause::RateLimit,
                    delay,
                    results,
                    Some("send rate limit reached".to_string()),
                )
                .await?;
            debug!(job_id = %job.id, ?delay, "Job deferred by rate limiter");
            return Ok(JobResolution::Deferred { delay });
        }
        let limiter_wait = halted.unwrap_or_default();

        if unresolved > 0 && throttled && !unavailable && self.retry.can_defer(job.throttle_deferrals)
        {
            let delay = self.retry.throttle_delay.max(limiter_wait);
            self.store
                .defer(&lease, DeferCause::ProviderThrottle, delay, results, last_error)
                .await?;
            warn!(job_id = %job.id, unresolved, ?delay, "Provider throttled sends, deferring job");
            return Ok(JobResolution::Deferred { delay });
        }

        if unresolved > 0 && job.has_attempts_left() {
            let delay = self.retry.delay_for_attempt(job.attempts).max(limiter_wait);
            self.store.requeue(&lease, delay, results, last_error).await?;
            warn!(
                job_id = %job.id,
                attempts = job.attempts + 1,
                max_attempts = job.max_attempts,
                unresolved,
                ?delay,
                "Email job requeued for retry"
            );
            return Ok(JobResolution::Requeued { delay });
        }

        let status = JobStatus::from_results(&results);
        self.complete(&job, &lease, status, results, last_error).await?;
        Ok(JobResolution::Completed(status))
    }

    /// Reserve one send, or return how long the job should wait.
    async fn admit(&self, job_id: &str) -> Option<Duration> {
        match self.limiter.try_acquire(1).await {
            Ok(RateLimitDecision::Allowed { .. }) => None,
            Ok(RateLimitDecision::Denied { retry_after }) => Some(retry_after),
            Err(e) => {
                warn!(job_id, error = %e, "Rate limiter unavailable");
                Some(self.retry.base_delay)
            }
        }
    }

    async fn complete(
        &self,
        job: &EmailJob,
        lease: &Lease,
        status: JobStatus,
        results: BTreeMap<String, RecipientResult>,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let sent = results.values().filter(|r| r.sent).count();
        self.store
            .complete(
                lease,
                JobOutcome {
                    status,
                    results,
                    error,
                },
            )
            .await?;

        match status {
            JobStatus::Sent => info!(job_id = %job.id, recipients = sent, "Email job sent"),
            _ => error!(
                job_id = %job.id,
                %status,
                sent,
                recipients = job.recipients.len(),
                attempts = job.attempts + 1,
                "Email job finished with failures"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rate_limit::{RateLimitError, WindowRateLimiter};
    use crate::store::MemoryQueueStore;
    use scholar_common::RateLimitSettings;
    use scholar_core::providers::{ScriptedOutcome, ScriptedProvider};
    use scholar_core::{NewEmailJob, Recipient, SenderIdentity};
    use std::collections::VecDeque;

    const VISIBILITY: Duration = Duration::from_secs(300);

    const ALLOW: RateLimitDecision = RateLimitDecision::Allowed {
        remaining_minute: 1,
        remaining_hour: 1,
    };

    const fn deny(secs: u64) -> RateLimitDecision {
        RateLimitDecision::Denied {
            retry_after: Duration::from_secs(secs),
        }
    }

    /// Replays its decisions in order, then allows everything.
    struct ScriptedLimiter {
        decisions: std::sync::Mutex<VecDeque<RateLimitDecision>>,
    }

    impl ScriptedLimiter {
        fn new(decisions: impl IntoIterator<Item = RateLimitDecision>) -> Arc<Self> {
            Arc::new(Self {
                decisions: std::sync::Mutex::new(decisions.into_iter().collect()),
            })
        }
    }

    #[async_trait::async_trait]
    impl RateLimiter for ScriptedLimiter {
        async fn try_acquire(&self, _n: u32) -> Result<RateLimitDecision, RateLimitError> {
            Ok(self.decisions.lock().unwrap().pop_front().unwrap_or(ALLOW))
        }
    }

    struct Harness {
        store: Arc<MemoryQueueStore>,
        provider: Arc<ScriptedProvider>,
        worker: EmailWorker,
    }

    fn harness(per_minute: u32, retry: RetryPolicy) -> Harness {
        let limiter = Arc::new(WindowRateLimiter::new(&RateLimitSettings {
            per_minute,
            per_hour: 10_000,
        }));
        harness_with(limiter, retry)
    }

    fn harness_with(limiter: Arc<dyn RateLimiter>, retry: RetryPolicy) -> Harness {
        let store = Arc::new(MemoryQueueStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        let dispatcher = DispatchService::new(
            Arc::clone(&provider) as _,
            SenderIdentity {
                from_address: "noreply@scholar.test".to_string(),
                from_name: None,
                reply_to: None,
            },
            Duration::from_secs(5),
        );
        let worker = EmailWorker::new(Arc::clone(&store) as _, limiter, dispatcher, retry);
        Harness {
            store,
            provider,
            worker,
        }
    }

    fn no_delay() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::ZERO,
            throttle_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn job(addresses: &[&str]) -> NewEmailJob {
        NewEmailJob {
            recipients: addresses
                .iter()
                .enumerate()
                .map(|(i, a)| Recipient::new(format!("r{i}"), *a, None))
                .collect(),
            subject: "Hello".to_string(),
            html_content: "<p>Hello</p>".to_string(),
            text_content: None,
            priority: 0,
            max_attempts: 3,
            template_id: None,
            template_data: None,
            scheduled_at: None,
        }
    }

    async fn run(h: &Harness) -> JobResolution {
        h.worker.run_once("w0", VISIBILITY).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_all_sent_completes_job() {
        let h = harness(100, no_delay());
        let job = h.store.enqueue(job(&["a@example.com", "b@example.com"])).await.unwrap();

        assert_eq!(run(&h).await, JobResolution::Completed(JobStatus::Sent));

        let done = h.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Sent);
        assert_eq!(done.attempts, 1);
        assert!(done.completed_at.is_some());
        assert!(done.per_recipient_result.values().all(|r| r.provider_message_id.is_some()));
    }

    #[tokio::test]
    async fn test_nothing_due_returns_none() {
        let h = harness(100, no_delay());
        assert!(h.worker.run_once("w0", VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_with_backoff() {
        let h = harness(100, RetryPolicy::default());
        h.provider.fail_next("b@example.com", 503);
        let job = h.store.enqueue(job(&["a@example.com", "b@example.com"])).await.unwrap();

        assert_eq!(
            run(&h).await,
            JobResolution::Requeued {
                delay: Duration::from_secs(30)
            }
        );

        let pending = h.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(pending.attempts, 1);
        assert!(pending.per_recipient_result["r0"].sent);
        assert!(!pending.per_recipient_result["r1"].permanent);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_end_partially_sent() {
        let h = harness(100, no_delay());
        h.provider.fail_always("b@example.com", 500);
        let job = h.store.enqueue(job(&["a@example.com", "b@example.com"])).await.unwrap();

        let mut resolutions = Vec::new();
        while let Some(resolution) = h.worker.run_once("w0", VISIBILITY).await.unwrap() {
            resolutions.push(resolution);
        }

        assert_eq!(resolutions.len(), 3);
        assert_eq!(
            resolutions.last(),
            Some(&JobResolution::Completed(JobStatus::PartiallySent))
        );
        let done = h.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.attempts, 3);
        assert_eq!(h.provider.sends_to("a@example.com"), 1);
        assert_eq!(h.provider.sends_to("b@example.com"), 3);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let h = harness(100, no_delay());
        h.provider.fail_always("a@example.com", 401);
        h.provider.fail_always("b@example.com", 400);
        let job = h.store.enqueue(job(&["a@example.com", "b@example.com"])).await.unwrap();

        assert_eq!(run(&h).await, JobResolution::Completed(JobStatus::Failed));
        let done = h.store.get(&job.id).await.unwrap().unwrap();
        assert!(done.per_recipient_result.values().all(|r| r.permanent));
        assert_eq!(h.provider.send_count(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_denial_defers_without_using_attempt() {
        let h = harness(1, no_delay());
        let job = h.store.enqueue(job(&["a@example.com", "b@example.com"])).await.unwrap();

        match run(&h).await {
            JobResolution::Deferred { delay } => assert!(delay > Duration::ZERO),
            other => panic!("expected Deferred, got {other:?}"),
        }

        let deferred = h.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(deferred.status, JobStatus::Pending);
        assert_eq!(deferred.attempts, 0);
        assert_eq!(deferred.deferrals, 1);
        assert!(deferred.per_recipient_result["r0"].sent);
        assert!(!deferred.per_recipient_result["r1"].sent);
        assert_eq!(h.provider.send_count(), 1);
    }

    #[tokio::test]
    async fn test_provider_throttling_defers_until_budget_runs_out() {
        let retry = RetryPolicy {
            max_deferrals: 1,
            ..no_delay()
        };
        let h = harness(100, retry);
        h.provider.push_outcome("a@example.com", ScriptedOutcome::Status(429));
        h.provider.push_outcome("a@example.com", ScriptedOutcome::Status(429));
        let job = h.store.enqueue(job(&["a@example.com"])).await.unwrap();

        assert_eq!(
            run(&h).await,
            JobResolution::Deferred {
                delay: Duration::ZERO
            }
        );
        // Deferral budget spent; the next throttle uses an attempt
        assert_eq!(
            run(&h).await,
            JobResolution::Requeued {
                delay: Duration::ZERO
            }
        );
        assert_eq!(run(&h).await, JobResolution::Completed(JobStatus::Sent));

        let done = h.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.throttle_deferrals, 1);
        assert_eq!(done.deferrals, 0);
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn test_limiter_stop_after_failed_send_uses_attempt() {
        let h = harness_with(ScriptedLimiter::new([ALLOW, deny(90)]), RetryPolicy::default());
        h.provider.fail_always("a@example.com", 503);
        let job = h.store.enqueue(job(&["a@example.com", "b@example.com"])).await.unwrap();

        // Backoff is 30s, the limiter asked for 90s
        assert_eq!(
            run(&h).await,
            JobResolution::Requeued {
                delay: Duration::from_secs(90)
            }
        );

        let pending = h.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(pending.attempts, 1);
        assert_eq!(pending.deferrals, 0);
        assert!(!pending.per_recipient_result["r0"].permanent);
        assert!(pending.per_recipient_result["r1"].error.is_none());
    }

    #[tokio::test]
    async fn test_failing_recipient_under_tight_limit_reaches_terminal_state() {
        // One send per pass: every pass is cut short after its first send
        let limiter = ScriptedLimiter::new((0..20).flat_map(|_| [ALLOW, deny(0)]));
        let h = harness_with(limiter, no_delay());
        h.provider.fail_always("a@example.com", 503);
        let job = h.store.enqueue(job(&["a@example.com", "b@example.com"])).await.unwrap();

        let mut passes = 0;
        while h.worker.run_once("w0", VISIBILITY).await.unwrap().is_some() {
            passes += 1;
            assert!(passes < 20, "job never reached a terminal state");
        }

        let done = h.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::PartiallySent);
        assert_eq!(done.attempts, 3);
        assert!(done.per_recipient_result["r1"].sent);
        assert_eq!(h.provider.sends_to("a@example.com"), 3);
        assert_eq!(h.provider.sends_to("b@example.com"), 1);
    }

    #[tokio::test]
    async fn test_limiter_deferrals_leave_throttle_budget_alone() {
        let retry = RetryPolicy {
            max_deferrals: 1,
            ..no_delay()
        };
        let h = harness_with(ScriptedLimiter::new([deny(0), deny(0)]), retry);
        h.provider.push_outcome("a@example.com", ScriptedOutcome::Status(429));
        let job = h.store.enqueue(job(&["a@example.com"])).await.unwrap();

        assert_eq!(run(&h).await, JobResolution::Deferred { delay: Duration::ZERO });
        assert_eq!(run(&h).await, JobResolution::Deferred { delay: Duration::ZERO });
        // The provider throttles next; that still defers instead of using an attempt
        assert_eq!(run(&h).await, JobResolution::Deferred { delay: Duration::ZERO });
        assert_eq!(run(&h).await, JobResolution::Completed(JobStatus::Sent));

        let done = h.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.deferrals, 2);
        assert_eq!(done.throttle_deferrals, 1);
        assert_eq!(done.attempts, 1);
    }

    #[tokio::test]
    async fn test_sent_recipients_are_not_resent() {
        let h = harness(100, no_delay());
        h.provider.fail_next("b@example.com", 503);
        h.store.enqueue(job(&["a@example.com", "b@example.com"])).await.unwrap();

        run(&h).await;
        run(&h).await;

        assert_eq!(h.provider.sends_to("a@example.com"), 1);
        assert_eq!(h.provider.sends_to("b@example.com"), 2);
    }
}
