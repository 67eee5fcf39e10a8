//! Durable email queue and delivery workers for scholar.
//!
//! - **Mailer**: job submission, status lookup and cancellation
//! - **Store**: leased job storage, in memory or on `PostgreSQL`
//! - **Workers**: a fixed pool claiming jobs and dispatching them
//! - **Rate limiting**: per-minute and per-hour provider quotas
//! - **Retry**: exponential backoff between attempts
//! - **Scheduler**: reaping abandoned claims and retention cleanup

pub mod mailer;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod workers;

pub use mailer::{MailQueue, SubmitEmail};
pub use rate_limit::{
    RateLimitDecision, RateLimitError, RateLimiter, RedisRateLimiter, WindowRateLimiter,
};
pub use retry::RetryPolicy;
pub use scheduler::{MaintenanceConfig, MaintenanceHandle, run_maintenance};
pub use store::{
    ClaimedJob, DeferCause, JobOutcome, Lease, MemoryQueueStore, PgQueueStore, QueueError,
    QueueStore,
};
pub use workers::{EmailWorker, JobResolution, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
