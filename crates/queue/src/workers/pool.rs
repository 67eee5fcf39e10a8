//! Fixed-size pool of email workers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use scholar_common::QueueSettings;
use scholar_core::DispatchService;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::email::EmailWorker;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::store::{QueueError, QueueStore};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long a claim stays owned before it may be reaped.
    pub visibility_timeout: Duration,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Prefix for worker ids in logs and claims.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for WorkerPoolConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            workers: settings.workers.max(1),
            visibility_timeout: Duration::from_secs(settings.visibility_timeout_secs),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            name: "email-worker".to_string(),
        }
    }
}

/// Starts email workers.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.workers` workers on the current runtime.
    pub fn spawn(
        config: WorkerPoolConfig,
        store: Arc<dyn QueueStore>,
        limiter: Arc<dyn RateLimiter>,
        dispatcher: DispatchService,
        retry: RetryPolicy,
    ) -> WorkerPoolHandle {
        let worker = EmailWorker::new(store, limiter, dispatcher, retry);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = (0..config.workers)
            .map(|i| {
                let worker_id = format!("{}-{i}", config.name);
                tokio::spawn(run_worker(
                    worker_id,
                    worker.clone(),
                    config.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(workers = config.workers, provider = %worker.provider_kind(), "Worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Handle to a running pool.
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Number of workers started.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop claiming new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Email worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(
    worker_id: String,
    worker: EmailWorker,
    config: WorkerPoolConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id = %worker_id, "Email worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match worker.run_once(&worker_id, config.visibility_timeout).await {
            // Keep draining while there is work
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e @ QueueError::Integrity { .. }) => {
                error!(worker_id = %worker_id, error = %e, "Queue integrity violation");
            }
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Email worker iteration failed");
            }
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            () = tokio::time::sleep(config.poll_interval) => {}
        }
    }

    debug!(worker_id = %worker_id, "Email worker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rate_limit::WindowRateLimiter;
    use crate::store::MemoryQueueStore;
    use scholar_common::RateLimitSettings;
    use scholar_core::providers::ScriptedProvider;
    use scholar_core::{JobStatus, NewEmailJob, Recipient, SenderIdentity};

    fn pool_config(workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers,
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(10),
            name: "test".to_string(),
        }
    }

    fn dispatcher(provider: Arc<ScriptedProvider>) -> DispatchService {
        DispatchService::new(
            provider,
            SenderIdentity {
                from_address: "noreply@scholar.test".to_string(),
                from_name: None,
                reply_to: None,
            },
            Duration::from_secs(5),
        )
    }

    fn limiter() -> Arc<WindowRateLimiter> {
        Arc::new(WindowRateLimiter::new(&RateLimitSettings::default()))
    }

    fn job(i: usize) -> NewEmailJob {
        NewEmailJob {
            recipients: vec![Recipient::new("r1", format!("user{i}@example.com"), None)],
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

    #[test]
    fn test_config_from_settings() {
        let config = WorkerPoolConfig::from(&QueueSettings {
            workers: 0,
            poll_interval_ms: 250,
            ..Default::default()
        });
        assert_eq!(config.workers, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.visibility_timeout, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_shuts_down() {
        let store = Arc::new(MemoryQueueStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(store.enqueue(job(i)).await.unwrap().id);
        }

        let handle = WorkerPool::spawn(
            pool_config(3),
            Arc::clone(&store) as _,
            limiter(),
            dispatcher(Arc::clone(&provider)),
            RetryPolicy::default(),
        );
        assert_eq!(handle.worker_count(), 3);

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.stats().await.unwrap().sent < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown().await;

        for id in ids {
            assert_eq!(store.get(&id).await.unwrap().unwrap().status, JobStatus::Sent);
        }
        assert_eq!(provider.send_count(), 10);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_job() {
        let store = Arc::new(MemoryQueueStore::new());
        let provider = Arc::new(ScriptedProvider::new().with_latency(Duration::from_millis(200)));
        let job = store.enqueue(job(0)).await.unwrap();

        let handle = WorkerPool::spawn(
            pool_config(1),
            Arc::clone(&store) as _,
            limiter(),
            dispatcher(Arc::clone(&provider)),
            RetryPolicy::default(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.stats().await.unwrap().processing == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown().await;

        let done = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Sent);
    }
}
