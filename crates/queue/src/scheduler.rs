//! Periodic queue maintenance.

use std::sync::Arc;
use std::time::Duration;

use scholar_common::QueueSettings;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::store::QueueStore;

/// Maintenance intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceConfig {
    /// How often abandoned claims are returned to the queue.
    pub reap_interval: Duration,
    /// How often finished jobs past retention are deleted.
    pub cleanup_interval: Duration,
    /// How long finished jobs are kept.
    pub retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for MaintenanceConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            reap_interval: Duration::from_secs(settings.reap_interval_secs.max(1)),
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs.max(1)),
            retention: Duration::from_secs(u64::from(settings.retention_days) * 86_400),
        }
    }
}

/// Handle to the running maintenance tasks.
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stop all maintenance tasks.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Run reaping and cleanup on their own intervals, independent of the
/// worker pool. Failures are logged and retried on the next tick.
pub fn run_maintenance(config: MaintenanceConfig, store: Arc<dyn QueueStore>) -> MaintenanceHandle {
    let reap_store = Arc::clone(&store);
    let clean_store = store;
    let retention = config.retention;

    // Spawn stale claim reaper
    let reaper = tokio::spawn(async move {
        let mut ticker = interval(config.reap_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match reap_store.reap_stale().await {
                Ok(count) => {
                    if count > 0 {
                        tracing::warn!(count, "Returned abandoned email jobs to the queue");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to reap stale email jobs");
                }
            }
        }
    });

    // Spawn retention cleanup
    let cleaner = tokio::spawn(async move {
        let mut ticker = interval(config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match clean_store.clean(retention).await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!(
                            count,
                            retention_days = retention.as_secs() / 86_400,
                            "Cleaned up finished email jobs"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to clean up finished email jobs");
                }
            }
        }
    });

    MaintenanceHandle {
        tasks: vec![reaper, cleaner],
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryQueueStore;
    use scholar_core::{JobStatus, NewEmailJob, Recipient};

    #[test]
    fn test_config_from_settings() {
        let config = MaintenanceConfig::from(&QueueSettings {
            retention_days: 2,
            reap_interval_secs: 0,
            ..Default::default()
        });
        assert_eq!(config.retention, Duration::from_secs(172_800));
        assert_eq!(config.reap_interval, Duration::from_secs(1));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_reaper_recovers_abandoned_claim() {
        let store = Arc::new(MemoryQueueStore::new());
        let job = store
            .enqueue(NewEmailJob {
                recipients: vec![Recipient::new("r1", "ada@example.com", None)],
                subject: "Hello".to_string(),
                html_content: "<p>Hello</p>".to_string(),
                text_content: None,
                priority: 0,
                max_attempts: 3,
                template_id: None,
                template_data: None,
                scheduled_at: None,
            })
            .await
            .unwrap();
        store
            .claim_next("crashed", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        let handle = run_maintenance(
            MaintenanceConfig {
                reap_interval: Duration::from_millis(20),
                cleanup_interval: Duration::from_secs(3600),
                retention: Duration::from_secs(3600),
            },
            Arc::clone(&store) as _,
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = store.get(&job.id).await.unwrap().unwrap();
                if current.status == JobStatus::Pending {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        handle.abort();

        let reaped = store.get(&job.id).await.unwrap().unwrap();
        assert!(reaped.claimed_by.is_none());
        assert_eq!(reaped.attempts, 0);
    }
}
