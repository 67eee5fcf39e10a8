//! Send-rate limiting shared by every worker.
//!
//! Two fixed windows (per minute and per hour) are checked together. Windows
//! roll over lazily: the count resets the first time it is touched after the
//! window has ended.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::clients::Client as RedisClient;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::Config as FredConfig;
use scholar_common::{RateLimitSettings, RedisConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Result of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The sends may go ahead.
    Allowed {
        /// Sends left in the current minute.
        remaining_minute: u32,
        /// Sends left in the current hour.
        remaining_hour: u32,
    },
    /// Over a cap; try again after `retry_after`.
    Denied {
        /// Time until every blocking window has reset.
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    /// Whether the sends may go ahead.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Rate limiter backend failure.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("redis error: {0}")]
    Redis(String),
}

impl From<fred::error::Error> for RateLimitError {
    fn from(err: fred::error::Error) -> Self {
        Self::Redis(err.to_string())
    }
}

/// Shared send counter.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Reserve `n` sends in both windows, or report how long to wait.
    ///
    /// A denial reserves nothing.
    async fn try_acquire(&self, n: u32) -> Result<RateLimitDecision, RateLimitError>;
}

#[derive(Debug)]
struct Window {
    limit: u32,
    length: Duration,
    count: u32,
    started: Instant,
}

impl Window {
    fn new(limit: u32, length: Duration, now: Instant) -> Self {
        Self {
            limit,
            length,
            count: 0,
            started: now,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.started) >= self.length {
            self.count = 0;
            self.started = now;
        }
    }

    fn fits(&self, n: u32) -> bool {
        self.count.saturating_add(n) <= self.limit
    }

    fn resets_in(&self, now: Instant) -> Duration {
        self.length.saturating_sub(now.duration_since(self.started))
    }

    const fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }
}

#[derive(Debug)]
struct Windows {
    minute: Window,
    hour: Window,
}

/// In-process limiter for a single node.
///
/// Both windows sit behind one lock so a reservation is all-or-nothing.
#[derive(Debug, Clone)]
pub struct WindowRateLimiter {
    windows: Arc<Mutex<Windows>>,
}

impl WindowRateLimiter {
    /// Create a limiter with the given caps.
    #[must_use]
    pub fn new(settings: &RateLimitSettings) -> Self {
        let now = Instant::now();
        Self {
            windows: Arc::new(Mutex::new(Windows {
                minute: Window::new(settings.per_minute, MINUTE, now),
                hour: Window::new(settings.per_hour, HOUR, now),
            })),
        }
    }

    /// Sends left in the current minute and hour.
    pub async fn remaining(&self) -> (u32, u32) {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        windows.minute.roll(now);
        windows.hour.roll(now);
        (windows.minute.remaining(), windows.hour.remaining())
    }
}

#[async_trait]
impl RateLimiter for WindowRateLimiter {
    async fn try_acquire(&self, n: u32) -> Result<RateLimitDecision, RateLimitError> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        windows.minute.roll(now);
        windows.hour.roll(now);

        // Nearest reset among the windows that are full
        let blocked = [&windows.minute, &windows.hour]
            .into_iter()
            .filter(|window| !window.fits(n))
            .map(|window| window.resets_in(now))
            .min();
        if let Some(retry_after) = blocked {
            debug!(requested = n, ?retry_after, "Send rate limited");
            return Ok(RateLimitDecision::Denied { retry_after });
        }

        windows.minute.count += n;
        windows.hour.count += n;
        Ok(RateLimitDecision::Allowed {
            remaining_minute: windows.minute.remaining(),
            remaining_hour: windows.hour.remaining(),
        })
    }
}

/// Limiter backed by Redis counters, shared across processes.
///
/// Each window is a key named after the window's index since the epoch,
/// expiring with the window. Over-cap increments are rolled back.
#[derive(Clone)]
pub struct RedisRateLimiter {
    redis: Arc<RedisClient>,
    prefix: String,
    per_minute: u32,
    per_hour: u32,
}

impl RedisRateLimiter {
    /// Wrap an initialized client.
    #[must_use]
    pub fn new(redis: Arc<RedisClient>, prefix: &str, settings: &RateLimitSettings) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            per_minute: settings.per_minute,
            per_hour: settings.per_hour,
        }
    }

    /// Connect to Redis and build the limiter.
    pub async fn connect(
        config: &RedisConfig,
        settings: &RateLimitSettings,
    ) -> Result<Self, RateLimitError> {
        let fred_config = FredConfig::from_url(&config.url)?;
        let client = RedisClient::new(fred_config, None, None, None);
        client.init().await?;
        info!(prefix = %config.prefix, "Redis rate limiter connected");
        Ok(Self::new(Arc::new(client), &config.prefix, settings))
    }

    fn key(&self, label: &str, window_secs: i64, now_secs: i64) -> String {
        format!("{}:mail_rate:{label}:{}", self.prefix, now_secs / window_secs)
    }

    async fn increment(&self, key: &str, n: u32, window_secs: i64) -> Result<u64, RateLimitError> {
        let count: u64 = self.redis.incr_by(key, i64::from(n)).await?;
        // First increment in this window
        if count == u64::from(n) {
            self.redis.expire::<(), _>(key, window_secs, None).await?;
        }
        Ok(count)
    }

    async fn rollback(&self, key: &str, n: u32) -> Result<(), RateLimitError> {
        self.redis.decr_by::<(), _>(key, i64::from(n)).await?;
        Ok(())
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn try_acquire(&self, n: u32) -> Result<RateLimitDecision, RateLimitError> {
        let now_secs = chrono::Utc::now().timestamp();
        let windows = [
            ("minute", 60_i64, self.per_minute),
            ("hour", 3600_i64, self.per_hour),
        ];

        let mut taken: Vec<String> = Vec::with_capacity(windows.len());
        let mut counts = [0_u32; 2];
        for (i, (label, window_secs, limit)) in windows.into_iter().enumerate() {
            let key = self.key(label, window_secs, now_secs);
            let count = self.increment(&key, n, window_secs).await?;
            taken.push(key);

            if count > u64::from(limit) {
                for key in &taken {
                    self.rollback(key, n).await?;
                }
                let retry_after = Duration::from_secs((window_secs - now_secs % window_secs).unsigned_abs());
                debug!(window = label, count, limit, "Send rate limited");
                return Ok(RateLimitDecision::Denied { retry_after });
            }
            counts[i] = u32::try_from(count).unwrap_or(u32::MAX);
        }

        Ok(RateLimitDecision::Allowed {
            remaining_minute: self.per_minute.saturating_sub(counts[0]),
            remaining_hour: self.per_hour.saturating_sub(counts[1]),
        })
    }
}
