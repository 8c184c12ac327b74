//! Per-user token bucket for message sends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::RateLimitConfig;

/// Buckets idle for this many windows are dropped by `purge_idle`.
pub const IDLE_WINDOWS_BEFORE_PURGE: u32 = 10;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<Uuid, TokenBucket>>>,
    capacity: f64,
    /// Tokens regained per second.
    rate: f64,
    window: Duration,
}

impl RateLimiter {
    /// `capacity` sends per `window`, refilled continuously.
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = f64::from(capacity);
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            rate: capacity / window.as_secs_f64().max(f64::EPSILON),
            window,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.window())
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Take one token for `user_id`; `false` means the send must be rejected.
    pub async fn check(&self, user_id: Uuid) -> bool {
        self.check_at(user_id, Instant::now()).await
    }

    async fn check_at(&self, user_id: Uuid, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(user_id)
            .or_insert_with(|| TokenBucket::new(self.capacity, now));
        bucket.try_consume(self.rate, self.capacity, now)
    }

    pub async fn purge_stale(&self, max_idle: Duration) -> usize {
        self.purge_stale_at(max_idle, Instant::now()).await
    }

    async fn purge_stale_at(&self, max_idle: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < max_idle);
        before - buckets.len()
    }

    /// Drop buckets idle for longer than ten windows.
    pub async fn purge_idle(&self) -> usize {
        self.purge_stale(self.window * IDLE_WINDOWS_BEFORE_PURGE)
            .await
    }
}
