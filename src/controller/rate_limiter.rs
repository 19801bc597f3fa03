//! Requeue Rate Limiters
//!
//! Decide how long a failing work item waits before it is handed to a
//! worker again. The controller default is the maximum of a per-item
//! exponential backoff and an overall token bucket.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::time::{Duration, Instant};

// =============================================================================
// Configuration
// =============================================================================

/// Tuning for the default controller rate limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimiterConfig {
    /// First per-item retry delay in milliseconds
    pub base_delay_ms: u64,
    /// Cap on the per-item retry delay in seconds
    pub max_delay_secs: u64,
    /// Sustained requeues per second across all items
    pub qps: f64,
    /// Token bucket size
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_secs: 1000,
            qps: 10.0,
            burst: 100,
        }
    }
}

// =============================================================================
// Rate Limiter Trait
// =============================================================================

/// Per-item requeue policy
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` may be processed again; records a failure
    fn when(&self, item: &K) -> Duration;

    /// Stop tracking `item`, resetting its backoff
    fn forget(&self, item: &K);

    /// Failures recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &K) -> u32;
}

// =============================================================================
// Item Exponential Failure Rate Limiter
// =============================================================================

struct ItemBackoff {
    backoff: ExponentialBackoff,
    failures: u32,
}

/// Doubles the delay of an item on each failure: `base * 2^failures`,
/// capped at `max`
pub struct ItemExponentialFailureRateLimiter<K: Eq + Hash> {
    base: Duration,
    max: Duration,
    items: DashMap<K, ItemBackoff>,
}

impl<K: Eq + Hash> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            items: DashMap::new(),
        }
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base)
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(self.max)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl<K> RateLimiter<K> for ItemExponentialFailureRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, item: &K) -> Duration {
        let mut entry = self.items.entry(item.clone()).or_insert_with(|| ItemBackoff {
            backoff: self.new_backoff(),
            failures: 0,
        });
        entry.failures = entry.failures.saturating_add(1);
        // max_elapsed_time is unset, so the backoff never runs out
        entry.backoff.next_backoff().unwrap_or(self.max).min(self.max)
    }

    fn forget(&self, item: &K) {
        self.items.remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.items.get(item).map(|e| e.failures).unwrap_or(0)
    }
}

// =============================================================================
// Bucket Rate Limiter
// =============================================================================

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by all items; bounds the overall requeue rate
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last_refill = now;

        // Reserve a token even when the bucket is empty; the debt is the wait
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

// =============================================================================
// Max-Of Rate Limiter
// =============================================================================

/// Waits as long as the strictest of its limiters demands
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K: Send + Sync> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item exponential backoff combined with an overall token bucket
pub fn default_controller_rate_limiter<K>(config: &RateLimiterConfig) -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_secs(config.max_delay_secs),
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}
