//! Coarse per-account request throttling.
//!
//! Counters live in process memory and are approximate by contract: they are
//! lost on restart and are not shared between instances. A deployment with
//! several instances can swap in another [`RateLimiter`] backed by a shared
//! TTL store.

use chrono::Duration;
use log::{debug, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::utils::time::bucket_index;
use crate::utils::Clock;

/// Fixed-window counter capability.
pub trait RateLimiter: Send + Sync {
    /// Counts one call for `key` in the current `window` and reports whether
    /// it fits under `limit`.
    fn allow(&self, key: &str, limit: u32, window: Duration) -> bool;
}

// (key, window length in seconds, window index)
type BucketKey = (String, i64, i64);

/// In-process fixed-window limiter.
pub struct InMemoryRateLimiter {
    buckets: Mutex<HashMap<BucketKey, u32>>,
    clock: Arc<dyn Clock>,
    cleanup_probability: f64,
    retention: Duration,
}

impl InMemoryRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
            cleanup_probability: 0.01,
            retention: Duration::hours(24),
        }
    }

    /// Sets how often `allow` sweeps old buckets and how old they must be.
    pub fn with_cleanup(mut self, probability: f64, retention: Duration) -> Self {
        self.cleanup_probability = probability.clamp(0.0, 1.0);
        self.retention = retention;
        self
    }

    /// Calls counted for `key` in the current window.
    pub fn count(&self, key: &str, window: Duration) -> u32 {
        let bucket = bucket_index(self.clock.now(), window);
        match self.buckets.lock() {
            Ok(buckets) => buckets
                .get(&(key.to_string(), window.num_seconds(), bucket))
                .copied()
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Drops buckets that ended more than the retention period ago.
    pub fn purge_stale(&self) -> usize {
        match self.buckets.lock() {
            Ok(mut buckets) => self.purge_locked(&mut buckets),
            Err(_) => 0,
        }
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn purge_locked(&self, buckets: &mut HashMap<BucketKey, u32>) -> usize {
        let cutoff = (self.clock.now() - self.retention).timestamp();
        let before = buckets.len();
        buckets.retain(|(_, window_secs, index), _| (index + 1) * window_secs.max(&1) > cutoff);
        let removed = before - buckets.len();
        if removed > 0 {
            debug!("Evicted {} stale rate-limit buckets", removed);
        }
        removed
    }
}

impl RateLimiter for InMemoryRateLimiter {
    fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        let bucket = bucket_index(self.clock.now(), window);
        let mut buckets = match self.buckets.lock() {
            Ok(buckets) => buckets,
            Err(e) => {
                warn!("Rate limiter state unavailable ({}); allowing {}", e, key);
                return true;
            }
        };

        if self.cleanup_probability > 0.0 && rand::thread_rng().gen_bool(self.cleanup_probability) {
            self.purge_locked(&mut buckets);
        }

        let count = buckets
            .entry((key.to_string(), window.num_seconds(), bucket))
            .or_insert(0);
        if *count >= limit {
            debug!("Rate limit hit for {} ({} per {}s)", key, limit, window.num_seconds());
            return false;
        }
        *count += 1;
        true
    }
}

/// Hourly request budget per account.
#[derive(Clone)]
pub struct RateLimitWindow {
    limiter: Arc<dyn RateLimiter>,
}

impl RateLimitWindow {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter }
    }

    pub fn allow(&self, account_id: &str, max_per_hour: u32) -> bool {
        self.limiter.allow(account_id, max_per_hour, Duration::hours(1))
    }
}
