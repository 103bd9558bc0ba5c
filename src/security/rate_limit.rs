use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::utils::clock::Clock;

#[derive(Debug)]
struct Bucket {
    window_start: i64,
    count: u64,
    last_seen: DateTime<Utc>,
    /// Set under the bucket lock when eviction drops it from the map.
    evicted: bool,
}

/// Outcome of counting one request against its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub count: u64,
    pub limit: u64,
    /// Time until the current window closes.
    pub retry_after: Duration,
}

/// Fixed-window counter per caller key.
///
/// Windows are aligned to multiples of the window length since the Unix
/// epoch; a request landing exactly on a boundary counts toward the new
/// window. Each bucket has its own lock, the map itself is sharded.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    limit: u64,
    window_secs: i64,
    idle_ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    buckets: Arc<DashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(limit: u64, window: Duration, idle_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let window_secs = window.as_secs().max(1) as i64;
        Self {
            limit: limit.max(1),
            window_secs,
            idle_ttl: chrono::Duration::seconds(idle_ttl.as_secs().max(window_secs as u64) as i64),
            clock,
            buckets: Arc::new(DashMap::new()),
        }
    }

    /// Count the request against the configured limit and decide. The
    /// increment happens whether or not the request is admitted.
    pub fn check(&self, key: &str) -> RateDecision {
        self.check_with_limit(key, self.limit)
    }

    pub fn allow(&self, key: &str) -> bool {
        self.check(key).allowed
    }

    /// Same as [`check`](Self::check) with an explicit limit, for buckets
    /// that sit on a different budget than the default one.
    pub fn check_with_limit(&self, key: &str, limit: u64) -> RateDecision {
        let limit = limit.max(1);
        let now = self.clock.now();
        let ts = now.timestamp();
        let window_start = ts - ts.rem_euclid(self.window_secs);

        loop {
            // Clone the bucket handle out so the shard lock is not held while
            // the bucket is updated.
            let bucket = self
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Bucket {
                        window_start,
                        count: 0,
                        last_seen: now,
                        evicted: false,
                    }))
                })
                .clone();

            // `None` means the bucket was evicted between lookup and lock;
            // count against its successor instead.
            if let Some(decision) = self.record(&bucket, key, limit, now) {
                return decision;
            }
        }
    }

    fn record(&self, bucket: &Mutex<Bucket>, key: &str, limit: u64, now: DateTime<Utc>) -> Option<RateDecision> {
        let ts = now.timestamp();
        let window_start = ts - ts.rem_euclid(self.window_secs);
        let mut b = bucket.lock();
        if b.evicted {
            return None;
        }
        if window_start > b.window_start {
            b.window_start = window_start;
            b.count = 0;
        }
        b.count = b.count.saturating_add(1);
        b.last_seen = now;

        let allowed = b.count <= limit;
        let remaining = (b.window_start + self.window_secs - ts).max(1);
        if !allowed {
            debug!(key, count = b.count, limit, "rate limit exceeded");
        }
        Some(RateDecision {
            allowed,
            count: b.count,
            limit,
            retry_after: Duration::from_secs(remaining as u64),
        })
    }

    /// Drop buckets that have not been touched for the idle TTL.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let mut b = bucket.lock();
            let keep = now - b.last_seen < self.idle_ttl;
            b.evicted = !keep;
            keep
        });
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            debug!(evicted, "evicted idle rate limit buckets");
        }
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
