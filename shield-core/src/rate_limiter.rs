//! Per-IP token-bucket rate limiting, sharded to avoid one global lock.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

pub const SHARD_COUNT: usize = 16;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        TokenBucket { capacity: capacity as f64, tokens: capacity as f64, last_refill: Instant::now(), refill_rate }
    }

    fn consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_stale(&self, stale_before: Instant) -> bool {
        self.last_refill < stale_before
    }
}

struct Shard {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl Shard {
    fn new() -> Self {
        Shard { buckets: Mutex::new(HashMap::new()) }
    }

    fn cleanup(&self, stale_before: Instant) {
        self.buckets.lock().retain(|_, b| !b.is_stale(stale_before));
    }
}

fn shard_index(ip: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    ip.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

/// Sharded per-IP token bucket limiter, with a separate bucket set per
/// rate-limited POST endpoint.
pub struct RateLimiter {
    global_capacity: u32,
    global_refill_rate: f64,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Instant>,
    shards: Vec<Shard>,
    endpoint_shards: DashMap<String, Vec<Shard>>,
}

impl RateLimiter {
    pub fn new(global_requests: u32, global_window_secs: u64) -> Self {
        RateLimiter {
            global_capacity: global_requests,
            global_refill_rate: global_requests as f64 / global_window_secs.max(1) as f64,
            cleanup_interval: Duration::from_secs(300),
            last_cleanup: Mutex::new(Instant::now()),
            shards: (0..SHARD_COUNT).map(|_| Shard::new()).collect(),
            endpoint_shards: DashMap::new(),
        }
    }

    pub fn check_global(&self, client_ip: &str) -> bool {
        let shard = &self.shards[shard_index(client_ip)];
        self.maybe_cleanup();
        let mut buckets = shard.buckets.lock();
        let bucket = buckets
            .entry(client_ip.to_string())
            .or_insert_with(|| TokenBucket::new(self.global_capacity, self.global_refill_rate));
        bucket.consume()
    }

    pub fn check_endpoint(&self, client_ip: &str, endpoint: &str, max_requests: u32, window_secs: u64) -> bool {
        let shards = self
            .endpoint_shards
            .entry(endpoint.to_string())
            .or_insert_with(|| (0..SHARD_COUNT).map(|_| Shard::new()).collect());
        let shard = &shards[shard_index(client_ip)];
        let mut buckets = shard.buckets.lock();
        let bucket = buckets
            .entry(client_ip.to_string())
            .or_insert_with(|| TokenBucket::new(max_requests, max_requests as f64 / window_secs.max(1) as f64));
        bucket.consume()
    }

    fn maybe_cleanup(&self) {
        let mut last = self.last_cleanup.lock();
        if last.elapsed() < self.cleanup_interval {
            return;
        }
        *last = Instant::now();
        let stale_before = Instant::now() - self.cleanup_interval;
        for shard in &self.shards {
            shard.cleanup(stale_before);
        }
        for entry in self.endpoint_shards.iter() {
            for shard in entry.value() {
                shard.cleanup(stale_before);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_blocks() {
        let limiter = RateLimiter::new(3, 60);
        assert!(limiter.check_global("1.2.3.4"));
        assert!(limiter.check_global("1.2.3.4"));
        assert!(limiter.check_global("1.2.3.4"));
        assert!(!limiter.check_global("1.2.3.4"));
    }

    #[test]
    fn different_ips_independent() {
        let limiter = RateLimiter::new(1, 60);
        assert!(limiter.check_global("1.1.1.1"));
        assert!(limiter.check_global("2.2.2.2"));
        assert!(!limiter.check_global("1.1.1.1"));
    }

    #[test]
    fn endpoint_limits_are_separate_from_global() {
        let limiter = RateLimiter::new(1, 60);
        assert!(limiter.check_global("9.9.9.9"));
        assert!(!limiter.check_global("9.9.9.9"));
        assert!(limiter.check_endpoint("9.9.9.9", "/contact", 5, 60));
    }
}
