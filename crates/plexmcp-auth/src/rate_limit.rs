//! In-memory token-bucket rate limiting for OAuth endpoints.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

/// Token-bucket configuration
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst size)
    pub capacity: u32,
    /// Refill window for a full bucket
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Keyed token buckets; one bucket per caller key.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: StdMutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Create a limiter with the given configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: StdMutex::new(HashMap::new()),
        }
    }

    /// Take one token for `key`; `false` means the caller is limited
    pub fn try_acquire(&self, key: &str) -> bool {
        let refill_per_sec = f64::from(self.config.capacity) / self.config.window.as_secs_f64();
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: f64::from(self.config.capacity),
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec)
            .min(f64::from(self.config.capacity));
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_limited() {
        let limiter = RateLimiter::new(RateLimitConfig {
            capacity: 3,
            window: Duration::from_secs(60),
        });
        assert!(limiter.try_acquire("a"));
        assert!(limiter.try_acquire("a"));
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        // Separate keys have separate buckets.
        assert!(limiter.try_acquire("b"));
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new(RateLimitConfig {
            capacity: 10,
            window: Duration::from_millis(100),
        });
        for _ in 0..10 {
            assert!(limiter.try_acquire("a"));
        }
        assert!(!limiter.try_acquire("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire("a"));
    }
}
