//! Token-bucket rate limiting keyed by bearer token or client IP.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RateLimitConfig;

/// Idle buckets older than this are evicted; an idle bucket has refilled to
/// max anyway, so dropping it does not change behaviour.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: now,
        }
    }

    /// Refill for elapsed time, then try to take one token. Returns whether
    /// the request is allowed and, if not, the seconds to wait.
    fn allow(&mut self, now: Instant) -> (bool, f64) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return (true, 0.0);
        }
        (false, (1.0 - self.tokens) / self.refill_rate)
    }
}

/// Per-key token buckets with periodic idle eviction.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    burst: f64,
    /// Tokens per second.
    rate: f64,
}

impl RateLimiter {
    /// Returns `None` when the config disables rate limiting
    /// (`requests_per_minute <= 0`); callers then skip the check entirely.
    pub fn from_config(cfg: RateLimitConfig) -> Option<Arc<Self>> {
        if cfg.requests_per_minute <= 0 {
            return None;
        }
        let rl = Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
            burst: cfg.burst.max(1) as f64,
            rate: cfg.requests_per_minute as f64 / 60.0,
        });

        let sweeper = rl.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                sweeper.sweep(Instant::now());
            }
        });

        Some(rl)
    }

    /// Check and consume for `key`. Returns whether the request is allowed
    /// and the retry-after seconds when it is not.
    pub fn allow(&self, key: &str) -> (bool, f64) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.burst, self.rate, now));
        bucket.allow(now)
    }

    /// Evict buckets idle longer than the cleanup interval.
    fn sweep(&self, now: Instant) {
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        let before = buckets.len();
        buckets.retain(|_, b| now.duration_since(b.last_refill) <= CLEANUP_INTERVAL);
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle rate-limit buckets");
        }
    }
}
