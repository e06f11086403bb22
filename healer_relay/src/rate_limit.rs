//! Rate Limiting
//!
//! Token bucket per client identity. Excess frames are refused, never queued.
//! Buckets survive reconnects and are dropped only after going idle.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(per_second: u32, now: Instant) -> Self {
        TokenBucket {
            tokens: per_second as f64,
            capacity: per_second as f64,
            refill_rate: per_second as f64,
            last_update: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-identity limiter: at most `per_second` frames per second, with a
/// burst of the same size.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    per_second: u32,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        RateLimiter {
            buckets: Mutex::new(HashMap::new()),
            per_second: per_second.max(1),
        }
    }

    /// Tries to take one token for this client.
    ///
    /// Returns true if allowed, false if rate limited.
    pub fn consume(&self, client_id: &str) -> bool {
        self.consume_at(client_id, Instant::now())
    }

    fn consume_at(&self, client_id: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(client_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.per_second, now))
            .try_consume(now)
    }

    /// Drops buckets untouched for longer than `idle`. Returns how many.
    pub fn prune_idle(&self, idle: Duration) -> usize {
        self.prune_idle_at(idle, Instant::now())
    }

    fn prune_idle_at(&self, idle: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_update) < idle);
        before - buckets.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}
