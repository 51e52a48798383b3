//! Token-bucket rate limiting.
//!
//! Used per remote address to throttle pre-auth (plaintext) traffic and
//! per session to pace outbound replication bytes. Buckets are plain
//! state; callers pass `Instant::now()` so tests stay deterministic.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A tiny token bucket. Not thread-safe; callers hold their own lock.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32, now: Instant) -> Self {
        let cap = capacity as f64;
        Self {
            capacity: cap,
            tokens: cap,
            refill_per_sec: refill_per_sec as f64,
            last: now,
        }
    }

    /// Consumes `n` tokens if available.
    pub fn allow(&mut self, n: f64, now: Instant) -> bool {
        let dt = now.duration_since(self.last).as_secs_f64();
        if dt > 0.0 {
            self.tokens = (self.tokens + dt * self.refill_per_sec).min(self.capacity);
            self.last = now;
        }
        if self.tokens < n {
            return false;
        }
        self.tokens -= n;
        true
    }
}

/// Keyed limiter state with idle pruning, one bucket per key.
#[derive(Debug)]
pub struct LimiterTable<K: Eq + Hash + Clone> {
    capacity: u32,
    refill_per_sec: u32,
    idle_after: Duration,
    entries: HashMap<K, (TokenBucket, Instant)>,
}

impl<K: Eq + Hash + Clone> LimiterTable<K> {
    pub fn new(capacity: u32, refill_per_sec: u32, idle_after: Duration) -> Self {
        Self {
            capacity,
            refill_per_sec,
            idle_after,
            entries: HashMap::new(),
        }
    }

    /// Consumes `cost` tokens for `key`, creating the bucket on first use.
    pub fn allow(&mut self, key: K, cost: f64, now: Instant) -> bool {
        let (capacity, refill) = (self.capacity, self.refill_per_sec);
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| (TokenBucket::new(capacity, refill, now), now));
        entry.1 = now;
        entry.0.allow(cost, now)
    }

    /// Drops buckets idle past the configured window. Returns how many
    /// were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let idle_after = self.idle_after;
        self.entries
            .retain(|_, (_, last)| now.duration_since(*last) < idle_after);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
