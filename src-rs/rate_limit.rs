use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Sliding-window request counter keyed by client identity.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    window: Duration,
    max_requests: usize,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

// Idle buckets are swept once the map grows past this many keys.
const SWEEP_THRESHOLD: usize = 10_000;

impl InMemoryRateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Records a hit for `key` and reports whether it is within the limit.
    /// Rejected hits are not counted.
    pub fn check_and_count(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut buckets = self.buckets.lock();
        if buckets.len() > SWEEP_THRESHOLD {
            buckets.retain(|_, bucket| bucket.back().is_some_and(|last| *last >= cutoff));
        }

        let bucket = buckets.entry(key.to_string()).or_default();
        while bucket.front().is_some_and(|front| *front < cutoff) {
            bucket.pop_front();
        }

        if bucket.len() >= self.max_requests {
            return false;
        }

        bucket.push_back(now);
        true
    }
}
