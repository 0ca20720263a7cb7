//! Per-client token bucket rate limiting.
//!
//! Each client gets a bucket of `capacity` tokens refilled at one token per
//! `refill_interval`, capped at capacity. Refill is computed lazily from
//! elapsed wall time on each [`try_acquire`](RateLimiter::try_acquire), so
//! there is no background task. Unknown clients start with a full bucket.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Server-assigned identifier for one connected client.
pub type ClientId = u64;

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Shared token-bucket limiter, one bucket per client.
pub struct RateLimiter {
    capacity: u32,
    refill_interval: Duration,
    buckets: Mutex<HashMap<ClientId, Bucket>>,
}

impl RateLimiter {
    /// Default bucket: 100 tokens, one refilled every 10 ms.
    pub fn new() -> Self {
        Self::with_params(100, Duration::from_millis(10))
    }

    pub fn with_params(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `client`. Returns false when the bucket is empty.
    pub fn try_acquire(&self, client: ClientId) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry(client).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        // Lazy refill: advance last_refill only by whole tokens so fractional
        // progress toward the next token is not lost.
        let elapsed = now.duration_since(bucket.last_refill);
        let refill = (elapsed.as_nanos() / self.refill_interval.as_nanos().max(1)) as u64;
        if refill > 0 {
            let added = u32::try_from(refill).unwrap_or(u32::MAX);
            bucket.tokens = bucket.tokens.saturating_add(added).min(self.capacity);
            bucket.last_refill += self.refill_interval * added;
            if bucket.tokens == self.capacity {
                bucket.last_refill = now;
            }
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Drop a client's bucket (called when its connection closes).
    pub fn remove(&self, client: ClientId) {
        self.buckets
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(&client);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_client_starts_full() {
        let rl = RateLimiter::with_params(3, Duration::from_secs(10));
        assert!(rl.try_acquire(1));
        assert!(rl.try_acquire(1));
        assert!(rl.try_acquire(1));
        assert!(!rl.try_acquire(1));
    }

    #[test]
    fn buckets_are_per_client() {
        let rl = RateLimiter::with_params(1, Duration::from_secs(10));
        assert!(rl.try_acquire(1));
        assert!(!rl.try_acquire(1));
        assert!(rl.try_acquire(2));
    }

    #[test]
    fn refills_over_time() {
        let rl = RateLimiter::with_params(2, Duration::from_millis(5));
        assert!(rl.try_acquire(7));
        assert!(rl.try_acquire(7));
        assert!(!rl.try_acquire(7));
        std::thread::sleep(Duration::from_millis(12));
        assert!(rl.try_acquire(7));
    }

    #[test]
    fn refill_caps_at_capacity() {
        let rl = RateLimiter::with_params(2, Duration::from_millis(1));
        assert!(rl.try_acquire(9));
        std::thread::sleep(Duration::from_millis(20));
        // Bucket is full again, not overfilled past capacity.
        assert!(rl.try_acquire(9));
        assert!(rl.try_acquire(9));
        assert!(!rl.try_acquire(9));
    }

    #[test]
    fn remove_resets_to_full() {
        let rl = RateLimiter::with_params(1, Duration::from_secs(10));
        assert!(rl.try_acquire(4));
        assert!(!rl.try_acquire(4));
        rl.remove(4);
        assert!(rl.try_acquire(4));
    }
}
