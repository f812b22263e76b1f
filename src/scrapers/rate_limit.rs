//! Per-worker token bucket for outbound exchange requests.
//!
//! One bucket is shared (via `Arc`) by every concurrent unit running on the
//! same worker. Buckets are never shared across workers; the exchange's own
//! 429 responses remain the authoritative ceiling.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;

/// Slowest supported refill rate; one request per 100 seconds.
pub const MIN_REQUESTS_PER_SECOND: f64 = 0.01;

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self::starting_at(requests_per_second, burst, Instant::now())
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_second, config.burst)
    }

    fn starting_at(requests_per_second: f64, burst: u32, now: Instant) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: requests_per_second.max(MIN_REQUESTS_PER_SECOND),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// Take one token at `now`, or report how long until one is available.
    pub fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limiter throttling request");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
