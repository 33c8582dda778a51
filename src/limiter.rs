// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Bandwidth cap shared by every chunk execution.
///
/// A token bucket that may run into debt: a chunk larger than the bucket is
/// let through immediately and later callers wait until the debt is repaid.
#[derive(Clone, Debug)]
pub struct SpeedLimiter {
    state: Arc<Mutex<TokenBucket>>,
}

#[derive(Debug)]
struct TokenBucket {
    /// Burst size in bytes.
    capacity: f64,
    /// Available bytes; negative while in debt.
    tokens: f64,
    /// Refill rate in bytes per second. `0` disables limiting.
    rate: u64,
    last_refill: Instant,
}

impl SpeedLimiter {
    /// `rate_bytes_per_sec == 0` means unlimited.
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(TokenBucket::new(rate_bytes_per_sec, Instant::now()))),
        }
    }

    /// Replace the cap, dropping any accumulated debt.
    pub async fn set_rate(&self, rate_bytes_per_sec: u64) {
        let mut bucket = self.state.lock().await;
        *bucket = TokenBucket::new(rate_bytes_per_sec, Instant::now());
    }

    /// Account for `amount` bytes, sleeping while the bucket is in debt.
    pub async fn take(&self, amount: u64) {
        let wait = {
            let mut bucket = self.state.lock().await;
            bucket.charge(amount, Instant::now())
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

impl TokenBucket {
    fn new(rate: u64, now: Instant) -> Self {
        Self {
            capacity: rate as f64,
            tokens: rate as f64,
            rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity);
        self.last_refill = now;
    }

    /// Deduct `amount` and return how long the caller must wait.
    fn charge(&mut self, amount: u64, now: Instant) -> Duration {
        if self.rate == 0 || amount == 0 {
            return Duration::ZERO;
        }
        self.refill(now);
        self.tokens -= amount as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate as f64)
        }
    }
}
