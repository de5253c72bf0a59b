//! Send pacing: a token bucket for the steady rate and exponential backoff
//! for rejected sends.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

/// Fallback deadline distance when `now + delay` does not fit in an
/// [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400);

/// `capacity` sends per `window`, refilled continuously. Starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, window: Duration, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        let window = window.as_secs_f64().max(0.001);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / window,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or return how long until one is available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_per_sec).max(Duration::from_millis(1)))
    }

    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens.floor() as u32
    }
}

/// Doubling delay from `base`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1 << exp).min(self.max)
    }

    /// [`Backoff::delay`] plus up to 10% jitter, raised to any
    /// server-provided `retry_after`. Never above `max`.
    pub fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay(attempt);
        let jitter_ms = (delay.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        let delay = delay.saturating_add(jitter).min(self.max);
        match retry_after {
            Some(wait) if wait > self.max => {
                debug!(
                    requested_ms = wait.as_millis() as u64,
                    capped_ms = self.max.as_millis() as u64,
                    "backoff: server retry_after shortened to max"
                );
                self.max
            }
            Some(wait) => delay.max(wait),
            None => delay,
        }
    }

    /// `now + delay`, saturating instead of overflowing.
    pub fn deadline(now: Instant, delay: Duration) -> Instant {
        now.checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now)
    }
}
