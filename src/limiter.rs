/*!
 * Rate Limiting
 *
 * Token bucket with a burst of one token, refilled continuously at `rate`
 * tokens per second. Waiting is a 1 ms sleep loop that re-checks the cancel
 * token on every pass.
 */

use crate::error::Result;
use crate::parser::CancelToken;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(1);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter
pub struct RateLimiter {
    /// Tokens per second
    rate: f64,
    max_tokens: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter admitting `rate` events per second
    ///
    /// Returns `None` for a zero rate, which means unlimited.
    pub fn new(rate: u64) -> Option<Self> {
        if rate == 0 {
            return None;
        }
        Some(Self {
            rate: rate as f64,
            max_tokens: 1.0,
            bucket: Mutex::new(Bucket {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        let mut b = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(b.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            b.tokens = (b.tokens + elapsed * self.rate).min(self.max_tokens);
            b.last_refill = now;
        }
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a token is available or `cancel` fires
    pub fn acquire(&self, cancel: &CancelToken) -> Result<()> {
        loop {
            cancel.check()?;
            if self.try_acquire() {
                return Ok(());
            }
            std::thread::sleep(POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_unlimited() {
        assert!(RateLimiter::new(0).is_none());
    }

    #[test]
    fn burst_is_one() {
        let l = RateLimiter::new(1).unwrap();
        assert!(l.try_acquire());
        assert!(!l.try_acquire());
    }

    #[test]
    fn drain_respects_rate() {
        let l = RateLimiter::new(200).unwrap();
        let cancel = CancelToken::new();
        let start = Instant::now();
        for _ in 0..21 {
            l.acquire(&cancel).unwrap();
        }
        // 20 refills at 5 ms each
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn cancelled_wait_returns() {
        let l = RateLimiter::new(1).unwrap();
        assert!(l.try_acquire());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(l.acquire(&cancel).unwrap_err().is_cancelled());
    }
}
