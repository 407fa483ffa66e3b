//! Token bucket with continuous refill.

use tokio::time::{Duration, Instant};

/// Slack for float comparisons of token counts.
const EPSILON: f64 = 1e-9;

/// Token bucket rate limiter.
///
/// Tokens are added at a constant rate and consumed one per request. The
/// bucket starts full. Refill is computed from elapsed time at each
/// operation; no background task is involved.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Max tokens.
    capacity: f64,
    /// Current available tokens.
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last refill time.
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket holding `burst` tokens refilled at `refill_per_sec`.
    pub fn new(burst: u32, refill_per_sec: f64) -> Self {
        let capacity = burst as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_per_sec.max(0.0),
            last_refill: Instant::now(),
        }
    }

    /// Create a bucket that regains one token every `interval`.
    pub fn every(burst: u32, interval: Duration) -> Self {
        let secs = interval.as_secs_f64();
        let rate = if secs > 0.0 { 1.0 / secs } else { f64::MAX };
        Self::new(burst, rate)
    }

    /// Whether one token is available. Does not consume.
    pub fn check(&mut self) -> bool {
        self.refill();
        self.tokens + EPSILON >= 1.0
    }

    /// Remove one token. Callers must have seen a successful [`check`](Self::check).
    pub fn consume(&mut self) {
        self.refill();
        self.tokens = (self.tokens - 1.0).max(0.0);
    }

    /// Atomic check-and-consume.
    pub fn allow(&mut self) -> bool {
        if self.check() {
            self.consume();
            true
        } else {
            false
        }
    }

    /// Current token count.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Full bucket.
    pub fn is_idle(&mut self) -> bool {
        self.available() + EPSILON >= self.capacity
    }

    /// Time until one token is available (zero if one already is).
    pub fn wait_time(&mut self) -> Duration {
        self.refill();
        if self.tokens + EPSILON >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        let tokens_needed = 1.0 - self.tokens;
        Duration::try_from_secs_f64(tokens_needed / self.refill_rate).unwrap_or(Duration::MAX)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_deny() {
        let mut bucket = TokenBucket::every(6, Duration::from_secs(5));
        for _ in 0..6 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_does_not_consume() {
        let mut bucket = TokenBucket::new(1, 1.0);
        assert!(bucket.check());
        assert!(bucket.check());
        bucket.consume();
        assert!(!bucket.check());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let mut bucket = TokenBucket::every(6, Duration::from_secs(5));
        for _ in 0..6 {
            bucket.allow();
        }
        assert!(!bucket.is_idle());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(bucket.allow());
        assert!(!bucket.allow());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.is_idle());
        assert!((bucket.available() - 6.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time() {
        let mut bucket = TokenBucket::new(1, 0.5);
        assert_eq!(bucket.wait_time(), Duration::ZERO);
        bucket.allow();
        let wait = bucket.wait_time();
        assert!(wait > Duration::from_millis(1900) && wait <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admitted_bounded_by_burst_plus_refill() {
        let mut bucket = TokenBucket::new(3, 2.0);
        let mut admitted = 0;
        for _ in 0..100 {
            if bucket.allow() {
                admitted += 1;
            }
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        // 5 s window: 3 + 2 * 5
        assert!(admitted <= 13, "admitted {}", admitted);
        assert!(admitted >= 11);
    }
}
