//! Sliding-window counter approximated from two fixed windows.

use tokio::time::{Duration, Instant};

/// Counts requests in the current and previous fixed windows; the
/// effective count weights the previous window by the fraction of the
/// current window still remaining.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    max_requests: u64,
    window: Duration,
    window_start: Instant,
    curr: u64,
    prev: u64,
}

impl SlidingWindow {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window: window.max(Duration::from_millis(1)),
            window_start: Instant::now(),
            curr: 0,
            prev: 0,
        }
    }

    /// A window of one day.
    pub fn daily(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(24 * 3600))
    }

    /// `curr + prev × remaining fraction of the current window`.
    pub fn effective_count(&mut self) -> f64 {
        let now = Instant::now();
        self.roll(now);
        let into = now.duration_since(self.window_start).as_secs_f64();
        let remaining = (1.0 - into / self.window.as_secs_f64()).clamp(0.0, 1.0);
        self.curr as f64 + self.prev as f64 * remaining
    }

    /// Whether one more request fits. Does not count it.
    pub fn check(&mut self) -> bool {
        self.effective_count() < self.max_requests as f64
    }

    /// Count one request. Callers must have seen a successful [`check`](Self::check).
    pub fn consume(&mut self) {
        self.roll(Instant::now());
        self.curr += 1;
    }

    /// Atomic check-and-count.
    pub fn allow(&mut self) -> bool {
        if self.check() {
            self.consume();
            true
        } else {
            false
        }
    }

    /// Requests still admissible right now.
    pub fn remaining(&mut self) -> u64 {
        let effective = self.effective_count().ceil() as u64;
        self.max_requests.saturating_sub(effective)
    }

    /// Effective count is zero.
    pub fn is_idle(&mut self) -> bool {
        self.effective_count() <= 0.0
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_start);
        if elapsed < self.window {
            return;
        }
        let windows = elapsed.as_nanos() / self.window.as_nanos();
        self.prev = if windows == 1 { self.curr } else { 0 };
        self.curr = 0;
        let advance = self.window.as_nanos() * windows;
        self.window_start += Duration::from_nanos(advance.min(u64::MAX as u128) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_caps_within_window() {
        let mut w = SlidingWindow::new(3, Duration::from_secs(60));
        assert!(w.allow());
        assert!(w.allow());
        assert!(w.allow());
        assert!(!w.allow());
        assert_eq!(w.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_previous_window_is_weighted() {
        let mut w = SlidingWindow::new(4, Duration::from_secs(100));
        for _ in 0..4 {
            assert!(w.allow());
        }

        // 25% into the next window: 4 * 0.75 = 3 still counted
        tokio::time::advance(Duration::from_secs(125)).await;
        assert!((w.effective_count() - 3.0).abs() < 1e-6);
        assert!(w.allow());
        assert!(!w.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_windows_reset_both() {
        let mut w = SlidingWindow::new(2, Duration::from_secs(10));
        w.allow();
        w.allow();
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(w.is_idle());
        assert_eq!(w.remaining(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_does_not_count() {
        let mut w = SlidingWindow::daily(1);
        assert!(w.check());
        assert!(w.check());
        w.consume();
        assert!(!w.check());
    }
}
