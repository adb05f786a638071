/// rate_limiter.rs – Sliding-window token bucket for the CLOB API.
///
/// The exchange allows 60 orders per minute; the limiter defaults to 55 for
/// a safety margin. Throttle responses apply exponential backoff, and the
/// backoff multiplier only resets after three consecutive successes.
use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Consecutive successes required before the backoff multiplier resets.
const SUCCESSES_TO_RESET: u32 = 3;
const MAX_BACKOFF_SECS: f64 = 60.0;

#[derive(Debug)]
struct Inner {
    timestamps: VecDeque<Instant>,
    backoff_until: Option<Instant>,
    consecutive_throttles: u32,
    consecutive_successes: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_secs: f64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs_f64(window_secs),
            inner: Mutex::new(Inner {
                timestamps: VecDeque::new(),
                backoff_until: None,
                consecutive_throttles: 0,
                consecutive_successes: 0,
            }),
        }
    }

    /// Wait until a request slot is available, then take it.
    ///
    /// Respects any active backoff from throttle responses. The internal
    /// lock is released before every sleep and re-acquired after.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();

                if let Some(until) = inner.backoff_until {
                    if now < until {
                        Some(until - now)
                    } else {
                        inner.backoff_until = None;
                        self.slot_wait(&mut inner, now)
                    }
                } else {
                    self.slot_wait(&mut inner, now)
                }
            };

            match wait {
                None => return,
                Some(d) => {
                    if d > Duration::from_secs(1) {
                        info!(wait_secs = d.as_secs_f64(), "rate limit wait");
                    }
                    tokio::time::sleep(d).await;
                }
            }
        }
    }

    /// Take a slot if one is free, otherwise return how long to wait.
    /// Called with the lock held; never sleeps.
    fn slot_wait(&self, inner: &mut Inner, now: Instant) -> Option<Duration> {
        let cutoff = now.checked_sub(self.window);
        while let Some(&front) = inner.timestamps.front() {
            match cutoff {
                Some(c) if front < c => {
                    inner.timestamps.pop_front();
                }
                _ => break,
            }
        }

        if inner.timestamps.len() < self.max_requests {
            inner.timestamps.push_back(now);
            None
        } else {
            let oldest = *inner.timestamps.front().expect("non-empty at capacity");
            Some((oldest + self.window).saturating_duration_since(now) + Duration::from_millis(100))
        }
    }

    /// Record a throttle (HTTP 429) response: exponential backoff with
    /// ±20% jitter, capped at 60s.
    pub async fn record_throttle(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_throttles += 1;
        inner.consecutive_successes = 0;

        let base = 2f64.powi(inner.consecutive_throttles.min(16) as i32).min(MAX_BACKOFF_SECS);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        let backoff = (base * jitter).min(MAX_BACKOFF_SECS);
        inner.backoff_until = Some(Instant::now() + Duration::from_secs_f64(backoff));

        warn!(
            consecutive = inner.consecutive_throttles,
            backoff_secs = backoff,
            "rate limit hit, backing off"
        );
    }

    /// Record a successful request. The throttle streak only clears after
    /// `SUCCESSES_TO_RESET` successes in a row, not after the first.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.consecutive_throttles == 0 {
            return;
        }
        inner.consecutive_successes += 1;
        if inner.consecutive_successes >= SUCCESSES_TO_RESET {
            inner.consecutive_throttles = 0;
            inner.consecutive_successes = 0;
        }
    }

    /// Requests consumed in the current window.
    pub async fn current_usage(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window);
        while let Some(&front) = inner.timestamps.front() {
            match cutoff {
                Some(c) if front < c => {
                    inner.timestamps.pop_front();
                }
                _ => break,
            }
        }
        inner.timestamps.len()
    }

    /// Current throttle streak (for status reporting and tests).
    pub async fn throttle_streak(&self) -> u32 {
        self.inner.lock().await.consecutive_throttles
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquires_immediately_under_limit() {
        let limiter = RateLimiter::new(5, 60.0);
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.current_usage().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_at_limit_until_window_rolls() {
        let limiter = RateLimiter::new(2, 10.0);
        limiter.acquire().await;
        limiter.acquire().await;

        // Third acquire must wait for the first slot to expire. With the
        // paused clock, sleep auto-advances virtual time.
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_applies_after_throttle() {
        let limiter = RateLimiter::new(100, 60.0);
        limiter.record_throttle().await;

        let start = Instant::now();
        limiter.acquire().await;
        // First backoff is ~2s with ±20% jitter.
        assert!(start.elapsed() >= Duration::from_secs_f64(1.5));
    }

    #[tokio::test(start_paused = true)]
    async fn one_success_does_not_reset_streak() {
        let limiter = RateLimiter::new(100, 60.0);
        limiter.record_throttle().await;
        limiter.record_throttle().await;
        assert_eq!(limiter.throttle_streak().await, 2);

        limiter.record_success().await;
        assert_eq!(limiter.throttle_streak().await, 2);
        limiter.record_success().await;
        assert_eq!(limiter.throttle_streak().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn three_successes_reset_streak() {
        let limiter = RateLimiter::new(100, 60.0);
        limiter.record_throttle().await;
        limiter.record_success().await;
        limiter.record_success().await;
        limiter.record_success().await;
        assert_eq!(limiter.throttle_streak().await, 0);
    }
}
