//! Shared per-second byte budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::QUOTA_POLL_INTERVAL;
use crate::admission::Admission;

/// Source of wall-clock seconds for the budget window.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// Seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    pub fn new(secs: u64) -> Self {
        Self {
            secs: AtomicU64::new(secs),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Window {
    start: u64,
    used: u64,
}

/// Byte budget of `rate` bytes per wall-clock second, shared by every
/// connection of a server.
///
/// The window rolls over lazily: the first call that observes a new second
/// resets the used counter. Quotas are recomputed on every call and never
/// reserved, so concurrent connections can overshoot the budget by at most
/// one grant each.
pub struct RateLimiter {
    rate: u64,
    window: Mutex<Window>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl RateLimiter {
    pub fn new(rate: u64) -> Self {
        Self::with_clock(rate, Arc::new(SystemClock))
    }

    pub fn with_clock(rate: u64, clock: Arc<dyn Clock>) -> Self {
        let start = clock.now_secs();
        Self {
            rate,
            window: Mutex::new(Window { start, used: 0 }),
            clock,
            poll_interval: QUOTA_POLL_INTERVAL,
        }
    }

    /// Overrides how long [`acquire`](Self::acquire) sleeps on an exhausted
    /// budget.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Configured bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Budget left in the current second.
    pub fn remaining(&self) -> u64 {
        self.with_window(|w| self.rate.saturating_sub(w.used))
    }

    /// Bytes recorded in the current second.
    pub fn used_this_second(&self) -> u64 {
        self.with_window(|w| w.used)
    }

    /// Fair share of the remaining budget for one of `active` connections.
    ///
    /// Zero only once the second's budget is spent; otherwise at least one
    /// byte so every connection keeps moving under contention.
    pub fn quota(&self, active: usize) -> u64 {
        let remaining = self.remaining();
        if remaining == 0 {
            return 0;
        }
        (remaining / active.max(1) as u64).max(1)
    }

    /// Adds bytes actually moved to the current second.
    pub fn record(&self, bytes: u64) {
        self.with_window(|w| w.used = w.used.saturating_add(bytes));
    }

    /// Waits for a positive quota and returns how many of `want` bytes may
    /// move now.
    pub async fn acquire(&self, want: usize, admission: &Admission) -> usize {
        loop {
            let quota = self.quota(admission.active());
            if quota > 0 {
                return want.min(usize::try_from(quota).unwrap_or(usize::MAX));
            }
            trace!(rate = self.rate, "budget exhausted, waiting");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn with_window<R>(&self, f: impl FnOnce(&mut Window) -> R) -> R {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now_secs();
        if now != window.start {
            window.start = now;
            window.used = 0;
        }
        f(&mut window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = RateLimiter::with_clock(rate, clock.clone());
        (limiter, clock)
    }

    #[test]
    fn quota_split_across_connections() {
        let (limiter, _) = limiter(1000);
        assert_eq!(limiter.quota(1), 1000);
        assert_eq!(limiter.quota(4), 250);
        // Zero active connections is treated as one.
        assert_eq!(limiter.quota(0), 1000);
    }

    #[test]
    fn quota_floor_is_one_byte() {
        let (limiter, _) = limiter(10);
        limiter.record(8);
        assert_eq!(limiter.remaining(), 2);
        assert_eq!(limiter.quota(5), 1);
    }

    #[test]
    fn exhausted_budget_gives_zero() {
        let (limiter, _) = limiter(100);
        limiter.record(100);
        assert_eq!(limiter.quota(1), 0);
        limiter.record(50);
        assert_eq!(limiter.remaining(), 0);
        assert_eq!(limiter.used_this_second(), 150);
    }

    #[test]
    fn budget_resets_on_second_boundary() {
        let (limiter, clock) = limiter(100);
        limiter.record(100);
        assert_eq!(limiter.quota(1), 0);

        clock.advance(1);
        assert_eq!(limiter.used_this_second(), 0);
        assert_eq!(limiter.quota(2), 50);
    }

    #[test]
    fn budget_does_not_reset_mid_second() {
        let (limiter, _) = limiter(100);
        for _ in 0..10 {
            limiter.record(10);
        }
        assert_eq!(limiter.used_this_second(), 100);
    }

    #[test]
    fn aggregate_within_window_is_bounded() {
        let rate = 1000;
        let connections = 4;
        let (limiter, _) = limiter(rate);

        // Each connection asks for a full buffer; grants are recorded as
        // fully used until the budget runs dry.
        let mut total = 0;
        'window: loop {
            for _ in 0..connections {
                let quota = limiter.quota(connections);
                if quota == 0 {
                    break 'window;
                }
                let moved = quota.min(parcel_transfer::BUFFER_SIZE as u64);
                limiter.record(moved);
                total += moved;
            }
        }

        assert!(total >= rate);
        assert!(total <= rate + connections as u64 * parcel_transfer::BUFFER_SIZE as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_caps_to_quota() {
        let (limiter, _) = limiter(300);
        let admission = Admission::new(4);
        let _a = admission.try_admit().unwrap();
        let _b = admission.try_admit().unwrap();
        let _c = admission.try_admit().unwrap();

        assert_eq!(limiter.acquire(4096, &admission).await, 100);
        assert_eq!(limiter.acquire(10, &admission).await, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_next_second() {
        let clock = Arc::new(ManualClock::new(50));
        let limiter = Arc::new(RateLimiter::with_clock(64, clock.clone()));
        let admission = Admission::new(1);
        let _permit = admission.try_admit().unwrap();
        limiter.record(64);

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let admission = admission.clone();
            tokio::spawn(async move { limiter.acquire(4096, &admission).await })
        };

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!waiter.is_finished(), "must block while the budget is spent");

        clock.advance(1);
        assert_eq!(waiter.await.unwrap(), 64);
    }
}
