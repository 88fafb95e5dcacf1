use std::future::Future;

use parcel_transfer::Throttle;

use crate::admission::Admission;
use crate::paths::InFlightPaths;
use crate::rate::RateLimiter;

/// State shared by every connection of one server.
///
/// Each field carries its own synchronization; nothing else is shared
/// between connection tasks.
pub struct SharedServerState {
    pub limiter: RateLimiter,
    pub admission: Admission,
    pub in_flight: InFlightPaths,
}

impl SharedServerState {
    pub fn new(limiter: RateLimiter, max_clients: usize) -> Self {
        Self {
            limiter,
            admission: Admission::new(max_clients),
            in_flight: InFlightPaths::new(),
        }
    }
}

/// Payload bytes of every connection draw from the shared budget, split by
/// the number of connections active at the time of each call.
impl Throttle for SharedServerState {
    fn acquire(&self, want: usize) -> impl Future<Output = usize> + Send {
        self.limiter.acquire(want, &self.admission)
    }

    fn consume(&self, used: usize) {
        self.limiter.record(used as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::ManualClock;
    use std::sync::Arc;

    #[tokio::test]
    async fn throttle_uses_active_count() {
        let clock = Arc::new(ManualClock::new(7));
        let state = SharedServerState::new(RateLimiter::with_clock(1000, clock), 8);
        let _p1 = state.admission.try_admit().unwrap();
        let _p2 = state.admission.try_admit().unwrap();

        assert_eq!(state.acquire(4096).await, 500);
        state.consume(500);
        assert_eq!(state.limiter.used_this_second(), 500);
        assert_eq!(state.acquire(4096).await, 250);
    }
}
