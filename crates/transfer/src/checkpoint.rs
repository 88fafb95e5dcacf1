use crate::CHECKPOINT_INTERVAL;

/// Fires whenever the cumulative position crosses the next checkpoint
/// boundary.
///
/// Boundaries are absolute multiples of the interval, so a transfer resumed
/// from an arbitrary offset checkpoints at the same positions an
/// uninterrupted one would. A single large advance fires once and skips
/// every boundary it jumped over.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    interval: u64,
    next: u64,
}

impl Checkpointer {
    /// Starts tracking from `position` with the default interval.
    pub fn new(position: u64) -> Self {
        Self::with_interval(position, CHECKPOINT_INTERVAL)
    }

    pub fn with_interval(position: u64, interval: u64) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            next: Self::boundary_after(position, interval),
        }
    }

    /// Returns `true` if `position` reached the pending boundary.
    pub fn crossed(&mut self, position: u64) -> bool {
        if position < self.next {
            return false;
        }
        self.next = Self::boundary_after(position, self.interval);
        true
    }

    /// The next position at which a checkpoint fires.
    pub fn next_boundary(&self) -> u64 {
        self.next
    }

    fn boundary_after(position: u64, interval: u64) -> u64 {
        (position / interval + 1) * interval
    }
}
