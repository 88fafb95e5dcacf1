use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Default interval between progress log lines.
const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.unwrap_or(100).max(2),
            window_size: window_size.unwrap_or(Duration::from_secs(5)),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        if let Some(cutoff) = now.checked_sub(self.window_size) {
            while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
                self.samples.pop_front();
            }
        }

        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }

        // The first sample marks the window start; its bytes precede it.
        let moved: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
        moved as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining_bytes`, or `None` while the speed
    /// is unknown.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

// ---------------------------------------------------------------------------
// ProgressLog
// ---------------------------------------------------------------------------

/// Rate-limited progress logging for one streaming loop.
pub struct ProgressLog {
    speed: SpeedCalculator,
    total: Option<u64>,
    last_position: u64,
    last_log: Instant,
    interval: Duration,
    verbose: bool,
}

impl ProgressLog {
    /// `start` is the resume offset; `total` the final size when known.
    pub fn new(start: u64, total: Option<u64>) -> Self {
        Self {
            speed: SpeedCalculator::new(None, None),
            total,
            last_position: start,
            last_log: Instant::now(),
            interval: DEFAULT_LOG_INTERVAL,
            verbose: false,
        }
    }

    /// Log at `info` instead of `debug`.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.speed.bytes_per_second()
    }

    /// Records the new absolute position and logs if the interval elapsed.
    pub fn update(&mut self, position: u64) {
        let delta = position.saturating_sub(self.last_position);
        self.last_position = position;
        self.speed.add_sample(delta);

        if self.last_log.elapsed() < self.interval {
            return;
        }
        self.last_log = Instant::now();

        let rate = self.speed.bytes_per_second() as u64;
        let eta_secs = self
            .total
            .and_then(|t| self.speed.eta(t.saturating_sub(position)))
            .map(|d| d.as_secs());

        if self.verbose {
            info!(position, total = ?self.total, rate, eta_secs = ?eta_secs, "transfer progress");
        } else {
            debug!(position, total = ?self.total, rate, eta_secs = ?eta_secs, "transfer progress");
        }
    }
}
