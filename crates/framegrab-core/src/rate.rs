use std::time::{Duration, Instant};

/// Shortest elapsed time used as a divisor.
const MIN_ELAPSED_SECS: f64 = 1e-6;

/// Average delivered frame rate since the meter was started.
#[derive(Debug, Clone)]
pub struct RateMeter {
    started: Instant,
    count: u64,
}

impl RateMeter {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }

    /// Count one produced frame and return the new total.
    pub fn tick(&mut self) -> u64 {
        self.count += 1;
        self.count
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn fps(&self) -> f64 {
        Self::rate(self.count, self.elapsed())
    }

    /// `count / max(elapsed, 1µs)`
    pub fn rate(count: u64, elapsed: Duration) -> f64 {
        count as f64 / elapsed.as_secs_f64().max(MIN_ELAPSED_SECS)
    }
}
