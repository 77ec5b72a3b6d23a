use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Clock port: wall time for timestamps, monotonic time for intervals.
///
/// Production uses [`SystemClock`]; tests use the manually-advanced fake in
/// ppm-testkit so age checks and timeouts are deterministic.
pub trait Clock: Send + Sync {
    /// Current wall-clock time (UTC).
    fn wall(&self) -> DateTime<Utc>;

    /// Monotonic duration since this clock was created. Never goes backwards.
    fn mono(&self) -> Duration;
}

/// OS-backed clock.
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn mono(&self) -> Duration {
        self.started.elapsed()
    }
}
