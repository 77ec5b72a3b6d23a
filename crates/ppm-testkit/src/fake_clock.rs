use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use ppm_signal::Clock;

/// Manually-advanced clock. Wall and monotonic time move together and only
/// when a test says so.
pub struct FakeClock {
    inner: Mutex<(DateTime<Utc>, Duration)>,
}

impl FakeClock {
    /// Starts at a fixed, recognizable instant.
    pub fn new() -> Self {
        Self::at(Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 5).unwrap())
    }

    pub fn at(wall: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new((wall, Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().expect("fake clock lock poisoned");
        inner.0 += chrono::Duration::from_std(by).expect("advance fits chrono range");
        inner.1 += by;
    }

    pub fn set_wall(&self, wall: DateTime<Utc>) {
        self.inner.lock().expect("fake clock lock poisoned").0 = wall;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn wall(&self) -> DateTime<Utc> {
        self.inner.lock().expect("fake clock lock poisoned").0
    }

    fn mono(&self) -> Duration {
        self.inner.lock().expect("fake clock lock poisoned").1
    }
}
