use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Rolling window for DB-sync latency averaging.
const LATENCY_WINDOW: usize = 100;

#[derive(Default)]
struct Inner {
    db_sync_success: u64,
    db_sync_failure: u64,
    latencies_ms: VecDeque<f64>,
    leadership_changes: u64,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Coordinator metrics behind a dedicated mutex; the heartbeat loop writes,
/// the coordinator endpoint snapshots.
#[derive(Default)]
pub struct HaMetrics {
    inner: Mutex<Inner>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HaMetricsSnapshot {
    pub db_sync_success: u64,
    pub db_sync_failure: u64,
    pub db_sync_failure_rate: f64,
    /// Mean over the most recent 100 syncs.
    pub db_sync_avg_latency_ms: f64,
    pub leadership_changes: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl HaMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_db_sync(&self, latency: Duration, ok: bool, at: DateTime<Utc>) {
        let mut m = self.inner.lock().expect("ha metrics lock poisoned");
        if ok {
            m.db_sync_success += 1;
        } else {
            m.db_sync_failure += 1;
        }
        m.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
        while m.latencies_ms.len() > LATENCY_WINDOW {
            m.latencies_ms.pop_front();
        }
        m.last_heartbeat = Some(at);
    }

    pub fn record_leadership_change(&self) {
        self.inner
            .lock()
            .expect("ha metrics lock poisoned")
            .leadership_changes += 1;
    }

    pub fn snapshot(&self) -> HaMetricsSnapshot {
        let m = self.inner.lock().expect("ha metrics lock poisoned");
        let total = m.db_sync_success + m.db_sync_failure;
        HaMetricsSnapshot {
            db_sync_success: m.db_sync_success,
            db_sync_failure: m.db_sync_failure,
            db_sync_failure_rate: if total == 0 {
                0.0
            } else {
                m.db_sync_failure as f64 / total as f64
            },
            db_sync_avg_latency_ms: if m.latencies_ms.is_empty() {
                0.0
            } else {
                m.latencies_ms.iter().sum::<f64>() / m.latencies_ms.len() as f64
            },
            leadership_changes: m.leadership_changes,
            last_heartbeat: m.last_heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_rate_and_average() {
        let m = HaMetrics::new();
        let at = Utc::now();
        m.record_db_sync(Duration::from_millis(10), true, at);
        m.record_db_sync(Duration::from_millis(30), false, at);
        let snap = m.snapshot();
        assert_eq!(snap.db_sync_success, 1);
        assert_eq!(snap.db_sync_failure, 1);
        assert_eq!(snap.db_sync_failure_rate, 0.5);
        assert_eq!(snap.db_sync_avg_latency_ms, 20.0);
    }

    #[test]
    fn latency_window_is_bounded_to_100() {
        let m = HaMetrics::new();
        let at = Utc::now();
        // 150 syncs at 0ms, then 100 at 10ms: the window holds only the last 100.
        for _ in 0..150 {
            m.record_db_sync(Duration::ZERO, true, at);
        }
        for _ in 0..100 {
            m.record_db_sync(Duration::from_millis(10), true, at);
        }
        assert_eq!(m.snapshot().db_sync_avg_latency_ms, 10.0);
    }
}
