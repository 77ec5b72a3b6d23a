use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Validator counters. One instance is constructed at startup and shared by
/// handle; there is no ambient global.
#[derive(Default)]
pub struct ValidatorMetrics {
    broker_quote_failure: AtomicU64,
    validation_bypassed: AtomicU64,
    condition_rejected: AtomicU64,
    execution_rejected: AtomicU64,
    critical_risk_alerts: AtomicU64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidatorMetricsSnapshot {
    pub broker_quote_failure: u64,
    pub validation_bypassed: u64,
    pub condition_rejected: u64,
    pub execution_rejected: u64,
    pub critical_risk_alerts: u64,
}

impl ValidatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_quote_failure(&self) {
        self.broker_quote_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.validation_bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_condition_reject(&self) {
        self.condition_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution_reject(&self) {
        self.execution_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_critical_risk(&self) {
        self.critical_risk_alerts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ValidatorMetricsSnapshot {
        ValidatorMetricsSnapshot {
            broker_quote_failure: self.broker_quote_failure.load(Ordering::Relaxed),
            validation_bypassed: self.validation_bypassed.load(Ordering::Relaxed),
            condition_rejected: self.condition_rejected.load(Ordering::Relaxed),
            execution_rejected: self.execution_rejected.load(Ordering::Relaxed),
            critical_risk_alerts: self.critical_risk_alerts.load(Ordering::Relaxed),
        }
    }
}
