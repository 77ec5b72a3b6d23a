use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use ppm_signal::{Signal, SignalKind};

use crate::metrics::ValidatorMetrics;

/// Forward clock skew tolerated on signal timestamps.
const MAX_FUTURE_SKEW_S: i64 = 5;

/// Signal age tiers. `Delayed` passes but halves Stage-2 divergence
/// thresholds; `Stale` rejects outright.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeTier {
    Fresh,
    SlightlyDelayed,
    Delayed,
    Stale,
}

impl AgeTier {
    fn from_age(age: Duration) -> AgeTier {
        let secs = age.num_seconds();
        if secs < 10 {
            AgeTier::Fresh
        } else if secs < 30 {
            AgeTier::SlightlyDelayed
        } else if secs < 60 {
            AgeTier::Delayed
        } else {
            AgeTier::Stale
        }
    }
}

/// Alert severity for condition failures. This concept exists ONLY on
/// condition verdicts; execution verdicts have no severity by design.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Stage-1 verdict.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConditionVerdict {
    pub is_valid: bool,
    pub severity: Severity,
    pub age_tier: AgeTier,
    pub reason: Option<String>,
}

impl ConditionVerdict {
    fn pass(severity: Severity, age_tier: AgeTier) -> Self {
        Self {
            is_valid: true,
            severity,
            age_tier,
            reason: None,
        }
    }

    fn reject(age_tier: AgeTier, reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            severity: Severity::Critical,
            age_tier,
            reason: Some(reason.into()),
        }
    }
}

/// Stage 1: synchronous, local, never touches the broker.
///
/// Order: age tiering, required-field positivity, logical consistency for
/// long entries (stop below price, price above supertrend).
pub fn validate_condition(
    signal: &Signal,
    now: DateTime<Utc>,
    metrics: &ValidatorMetrics,
) -> ConditionVerdict {
    let age = now - signal.timestamp;

    if age < -Duration::seconds(MAX_FUTURE_SKEW_S) {
        metrics.record_condition_reject();
        return ConditionVerdict::reject(AgeTier::Fresh, "timestamp is in the future");
    }

    let tier = AgeTier::from_age(age);
    if tier == AgeTier::Stale {
        metrics.record_condition_reject();
        return ConditionVerdict::reject(
            tier,
            format!("signal is stale: {}s old", age.num_seconds()),
        );
    }

    for (name, value) in [
        ("price", signal.price),
        ("stop", signal.stop),
        ("atr", signal.atr),
        ("supertrend", signal.supertrend),
    ] {
        if !value.is_finite() || value <= 0.0 {
            metrics.record_condition_reject();
            return ConditionVerdict::reject(tier, format!("{name} must be positive"));
        }
    }
    if !(0.0..=1.0).contains(&signal.er) {
        metrics.record_condition_reject();
        return ConditionVerdict::reject(tier, "er must be in [0, 1]");
    }

    if matches!(signal.kind, SignalKind::BaseEntry | SignalKind::Pyramid) {
        if signal.stop >= signal.price {
            metrics.record_condition_reject();
            return ConditionVerdict::reject(tier, "stop must sit below the entry price");
        }
        if signal.price <= signal.supertrend {
            metrics.record_condition_reject();
            return ConditionVerdict::reject(tier, "entry below supertrend");
        }
    }

    let severity = match tier {
        AgeTier::Fresh => Severity::Info,
        AgeTier::SlightlyDelayed | AgeTier::Delayed => Severity::Warning,
        AgeTier::Stale => unreachable!("stale rejected above"),
    };
    ConditionVerdict::pass(severity, tier)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use ppm_signal::{Instrument, Slot};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 30).unwrap()
    }

    fn signal_aged(secs: i64) -> Signal {
        Signal {
            kind: SignalKind::BaseEntry,
            instrument: Instrument::BankNifty,
            slot: Slot::Named("Long_1".into()),
            price: 52_000.0,
            stop: 51_650.0,
            suggested_lots: 3,
            atr: 350.0,
            er: 0.82,
            supertrend: 51_500.0,
            roc: None,
            exit_reason: None,
            timestamp: now() - Duration::seconds(secs),
        }
    }

    #[test]
    fn fresh_signal_passes_info() {
        let v = validate_condition(&signal_aged(3), now(), &ValidatorMetrics::new());
        assert!(v.is_valid);
        assert_eq!(v.age_tier, AgeTier::Fresh);
        assert_eq!(v.severity, Severity::Info);
    }

    #[test]
    fn age_tiers_cut_at_10_30_60() {
        let m = ValidatorMetrics::new();
        assert_eq!(
            validate_condition(&signal_aged(12), now(), &m).age_tier,
            AgeTier::SlightlyDelayed
        );
        assert_eq!(
            validate_condition(&signal_aged(45), now(), &m).age_tier,
            AgeTier::Delayed
        );
        let stale = validate_condition(&signal_aged(60), now(), &m);
        assert!(!stale.is_valid);
        assert_eq!(stale.age_tier, AgeTier::Stale);
    }

    #[test]
    fn delayed_passes_with_warning() {
        let v = validate_condition(&signal_aged(45), now(), &ValidatorMetrics::new());
        assert!(v.is_valid);
        assert_eq!(v.severity, Severity::Warning);
    }

    #[test]
    fn future_timestamp_beyond_skew_rejected() {
        let m = ValidatorMetrics::new();
        let v = validate_condition(&signal_aged(-30), now(), &m);
        assert!(!v.is_valid);
        // Small skew is tolerated.
        assert!(validate_condition(&signal_aged(-3), now(), &m).is_valid);
    }

    #[test]
    fn non_positive_fields_rejected() {
        let mut s = signal_aged(3);
        s.atr = 0.0;
        let v = validate_condition(&s, now(), &ValidatorMetrics::new());
        assert!(!v.is_valid);
        assert!(v.reason.unwrap().contains("atr"));
    }

    #[test]
    fn stop_above_price_rejected_for_entries() {
        let mut s = signal_aged(3);
        s.stop = 52_100.0;
        assert!(!validate_condition(&s, now(), &ValidatorMetrics::new()).is_valid);
    }

    #[test]
    fn entry_below_supertrend_rejected() {
        let mut s = signal_aged(3);
        s.supertrend = 52_500.0;
        assert!(!validate_condition(&s, now(), &ValidatorMetrics::new()).is_valid);
    }

    #[test]
    fn exit_skips_long_entry_consistency() {
        let mut s = signal_aged(3);
        s.kind = SignalKind::Exit;
        s.exit_reason = Some("trail hit".into());
        s.stop = 52_100.0; // would fail the entry check
        assert!(validate_condition(&s, now(), &ValidatorMetrics::new()).is_valid);
    }

    #[test]
    fn rejects_bump_the_counter() {
        let m = ValidatorMetrics::new();
        let _ = validate_condition(&signal_aged(90), now(), &m);
        assert_eq!(m.snapshot().condition_rejected, 1);
    }
}
