use serde::Serialize;
use tracing::{error, warn};

use ppm_config::ValidationConfig;
use ppm_execution::{with_broker_retry, BrokerGateway};
use ppm_signal::{Signal, SignalKind};

use crate::condition::AgeTier;
use crate::metrics::ValidatorMetrics;

/// Why Stage 2 concluded what it concluded.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecReason {
    Validated,
    /// Broker unreachable after the full attempt schedule; the signal's own
    /// price is used. Counted, never silent.
    Bypassed,
    PriceDivergence { pct: f64, threshold: f64 },
    UnfavorableExitDivergence { pct: f64, threshold: f64 },
    RiskIncrease { pct: f64, threshold: f64 },
}

/// Stage-2 verdict. No severity here: severity belongs to condition
/// verdicts alone, and keeping the field off this struct means a metric
/// recorder cannot reach for it by accident.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutionVerdict {
    pub is_valid: bool,
    pub reason: ExecReason,
    pub divergence_pct: Option<f64>,
    pub risk_increase_pct: Option<f64>,
    /// The price the sizer should work from: broker quote when available,
    /// signal price on bypass.
    pub source_price_used: f64,
}

impl ExecutionVerdict {
    pub fn bypassed(&self) -> bool {
        self.reason == ExecReason::Bypassed
    }
}

fn divergence_threshold(cfg: &ValidationConfig, kind: SignalKind, tier: AgeTier) -> f64 {
    let base = match kind {
        SignalKind::BaseEntry => cfg.base_entry_divergence_pct,
        SignalKind::Pyramid => cfg.pyramid_divergence_pct,
        _ => cfg.exit_divergence_pct,
    };
    // Delayed signals run on half thresholds: the older the picture, the less
    // divergence we are willing to absorb.
    if tier == AgeTier::Delayed {
        base / 2.0
    } else {
        base
    }
}

/// Stage 2: broker-quote cross-check.
///
/// Entry signals reject on absolute divergence beyond the (possibly halved)
/// threshold, and on risk amplification beyond `max_risk_increase_pct`.
/// Exits reject only unfavorable divergence; a better exit price is never a
/// reason to refuse an exit.
pub async fn validate_execution(
    cfg: &ValidationConfig,
    signal: &Signal,
    tier: AgeTier,
    broker: &dyn BrokerGateway,
    metrics: &ValidatorMetrics,
) -> ExecutionVerdict {
    let quote = with_broker_retry("quote", || broker.quote(signal.instrument)).await;

    let broker_price = match quote {
        Ok(q) => q.last_price,
        Err(e) => {
            metrics.record_quote_failure();
            metrics.record_bypass();
            warn!(
                instrument = %signal.instrument,
                error = %e,
                "broker quote unavailable; bypassing execution validation"
            );
            return ExecutionVerdict {
                is_valid: true,
                reason: ExecReason::Bypassed,
                divergence_pct: None,
                risk_increase_pct: None,
                source_price_used: signal.price,
            };
        }
    };

    let divergence = (broker_price - signal.price) / signal.price;
    let threshold = divergence_threshold(cfg, signal.kind, tier);

    if signal.kind == SignalKind::Exit {
        // Long exit: broker below signal means we would sell worse than the
        // strategy assumed.
        if divergence < -threshold {
            metrics.record_execution_reject();
            return ExecutionVerdict {
                is_valid: false,
                reason: ExecReason::UnfavorableExitDivergence {
                    pct: divergence,
                    threshold,
                },
                divergence_pct: Some(divergence),
                risk_increase_pct: None,
                source_price_used: broker_price,
            };
        }
        return ExecutionVerdict {
            is_valid: true,
            reason: ExecReason::Validated,
            divergence_pct: Some(divergence),
            risk_increase_pct: None,
            source_price_used: broker_price,
        };
    }

    if divergence.abs() > threshold {
        metrics.record_execution_reject();
        return ExecutionVerdict {
            is_valid: false,
            reason: ExecReason::PriceDivergence {
                pct: divergence,
                threshold,
            },
            divergence_pct: Some(divergence),
            risk_increase_pct: None,
            source_price_used: broker_price,
        };
    }

    // Risk amplification: how much wider the stop distance became between
    // signal and broker price.
    let signal_distance = signal.price - signal.stop;
    let risk_increase = if signal_distance > 0.0 {
        (broker_price - signal.stop) / signal_distance - 1.0
    } else {
        0.0
    };
    if risk_increase > cfg.max_risk_increase_pct {
        metrics.record_execution_reject();
        metrics.record_critical_risk();
        error!(
            instrument = %signal.instrument,
            risk_increase_pct = risk_increase,
            "🚨 extreme risk amplification between signal and broker price"
        );
        return ExecutionVerdict {
            is_valid: false,
            reason: ExecReason::RiskIncrease {
                pct: risk_increase,
                threshold: cfg.max_risk_increase_pct,
            },
            divergence_pct: Some(divergence),
            risk_increase_pct: Some(risk_increase),
            source_price_used: broker_price,
        };
    }

    ExecutionVerdict {
        is_valid: true,
        reason: ExecReason::Validated,
        divergence_pct: Some(divergence),
        risk_increase_pct: Some(risk_increase),
        source_price_used: broker_price,
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use ppm_execution::{OrderAck, OrderSide, OrderStatusReport, OrderType, Quote};
    use ppm_signal::{Instrument, Slot};

    use super::*;

    /// Quote-only broker double: a fixed price or a hard failure.
    struct QuoteBroker {
        price: Option<f64>,
    }

    #[async_trait]
    impl BrokerGateway for QuoteBroker {
        async fn place_order(
            &self,
            _: Instrument,
            _: OrderSide,
            _: OrderType,
            _: i64,
            _: Option<f64>,
        ) -> Result<OrderAck> {
            unreachable!("validator never places orders")
        }

        async fn order_status(&self, _: &str) -> Result<OrderStatusReport> {
            unreachable!("validator never polls orders")
        }

        async fn cancel_order(&self, _: &str) -> Result<()> {
            unreachable!("validator never cancels orders")
        }

        async fn quote(&self, instrument: Instrument) -> Result<Quote> {
            match self.price {
                Some(p) => Ok(Quote {
                    instrument,
                    last_price: p,
                    ts: Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 6).unwrap(),
                }),
                None => Err(anyhow!("quote endpoint timed out")),
            }
        }
    }

    fn signal(kind: SignalKind) -> Signal {
        Signal {
            kind,
            instrument: Instrument::BankNifty,
            slot: Slot::Named("Long_1".into()),
            price: 52_000.0,
            stop: 51_650.0,
            suggested_lots: 3,
            atr: 350.0,
            er: 0.82,
            supertrend: 51_500.0,
            roc: None,
            exit_reason: (kind == SignalKind::Exit).then(|| "trail hit".to_string()),
            timestamp: Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 5).unwrap(),
        }
    }

    fn cfg() -> ValidationConfig {
        ValidationConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn close_quote_validates_and_uses_broker_price() {
        let broker = QuoteBroker {
            price: Some(52_100.0),
        };
        let m = ValidatorMetrics::new();
        let v = validate_execution(&cfg(), &signal(SignalKind::BaseEntry), AgeTier::Fresh, &broker, &m)
            .await;
        assert!(v.is_valid);
        assert_eq!(v.reason, ExecReason::Validated);
        assert_eq!(v.source_price_used, 52_100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn base_entry_divergence_beyond_2pct_rejects() {
        let broker = QuoteBroker {
            price: Some(53_100.0), // +2.1%
        };
        let m = ValidatorMetrics::new();
        let v = validate_execution(&cfg(), &signal(SignalKind::BaseEntry), AgeTier::Fresh, &broker, &m)
            .await;
        assert!(!v.is_valid);
        assert!(matches!(v.reason, ExecReason::PriceDivergence { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_tier_halves_the_threshold() {
        // +1.5%: inside 2% but outside the halved 1%.
        let broker = QuoteBroker {
            price: Some(52_780.0),
        };
        let m = ValidatorMetrics::new();
        let v = validate_execution(
            &cfg(),
            &signal(SignalKind::BaseEntry),
            AgeTier::Delayed,
            &broker,
            &m,
        )
        .await;
        assert!(!v.is_valid);
    }

    #[tokio::test(start_paused = true)]
    async fn pyramid_threshold_is_tighter() {
        // +1.2%: fine for a base entry, too far for a pyramid.
        let broker = QuoteBroker {
            price: Some(52_624.0),
        };
        let m = ValidatorMetrics::new();
        let v = validate_execution(&cfg(), &signal(SignalKind::Pyramid), AgeTier::Fresh, &broker, &m)
            .await;
        assert!(!v.is_valid);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_favorable_divergence_always_passes() {
        // Broker 3% above the signal: favorable for a long exit.
        let broker = QuoteBroker {
            price: Some(53_560.0),
        };
        let m = ValidatorMetrics::new();
        let v = validate_execution(&cfg(), &signal(SignalKind::Exit), AgeTier::Fresh, &broker, &m)
            .await;
        assert!(v.is_valid);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_unfavorable_divergence_rejects() {
        // Broker 1.5% below: selling materially worse than assumed.
        let broker = QuoteBroker {
            price: Some(51_220.0),
        };
        let m = ValidatorMetrics::new();
        let v = validate_execution(&cfg(), &signal(SignalKind::Exit), AgeTier::Fresh, &broker, &m)
            .await;
        assert!(!v.is_valid);
        assert!(matches!(
            v.reason,
            ExecReason::UnfavorableExitDivergence { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn risk_amplification_rejects_with_critical_count() {
        // Stop distance 350 -> 550 is +57%; divergence only +0.38%.
        let broker = QuoteBroker {
            price: Some(52_200.0),
        };
        let m = ValidatorMetrics::new();
        let v = validate_execution(&cfg(), &signal(SignalKind::BaseEntry), AgeTier::Fresh, &broker, &m)
            .await;
        assert!(!v.is_valid);
        assert!(matches!(v.reason, ExecReason::RiskIncrease { .. }));
        assert_eq!(m.snapshot().critical_risk_alerts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quote_failure_bypasses_and_counts() {
        let broker = QuoteBroker { price: None };
        let m = ValidatorMetrics::new();
        let v = validate_execution(&cfg(), &signal(SignalKind::BaseEntry), AgeTier::Fresh, &broker, &m)
            .await;
        assert!(v.is_valid);
        assert!(v.bypassed());
        assert_eq!(v.source_price_used, 52_000.0);
        let snap = m.snapshot();
        assert_eq!(snap.broker_quote_failure, 1);
        assert_eq!(snap.validation_bypassed, 1);
    }
}
