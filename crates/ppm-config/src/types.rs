use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use ppm_signal::{Instrument, InstrumentSpec};

/// Order execution strategy selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategyKind {
    SimpleLimit,
    Progressive,
}

/// What to do with the unfilled remainder of a partially-filled order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFillStrategy {
    CancelRemainder,
    WaitForFill,
    Reattempt,
}

/// Sizing inputs and portfolio-level caps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskLimitsConfig {
    /// Fraction of equity risked per base entry (e.g. 0.01).
    pub risk_pct: f64,
    /// Fraction of equity allocated to volatility per base entry.
    pub vol_pct: f64,
    /// Portfolio-wide risk cap as a fraction of equity.
    pub risk_cap_pct: f64,
    /// Portfolio-wide volatility cap as a fraction of equity.
    pub vol_cap_pct: f64,
    /// Portfolio-wide margin usage cap as a fraction of equity.
    pub margin_cap_pct: f64,
    /// Pyramid spacing multiplier applied to ATR in the instrument gate.
    pub atr_spacing_mult: f64,
    /// Trailing-stop distance as a multiple of ATR below the highest close.
    pub trail_atr_mult: f64,
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        Self {
            risk_pct: 0.01,
            vol_pct: 0.02,
            risk_cap_pct: 0.12,
            vol_cap_pct: 0.04,
            margin_cap_pct: 0.60,
            atr_spacing_mult: 1.0,
            trail_atr_mult: 2.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    pub strategy: ExecutionStrategyKind,
    pub partial_fill: PartialFillStrategy,
    /// SimpleLimit: how long to poll before the partial-fill policy kicks in.
    pub fill_timeout_s: u64,
    /// Progressive: cancel/resubmit cadence.
    pub tightening_interval_s: u64,
    /// Progressive: price concession per attempt, as a fraction (0.001 = 0.1%).
    pub tightening_step_pct: f64,
    /// Progressive: attempts before the market-order fallback.
    pub max_attempts: u32,
    /// WaitForFill: extra polling budget after the primary timeout.
    pub partial_fill_wait_timeout_s: u64,
    /// Reattempt: price concession on the remainder order.
    pub reattempt_slippage_pct: f64,
    /// Hard clamp on `reattempt_slippage_pct`.
    pub max_reattempt_slippage_pct: f64,
    pub broker_base_url: String,
    pub broker_api_key: String,
    /// Per-call broker timeout (quotes, order submission).
    pub broker_call_timeout_s: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategyKind::SimpleLimit,
            partial_fill: PartialFillStrategy::CancelRemainder,
            fill_timeout_s: 30,
            tightening_interval_s: 5,
            tightening_step_pct: 0.001,
            max_attempts: 5,
            partial_fill_wait_timeout_s: 20,
            reattempt_slippage_pct: 0.001,
            max_reattempt_slippage_pct: 0.005,
            broker_base_url: "http://127.0.0.1:9555".to_string(),
            broker_api_key: String::new(),
            broker_call_timeout_s: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Divergence rejection threshold for base entries, fraction of price.
    pub base_entry_divergence_pct: f64,
    /// Divergence rejection threshold for pyramids.
    pub pyramid_divergence_pct: f64,
    /// Unfavorable-divergence threshold for exits.
    pub exit_divergence_pct: f64,
    /// Risk-amplification rejection threshold ((broker-stop)/(signal-stop) - 1).
    pub max_risk_increase_pct: f64,
    /// Upper bound on time the condition stage may hold the request path.
    pub max_validation_latency_ms: u64,
    pub quote_timeout_s: u64,
    pub quote_attempts: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            base_entry_divergence_pct: 0.02,
            pyramid_divergence_pct: 0.01,
            exit_divergence_pct: 0.01,
            max_risk_increase_pct: 0.50,
            max_validation_latency_ms: 500,
            quote_timeout_s: 2,
            quote_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HaConfig {
    pub redis_url: String,
    /// Leader lease TTL. Heartbeat runs at TTL/2.
    pub leader_ttl_s: u64,
    /// Run split-brain detection every N heartbeats.
    pub split_brain_every_n_beats: u32,
    /// DB-side leader heartbeat freshness bound for the cross-check.
    pub db_leader_fresh_s: i64,
    /// Where the persisted instance UUID lives.
    pub instance_id_path: String,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            leader_ttl_s: 10,
            split_brain_every_n_beats: 10,
            db_leader_fresh_s: 30,
            instance_id_path: ".ppm-instance-id".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub bind_addr: String,
    /// Fingerprint dedup window.
    pub dedup_window_s: i64,
    pub max_payload_bytes: usize,
    /// Per-IP webhook budget per rolling minute.
    pub rate_limit_per_min: u32,
    /// Cadence of the background trailing-stop refresh.
    pub trail_poll_s: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8899".to_string(),
            dedup_window_s: 300,
            max_payload_bytes: 10 * 1024,
            rate_limit_per_min: 100,
            trail_poll_s: 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/ppm".to_string(),
            max_connections: 10,
        }
    }
}

/// The complete, explicitly enumerated option set. Loaded once; components
/// receive the sub-struct they need.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub initial_capital: f64,
    #[serde(default)]
    pub risk: RiskLimitsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub ha: HaConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub db: DbConfig,
    /// Instrument table keyed by wire name; instruments absent here fall
    /// back to [`InstrumentSpec::default_for`].
    #[serde(default)]
    pub instruments: BTreeMap<String, InstrumentSpec>,
}

impl AppConfig {
    /// Resolve the spec for an instrument, config override first.
    pub fn instrument_spec(&self, instrument: Instrument) -> InstrumentSpec {
        self.instruments
            .get(instrument.wire_name())
            .cloned()
            .unwrap_or_else(|| InstrumentSpec::default_for(instrument))
    }

    /// Range checks that serde cannot express. Called once after load.
    pub fn validate(&self) -> Result<()> {
        if self.initial_capital <= 0.0 {
            bail!("initial_capital must be > 0");
        }
        for (name, v) in [
            ("risk.risk_pct", self.risk.risk_pct),
            ("risk.vol_pct", self.risk.vol_pct),
            ("risk.risk_cap_pct", self.risk.risk_cap_pct),
            ("risk.vol_cap_pct", self.risk.vol_cap_pct),
            ("risk.margin_cap_pct", self.risk.margin_cap_pct),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("{name} must be in [0, 1], got {v}");
            }
        }
        if self.risk.atr_spacing_mult <= 0.0 {
            bail!("risk.atr_spacing_mult must be > 0");
        }
        if self.risk.trail_atr_mult <= 0.0 {
            bail!("risk.trail_atr_mult must be > 0");
        }
        if self.execution.max_attempts == 0 {
            bail!("execution.max_attempts must be >= 1");
        }
        if self.execution.reattempt_slippage_pct > self.execution.max_reattempt_slippage_pct {
            bail!(
                "execution.reattempt_slippage_pct {} exceeds max_reattempt_slippage_pct {}",
                self.execution.reattempt_slippage_pct,
                self.execution.max_reattempt_slippage_pct
            );
        }
        if self.ha.leader_ttl_s < 2 {
            bail!("ha.leader_ttl_s must be >= 2 (heartbeat runs at TTL/2)");
        }
        if self.pipeline.max_payload_bytes == 0 || self.pipeline.rate_limit_per_min == 0 {
            bail!("pipeline limits must be non-zero");
        }
        for (name, spec) in &self.instruments {
            if Instrument::from_wire(name).is_none() {
                bail!("instruments: unknown instrument `{name}`");
            }
            if spec.lot_size <= 0 || spec.point_value <= 0.0 || spec.margin_per_lot <= 0.0 {
                bail!("instruments.{name}: lot_size, point_value, margin_per_lot must be > 0");
            }
        }
        Ok(())
    }
}
