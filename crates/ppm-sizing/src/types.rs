use std::fmt;

use serde::{Deserialize, Serialize};

/// Sizing rejects bad inputs instead of guessing. Every variant names the
/// offending quantity; these are programmer/config errors, not market
/// conditions, so the engine aborts the signal rather than retrying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SizingError {
    /// A denominator that must be strictly positive was not.
    InvalidConfig(&'static str),
    /// Long entry at or below its protective stop.
    InvertedStop,
}

impl fmt::Display for SizingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizingError::InvalidConfig(what) => write!(f, "invalid sizing input: {what}"),
            SizingError::InvertedStop => write!(f, "entry must be above stop for a long"),
        }
    }
}

impl std::error::Error for SizingError {}

/// Inputs to base-entry sizing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BaseEntryInput {
    pub equity: f64,
    pub risk_pct: f64,
    pub vol_pct: f64,
    pub entry: f64,
    pub stop: f64,
    pub point_value: f64,
    /// Efficiency ratio in [0, 1]; scales the risk-based candidate.
    pub er: f64,
    pub atr: f64,
    pub available_margin: f64,
    pub margin_per_lot: f64,
}

/// Base-entry sizing breakdown. `lot_v` is computed for observability but
/// deliberately excluded from the final min; the upstream strategy contract
/// sizes on risk and margin only. The breakdown keeps all three candidates
/// visible so the exclusion is auditable in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseEntrySizing {
    pub lot_r: i64,
    pub lot_v: i64,
    pub lot_m: i64,
    pub lots: i64,
}

/// Inputs to pyramid sizing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PyramidInput {
    pub free_margin: f64,
    pub margin_per_lot: f64,
    /// 1 for the first pyramid above the base, 2 for the next, ...
    pub pyramid_index: u32,
    pub base_lots: i64,
    /// Realized + unrealized profit accumulated on the instrument.
    pub accumulated_profit: f64,
    /// The base trade's initial risk amount, (entry − stop) × lots × point_value.
    pub base_risk: f64,
    pub entry: f64,
    pub new_stop: f64,
    pub point_value: f64,
}

/// Pyramid sizing breakdown: margin, de-escalation, profit constraints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidSizing {
    pub lot_a: i64,
    pub lot_b: i64,
    pub lot_c: i64,
    pub lots: i64,
}

/// Inputs to peel-off sizing (cap-breach reduction).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeelOffInput {
    pub position_lots: i64,
    pub entry: f64,
    pub current_stop: f64,
    pub atr: f64,
    pub point_value: f64,
    /// Amount by which the portfolio risk rollup exceeds its cap (≥ 0).
    pub risk_over: f64,
    /// Amount by which the portfolio volatility rollup exceeds its cap (≥ 0).
    pub vol_over: f64,
}
