use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ppm_signal::{Instrument, Slot};

/// Stable position identity: instrument + slot + creation second.
/// String-backed so it survives DB round-trips and log lines unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(String);

impl PositionId {
    pub fn derive(instrument: Instrument, slot: &Slot, opened_at: DateTime<Utc>) -> Self {
        Self(format!(
            "{}:{}:{}",
            instrument.wire_name(),
            slot.wire_name(),
            opened_at.timestamp()
        ))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// One leg of an instrument campaign: the base entry or a pyramid add-on.
///
/// Invariants (enforced by [`crate::PortfolioState`], checked by
/// `check_invariants`): lots ≥ 0; current_stop ≥ initial_stop;
/// highest_close ≥ entry_price once set; at most one base leg per
/// instrument while the instrument has open positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub instrument: Instrument,
    pub slot: Slot,
    pub is_base_position: bool,
    pub entry_price: f64,
    pub initial_stop: f64,
    pub current_stop: f64,
    /// High-water close since entry; None until the first tick after entry.
    pub highest_close: Option<f64>,
    pub lots: i64,
    pub atr_at_entry: f64,
    /// Option-leg entry prices for synthetic-long instruments.
    pub pe_entry_price: Option<f64>,
    pub ce_entry_price: Option<f64>,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
    /// Optimistic-lock counter; bumped on every persisted mutation.
    pub version: i64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Risk carried by this leg: (entry − current_stop) × lots × point_value.
    /// Goes negative once the stop ratchets past the entry (locked profit).
    pub fn risk_amount(&self, point_value: f64) -> f64 {
        (self.entry_price - self.current_stop) * self.lots as f64 * point_value
    }

    /// Volatility exposure: ATR-at-entry × lots × point_value.
    pub fn vol_amount(&self, point_value: f64) -> f64 {
        self.atr_at_entry * self.lots as f64 * point_value
    }

    pub fn margin_used(&self, margin_per_lot: f64) -> f64 {
        self.lots as f64 * margin_per_lot
    }

    pub fn unrealized_pnl(&self, price: f64, point_value: f64) -> f64 {
        (price - self.entry_price) * self.lots as f64 * point_value
    }
}

/// Singleton portfolio summary row. The rollups are derivable from the open
/// positions; they are persisted anyway so recovery can cross-check a
/// freshly recomputed book against what the last writer believed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioAggregate {
    pub initial_capital: f64,
    /// Realized P&L accumulated from closed positions.
    pub closed_equity: f64,
    pub total_risk_amount: f64,
    pub total_vol_amount: f64,
    pub margin_used: f64,
    pub version: i64,
}

impl PortfolioAggregate {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            closed_equity: 0.0,
            total_risk_amount: 0.0,
            total_vol_amount: 0.0,
            margin_used: 0.0,
            version: 0,
        }
    }

    pub fn equity(&self) -> f64 {
        self.initial_capital + self.closed_equity
    }
}

/// Per-instrument pyramid metadata. Created at the first base entry, deleted
/// when the instrument goes flat. `base_position_id` is nulled (not the whole
/// row) when the base leg closes while pyramids are still open.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PyramidState {
    pub last_pyramid_price: f64,
    pub base_position_id: Option<PositionId>,
    pub pyramid_count: u32,
}
