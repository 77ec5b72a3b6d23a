use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ppm_config::PartialFillStrategy;
use ppm_signal::Instrument;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => f.write_str("BUY"),
            OrderSide::Sell => f.write_str("SELL"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// What the engine asks the executor to do. Lots are always positive; the
/// side carries direction.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderIntent {
    pub instrument: Instrument,
    pub side: OrderSide,
    pub lots: i64,
    pub limit_price: f64,
}

impl OrderIntent {
    pub fn new(instrument: Instrument, side: OrderSide, lots: i64, limit_price: f64) -> Self {
        debug_assert!(lots > 0, "OrderIntent.lots must be > 0");
        Self {
            instrument,
            side,
            lots,
            limit_price,
        }
    }
}

/// Broker acknowledgement of a submitted order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// Broker-side order states the executor polls for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireOrderStatus {
    Pending,
    Partial,
    Complete,
    Cancelled,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub order_id: String,
    pub status: WireOrderStatus,
    pub filled_lots: i64,
    pub average_fill_price: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: Instrument,
    pub last_price: f64,
    pub ts: DateTime<Utc>,
}

/// Terminal outcome of one executor invocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Executed,
    Partial,
    Rejected,
    Timeout,
}

/// What the engine gets back. `lots_filled + lots_cancelled` always equals
/// the requested lot count for PARTIAL/TIMEOUT results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub lots_filled: i64,
    pub lots_cancelled: i64,
    pub average_fill_price: Option<f64>,
    pub notes: String,
    pub partial_fill_strategy_applied: Option<PartialFillStrategy>,
}

impl ExecutionResult {
    pub fn rejected(notes: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Rejected,
            lots_filled: 0,
            lots_cancelled: 0,
            average_fill_price: None,
            notes: notes.into(),
            partial_fill_strategy_applied: None,
        }
    }

    pub fn is_fill(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Executed | ExecutionStatus::Partial
        ) && self.lots_filled > 0
    }
}

/// Weighted-average price across two fills (Reattempt combining).
pub(crate) fn combine_fills(
    lots_a: i64,
    price_a: f64,
    lots_b: i64,
    price_b: f64,
) -> Option<f64> {
    let total = lots_a + lots_b;
    if total <= 0 {
        return None;
    }
    Some((lots_a as f64 * price_a + lots_b as f64 * price_b) / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_average_combines_fills() {
        // 2 lots @ 100, 1 lot @ 103 => 101.
        assert_eq!(combine_fills(2, 100.0, 1, 103.0), Some(101.0));
        assert_eq!(combine_fills(0, 0.0, 0, 0.0), None);
    }
}
