//! In-memory portfolio book: open positions, per-instrument pyramid
//! metadata, and the aggregate rollups the risk gates read.
//!
//! Ownership is arena-style: [`PortfolioState`] exclusively owns every
//! [`Position`] keyed by id; everything else refers to positions by
//! [`PositionId`], never by pointer. Persistence gets read access through
//! narrow accessors and writes back what the engine tells it to.

mod money;
mod state;
mod types;

pub use money::{approx_eq_money, round_paise, MONEY_EPSILON};
pub use state::{InvariantViolation, PortfolioState};
pub use types::{Position, PositionId, PositionStatus, PortfolioAggregate, PyramidState};
