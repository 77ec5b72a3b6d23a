//! Position sizing, pyramid admission, and stop management.
//!
//! Everything in this crate is pure and deterministic: plain functions over
//! plain inputs, no IO, no clocks, no logging. The engine owns the side
//! effects; this crate owns the arithmetic and the admission rules.

mod gate;
mod sizer;
mod stops;
mod types;

pub use gate::{evaluate_pyramid_gate, GateDecision, GateReason, PyramidGateContext};
pub use sizer::{base_entry_lots, peel_off_lots, pyramid_lots};
pub use stops::ratchet_trailing_stop;
pub use types::{
    BaseEntryInput, BaseEntrySizing, PeelOffInput, PyramidInput, PyramidSizing, SizingError,
};
