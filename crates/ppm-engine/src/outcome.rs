use serde::Serialize;

use ppm_signal::{Instrument, SignalKind};

/// Leader-admission port. Live mode wires the HA coordinator in; backtests
/// and single-instance deployments run without one (always leader).
pub trait LeaderGate: Send + Sync {
    fn is_leader(&self) -> bool;
}

impl LeaderGate for ppm_ha::HaCoordinator {
    fn is_leader(&self) -> bool {
        ppm_ha::HaCoordinator::is_leader(self)
    }
}

/// Why a signal was refused. `code()` is the stable snake_case string used
/// in webhook responses and signal_log summaries.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    NotLeader,
    LostLeadership,
    ConditionFailed { detail: String },
    ExecutionValidation { detail: String },
    BaseAlreadyOpen,
    NoBasePosition,
    NoOpenPosition,
    Gate { gate: String, detail: String },
    BelowSizeFloor,
    InvalidSizing { detail: String },
    ExecutionFailed { detail: String },
}

impl RejectReason {
    pub fn code(&self) -> &str {
        match self {
            RejectReason::NotLeader => "not_leader",
            RejectReason::LostLeadership => "lost_leadership",
            RejectReason::ConditionFailed { .. } => "condition_failed",
            RejectReason::ExecutionValidation { .. } => "execution_validation",
            RejectReason::BaseAlreadyOpen => "base_already_open",
            RejectReason::NoBasePosition => "no_base_position",
            RejectReason::NoOpenPosition => "no_open_position",
            RejectReason::Gate { gate, .. } => gate,
            RejectReason::BelowSizeFloor => "below_size_floor",
            RejectReason::InvalidSizing { .. } => "invalid_sizing",
            RejectReason::ExecutionFailed { .. } => "execution_failed",
        }
    }
}

/// Fill summary carried back to the webhook response.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessedSummary {
    pub kind: SignalKind,
    pub instrument: Instrument,
    pub lots: i64,
    pub fill_price: Option<f64>,
    /// Price the sizer worked from: broker quote, or the signal's own price
    /// when Stage-2 validation was bypassed.
    pub source_price_used: f64,
    pub validation_bypassed: bool,
    pub realized_pnl: Option<f64>,
}

/// Terminal outcome of one signal.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Processed { result: ProcessedSummary },
    Rejected { reason: RejectReason },
    Duplicate,
    /// Accepted and logged with no execution side effects (EOD monitor).
    Ignored,
}
