//! Two-stage signal validation.
//!
//! Stage 1 (condition) is local and synchronous: age tiers, field sanity,
//! logical consistency. Stage 2 (execution) fetches a broker quote and
//! compares it against the signal; if the broker cannot be reached inside
//! the bounded attempt schedule the signal is BYPASSED rather than dropped:
//! availability over strictness, loudly counted.
//!
//! The two verdict types are deliberately distinct closed structs:
//! [`ConditionVerdict`] carries a severity, [`ExecutionVerdict`] does not.
//! Anything recording metrics from an execution verdict can only touch the
//! fields that exist on it.

mod condition;
mod execution;
mod metrics;

pub use condition::{validate_condition, AgeTier, ConditionVerdict, Severity};
pub use execution::{validate_execution, ExecutionVerdict, ExecReason};
pub use metrics::{ValidatorMetrics, ValidatorMetricsSnapshot};
