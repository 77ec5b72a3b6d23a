//! Crash recovery: rebuild the in-memory book from the relational store at
//! startup, refuse to run on a book that does not reconcile.
//!
//! The sequence is fetch → reconstruct → validate → activate. Data-shape
//! problems (unknown instruments, orphaned pyramid references) and
//! reconciliation mismatches are terminal; plain unavailability is
//! surfaced so the caller can choose to start empty.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info};

use ppm_db::{DataShapeError, Persistence};
use ppm_portfolio::{
    InvariantViolation, PortfolioAggregate, PortfolioState, Position, PositionId, PyramidState,
};
use ppm_signal::{Instrument, InstrumentSpec};

/// Why recovery failed. `DbUnavailable` permits an empty-state start (with
/// an ERROR log at the call site); the other two must halt startup.
#[derive(Debug)]
pub enum RecoveryError {
    DbUnavailable(anyhow::Error),
    DataCorrupt(String),
    ValidationFailed(String),
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryError::DbUnavailable(e) => write!(f, "database unavailable: {e:#}"),
            RecoveryError::DataCorrupt(what) => write!(f, "persisted state corrupt: {what}"),
            RecoveryError::ValidationFailed(what) => {
                write!(f, "recovered state failed validation: {what}")
            }
        }
    }
}

impl std::error::Error for RecoveryError {}

/// Narrow read port over persistence; lets the recovery sequence run against
/// an in-memory store in tests.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn open_positions(&self) -> Result<HashMap<PositionId, Position>>;
    async fn pyramid_states(&self) -> Result<HashMap<Instrument, PyramidState>>;
    async fn aggregate(&self) -> Result<Option<PortfolioAggregate>>;
    async fn set_instance_status(&self, instance_id: &str, status: &str) -> Result<()>;
}

#[async_trait]
impl StateStore for Persistence {
    async fn open_positions(&self) -> Result<HashMap<PositionId, Position>> {
        self.get_open_positions().await
    }

    async fn pyramid_states(&self) -> Result<HashMap<Instrument, PyramidState>> {
        self.get_pyramid_states().await
    }

    async fn aggregate(&self) -> Result<Option<PortfolioAggregate>> {
        self.get_aggregate().await
    }

    async fn set_instance_status(&self, instance_id: &str, status: &str) -> Result<()> {
        Persistence::set_instance_status(self, instance_id, status).await
    }
}

fn classify(e: anyhow::Error) -> RecoveryError {
    if e.chain().any(|cause| cause.is::<DataShapeError>()) {
        RecoveryError::DataCorrupt(format!("{e:#}"))
    } else {
        RecoveryError::DbUnavailable(e)
    }
}

/// One-shot startup load. Idempotent: the returned book REPLACES whatever
/// the engine held; nothing is merged.
pub async fn load_state(
    store: &dyn StateStore,
    instance_id: Option<&str>,
    initial_capital: f64,
    specs: BTreeMap<Instrument, InstrumentSpec>,
) -> std::result::Result<PortfolioState, RecoveryError> {
    if let Some(id) = instance_id {
        store
            .set_instance_status(id, "recovering")
            .await
            .map_err(classify)?;
    }

    let positions = store.open_positions().await.map_err(classify)?;
    let pyramids = store.pyramid_states().await.map_err(classify)?;
    let stored_aggregate = store.aggregate().await.map_err(classify)?;

    // Shape validation before anything is activated.
    for (instrument, ps) in &pyramids {
        if let Some(base_id) = &ps.base_position_id {
            match positions.get(base_id) {
                Some(p) if p.is_open() && p.instrument == *instrument => {}
                _ => {
                    return Err(RecoveryError::DataCorrupt(format!(
                        "{instrument}: pyramid state references missing base position {base_id}"
                    )))
                }
            }
        }
    }
    if stored_aggregate.is_none() && !positions.is_empty() {
        return Err(RecoveryError::DataCorrupt(
            "open positions exist but the aggregate row is missing".to_string(),
        ));
    }

    let aggregate = stored_aggregate.unwrap_or_else(|| PortfolioAggregate::new(initial_capital));

    let mut portfolio = PortfolioState::new(aggregate.initial_capital, specs);
    portfolio.replace(positions, pyramids, aggregate);

    // Reconciliation: the recomputed rollups must match what the last writer
    // persisted, to the paisa. Anything else means the book and the
    // aggregate diverged while we were down.
    let violations = portfolio.check_invariants();
    if !violations.is_empty() {
        let rendered = violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(if violations
            .iter()
            .all(|v| matches!(v, InvariantViolation::AggregateMismatch { .. }))
        {
            RecoveryError::ValidationFailed(rendered)
        } else {
            RecoveryError::DataCorrupt(rendered)
        });
    }

    if let Some(id) = instance_id {
        store
            .set_instance_status(id, "active")
            .await
            .map_err(classify)?;
    }

    info!(
        open_positions = portfolio.open_positions().count(),
        equity = portfolio.equity(),
        "recovery complete"
    );
    Ok(portfolio)
}

/// Convenience wrapper for callers that tolerate an empty start: returns an
/// empty book on `DbUnavailable` (logged at ERROR), propagates the terminal
/// variants.
pub async fn load_state_or_empty(
    store: &dyn StateStore,
    instance_id: Option<&str>,
    initial_capital: f64,
    specs: BTreeMap<Instrument, InstrumentSpec>,
) -> std::result::Result<PortfolioState, RecoveryError> {
    match load_state(store, instance_id, initial_capital, specs.clone()).await {
        Ok(book) => Ok(book),
        Err(RecoveryError::DbUnavailable(e)) => {
            error!(error = %e, "recovery could not reach the database; starting with empty state");
            Ok(PortfolioState::new(initial_capital, specs))
        }
        Err(terminal) => Err(terminal),
    }
}
