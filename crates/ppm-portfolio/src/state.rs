use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};

use ppm_signal::{Instrument, InstrumentSpec};

use crate::money::{approx_eq_money, round_paise};
use crate::types::{
    PortfolioAggregate, Position, PositionId, PositionStatus, PyramidState,
};

/// A broken book invariant. Surfaced by recovery validation and by the
/// consistency sweep tests; the engine treats any of these as corruption.
#[derive(Clone, Debug, PartialEq)]
pub enum InvariantViolation {
    NegativeLots(PositionId),
    StopBelowInitial(PositionId),
    HighWaterBelowEntry(PositionId),
    MultipleBasePositions(Instrument),
    OrphanedBaseReference(Instrument),
    AggregateMismatch {
        field: &'static str,
        stored: f64,
        recomputed: f64,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::NegativeLots(id) => write!(f, "position {id}: negative lots"),
            InvariantViolation::StopBelowInitial(id) => {
                write!(f, "position {id}: current_stop below initial_stop")
            }
            InvariantViolation::HighWaterBelowEntry(id) => {
                write!(f, "position {id}: highest_close below entry")
            }
            InvariantViolation::MultipleBasePositions(i) => {
                write!(f, "{i}: more than one open base position")
            }
            InvariantViolation::OrphanedBaseReference(i) => {
                write!(f, "{i}: pyramid state references a missing base position")
            }
            InvariantViolation::AggregateMismatch {
                field,
                stored,
                recomputed,
            } => write!(
                f,
                "aggregate {field}: stored {stored:.2} vs recomputed {recomputed:.2}"
            ),
        }
    }
}

/// The single in-memory book. Mutated only by the engine under the relevant
/// per-instrument lock; rollups are recomputed from the open positions after
/// every mutation so the aggregate can never drift from its parts.
pub struct PortfolioState {
    specs: BTreeMap<Instrument, InstrumentSpec>,
    positions: HashMap<PositionId, Position>,
    pyramid: HashMap<Instrument, PyramidState>,
    aggregate: PortfolioAggregate,
}

impl PortfolioState {
    pub fn new(initial_capital: f64, specs: BTreeMap<Instrument, InstrumentSpec>) -> Self {
        Self {
            specs,
            positions: HashMap::new(),
            pyramid: HashMap::new(),
            aggregate: PortfolioAggregate::new(initial_capital),
        }
    }

    pub fn spec(&self, instrument: Instrument) -> InstrumentSpec {
        self.specs
            .get(&instrument)
            .cloned()
            .unwrap_or_else(|| InstrumentSpec::default_for(instrument))
    }

    // -----------------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------------

    pub fn aggregate(&self) -> &PortfolioAggregate {
        &self.aggregate
    }

    pub fn equity(&self) -> f64 {
        self.aggregate.equity()
    }

    /// Margin headroom under the configured cap.
    pub fn free_margin(&self, margin_cap_pct: f64) -> f64 {
        (self.equity() * margin_cap_pct - self.aggregate.margin_used).max(0.0)
    }

    pub fn position(&self, id: &PositionId) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| p.is_open())
    }

    pub fn open_positions_for(&self, instrument: Instrument) -> Vec<&Position> {
        let mut legs: Vec<&Position> = self
            .positions
            .values()
            .filter(|p| p.is_open() && p.instrument == instrument)
            .collect();
        legs.sort_by(|a, b| a.id.cmp(&b.id));
        legs
    }

    pub fn base_position(&self, instrument: Instrument) -> Option<&Position> {
        self.positions
            .values()
            .find(|p| p.is_open() && p.instrument == instrument && p.is_base_position)
    }

    pub fn pyramid_state(&self, instrument: Instrument) -> Option<&PyramidState> {
        self.pyramid.get(&instrument)
    }

    pub fn pyramid_states(&self) -> &HashMap<Instrument, PyramidState> {
        &self.pyramid
    }

    pub fn instrument_unrealized_pnl(&self, instrument: Instrument, price: f64) -> f64 {
        let pv = self.spec(instrument).point_value;
        self.open_positions_for(instrument)
            .iter()
            .map(|p| p.unrealized_pnl(price, pv))
            .sum()
    }

    /// Portfolio rollups after hypothetically adding a leg. Used by the
    /// pyramid gate without mutating anything.
    pub fn hypothetical_rollups(
        &self,
        instrument: Instrument,
        entry: f64,
        stop: f64,
        atr: f64,
        lots: i64,
    ) -> (f64, f64, f64) {
        let spec = self.spec(instrument);
        let add_risk = (entry - stop) * lots as f64 * spec.point_value;
        let add_vol = atr * lots as f64 * spec.point_value;
        let add_margin = lots as f64 * spec.margin_per_lot;
        (
            self.aggregate.total_risk_amount + add_risk,
            self.aggregate.total_vol_amount + add_vol,
            self.aggregate.margin_used + add_margin,
        )
    }

    // -----------------------------------------------------------------------
    // Mutation (engine-only, under the instrument lock)
    // -----------------------------------------------------------------------

    /// Admit a filled entry. Creates the position, maintains pyramid
    /// metadata, and refreshes the rollups. Returns the new position id.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &mut self,
        instrument: Instrument,
        slot: ppm_signal::Slot,
        is_base: bool,
        entry_price: f64,
        initial_stop: f64,
        lots: i64,
        atr: f64,
        opened_at: DateTime<Utc>,
    ) -> PositionId {
        debug_assert!(lots > 0, "open_position with non-positive lots");
        let id = PositionId::derive(instrument, &slot, opened_at);
        let spec = self.spec(instrument);

        let position = Position {
            id: id.clone(),
            instrument,
            slot,
            is_base_position: is_base,
            entry_price,
            initial_stop,
            current_stop: initial_stop,
            highest_close: None,
            lots,
            atr_at_entry: atr,
            pe_entry_price: if spec.synthetic_long { Some(initial_stop) } else { None },
            ce_entry_price: if spec.synthetic_long { Some(entry_price) } else { None },
            status: PositionStatus::Open,
            opened_at,
            closed_at: None,
            realized_pnl: None,
            version: 0,
        };
        self.positions.insert(id.clone(), position);

        if is_base {
            self.pyramid.insert(
                instrument,
                PyramidState {
                    last_pyramid_price: entry_price,
                    base_position_id: Some(id.clone()),
                    pyramid_count: 0,
                },
            );
        } else if let Some(ps) = self.pyramid.get_mut(&instrument) {
            ps.pyramid_count += 1;
            ps.last_pyramid_price = entry_price;
        }

        self.refresh_rollups();
        id
    }

    /// Close a leg at `exit_price`; returns realized P&L. Pyramid metadata
    /// follows the leg: base closing with pyramids remaining nulls
    /// `base_position_id`; the last leg closing deletes the instrument's
    /// pyramid state entirely.
    pub fn close_position(
        &mut self,
        id: &PositionId,
        exit_price: f64,
        closed_at: DateTime<Utc>,
    ) -> Option<f64> {
        let (instrument, was_base, points) = {
            let pos = self.positions.get(id)?;
            if !pos.is_open() {
                return None;
            }
            (
                pos.instrument,
                pos.is_base_position,
                (exit_price - pos.entry_price) * pos.lots as f64,
            )
        };
        let realized = round_paise(points * self.spec(instrument).point_value);

        let pos = self.positions.get_mut(id)?;
        pos.status = PositionStatus::Closed;
        pos.closed_at = Some(closed_at);
        pos.realized_pnl = Some(realized);
        pos.version += 1;

        self.aggregate.closed_equity = round_paise(self.aggregate.closed_equity + realized);

        let any_open = self
            .positions
            .values()
            .any(|p| p.is_open() && p.instrument == instrument);
        if !any_open {
            self.pyramid.remove(&instrument);
        } else if was_base {
            if let Some(ps) = self.pyramid.get_mut(&instrument) {
                ps.base_position_id = None;
            }
        }

        self.refresh_rollups();
        Some(realized)
    }

    /// Ratchet a stop upward. Rejects regressions; bumps the version so the
    /// optimistic write can be persisted.
    pub fn advance_stop(&mut self, id: &PositionId, new_stop: f64) -> bool {
        let Some(pos) = self.positions.get_mut(id) else {
            return false;
        };
        if !pos.is_open() || new_stop <= pos.current_stop {
            return false;
        }
        pos.current_stop = new_stop;
        pos.version += 1;
        self.refresh_rollups();
        true
    }

    /// Record a new closing price; maintains the monotone high-water mark.
    pub fn observe_close(&mut self, id: &PositionId, close: f64) {
        if let Some(pos) = self.positions.get_mut(id) {
            let hw = pos.highest_close.unwrap_or(pos.entry_price);
            if close >= hw {
                pos.highest_close = Some(close);
            }
        }
    }

    /// Reduce a leg's lot count (peel-off). The reduced lots realize P&L at
    /// `exit_price` like a partial close.
    pub fn reduce_position(
        &mut self,
        id: &PositionId,
        lots_off: i64,
        exit_price: f64,
    ) -> Option<f64> {
        if lots_off <= 0 {
            return None;
        }
        let instrument = self.positions.get(id)?.instrument;
        let pv = self.spec(instrument).point_value;
        let pos = self.positions.get_mut(id)?;
        if !pos.is_open() || lots_off > pos.lots {
            return None;
        }
        let realized = round_paise((exit_price - pos.entry_price) * lots_off as f64 * pv);
        pos.lots -= lots_off;
        pos.version += 1;
        self.aggregate.closed_equity = round_paise(self.aggregate.closed_equity + realized);
        self.refresh_rollups();
        Some(realized)
    }

    /// Replace the whole book (recovery). Never merges.
    pub fn replace(
        &mut self,
        positions: HashMap<PositionId, Position>,
        pyramid: HashMap<Instrument, PyramidState>,
        aggregate: PortfolioAggregate,
    ) {
        self.positions = positions;
        self.pyramid = pyramid;
        self.aggregate = aggregate;
    }

    fn refresh_rollups(&mut self) {
        let mut risk = 0.0;
        let mut vol = 0.0;
        let mut margin = 0.0;
        for p in self.positions.values().filter(|p| p.is_open()) {
            let spec = self
                .specs
                .get(&p.instrument)
                .cloned()
                .unwrap_or_else(|| InstrumentSpec::default_for(p.instrument));
            risk += p.risk_amount(spec.point_value);
            vol += p.vol_amount(spec.point_value);
            margin += p.margin_used(spec.margin_per_lot);
        }
        self.aggregate.total_risk_amount = round_paise(risk);
        self.aggregate.total_vol_amount = round_paise(vol);
        self.aggregate.margin_used = round_paise(margin);
        self.aggregate.version += 1;
    }

    // -----------------------------------------------------------------------
    // Invariants
    // -----------------------------------------------------------------------

    /// Full consistency sweep. Empty vec = healthy book.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut out = Vec::new();

        let mut base_count: BTreeMap<Instrument, u32> = BTreeMap::new();
        for p in self.positions.values() {
            if p.lots < 0 {
                out.push(InvariantViolation::NegativeLots(p.id.clone()));
            }
            if !p.is_open() {
                continue;
            }
            if p.current_stop < p.initial_stop {
                out.push(InvariantViolation::StopBelowInitial(p.id.clone()));
            }
            if let Some(hw) = p.highest_close {
                if hw < p.entry_price {
                    out.push(InvariantViolation::HighWaterBelowEntry(p.id.clone()));
                }
            }
            if p.is_base_position {
                *base_count.entry(p.instrument).or_default() += 1;
            }
        }
        for (instrument, n) in base_count {
            if n > 1 {
                out.push(InvariantViolation::MultipleBasePositions(instrument));
            }
        }

        for (instrument, ps) in &self.pyramid {
            if let Some(base_id) = &ps.base_position_id {
                match self.positions.get(base_id) {
                    Some(p) if p.is_open() => {}
                    _ => out.push(InvariantViolation::OrphanedBaseReference(*instrument)),
                }
            }
        }

        let mut risk = 0.0;
        let mut vol = 0.0;
        let mut margin = 0.0;
        for p in self.positions.values().filter(|p| p.is_open()) {
            let spec = self.spec(p.instrument);
            risk += p.risk_amount(spec.point_value);
            vol += p.vol_amount(spec.point_value);
            margin += p.margin_used(spec.margin_per_lot);
        }
        for (field, stored, recomputed) in [
            ("total_risk_amount", self.aggregate.total_risk_amount, risk),
            ("total_vol_amount", self.aggregate.total_vol_amount, vol),
            ("margin_used", self.aggregate.margin_used, margin),
        ] {
            if !approx_eq_money(stored, recomputed) {
                out.push(InvariantViolation::AggregateMismatch {
                    field,
                    stored,
                    recomputed,
                });
            }
        }

        out
    }
}
