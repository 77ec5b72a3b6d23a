use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{error, info, warn};

use ppm_config::AppConfig;
use ppm_db::{Persistence, SignalLogStatus};
use ppm_execution::{BrokerGateway, OrderExecutor, OrderIntent, OrderSide};
use ppm_portfolio::{PortfolioAggregate, PortfolioState, Position, PyramidState};
use ppm_signal::{signal_fingerprint, Clock, Instrument, Signal, SignalKind, Slot};
use ppm_sizing::{
    base_entry_lots, evaluate_pyramid_gate, pyramid_lots, ratchet_trailing_stop, BaseEntryInput,
    PyramidGateContext, PyramidInput,
};
use ppm_validate::{validate_condition, validate_execution, AgeTier, ValidatorMetrics};

use crate::locks::InstrumentLocks;
use crate::outcome::{LeaderGate, Outcome, ProcessedSummary, RejectReason};

/// A market observation for the trailing-stop updater.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarketTick {
    pub instrument: Instrument,
    pub price: f64,
    pub atr: f64,
}

/// External collaborators handed to the engine at construction. Live mode
/// wires all of them; backtests leave persistence and the leader gate out.
pub struct EngineHandles {
    pub broker: Arc<dyn BrokerGateway>,
    pub clock: Arc<dyn Clock>,
    pub persistence: Option<Arc<Persistence>>,
    pub leader: Option<Arc<dyn LeaderGate>>,
    pub metrics: Arc<ValidatorMetrics>,
    pub instance_id: String,
}

/// Signal orchestrator. One instance per process; every webhook worker and
/// background updater shares it by `Arc`.
pub struct LiveEngine {
    cfg: AppConfig,
    broker: Arc<dyn BrokerGateway>,
    clock: Arc<dyn Clock>,
    executor: OrderExecutor,
    persistence: Option<Arc<Persistence>>,
    leader: Option<Arc<dyn LeaderGate>>,
    metrics: Arc<ValidatorMetrics>,
    instance_id: String,
    portfolio: Mutex<PortfolioState>,
    locks: InstrumentLocks,
    /// Fingerprint memory for persistence-less (backtest) runs.
    seen: Mutex<HashSet<String>>,
}

impl LiveEngine {
    pub fn new(cfg: AppConfig, portfolio: PortfolioState, handles: EngineHandles) -> Self {
        let executor = OrderExecutor::new(Arc::clone(&handles.broker), cfg.execution.clone());
        Self {
            cfg,
            broker: handles.broker,
            clock: handles.clock,
            executor,
            persistence: handles.persistence,
            leader: handles.leader,
            metrics: handles.metrics,
            instance_id: handles.instance_id,
            portfolio: Mutex::new(portfolio),
            locks: InstrumentLocks::new(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Read access to the book for routes, reports, and tests.
    pub fn with_portfolio<R>(&self, f: impl FnOnce(&PortfolioState) -> R) -> R {
        f(&self.portfolio.lock().expect("portfolio lock poisoned"))
    }

    /// Replace the book wholesale (recovery).
    pub fn install_portfolio(&self, portfolio: PortfolioState) {
        *self.portfolio.lock().expect("portfolio lock poisoned") = portfolio;
    }

    pub fn validator_metrics(&self) -> &ValidatorMetrics {
        &self.metrics
    }

    fn is_leader(&self) -> bool {
        self.leader.as_ref().map(|l| l.is_leader()).unwrap_or(true)
    }

    // -----------------------------------------------------------------------
    // ProcessSignal
    // -----------------------------------------------------------------------

    /// Process one trading signal to a terminal [`Outcome`]. Serialized per
    /// instrument; concurrent across instruments.
    pub async fn process_signal(&self, signal: &Signal) -> Outcome {
        let lock = self.locks.for_instrument(signal.instrument);
        let _guard = lock.lock().await;

        if !self.is_leader() {
            return Outcome::Rejected {
                reason: RejectReason::NotLeader,
            };
        }

        let fingerprint = signal_fingerprint(signal);
        match self.claim_fingerprint(&fingerprint, signal).await {
            Ok(true) => {}
            Ok(false) => return Outcome::Duplicate,
            Err(e) => {
                error!(error = %e, "fingerprint claim failed; refusing the signal");
                return Outcome::Rejected {
                    reason: RejectReason::ExecutionFailed {
                        detail: format!("dedup store unavailable: {e:#}"),
                    },
                };
            }
        }

        // Leadership can be lost across the dedup write; re-check before any
        // market-facing step.
        if !self.is_leader() {
            self.settle(&fingerprint, SignalLogStatus::Rejected, "lost_leadership")
                .await;
            return Outcome::Rejected {
                reason: RejectReason::LostLeadership,
            };
        }

        let condition = validate_condition(signal, self.clock.wall(), &self.metrics);
        if !condition.is_valid {
            let detail = condition.reason.unwrap_or_else(|| "condition failed".into());
            self.settle(&fingerprint, SignalLogStatus::Rejected, &detail)
                .await;
            return Outcome::Rejected {
                reason: RejectReason::ConditionFailed { detail },
            };
        }

        let outcome = match signal.kind {
            SignalKind::BaseEntry => {
                self.handle_base_entry(signal, condition.age_tier, &fingerprint)
                    .await
            }
            SignalKind::Pyramid => {
                self.handle_pyramid(signal, condition.age_tier, &fingerprint)
                    .await
            }
            SignalKind::Exit => {
                self.handle_exit(signal, condition.age_tier, &fingerprint)
                    .await
            }
            SignalKind::EodMonitor => Outcome::Ignored,
        };

        if let Outcome::Rejected { reason } = &outcome {
            self.settle(&fingerprint, SignalLogStatus::Rejected, reason.code())
                .await;
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // BASE_ENTRY
    // -----------------------------------------------------------------------

    async fn handle_base_entry(
        &self,
        signal: &Signal,
        tier: AgeTier,
        fingerprint: &str,
    ) -> Outcome {
        let spec = self.cfg.instrument_spec(signal.instrument);

        {
            let book = self.portfolio.lock().expect("portfolio lock poisoned");
            if book.base_position(signal.instrument).is_some() {
                return Outcome::Rejected {
                    reason: RejectReason::BaseAlreadyOpen,
                };
            }
        }

        let verdict = validate_execution(
            &self.cfg.validation,
            signal,
            tier,
            self.broker.as_ref(),
            &self.metrics,
        )
        .await;
        if !verdict.is_valid {
            return Outcome::Rejected {
                reason: RejectReason::ExecutionValidation {
                    detail: format!("{:?}", verdict.reason),
                },
            };
        }
        let price = verdict.source_price_used;

        let (equity, available_margin) = {
            let book = self.portfolio.lock().expect("portfolio lock poisoned");
            (book.equity(), book.free_margin(self.cfg.risk.margin_cap_pct))
        };
        let sizing = match base_entry_lots(BaseEntryInput {
            equity,
            risk_pct: self.cfg.risk.risk_pct,
            vol_pct: self.cfg.risk.vol_pct,
            entry: price,
            stop: signal.stop,
            point_value: spec.point_value,
            er: signal.er,
            atr: signal.atr,
            available_margin,
            margin_per_lot: spec.margin_per_lot,
        }) {
            Ok(s) => s,
            Err(e) => {
                return Outcome::Rejected {
                    reason: RejectReason::InvalidSizing {
                        detail: e.to_string(),
                    },
                }
            }
        };
        info!(
            instrument = %signal.instrument,
            lot_r = sizing.lot_r,
            lot_v = sizing.lot_v,
            lot_m = sizing.lot_m,
            lots = sizing.lots,
            "base entry sizing (LotV reported, not binding)"
        );
        if sizing.lots == 0 {
            return Outcome::Rejected {
                reason: RejectReason::BelowSizeFloor,
            };
        }

        let result = self
            .executor
            .execute(&OrderIntent::new(
                signal.instrument,
                OrderSide::Buy,
                sizing.lots,
                price,
            ))
            .await;
        if !result.is_fill() {
            return Outcome::Rejected {
                reason: RejectReason::ExecutionFailed {
                    detail: result.notes,
                },
            };
        }
        let fill_price = result.average_fill_price.unwrap_or(price);

        let (position, pyramid, aggregate) = {
            let mut book = self.portfolio.lock().expect("portfolio lock poisoned");
            let id = book.open_position(
                signal.instrument,
                signal.slot.clone(),
                true,
                fill_price,
                signal.stop,
                result.lots_filled,
                signal.atr,
                self.clock.wall(),
            );
            (
                book.position(&id).expect("just created").clone(),
                book.pyramid_state(signal.instrument)
                    .expect("created with the base")
                    .clone(),
                book.aggregate().clone(),
            )
        };
        self.persist_entry(&position, &pyramid, &aggregate).await;

        let summary = ProcessedSummary {
            kind: signal.kind,
            instrument: signal.instrument,
            lots: result.lots_filled,
            fill_price: Some(fill_price),
            source_price_used: price,
            validation_bypassed: verdict.bypassed(),
            realized_pnl: None,
        };
        self.settle(
            fingerprint,
            SignalLogStatus::Executed,
            &format!(
                "base entry filled: {} lots @ {:.2}{}",
                result.lots_filled,
                fill_price,
                if verdict.bypassed() {
                    " (validation_bypassed=true)"
                } else {
                    ""
                }
            ),
        )
        .await;
        Outcome::Processed { result: summary }
    }

    // -----------------------------------------------------------------------
    // PYRAMID
    // -----------------------------------------------------------------------

    async fn handle_pyramid(&self, signal: &Signal, tier: AgeTier, fingerprint: &str) -> Outcome {
        let spec = self.cfg.instrument_spec(signal.instrument);

        // Gate context snapshot under the book lock; the gate itself is pure.
        let (gate_ctx, base_lots, base_risk, pyramid_index) = {
            let book = self.portfolio.lock().expect("portfolio lock poisoned");
            let Some(base) = book.base_position(signal.instrument) else {
                return Outcome::Rejected {
                    reason: RejectReason::NoBasePosition,
                };
            };
            let ps = book
                .pyramid_state(signal.instrument)
                .expect("pyramid state exists while the base is open");

            // Hypothetical admission uses the strategy's advisory lot count;
            // the real count is sized after the gate.
            let hypo_lots = signal.suggested_lots.max(1);
            let (hypo_risk, hypo_vol, hypo_margin) = book.hypothetical_rollups(
                signal.instrument,
                signal.price,
                signal.stop,
                signal.atr,
                hypo_lots,
            );
            let ctx = PyramidGateContext {
                price: signal.price,
                last_pyramid_price: ps.last_pyramid_price,
                initial_r: base.entry_price - base.initial_stop,
                atr: signal.atr,
                equity: book.equity(),
                hypothetical_risk: hypo_risk,
                hypothetical_vol: hypo_vol,
                hypothetical_margin: hypo_margin,
                instrument_unrealized_pnl: book
                    .instrument_unrealized_pnl(signal.instrument, signal.price),
            };
            (
                ctx,
                base.lots,
                (base.entry_price - base.initial_stop) * base.lots as f64 * spec.point_value,
                ps.pyramid_count + 1,
            )
        };

        let decision = evaluate_pyramid_gate(&self.cfg.risk, &gate_ctx);
        if !decision.admit {
            return Outcome::Rejected {
                reason: RejectReason::Gate {
                    gate: decision.reason.code().to_string(),
                    detail: decision.reason.to_string(),
                },
            };
        }

        let verdict = validate_execution(
            &self.cfg.validation,
            signal,
            tier,
            self.broker.as_ref(),
            &self.metrics,
        )
        .await;
        if !verdict.is_valid {
            return Outcome::Rejected {
                reason: RejectReason::ExecutionValidation {
                    detail: format!("{:?}", verdict.reason),
                },
            };
        }
        let price = verdict.source_price_used;

        let (free_margin, accumulated_profit) = {
            let book = self.portfolio.lock().expect("portfolio lock poisoned");
            (
                book.free_margin(self.cfg.risk.margin_cap_pct),
                book.instrument_unrealized_pnl(signal.instrument, price),
            )
        };
        let sizing = match pyramid_lots(PyramidInput {
            free_margin,
            margin_per_lot: spec.margin_per_lot,
            pyramid_index,
            base_lots,
            accumulated_profit,
            base_risk,
            entry: price,
            new_stop: signal.stop,
            point_value: spec.point_value,
        }) {
            Ok(s) => s,
            Err(e) => {
                return Outcome::Rejected {
                    reason: RejectReason::InvalidSizing {
                        detail: e.to_string(),
                    },
                }
            }
        };
        info!(
            instrument = %signal.instrument,
            lot_a = sizing.lot_a,
            lot_b = sizing.lot_b,
            lot_c = sizing.lot_c,
            lots = sizing.lots,
            pyramid_index,
            "pyramid sizing"
        );
        if sizing.lots == 0 {
            return Outcome::Rejected {
                reason: RejectReason::BelowSizeFloor,
            };
        }

        let result = self
            .executor
            .execute(&OrderIntent::new(
                signal.instrument,
                OrderSide::Buy,
                sizing.lots,
                price,
            ))
            .await;
        if !result.is_fill() {
            return Outcome::Rejected {
                reason: RejectReason::ExecutionFailed {
                    detail: result.notes,
                },
            };
        }
        let fill_price = result.average_fill_price.unwrap_or(price);

        // last_pyramid_price and the count advance here, on the fill, and
        // nowhere else: a rejected pyramid must not poison the spacing gate.
        let (position, pyramid, aggregate) = {
            let mut book = self.portfolio.lock().expect("portfolio lock poisoned");
            let id = book.open_position(
                signal.instrument,
                signal.slot.clone(),
                false,
                fill_price,
                signal.stop,
                result.lots_filled,
                signal.atr,
                self.clock.wall(),
            );
            (
                book.position(&id).expect("just created").clone(),
                book.pyramid_state(signal.instrument)
                    .expect("still present")
                    .clone(),
                book.aggregate().clone(),
            )
        };
        self.persist_entry(&position, &pyramid, &aggregate).await;

        let summary = ProcessedSummary {
            kind: signal.kind,
            instrument: signal.instrument,
            lots: result.lots_filled,
            fill_price: Some(fill_price),
            source_price_used: price,
            validation_bypassed: verdict.bypassed(),
            realized_pnl: None,
        };
        self.settle(
            fingerprint,
            SignalLogStatus::Executed,
            &format!(
                "pyramid {} filled: {} lots @ {:.2}",
                pyramid_index, result.lots_filled, fill_price
            ),
        )
        .await;
        Outcome::Processed { result: summary }
    }

    // -----------------------------------------------------------------------
    // EXIT
    // -----------------------------------------------------------------------

    async fn handle_exit(&self, signal: &Signal, tier: AgeTier, fingerprint: &str) -> Outcome {
        let targets: Vec<Position> = {
            let book = self.portfolio.lock().expect("portfolio lock poisoned");
            let legs = book.open_positions_for(signal.instrument);
            match &signal.slot {
                Slot::All => legs.into_iter().cloned().collect(),
                named => legs
                    .into_iter()
                    .filter(|p| &p.slot == named)
                    .cloned()
                    .collect(),
            }
        };
        if targets.is_empty() {
            return Outcome::Rejected {
                reason: RejectReason::NoOpenPosition,
            };
        }

        let verdict = validate_execution(
            &self.cfg.validation,
            signal,
            tier,
            self.broker.as_ref(),
            &self.metrics,
        )
        .await;
        if !verdict.is_valid {
            return Outcome::Rejected {
                reason: RejectReason::ExecutionValidation {
                    detail: format!("{:?}", verdict.reason),
                },
            };
        }
        let price = verdict.source_price_used;

        let total_lots: i64 = targets.iter().map(|p| p.lots).sum();
        let result = self
            .executor
            .execute(&OrderIntent::new(
                signal.instrument,
                OrderSide::Sell,
                total_lots,
                price,
            ))
            .await;
        if !result.is_fill() {
            return Outcome::Rejected {
                reason: RejectReason::ExecutionFailed {
                    detail: result.notes,
                },
            };
        }
        let fill_price = result.average_fill_price.unwrap_or(price);

        let (closed, pyramid_after, aggregate, realized) =
            self.apply_exit_fill(signal.instrument, &targets, result.lots_filled, fill_price);

        self.persist_exit(signal.instrument, &closed, pyramid_after.as_ref(), &aggregate)
            .await;

        let summary = ProcessedSummary {
            kind: signal.kind,
            instrument: signal.instrument,
            lots: result.lots_filled,
            fill_price: Some(fill_price),
            source_price_used: price,
            validation_bypassed: verdict.bypassed(),
            realized_pnl: Some(realized),
        };
        self.settle(
            fingerprint,
            SignalLogStatus::Executed,
            &format!(
                "exit filled: {} lots @ {:.2}, realized {:.2} ({})",
                result.lots_filled,
                fill_price,
                realized,
                signal.exit_reason.as_deref().unwrap_or("unspecified")
            ),
        )
        .await;
        Outcome::Processed { result: summary }
    }

    /// Apply a (possibly partial) exit fill to the book: full closes first,
    /// a trailing reduce for a remainder that covers only part of a leg.
    fn apply_exit_fill(
        &self,
        instrument: Instrument,
        targets: &[Position],
        mut lots_to_close: i64,
        fill_price: f64,
    ) -> (
        Vec<Position>,
        Option<PyramidState>,
        PortfolioAggregate,
        f64,
    ) {
        let mut book = self.portfolio.lock().expect("portfolio lock poisoned");
        let mut closed = Vec::new();
        let mut realized_total = 0.0;
        let now = self.clock.wall();

        for target in targets {
            if lots_to_close <= 0 {
                break;
            }
            if lots_to_close >= target.lots {
                lots_to_close -= target.lots;
                if let Some(realized) = book.close_position(&target.id, fill_price, now) {
                    realized_total += realized;
                }
                closed.push(book.position(&target.id).expect("still in arena").clone());
            } else {
                if let Some(realized) = book.reduce_position(&target.id, lots_to_close, fill_price)
                {
                    realized_total += realized;
                }
                closed.push(book.position(&target.id).expect("still in arena").clone());
                lots_to_close = 0;
            }
        }

        (
            closed,
            book.pyramid_state(instrument).cloned(),
            book.aggregate().clone(),
            realized_total,
        )
    }

    // -----------------------------------------------------------------------
    // Trailing stops
    // -----------------------------------------------------------------------

    /// Ratchet stops for every open position on the ticked instrument and
    /// persist the ones that advanced.
    pub async fn update_trailing_stops(&self, tick: &MarketTick) {
        let lock = self.locks.for_instrument(tick.instrument);
        let _guard = lock.lock().await;

        let advanced: Vec<(Position, PortfolioAggregate)> = {
            let mut book = self.portfolio.lock().expect("portfolio lock poisoned");
            let ids: Vec<_> = book
                .open_positions_for(tick.instrument)
                .iter()
                .map(|p| p.id.clone())
                .collect();

            let mut out = Vec::new();
            for id in ids {
                book.observe_close(&id, tick.price);
                let Some(position) = book.position(&id) else {
                    continue;
                };
                let high = position.highest_close.unwrap_or(position.entry_price);
                if let Some(new_stop) = ratchet_trailing_stop(
                    position.current_stop,
                    high,
                    tick.atr,
                    self.cfg.risk.trail_atr_mult,
                ) {
                    if book.advance_stop(&id, new_stop) {
                        out.push((
                            book.position(&id).expect("still open").clone(),
                            book.aggregate().clone(),
                        ));
                    }
                }
            }
            out
        };

        for (position, aggregate) in advanced {
            info!(
                position = %position.id,
                new_stop = position.current_stop,
                "trailing stop advanced"
            );
            if let Some(db) = &self.persistence {
                if let Err(e) = db.persist_stop_advance(&position, &aggregate).await {
                    error!(
                        position = %position.id,
                        error = %e,
                        "🚨 stop advance persisted in memory only; reconcile against the store"
                    );
                }
            }
        }
    }

    /// Background worker body: pull a quote for every instrument with open
    /// positions and run the ratchet on it. ATR is the entry-time value (the
    /// strategy resends it with every signal; between signals the last known
    /// one is the best available). Returns how many stops advanced.
    pub async fn refresh_trailing_stops(&self) -> usize {
        let instruments: Vec<(Instrument, f64)> = {
            let book = self.portfolio.lock().expect("portfolio lock poisoned");
            Instrument::ALL
                .iter()
                .filter_map(|i| {
                    let legs = book.open_positions_for(*i);
                    legs.last().map(|leg| (*i, leg.atr_at_entry))
                })
                .collect()
        };

        let mut advanced = 0;
        for (instrument, atr) in instruments {
            match self.broker.quote(instrument).await {
                Ok(quote) => {
                    let before = self.stop_snapshot(instrument);
                    self.update_trailing_stops(&MarketTick {
                        instrument,
                        price: quote.last_price,
                        atr,
                    })
                    .await;
                    if self.stop_snapshot(instrument) != before {
                        advanced += 1;
                    }
                }
                Err(e) => warn!(%instrument, error = %e, "trailing refresh quote failed"),
            }
        }
        advanced
    }

    fn stop_snapshot(&self, instrument: Instrument) -> Vec<(ppm_portfolio::PositionId, f64)> {
        let book = self.portfolio.lock().expect("portfolio lock poisoned");
        book.open_positions_for(instrument)
            .iter()
            .map(|p| (p.id.clone(), p.current_stop))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Persistence plumbing
    // -----------------------------------------------------------------------

    async fn claim_fingerprint(&self, fingerprint: &str, signal: &Signal) -> anyhow::Result<bool> {
        match &self.persistence {
            Some(db) => {
                let payload = serde_json::to_value(signal).unwrap_or_else(|_| json!({}));
                db.try_claim_signal(
                    fingerprint,
                    &payload,
                    &self.instance_id,
                    self.cfg.pipeline.dedup_window_s,
                )
                .await
            }
            None => Ok(self
                .seen
                .lock()
                .expect("seen lock poisoned")
                .insert(fingerprint.to_string())),
        }
    }

    async fn settle(&self, fingerprint: &str, status: SignalLogStatus, summary: &str) {
        if let Some(db) = &self.persistence {
            if let Err(e) = db.update_signal_status(fingerprint, status, summary).await {
                warn!(error = %e, fingerprint, "signal log settle failed");
            }
        }
    }

    /// Fill already happened: a persistence failure here is logged loudly
    /// and the in-memory book stands so the operator can reconcile. The
    /// broker order is never "undone".
    async fn persist_entry(
        &self,
        position: &Position,
        pyramid: &PyramidState,
        aggregate: &PortfolioAggregate,
    ) {
        if let Some(db) = &self.persistence {
            if let Err(e) = db.persist_entry(position, pyramid, aggregate).await {
                error!(
                    position = %position.id,
                    error = %e,
                    "🚨 entry persisted in memory only; reconcile against the store"
                );
            }
        }
    }

    async fn persist_exit(
        &self,
        instrument: Instrument,
        closed: &[Position],
        pyramid: Option<&PyramidState>,
        aggregate: &PortfolioAggregate,
    ) {
        if let Some(db) = &self.persistence {
            if let Err(e) = db
                .persist_exit(closed, instrument, pyramid, aggregate)
                .await
            {
                error!(
                    instrument = %instrument,
                    error = %e,
                    "🚨 exit persisted in memory only; reconcile against the store"
                );
            }
        }
    }
}
