use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info};

use ppm_config::{ExecutionConfig, ExecutionStrategyKind, PartialFillStrategy};

use crate::broker::{with_broker_retry, BrokerGateway};
use crate::types::{
    combine_fills, ExecutionResult, ExecutionStatus, OrderIntent, OrderSide, OrderStatusReport,
    OrderType, WireOrderStatus,
};

/// Broker poll cadence inside a fill window.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Limit-first order executor with market fallback.
///
/// One invocation = one definitive [`ExecutionResult`]. All timeouts,
/// retries, cancels, and remainder handling happen inside; the engine never
/// sees a half-done order.
pub struct OrderExecutor {
    broker: Arc<dyn BrokerGateway>,
    cfg: ExecutionConfig,
}

impl OrderExecutor {
    pub fn new(broker: Arc<dyn BrokerGateway>, cfg: ExecutionConfig) -> Self {
        Self { broker, cfg }
    }

    pub async fn execute(&self, intent: &OrderIntent) -> ExecutionResult {
        let result = match self.cfg.strategy {
            ExecutionStrategyKind::SimpleLimit => self.simple_limit(intent).await,
            ExecutionStrategyKind::Progressive => self.progressive(intent).await,
        };
        info!(
            instrument = %intent.instrument,
            side = %intent.side,
            lots = intent.lots,
            status = ?result.status,
            filled = result.lots_filled,
            "execution finished"
        );
        result
    }

    // -----------------------------------------------------------------------
    // SimpleLimit
    // -----------------------------------------------------------------------

    async fn simple_limit(&self, intent: &OrderIntent) -> ExecutionResult {
        let ack = match with_broker_retry("place_order", || {
            self.broker.place_order(
                intent.instrument,
                intent.side,
                OrderType::Limit,
                intent.lots,
                Some(intent.limit_price),
            )
        })
        .await
        {
            Ok(ack) => ack,
            Err(e) => return ExecutionResult::rejected(format!("submit failed: {e:#}")),
        };

        let deadline = Instant::now() + Duration::from_secs(self.cfg.fill_timeout_s);
        let report = match self.poll_until(&ack.order_id, deadline).await {
            Ok(r) => r,
            Err(e) => return ExecutionResult::rejected(format!("status poll failed: {e:#}")),
        };

        match report.status {
            WireOrderStatus::Complete => ExecutionResult {
                status: ExecutionStatus::Executed,
                lots_filled: report.filled_lots,
                lots_cancelled: 0,
                average_fill_price: report.average_fill_price,
                notes: "limit filled".to_string(),
                partial_fill_strategy_applied: None,
            },
            WireOrderStatus::Rejected => {
                ExecutionResult::rejected("broker rejected the order".to_string())
            }
            WireOrderStatus::Cancelled => ExecutionResult::rejected(
                "order cancelled outside the executor".to_string(),
            ),
            WireOrderStatus::Partial => self.apply_partial_policy(intent, &report).await,
            WireOrderStatus::Pending => {
                let cancelled = self.cancel_and_confirm(&ack.order_id).await;
                // A fill can race the cancel; trust the post-cancel report.
                if cancelled.filled_lots > 0 {
                    return self.apply_partial_policy(intent, &cancelled).await;
                }
                ExecutionResult {
                    status: ExecutionStatus::Timeout,
                    lots_filled: 0,
                    lots_cancelled: intent.lots,
                    average_fill_price: None,
                    notes: format!("unfilled after {}s", self.cfg.fill_timeout_s),
                    partial_fill_strategy_applied: None,
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Progressive
    // -----------------------------------------------------------------------

    async fn progressive(&self, intent: &OrderIntent) -> ExecutionResult {
        let mut remaining = intent.lots;
        let mut filled_total = 0i64;
        let mut avg_price: Option<f64> = None;

        for attempt in 0..self.cfg.max_attempts {
            let last_attempt = attempt + 1 == self.cfg.max_attempts;
            let (order_type, price) = if last_attempt {
                (OrderType::Market, None)
            } else {
                (OrderType::Limit, Some(tightened_price(intent, attempt, self.cfg.tightening_step_pct)))
            };

            let ack = match with_broker_retry("place_order", || {
                self.broker.place_order(
                    intent.instrument,
                    intent.side,
                    order_type,
                    remaining,
                    price,
                )
            })
            .await
            {
                Ok(ack) => ack,
                Err(e) => {
                    if filled_total > 0 {
                        return partial_result(
                            intent,
                            filled_total,
                            avg_price,
                            format!("resubmit failed after partial fills: {e:#}"),
                            None,
                        );
                    }
                    return ExecutionResult::rejected(format!("submit failed: {e:#}"));
                }
            };

            let window = if last_attempt {
                Duration::from_secs(self.cfg.fill_timeout_s)
            } else {
                Duration::from_secs(self.cfg.tightening_interval_s)
            };
            let report = match self.poll_until(&ack.order_id, Instant::now() + window).await {
                Ok(r) => r,
                Err(e) => {
                    return partial_result(
                        intent,
                        filled_total,
                        avg_price,
                        format!("status poll failed: {e:#}"),
                        None,
                    )
                }
            };

            let report = match report.status {
                WireOrderStatus::Complete => report,
                WireOrderStatus::Rejected | WireOrderStatus::Cancelled => {
                    if filled_total > 0 {
                        return partial_result(
                            intent,
                            filled_total,
                            avg_price,
                            "broker refused a resubmission".to_string(),
                            None,
                        );
                    }
                    return ExecutionResult::rejected("broker rejected the order".to_string());
                }
                // Pending or partial at window end: cancel, keep whatever
                // filled, and go around with the remainder.
                _ => self.cancel_and_confirm(&ack.order_id).await,
            };

            if report.filled_lots > 0 {
                avg_price = combine_fills(
                    filled_total,
                    avg_price.unwrap_or(0.0),
                    report.filled_lots,
                    report.average_fill_price.unwrap_or(intent.limit_price),
                );
                filled_total += report.filled_lots;
                remaining -= report.filled_lots;
            }

            if remaining <= 0 {
                return ExecutionResult {
                    status: ExecutionStatus::Executed,
                    lots_filled: filled_total,
                    lots_cancelled: 0,
                    average_fill_price: avg_price,
                    notes: format!("filled across {} attempt(s)", attempt + 1),
                    partial_fill_strategy_applied: None,
                };
            }
        }

        if filled_total > 0 {
            partial_result(
                intent,
                filled_total,
                avg_price,
                "attempts exhausted with a remainder".to_string(),
                None,
            )
        } else {
            ExecutionResult {
                status: ExecutionStatus::Timeout,
                lots_filled: 0,
                lots_cancelled: intent.lots,
                average_fill_price: None,
                notes: "attempts exhausted unfilled".to_string(),
                partial_fill_strategy_applied: None,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Partial-fill policies
    // -----------------------------------------------------------------------

    async fn apply_partial_policy(
        &self,
        intent: &OrderIntent,
        report: &OrderStatusReport,
    ) -> ExecutionResult {
        match self.cfg.partial_fill {
            PartialFillStrategy::CancelRemainder => {
                let last = self.cancel_and_confirm(&report.order_id).await;
                partial_result(
                    intent,
                    last.filled_lots.max(report.filled_lots),
                    last.average_fill_price.or(report.average_fill_price),
                    "remainder cancelled".to_string(),
                    Some(PartialFillStrategy::CancelRemainder),
                )
            }
            PartialFillStrategy::WaitForFill => {
                let deadline =
                    Instant::now() + Duration::from_secs(self.cfg.partial_fill_wait_timeout_s);
                let last = match self.poll_until(&report.order_id, deadline).await {
                    Ok(r) => r,
                    Err(_) => report.clone(),
                };
                if last.status == WireOrderStatus::Complete {
                    return ExecutionResult {
                        status: ExecutionStatus::Executed,
                        lots_filled: last.filled_lots,
                        lots_cancelled: 0,
                        average_fill_price: last.average_fill_price,
                        notes: "completed during the wait window".to_string(),
                        partial_fill_strategy_applied: Some(PartialFillStrategy::WaitForFill),
                    };
                }
                let cancelled = self.cancel_and_confirm(&report.order_id).await;
                partial_result(
                    intent,
                    cancelled.filled_lots.max(last.filled_lots),
                    cancelled.average_fill_price.or(last.average_fill_price),
                    "wait window expired".to_string(),
                    Some(PartialFillStrategy::WaitForFill),
                )
            }
            PartialFillStrategy::Reattempt => self.reattempt_remainder(intent, report).await,
        }
    }

    async fn reattempt_remainder(
        &self,
        intent: &OrderIntent,
        report: &OrderStatusReport,
    ) -> ExecutionResult {
        let first = self.cancel_and_confirm(&report.order_id).await;
        let first_filled = first.filled_lots.max(report.filled_lots);
        let first_price = first
            .average_fill_price
            .or(report.average_fill_price)
            .unwrap_or(intent.limit_price);
        let remaining = intent.lots - first_filled;
        if remaining <= 0 {
            return ExecutionResult {
                status: ExecutionStatus::Executed,
                lots_filled: first_filled,
                lots_cancelled: 0,
                average_fill_price: Some(first_price),
                notes: "filled while cancelling".to_string(),
                partial_fill_strategy_applied: Some(PartialFillStrategy::Reattempt),
            };
        }

        let slippage = self
            .cfg
            .reattempt_slippage_pct
            .min(self.cfg.max_reattempt_slippage_pct);
        let price = match intent.side {
            OrderSide::Buy => intent.limit_price * (1.0 + slippage),
            OrderSide::Sell => intent.limit_price * (1.0 - slippage),
        };

        let ack = match with_broker_retry("place_order", || {
            self.broker.place_order(
                intent.instrument,
                intent.side,
                OrderType::Limit,
                remaining,
                Some(price),
            )
        })
        .await
        {
            Ok(ack) => ack,
            Err(e) => {
                return partial_result(
                    intent,
                    first_filled,
                    Some(first_price),
                    format!("reattempt submit failed: {e:#}"),
                    Some(PartialFillStrategy::Reattempt),
                )
            }
        };

        let deadline = Instant::now() + Duration::from_secs(self.cfg.partial_fill_wait_timeout_s);
        let second = match self.poll_until(&ack.order_id, deadline).await {
            Ok(r) => r,
            Err(_) => self.cancel_and_confirm(&ack.order_id).await,
        };
        let second = if second.status == WireOrderStatus::Complete {
            second
        } else {
            self.cancel_and_confirm(&ack.order_id).await
        };

        let total = first_filled + second.filled_lots;
        let combined = combine_fills(
            first_filled,
            first_price,
            second.filled_lots,
            second.average_fill_price.unwrap_or(price),
        );
        if total >= intent.lots {
            ExecutionResult {
                status: ExecutionStatus::Executed,
                lots_filled: total,
                lots_cancelled: 0,
                average_fill_price: combined,
                notes: "remainder filled on reattempt".to_string(),
                partial_fill_strategy_applied: Some(PartialFillStrategy::Reattempt),
            }
        } else {
            partial_result(
                intent,
                total,
                combined,
                "reattempt left a remainder".to_string(),
                Some(PartialFillStrategy::Reattempt),
            )
        }
    }

    // -----------------------------------------------------------------------
    // Polling / cancelling
    // -----------------------------------------------------------------------

    /// Poll until the order reaches a terminal status or the deadline hits.
    /// Returns the last report observed either way.
    async fn poll_until(
        &self,
        order_id: &str,
        deadline: Instant,
    ) -> anyhow::Result<OrderStatusReport> {
        loop {
            let report =
                with_broker_retry("order_status", || self.broker.order_status(order_id)).await?;
            match report.status {
                WireOrderStatus::Complete
                | WireOrderStatus::Rejected
                | WireOrderStatus::Cancelled => return Ok(report),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Ok(report);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    /// Cancel and return the post-cancel report so racing fills are counted.
    /// A cancel that cannot be confirmed is logged loudly; the executor still
    /// returns, and reconciliation against the broker book picks it up.
    async fn cancel_and_confirm(&self, order_id: &str) -> OrderStatusReport {
        if let Err(e) =
            with_broker_retry("cancel_order", || self.broker.cancel_order(order_id)).await
        {
            error!(order_id, error = %e, "🚨 cancel failed; broker book may hold a live order");
        }
        match with_broker_retry("order_status", || self.broker.order_status(order_id)).await {
            Ok(report) => report,
            Err(e) => {
                error!(order_id, error = %e, "post-cancel status unavailable");
                OrderStatusReport {
                    order_id: order_id.to_string(),
                    status: WireOrderStatus::Cancelled,
                    filled_lots: 0,
                    average_fill_price: None,
                }
            }
        }
    }
}

fn tightened_price(intent: &OrderIntent, attempt: u32, step_pct: f64) -> f64 {
    let factor = step_pct * attempt as f64;
    match intent.side {
        OrderSide::Buy => intent.limit_price * (1.0 + factor),
        OrderSide::Sell => intent.limit_price * (1.0 - factor),
    }
}

fn partial_result(
    intent: &OrderIntent,
    filled: i64,
    avg_price: Option<f64>,
    notes: String,
    strategy: Option<PartialFillStrategy>,
) -> ExecutionResult {
    ExecutionResult {
        status: ExecutionStatus::Partial,
        lots_filled: filled,
        lots_cancelled: intent.lots - filled,
        average_fill_price: avg_price,
        notes,
        partial_fill_strategy_applied: strategy,
    }
}
