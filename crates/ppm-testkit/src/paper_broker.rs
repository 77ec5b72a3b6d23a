use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use ppm_execution::{
    BrokerGateway, OrderAck, OrderSide, OrderStatusReport, OrderType, Quote, WireOrderStatus,
};
use ppm_signal::Instrument;

/// How the paper broker behaves for the next calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PaperBrokerMode {
    /// Orders fill immediately and completely at the limit price (market
    /// orders fill at the posted quote).
    FillAtLimit,
    /// Order submission fails at the transport level.
    SubmitFails,
    /// Orders are accepted but never fill.
    NeverFills,
    /// Quote fetches fail; order flow unaffected.
    QuotesDown,
}

struct PaperOrder {
    report: OrderStatusReport,
}

/// Deterministic paper broker: immediate fills, sequential ids, scriptable
/// quotes per instrument, and coarse failure modes for the unhappy paths.
pub struct PaperBroker {
    mode: Mutex<PaperBrokerMode>,
    quotes: Mutex<HashMap<Instrument, f64>>,
    orders: Mutex<Vec<PaperOrder>>,
    quote_calls: Mutex<u32>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(PaperBrokerMode::FillAtLimit),
            quotes: Mutex::new(HashMap::new()),
            orders: Mutex::new(Vec::new()),
            quote_calls: Mutex::new(0),
        }
    }

    pub fn set_mode(&self, mode: PaperBrokerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_quote(&self, instrument: Instrument, price: f64) {
        self.quotes.lock().unwrap().insert(instrument, price);
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    pub fn quote_call_count(&self) -> u32 {
        *self.quote_calls.lock().unwrap()
    }

    fn quote_price(&self, instrument: Instrument) -> Option<f64> {
        self.quotes.lock().unwrap().get(&instrument).copied()
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn place_order(
        &self,
        instrument: Instrument,
        _side: OrderSide,
        order_type: OrderType,
        lots: i64,
        limit_price: Option<f64>,
    ) -> Result<OrderAck> {
        let mode = *self.mode.lock().unwrap();
        if mode == PaperBrokerMode::SubmitFails {
            return Err(anyhow!("paper broker: submission refused"));
        }

        let fill_price = match order_type {
            OrderType::Limit => limit_price.unwrap_or(0.0),
            OrderType::Market => self
                .quote_price(instrument)
                .or(limit_price)
                .unwrap_or(0.0),
        };

        let mut orders = self.orders.lock().unwrap();
        let order_id = format!("PORD-{:06}", orders.len() + 1);
        let report = match mode {
            PaperBrokerMode::NeverFills => OrderStatusReport {
                order_id: order_id.clone(),
                status: WireOrderStatus::Pending,
                filled_lots: 0,
                average_fill_price: None,
            },
            _ => OrderStatusReport {
                order_id: order_id.clone(),
                status: WireOrderStatus::Complete,
                filled_lots: lots,
                average_fill_price: Some(fill_price),
            },
        };
        orders.push(PaperOrder { report });
        Ok(OrderAck { order_id })
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport> {
        self.orders
            .lock()
            .unwrap()
            .iter()
            .map(|o| &o.report)
            .find(|r| r.order_id == order_id)
            .cloned()
            .ok_or_else(|| anyhow!("paper broker: unknown order {order_id}"))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut orders = self.orders.lock().unwrap();
        let order = orders
            .iter_mut()
            .find(|o| o.report.order_id == order_id)
            .ok_or_else(|| anyhow!("paper broker: unknown order {order_id}"))?;
        if order.report.status == WireOrderStatus::Pending {
            order.report.status = WireOrderStatus::Cancelled;
        }
        Ok(())
    }

    async fn quote(&self, instrument: Instrument) -> Result<Quote> {
        *self.quote_calls.lock().unwrap() += 1;
        if *self.mode.lock().unwrap() == PaperBrokerMode::QuotesDown {
            return Err(anyhow!("paper broker: quote endpoint down"));
        }
        let price = self
            .quote_price(instrument)
            .ok_or_else(|| anyhow!("paper broker: no quote posted for {instrument}"))?;
        Ok(Quote {
            instrument,
            last_price: price,
            ts: Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 6).unwrap(),
        })
    }
}
