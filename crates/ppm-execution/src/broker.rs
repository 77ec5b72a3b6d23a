use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use ppm_signal::Instrument;

use crate::types::{OrderAck, OrderSide, OrderStatusReport, OrderType, Quote};

/// The narrow broker port. Everything the portfolio manager needs from the
/// broker gateway fits in four calls; anything richer stays behind it.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn place_order(
        &self,
        instrument: Instrument,
        side: OrderSide,
        order_type: OrderType,
        lots: i64,
        limit_price: Option<f64>,
    ) -> Result<OrderAck>;

    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    async fn quote(&self, instrument: Instrument) -> Result<Quote>;
}

/// Transient-failure retry schedule for broker calls: immediate, +0.5 s,
/// +1.0 s. Exhaustion propagates the last error to the caller, which maps it
/// to REJECTED (executor) or BYPASSED (validator).
pub const BROKER_RETRY_DELAYS_MS: [u64; 3] = [0, 500, 1000];

/// Run `op` under the standard broker retry schedule.
pub async fn with_broker_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    for (attempt, delay_ms) in BROKER_RETRY_DELAYS_MS.iter().enumerate() {
        if *delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(what, attempt, error = %e, "broker call failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("retry loop ran at least once"))
        .with_context(|| format!("{what}: all broker attempts failed"))
}

// ---------------------------------------------------------------------------
// HTTP broker client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PlaceOrderBody<'a> {
    instrument: &'a str,
    side: OrderSide,
    order_type: OrderType,
    lots: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<f64>,
}

/// Production broker gateway over the broker's HTTP API.
pub struct HttpBroker {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBroker {
    pub fn new(base_url: &str, api_key: &str, call_timeout: Duration) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if !api_key.is_empty() {
            let mut v = reqwest::header::HeaderValue::from_str(api_key)
                .context("broker api key is not a valid header value")?;
            v.set_sensitive(true);
            headers.insert("x-api-key", v);
        }
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .default_headers(headers)
            .build()
            .context("build broker http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BrokerGateway for HttpBroker {
    async fn place_order(
        &self,
        instrument: Instrument,
        side: OrderSide,
        order_type: OrderType,
        lots: i64,
        limit_price: Option<f64>,
    ) -> Result<OrderAck> {
        let url = format!("{}/orders", self.base_url);
        let body = PlaceOrderBody {
            instrument: instrument.wire_name(),
            side,
            order_type,
            lots,
            limit_price,
        };
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("broker place_order request failed")?
            .error_for_status()
            .context("broker place_order returned an error status")?;
        resp.json::<OrderAck>()
            .await
            .context("broker place_order response decode failed")
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport> {
        let url = format!("{}/orders/{order_id}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("broker order_status request failed")?
            .error_for_status()
            .context("broker order_status returned an error status")?;
        resp.json::<OrderStatusReport>()
            .await
            .context("broker order_status response decode failed")
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let url = format!("{}/orders/{order_id}", self.base_url);
        self.http
            .delete(&url)
            .send()
            .await
            .context("broker cancel_order request failed")?
            .error_for_status()
            .context("broker cancel_order returned an error status")?;
        Ok(())
    }

    async fn quote(&self, instrument: Instrument) -> Result<Quote> {
        let url = format!("{}/quotes/{}", self.base_url, instrument.wire_name());
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("broker quote request failed")?
            .error_for_status()
            .context("broker quote returned an error status")?;
        resp.json::<Quote>()
            .await
            .context("broker quote response decode failed")
    }
}
