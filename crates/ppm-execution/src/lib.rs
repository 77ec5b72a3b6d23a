//! Order execution: the broker port, the limit/progressive strategies, and
//! the partial-fill policies.
//!
//! The executor is the single choke-point between a sized, gated signal and
//! the broker. It owns every timeout and retry; the engine above it only
//! ever sees a definitive [`ExecutionResult`]. A `Rejected` or `Timeout`
//! result guarantees no net broker exposure was left behind (outstanding
//! remainders are cancelled before the result is returned).

mod broker;
mod executor;
mod types;

pub use broker::{with_broker_retry, BrokerGateway, HttpBroker};
pub use executor::OrderExecutor;
pub use types::{
    ExecutionResult, ExecutionStatus, OrderAck, OrderIntent, OrderSide, OrderStatusReport,
    OrderType, Quote, WireOrderStatus,
};
