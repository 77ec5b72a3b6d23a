//! Deterministic test doubles shared by the scenario tests: a paper broker
//! with scriptable quotes and failure modes, a manually-advanced clock, and
//! signal fixture builders.
//!
//! Nothing here touches the network, the filesystem, or the wall clock.

mod fake_clock;
mod paper_broker;
mod signals;

pub use fake_clock::FakeClock;
pub use paper_broker::{PaperBroker, PaperBrokerMode};
pub use signals::SignalFixture;
