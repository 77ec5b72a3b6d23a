//! The live engine: parse → validate → size → gate → execute → persist, one
//! signal at a time per instrument, concurrently across instruments.
//!
//! The same engine object drives both modes: live (webhook-fed, real broker,
//! persistence and leader gate attached) and backtest (signal file, paper
//! broker, fake clock, no persistence).

mod backtest;
mod engine;
mod locks;
mod outcome;

pub use backtest::{backtest_handles, run_backtest, BacktestReport};
pub use engine::{EngineHandles, LiveEngine, MarketTick};
pub use locks::InstrumentLocks;
pub use outcome::{LeaderGate, Outcome, ProcessedSummary, RejectReason};
