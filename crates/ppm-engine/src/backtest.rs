use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use ppm_config::AppConfig;
use ppm_portfolio::PortfolioState;
use ppm_signal::{parse_webhook, Instrument, ParsedWebhook};
use ppm_validate::ValidatorMetrics;

use crate::engine::{EngineHandles, LiveEngine};
use crate::outcome::Outcome;

/// What the backtest driver did with the replayed stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BacktestReport {
    pub signals_read: u64,
    pub processed: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub parse_failures: u64,
    pub closed_equity: f64,
    pub final_equity: f64,
    pub open_positions: usize,
}

/// Replay a JSONL signal file through the live decision logic.
///
/// The engine runs with the caller-supplied broker/clock handles (paper
/// broker + fake clock from ppm-testkit in practice), no persistence, no
/// leader gate. Signals are consumed strictly in file order; the clock is
/// pinned to each signal's own timestamp so age tiering never interferes,
/// and the caller's clock hook can observe each step.
pub async fn run_backtest(
    cfg: AppConfig,
    signals_path: &Path,
    handles: EngineHandles,
    on_signal: impl Fn(&ppm_signal::Signal),
) -> Result<BacktestReport> {
    let specs: BTreeMap<_, _> = Instrument::ALL
        .iter()
        .map(|i| (*i, cfg.instrument_spec(*i)))
        .collect();
    let portfolio = PortfolioState::new(cfg.initial_capital, specs);
    let engine = LiveEngine::new(cfg, portfolio, handles);

    let file = File::open(signals_path)
        .with_context(|| format!("open signal file {}", signals_path.display()))?;
    let reader = BufReader::new(file);

    let mut report = BacktestReport::default();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("read signal file line")?;
        if line.trim().is_empty() {
            continue;
        }
        report.signals_read += 1;

        let body: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(lineno, error = %e, "skipping malformed signal line");
                report.parse_failures += 1;
                continue;
            }
        };
        let signal = match parse_webhook(&body) {
            Ok(ParsedWebhook::Trading(s)) => s,
            Ok(ParsedWebhook::Monitor(_)) => continue,
            Err(e) => {
                warn!(lineno, error = %e, "skipping contract-violating signal");
                report.parse_failures += 1;
                continue;
            }
        };

        on_signal(&signal);
        match engine.process_signal(&signal).await {
            Outcome::Processed { .. } => report.processed += 1,
            Outcome::Rejected { .. } => report.rejected += 1,
            Outcome::Duplicate => report.duplicates += 1,
            Outcome::Ignored => {}
        }
    }

    engine.with_portfolio(|book| {
        report.closed_equity = book.aggregate().closed_equity;
        report.final_equity = book.equity();
        report.open_positions = book.open_positions().count();
    });
    info!(?report, "backtest complete");
    Ok(report)
}

/// Convenience handles for a persistence-less backtest run.
pub fn backtest_handles(
    broker: Arc<dyn ppm_execution::BrokerGateway>,
    clock: Arc<dyn ppm_signal::Clock>,
) -> EngineHandles {
    EngineHandles {
        broker,
        clock,
        persistence: None,
        leader: None,
        metrics: Arc::new(ValidatorMetrics::new()),
        instance_id: "backtest-0".to_string(),
    }
}
