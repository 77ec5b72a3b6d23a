#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use ppm_config::AppConfig;
use ppm_engine::{EngineHandles, LeaderGate, LiveEngine};
use ppm_portfolio::PortfolioState;
use ppm_signal::Instrument;
use ppm_testkit::{FakeClock, PaperBroker};
use ppm_validate::ValidatorMetrics;

pub struct Rig {
    pub engine: LiveEngine,
    pub broker: Arc<PaperBroker>,
    pub clock: Arc<FakeClock>,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        initial_capital: 5_000_000.0,
        risk: Default::default(),
        execution: Default::default(),
        validation: Default::default(),
        ha: Default::default(),
        pipeline: Default::default(),
        db: Default::default(),
        instruments: BTreeMap::new(),
    }
}

pub fn rig() -> Rig {
    build_rig(test_config(), None)
}

pub fn rig_with_cfg(cfg: AppConfig) -> Rig {
    build_rig(cfg, None)
}

pub fn rig_with_gate(leader: Option<Arc<dyn LeaderGate>>) -> Rig {
    build_rig(test_config(), leader)
}

fn build_rig(cfg: AppConfig, leader: Option<Arc<dyn LeaderGate>>) -> Rig {
    let broker = Arc::new(PaperBroker::new());
    broker.set_quote(Instrument::BankNifty, 52_000.0);
    let clock = Arc::new(FakeClock::new());

    let specs: BTreeMap<_, _> = Instrument::ALL
        .iter()
        .map(|i| (*i, cfg.instrument_spec(*i)))
        .collect();
    let portfolio = PortfolioState::new(cfg.initial_capital, specs);

    let engine = LiveEngine::new(
        cfg,
        portfolio,
        EngineHandles {
            broker: Arc::clone(&broker) as _,
            clock: Arc::clone(&clock) as _,
            persistence: None,
            leader,
            metrics: Arc::new(ValidatorMetrics::new()),
            instance_id: "test-instance-1".to_string(),
        },
    );
    Rig {
        engine,
        broker,
        clock,
    }
}
