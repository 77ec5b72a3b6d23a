//! Recovery round-trip: a persisted book with two open legs and one pyramid
//! comes back with rollups that reconcile to the paisa, and corruption /
//! drift in the stored rows is refused.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use ppm_portfolio::{PortfolioAggregate, Position, PositionId, PositionStatus, PyramidState};
use ppm_recovery::{load_state, load_state_or_empty, RecoveryError, StateStore};
use ppm_signal::{Instrument, InstrumentSpec, Slot};

struct MemStore {
    positions: HashMap<PositionId, Position>,
    pyramids: HashMap<Instrument, PyramidState>,
    aggregate: Option<PortfolioAggregate>,
    statuses: Mutex<Vec<String>>,
    unavailable: bool,
}

#[async_trait]
impl StateStore for MemStore {
    async fn open_positions(&self) -> Result<HashMap<PositionId, Position>> {
        if self.unavailable {
            anyhow::bail!("connection refused");
        }
        Ok(self.positions.clone())
    }

    async fn pyramid_states(&self) -> Result<HashMap<Instrument, PyramidState>> {
        Ok(self.pyramids.clone())
    }

    async fn aggregate(&self) -> Result<Option<PortfolioAggregate>> {
        Ok(self.aggregate.clone())
    }

    async fn set_instance_status(&self, _instance_id: &str, status: &str) -> Result<()> {
        self.statuses.lock().unwrap().push(status.to_string());
        Ok(())
    }
}

fn specs() -> BTreeMap<Instrument, InstrumentSpec> {
    let mut m = BTreeMap::new();
    m.insert(
        Instrument::BankNifty,
        InstrumentSpec::default_for(Instrument::BankNifty),
    );
    m
}

fn leg(id: &str, slot: &str, is_base: bool, entry: f64, stop: f64, lots: i64) -> Position {
    Position {
        id: PositionId::from_raw(id),
        instrument: Instrument::BankNifty,
        slot: Slot::Named(slot.to_string()),
        is_base_position: is_base,
        entry_price: entry,
        initial_stop: stop,
        current_stop: stop,
        highest_close: None,
        lots,
        atr_at_entry: 350.0,
        pe_entry_price: None,
        ce_entry_price: None,
        status: PositionStatus::Open,
        opened_at: Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 5).unwrap(),
        closed_at: None,
        realized_pnl: None,
        version: 2,
    }
}

fn consistent_store() -> MemStore {
    let base = leg("BANK_NIFTY:Long_1:1", "Long_1", true, 52_000.0, 51_650.0, 3);
    let pyramid = leg("BANK_NIFTY:Long_2:2", "Long_2", false, 52_400.0, 52_050.0, 1);

    // risk = 350*3*35 + 350*1*35 = 49000; vol = same; margin = 4*270000.
    let aggregate = PortfolioAggregate {
        initial_capital: 5_000_000.0,
        closed_equity: 0.0,
        total_risk_amount: 49_000.0,
        total_vol_amount: 49_000.0,
        margin_used: 1_080_000.0,
        version: 7,
    };
    let mut positions = HashMap::new();
    let base_id = base.id.clone();
    positions.insert(base.id.clone(), base);
    positions.insert(pyramid.id.clone(), pyramid);

    let mut pyramids = HashMap::new();
    pyramids.insert(
        Instrument::BankNifty,
        PyramidState {
            last_pyramid_price: 52_400.0,
            base_position_id: Some(base_id),
            pyramid_count: 1,
        },
    );

    MemStore {
        positions,
        pyramids,
        aggregate: Some(aggregate),
        statuses: Mutex::new(Vec::new()),
        unavailable: false,
    }
}

#[tokio::test]
async fn recovered_book_reconciles_and_activates() {
    let store = consistent_store();
    let book = load_state(&store, Some("inst:1"), 5_000_000.0, specs())
        .await
        .expect("recovery succeeds");

    assert_eq!(book.open_positions().count(), 2);
    assert_eq!(book.aggregate().total_risk_amount, 49_000.0);
    assert_eq!(book.aggregate().version, 7);
    let ps = book.pyramid_state(Instrument::BankNifty).expect("state");
    assert_eq!(ps.pyramid_count, 1);
    assert_eq!(ps.last_pyramid_price, 52_400.0);

    assert_eq!(
        *store.statuses.lock().unwrap(),
        vec!["recovering".to_string(), "active".to_string()]
    );
}

#[tokio::test]
async fn aggregate_drift_is_validation_failure() {
    let mut store = consistent_store();
    store.aggregate.as_mut().unwrap().total_risk_amount += 5.0;

    match load_state(&store, None, 5_000_000.0, specs()).await {
        Err(RecoveryError::ValidationFailed(msg)) => {
            assert!(msg.contains("total_risk_amount"), "got: {msg}")
        }
        Err(other) => panic!("expected ValidationFailed, got {other:?}"),
        Ok(_) => panic!("expected ValidationFailed, got a recovered book"),
    }
}

#[tokio::test]
async fn orphaned_pyramid_reference_is_corruption() {
    let mut store = consistent_store();
    store
        .pyramids
        .get_mut(&Instrument::BankNifty)
        .unwrap()
        .base_position_id = Some(PositionId::from_raw("BANK_NIFTY:Long_9:999"));

    match load_state(&store, None, 5_000_000.0, specs()).await {
        Err(RecoveryError::DataCorrupt(msg)) => assert!(msg.contains("Long_9"), "got: {msg}"),
        Err(other) => panic!("expected DataCorrupt, got {other:?}"),
        Ok(_) => panic!("expected DataCorrupt, got a recovered book"),
    }
}

#[tokio::test]
async fn positions_without_aggregate_row_is_corruption() {
    let mut store = consistent_store();
    store.aggregate = None;

    assert!(matches!(
        load_state(&store, None, 5_000_000.0, specs()).await,
        Err(RecoveryError::DataCorrupt(_))
    ));
}

#[tokio::test]
async fn unavailable_db_allows_an_empty_start() {
    let mut store = consistent_store();
    store.unavailable = true;

    let book = load_state_or_empty(&store, None, 5_000_000.0, specs())
        .await
        .expect("empty start permitted");
    assert_eq!(book.open_positions().count(), 0);
    assert_eq!(book.equity(), 5_000_000.0);
}

#[tokio::test]
async fn recovery_replaces_rather_than_merges() {
    // Second invocation against an empty store wipes a previously loaded book.
    let empty = MemStore {
        positions: HashMap::new(),
        pyramids: HashMap::new(),
        aggregate: Some(PortfolioAggregate::new(5_000_000.0)),
        statuses: Mutex::new(Vec::new()),
        unavailable: false,
    };
    let book = load_state(&empty, None, 5_000_000.0, specs())
        .await
        .expect("empty load");
    assert_eq!(book.open_positions().count(), 0);
}
