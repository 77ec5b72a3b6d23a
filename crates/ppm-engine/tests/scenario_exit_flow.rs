//! Exit handling: ALL closes every leg and realizes P&L into closed equity,
//! the pyramid metadata follows the legs (deleted when flat, base reference
//! nulled when pyramids remain), and favorable divergence never blocks an
//! exit.

mod common;

use ppm_engine::{Outcome, RejectReason};
use ppm_signal::{Instrument, Signal, SignalKind, Slot};
use ppm_testkit::SignalFixture;

#[tokio::test(start_paused = true)]
async fn exit_all_closes_the_book_and_realizes_pnl() {
    let rig = common::rig();
    let fixture = SignalFixture::new();
    rig.engine.process_signal(&fixture.base_entry()).await;

    rig.broker.set_quote(Instrument::BankNifty, 52_500.0);
    let outcome = rig.engine.process_signal(&fixture.exit_all(52_500.0)).await;
    let Outcome::Processed { result } = outcome else {
        panic!("expected Processed, got {outcome:?}");
    };
    assert_eq!(result.lots, 3);
    // (52500 - 52000) * 3 * 35
    assert_eq!(result.realized_pnl, Some(52_500.0));

    rig.engine.with_portfolio(|book| {
        assert_eq!(book.open_positions().count(), 0);
        assert_eq!(book.aggregate().closed_equity, 52_500.0);
        assert_eq!(book.equity(), 5_052_500.0);
        assert!(book.pyramid_state(Instrument::BankNifty).is_none());
        assert_eq!(book.aggregate().margin_used, 0.0);
        assert!(book.check_invariants().is_empty());
    });
}

#[tokio::test(start_paused = true)]
async fn closing_the_base_slot_keeps_pyramids_and_nulls_the_reference() {
    let rig = common::rig();
    let fixture = SignalFixture::new();
    rig.engine.process_signal(&fixture.base_entry()).await;

    rig.broker.set_quote(Instrument::BankNifty, 53_000.0);
    rig.engine
        .process_signal(&fixture.pyramid("Long_2", 53_000.0, 52_650.0))
        .await;

    // Exit only the base slot.
    let exit = Signal {
        kind: SignalKind::Exit,
        instrument: Instrument::BankNifty,
        slot: Slot::Named("Long_1".to_string()),
        price: 53_000.0,
        stop: 52_650.0,
        suggested_lots: 0,
        atr: 350.0,
        er: 0.82,
        supertrend: 51_500.0,
        roc: None,
        exit_reason: Some("base target".to_string()),
        timestamp: fixture.base_entry().timestamp,
    };
    let outcome = rig.engine.process_signal(&exit).await;
    assert!(matches!(outcome, Outcome::Processed { .. }), "got {outcome:?}");

    rig.engine.with_portfolio(|book| {
        assert_eq!(book.open_positions().count(), 1, "pyramid leg survives");
        assert!(book.base_position(Instrument::BankNifty).is_none());
        let ps = book.pyramid_state(Instrument::BankNifty).expect("kept");
        assert_eq!(ps.base_position_id, None);
        assert_eq!(ps.pyramid_count, 1);
        assert!(book.check_invariants().is_empty());
    });
}

#[tokio::test(start_paused = true)]
async fn exit_with_unfavorable_broker_price_is_refused() {
    let rig = common::rig();
    let fixture = SignalFixture::new();
    rig.engine.process_signal(&fixture.base_entry()).await;

    // Broker 1.5% under the signal: selling materially worse than assumed.
    rig.broker.set_quote(Instrument::BankNifty, 51_712.0);
    let outcome = rig.engine.process_signal(&fixture.exit_all(52_500.0)).await;
    assert!(matches!(
        outcome,
        Outcome::Rejected {
            reason: RejectReason::ExecutionValidation { .. }
        }
    ));
    rig.engine
        .with_portfolio(|book| assert_eq!(book.open_positions().count(), 1));
}

#[tokio::test(start_paused = true)]
async fn exit_without_positions_is_refused() {
    let rig = common::rig();
    let outcome = rig
        .engine
        .process_signal(&SignalFixture::new().exit_all(52_500.0))
        .await;
    assert_eq!(
        outcome,
        Outcome::Rejected {
            reason: RejectReason::NoOpenPosition
        }
    );
}
