//! After every fully-processed signal, the recomputed rollups must match
//! the aggregate to the paisa and the structural invariants must hold:
//! a whole campaign (base, two pyramids, partial exit, flat) is walked with
//! the sweep asserted at each step.

mod common;

use ppm_signal::{Instrument, Signal, SignalKind, Slot};
use ppm_testkit::SignalFixture;

fn assert_clean(rig: &common::Rig, step: &str) {
    rig.engine.with_portfolio(|book| {
        let violations = book.check_invariants();
        assert!(violations.is_empty(), "{step}: {violations:?}");
    });
}

#[tokio::test(start_paused = true)]
async fn full_campaign_keeps_the_book_reconciled() {
    let rig = common::rig();
    let fixture = SignalFixture::new();

    rig.engine.process_signal(&fixture.base_entry()).await;
    assert_clean(&rig, "after base entry");

    // First pyramid: 1000 points up, banked profit well past base risk.
    rig.broker.set_quote(Instrument::BankNifty, 53_000.0);
    rig.engine
        .process_signal(&fixture.pyramid("Long_2", 53_000.0, 52_650.0))
        .await;
    assert_clean(&rig, "after first pyramid");

    // Second pyramid attempt de-escalates to zero lots (LotB = floor(3·0.25))
    // ... still a valid, reconciled book after the rejection.
    rig.broker.set_quote(Instrument::BankNifty, 53_500.0);
    rig.engine
        .process_signal(&fixture.pyramid("Long_3", 53_500.0, 53_150.0))
        .await;
    assert_clean(&rig, "after second pyramid attempt");

    // Exit the base slot only.
    let base_exit = Signal {
        kind: SignalKind::Exit,
        instrument: Instrument::BankNifty,
        slot: Slot::Named("Long_1".to_string()),
        price: 53_500.0,
        stop: 53_150.0,
        suggested_lots: 0,
        atr: 350.0,
        er: 0.82,
        supertrend: 51_500.0,
        roc: None,
        exit_reason: Some("base target".to_string()),
        timestamp: fixture.base_entry().timestamp,
    };
    rig.engine.process_signal(&base_exit).await;
    assert_clean(&rig, "after base exit");

    // Flatten everything that remains.
    rig.engine.process_signal(&fixture.exit_all(53_500.0)).await;
    assert_clean(&rig, "after exit all");

    rig.engine.with_portfolio(|book| {
        assert_eq!(book.open_positions().count(), 0);
        assert!(book.pyramid_state(Instrument::BankNifty).is_none());
        // Base: (53500-52000)*3*35 = 157500; pyramid: (53500-53000)*1*35 = 17500.
        assert_eq!(book.aggregate().closed_equity, 175_000.0);
        assert_eq!(book.aggregate().total_risk_amount, 0.0);
        assert_eq!(book.aggregate().margin_used, 0.0);
    });
}
