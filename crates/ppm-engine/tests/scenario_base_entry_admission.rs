//! Bank Nifty base entry at the reference numbers: 5,000,000 equity, 1%
//! risk, ER 0.82, entry 52000 / stop 51650 sizes to exactly 3 lots (LotR
//! binds; LotM is 11), one position lands, pyramid metadata starts at the
//! entry price.

mod common;

use ppm_engine::{Outcome, RejectReason};
use ppm_signal::Instrument;
use ppm_testkit::SignalFixture;

#[tokio::test(start_paused = true)]
async fn base_entry_sizes_to_three_lots_and_opens_the_book() {
    let rig = common::rig();
    let signal = SignalFixture::new().base_entry();

    let outcome = rig.engine.process_signal(&signal).await;
    let Outcome::Processed { result } = outcome else {
        panic!("expected Processed, got {outcome:?}");
    };
    assert_eq!(result.lots, 3);
    assert_eq!(result.fill_price, Some(52_000.0));
    assert!(!result.validation_bypassed);

    rig.engine.with_portfolio(|book| {
        assert_eq!(book.open_positions().count(), 1);
        let base = book.base_position(Instrument::BankNifty).expect("base leg");
        assert!(base.is_base_position);
        assert_eq!(base.lots, 3);
        assert_eq!(base.entry_price, 52_000.0);
        assert_eq!(base.current_stop, 51_650.0);

        let ps = book.pyramid_state(Instrument::BankNifty).expect("metadata");
        assert_eq!(ps.pyramid_count, 0);
        assert_eq!(ps.last_pyramid_price, 52_000.0);
        assert_eq!(ps.base_position_id.as_ref(), Some(&base.id));

        // (52000-51650) * 3 * 35
        assert_eq!(book.aggregate().total_risk_amount, 36_750.0);
        assert!(book.check_invariants().is_empty());
    });
}

#[tokio::test(start_paused = true)]
async fn second_base_entry_for_the_instrument_is_refused() {
    let rig = common::rig();
    let signal = SignalFixture::new().base_entry();

    rig.engine.process_signal(&signal).await;

    // New fingerprint (different price), same instrument: still refused.
    let mut second = signal.clone();
    second.price = 52_050.0;
    let outcome = rig.engine.process_signal(&second).await;
    assert_eq!(
        outcome,
        Outcome::Rejected {
            reason: RejectReason::BaseAlreadyOpen
        }
    );
    rig.engine
        .with_portfolio(|book| assert_eq!(book.open_positions().count(), 1));
}

#[tokio::test(start_paused = true)]
async fn margin_floor_rejects_below_size_floor() {
    // Capital whose 60% margin cap (240,000) cannot afford one 270,000 lot.
    let mut cfg = common::test_config();
    cfg.initial_capital = 400_000.0;
    let rig = common::rig_with_cfg(cfg);

    let outcome = rig
        .engine
        .process_signal(&SignalFixture::new().base_entry())
        .await;
    assert_eq!(
        outcome,
        Outcome::Rejected {
            reason: RejectReason::BelowSizeFloor
        }
    );
    rig.engine
        .with_portfolio(|book| assert_eq!(book.open_positions().count(), 0));
}
