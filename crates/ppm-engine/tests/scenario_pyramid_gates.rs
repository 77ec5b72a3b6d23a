//! The two pyramid refusals from the strategy's reference walk-through:
//! an entry 100 points up is blocked by the spacing gate, and an entry 400
//! points up clears every gate but sizes to zero because accumulated profit
//! (42,000) barely exceeds the base risk (36,750).

mod common;

use ppm_engine::{Outcome, RejectReason};
use ppm_signal::Instrument;
use ppm_testkit::SignalFixture;

#[tokio::test(start_paused = true)]
async fn pyramid_too_close_is_blocked_by_the_instrument_gate() {
    let rig = common::rig();
    let fixture = SignalFixture::new();
    rig.engine.process_signal(&fixture.base_entry()).await;

    // Distance 100 < max(initial_R 350, 1.0 × ATR 350).
    let outcome = rig
        .engine
        .process_signal(&fixture.pyramid("Long_2", 52_100.0, 51_850.0))
        .await;
    match outcome {
        Outcome::Rejected {
            reason: RejectReason::Gate { gate, .. },
        } => assert_eq!(gate, "instrument_gate"),
        other => panic!("expected an instrument_gate rejection, got {other:?}"),
    }

    rig.engine.with_portfolio(|book| {
        assert_eq!(book.open_positions().count(), 1);
        let ps = book.pyramid_state(Instrument::BankNifty).expect("metadata");
        // A rejected pyramid must not advance the spacing reference.
        assert_eq!(ps.last_pyramid_price, 52_000.0);
        assert_eq!(ps.pyramid_count, 0);
    });
}

#[tokio::test(start_paused = true)]
async fn pyramid_with_thin_profit_sizes_to_zero() {
    let rig = common::rig();
    let fixture = SignalFixture::new();
    rig.engine.process_signal(&fixture.base_entry()).await;

    // Distance 400 clears the spacing gate; the broker agrees with the
    // signal price so the sizer sees accumulated_profit = 42,000 against
    // base_risk = 36,750 -> LotC = floor(2625 / 12250) = 0.
    rig.broker.set_quote(Instrument::BankNifty, 52_400.0);
    let outcome = rig
        .engine
        .process_signal(&fixture.pyramid("Long_2", 52_400.0, 52_050.0))
        .await;
    assert_eq!(
        outcome,
        Outcome::Rejected {
            reason: RejectReason::BelowSizeFloor
        }
    );

    rig.engine.with_portfolio(|book| {
        assert_eq!(book.open_positions().count(), 1);
        assert_eq!(
            book.pyramid_state(Instrument::BankNifty)
                .expect("metadata")
                .last_pyramid_price,
            52_000.0
        );
    });
}

#[tokio::test(start_paused = true)]
async fn pyramid_with_banked_profit_fills_and_advances_metadata() {
    let rig = common::rig();
    let fixture = SignalFixture::new();
    rig.engine.process_signal(&fixture.base_entry()).await;

    // 1000 points of excursion: profit 105,000 >> base risk 36,750.
    // LotC = floor((68,250 × 0.5) / 12,250) = 2, LotB = floor(3 × 0.5) = 1.
    rig.broker.set_quote(Instrument::BankNifty, 53_000.0);
    let outcome = rig
        .engine
        .process_signal(&fixture.pyramid("Long_2", 53_000.0, 52_650.0))
        .await;
    let Outcome::Processed { result } = outcome else {
        panic!("expected a fill, got {outcome:?}");
    };
    assert_eq!(result.lots, 1);

    rig.engine.with_portfolio(|book| {
        assert_eq!(book.open_positions().count(), 2);
        let ps = book.pyramid_state(Instrument::BankNifty).expect("metadata");
        assert_eq!(ps.pyramid_count, 1);
        assert_eq!(ps.last_pyramid_price, 53_000.0);
        assert!(book.check_invariants().is_empty());
    });
}

#[tokio::test(start_paused = true)]
async fn pyramid_without_a_base_is_refused() {
    let rig = common::rig();
    let outcome = rig
        .engine
        .process_signal(&SignalFixture::new().pyramid("Long_2", 52_400.0, 52_050.0))
        .await;
    assert_eq!(
        outcome,
        Outcome::Rejected {
            reason: RejectReason::NoBasePosition
        }
    );
}
