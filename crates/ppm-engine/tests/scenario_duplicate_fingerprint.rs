//! Sending the identical payload twice inside the dedup window: the first
//! processes, the second answers `duplicate`, and exactly one position
//! exists afterwards.

mod common;

use ppm_engine::Outcome;
use ppm_testkit::SignalFixture;

#[tokio::test(start_paused = true)]
async fn second_identical_signal_is_a_duplicate() {
    let rig = common::rig();
    let signal = SignalFixture::new().base_entry();

    let first = rig.engine.process_signal(&signal).await;
    assert!(matches!(first, Outcome::Processed { ref result } if result.lots == 3));

    let second = rig.engine.process_signal(&signal).await;
    assert_eq!(second, Outcome::Duplicate);

    rig.engine
        .with_portfolio(|book| assert_eq!(book.open_positions().count(), 1));
    // Only the first attempt reached the broker.
    assert_eq!(rig.broker.order_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn sub_second_timestamp_jitter_still_deduplicates() {
    let rig = common::rig();
    let signal = SignalFixture::new().base_entry();

    rig.engine.process_signal(&signal).await;

    let mut jittered = signal.clone();
    jittered.timestamp = signal.timestamp + chrono::Duration::milliseconds(400);
    assert_eq!(rig.engine.process_signal(&jittered).await, Outcome::Duplicate);
}

#[tokio::test(start_paused = true)]
async fn different_price_is_not_a_duplicate() {
    let rig = common::rig();
    let fixture = SignalFixture::new();

    rig.engine.process_signal(&fixture.base_entry()).await;

    let mut different = fixture.base_entry();
    different.price = 52_010.0;
    // Same instrument already has a base: rejected, but NOT as a duplicate.
    let outcome = rig.engine.process_signal(&different).await;
    assert!(!matches!(outcome, Outcome::Duplicate), "got {outcome:?}");
}
