//! Leadership lost between the dedup claim and the market-facing steps: the
//! re-check catches it, the response is rejected with `lost_leadership`, and
//! neither the broker nor the book is touched.

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ppm_engine::{LeaderGate, Outcome, RejectReason};
use ppm_testkit::SignalFixture;

/// Answers a scripted sequence of leadership checks, then repeats the last.
struct ScriptedGate {
    answers: Mutex<VecDeque<bool>>,
}

impl ScriptedGate {
    fn new(answers: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().copied().collect()),
        })
    }
}

impl LeaderGate for ScriptedGate {
    fn is_leader(&self) -> bool {
        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            answers.pop_front().unwrap()
        } else {
            *answers.front().expect("script never empty")
        }
    }
}

#[tokio::test(start_paused = true)]
async fn follower_rejects_immediately() {
    let rig = common::rig_with_gate(Some(ScriptedGate::new(&[false])));
    let outcome = rig
        .engine
        .process_signal(&SignalFixture::new().base_entry())
        .await;
    assert_eq!(
        outcome,
        Outcome::Rejected {
            reason: RejectReason::NotLeader
        }
    );
    assert_eq!(rig.broker.order_count(), 0);
    assert_eq!(rig.broker.quote_call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn leadership_loss_across_the_dedup_write_aborts_cleanly() {
    // Leader for the admission check, follower by the re-check.
    let rig = common::rig_with_gate(Some(ScriptedGate::new(&[true, false])));
    let outcome = rig
        .engine
        .process_signal(&SignalFixture::new().base_entry())
        .await;
    assert_eq!(
        outcome,
        Outcome::Rejected {
            reason: RejectReason::LostLeadership
        }
    );

    // No broker traffic, no position, no aggregate movement.
    assert_eq!(rig.broker.order_count(), 0);
    assert_eq!(rig.broker.quote_call_count(), 0);
    rig.engine.with_portfolio(|book| {
        assert_eq!(book.open_positions().count(), 0);
        assert_eq!(book.aggregate().total_risk_amount, 0.0);
        assert_eq!(book.aggregate().margin_used, 0.0);
    });
}
