use chrono::{DateTime, TimeZone, Utc};

use ppm_signal::{Instrument, Signal, SignalKind, Slot};

/// Builder for the Bank Nifty reference signals used across the scenario
/// tests (entry 52000 / stop 51650 / ATR 350 / ER 0.82).
pub struct SignalFixture {
    ts: DateTime<Utc>,
}

impl SignalFixture {
    pub fn new() -> Self {
        Self {
            ts: Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 5).unwrap(),
        }
    }

    pub fn at(ts: DateTime<Utc>) -> Self {
        Self { ts }
    }

    pub fn base_entry(&self) -> Signal {
        Signal {
            kind: SignalKind::BaseEntry,
            instrument: Instrument::BankNifty,
            slot: Slot::Named("Long_1".to_string()),
            price: 52_000.0,
            stop: 51_650.0,
            suggested_lots: 3,
            atr: 350.0,
            er: 0.82,
            supertrend: 51_500.0,
            roc: None,
            exit_reason: None,
            timestamp: self.ts,
        }
    }

    pub fn pyramid(&self, slot: &str, price: f64, stop: f64) -> Signal {
        Signal {
            kind: SignalKind::Pyramid,
            instrument: Instrument::BankNifty,
            slot: Slot::Named(slot.to_string()),
            price,
            stop,
            suggested_lots: 1,
            atr: 350.0,
            er: 0.82,
            supertrend: 51_500.0,
            roc: None,
            exit_reason: None,
            timestamp: self.ts,
        }
    }

    pub fn exit_all(&self, price: f64) -> Signal {
        Signal {
            kind: SignalKind::Exit,
            instrument: Instrument::BankNifty,
            slot: Slot::All,
            price,
            stop: price - 350.0,
            suggested_lots: 0,
            atr: 350.0,
            er: 0.82,
            supertrend: 51_500.0,
            roc: None,
            exit_reason: Some("trail hit".to_string()),
            timestamp: self.ts,
        }
    }
}

impl Default for SignalFixture {
    fn default() -> Self {
        Self::new()
    }
}
