use std::fmt;

use serde::{Deserialize, Serialize};

/// Tradable instruments. Wire names match the charting platform's alert
/// payloads exactly (`BANK_NIFTY`, `GOLD_MINI`, ...).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Instrument {
    BankNifty,
    Nifty,
    GoldMini,
    SilverMini,
}

impl Instrument {
    pub const ALL: [Instrument; 4] = [
        Instrument::BankNifty,
        Instrument::Nifty,
        Instrument::GoldMini,
        Instrument::SilverMini,
    ];

    /// Wire name as it appears in webhook payloads and DB rows.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Instrument::BankNifty => "BANK_NIFTY",
            Instrument::Nifty => "NIFTY",
            Instrument::GoldMini => "GOLD_MINI",
            Instrument::SilverMini => "SILVER_MINI",
        }
    }

    pub fn from_wire(s: &str) -> Option<Instrument> {
        Instrument::ALL.iter().copied().find(|i| i.wire_name() == s)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Per-instrument contract parameters. Loaded from config; the defaults here
/// are the exchange values current at the time of writing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub lot_size: i64,
    /// Rupee value of one point of price movement per lot.
    pub point_value: f64,
    /// Exchange margin blocked per lot.
    pub margin_per_lot: f64,
    /// True when the "long" is carried as a synthetic future (short PE +
    /// long CE); positions then track the two option-leg entry prices.
    pub synthetic_long: bool,
}

impl InstrumentSpec {
    pub fn default_for(instrument: Instrument) -> Self {
        match instrument {
            Instrument::BankNifty => Self {
                lot_size: 35,
                point_value: 35.0,
                margin_per_lot: 270_000.0,
                synthetic_long: true,
            },
            Instrument::Nifty => Self {
                lot_size: 75,
                point_value: 75.0,
                margin_per_lot: 156_000.0,
                synthetic_long: true,
            },
            Instrument::GoldMini => Self {
                lot_size: 100,
                point_value: 10.0,
                margin_per_lot: 76_000.0,
                synthetic_long: false,
            },
            Instrument::SilverMini => Self {
                lot_size: 5,
                point_value: 5.0,
                margin_per_lot: 62_000.0,
                synthetic_long: false,
            },
        }
    }
}
