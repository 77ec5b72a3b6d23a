use sha2::{Digest, Sha256};

use crate::signal::Signal;

/// Deterministic dedup fingerprint: SHA-256 over the canonical identifying
/// tuple (type, instrument, position, price, stop, lots, timestamp rounded
/// down to the second).
///
/// Prices are canonicalized to two decimals so `52000` and `52000.0` hash
/// identically regardless of how the upstream formatted them.
pub fn signal_fingerprint(signal: &Signal) -> String {
    let canonical = format!(
        "{}|{}|{}|{:.2}|{:.2}|{}|{}",
        signal.kind.wire_name(),
        signal.instrument.wire_name(),
        signal.slot.wire_name(),
        signal.price,
        signal.stop,
        signal.suggested_lots,
        signal.timestamp.timestamp(),
    );

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Timelike, Utc};

    use super::*;
    use crate::instrument::Instrument;
    use crate::signal::{SignalKind, Slot};

    fn signal_at(ts: DateTime<Utc>) -> Signal {
        Signal {
            kind: SignalKind::BaseEntry,
            instrument: Instrument::BankNifty,
            slot: Slot::Named("Long_1".into()),
            price: 52000.0,
            stop: 51650.0,
            suggested_lots: 3,
            atr: 350.0,
            er: 0.82,
            supertrend: 51500.0,
            roc: None,
            exit_reason: None,
            timestamp: ts,
        }
    }

    #[test]
    fn identical_signals_share_a_fingerprint() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 5).unwrap();
        assert_eq!(
            signal_fingerprint(&signal_at(ts)),
            signal_fingerprint(&signal_at(ts))
        );
    }

    #[test]
    fn sub_second_jitter_does_not_change_the_fingerprint() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 5).unwrap();
        let jittered = ts.with_nanosecond(730_000_000).unwrap();
        assert_eq!(
            signal_fingerprint(&signal_at(ts)),
            signal_fingerprint(&signal_at(jittered))
        );
    }

    #[test]
    fn price_change_changes_the_fingerprint() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 5).unwrap();
        let mut other = signal_at(ts);
        other.price = 52005.0;
        assert_ne!(
            signal_fingerprint(&signal_at(ts)),
            signal_fingerprint(&other)
        );
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 14, 9, 32, 5).unwrap();
        let fp = signal_fingerprint(&signal_at(ts));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
