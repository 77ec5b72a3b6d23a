//! Shared signal-domain types for the pyramid portfolio manager.
//!
//! Everything here is plain data: the decoded webhook directive ([`Signal`]),
//! the instrument table ([`Instrument`], [`InstrumentSpec`]), the dedup
//! fingerprint, and the clock port used by every time-dependent component.
//! No IO, no async.

mod clock;
mod fingerprint;
mod instrument;
mod signal;

pub use clock::{Clock, SystemClock};
pub use fingerprint::signal_fingerprint;
pub use instrument::{Instrument, InstrumentSpec};
pub use signal::{
    parse_webhook, EodMonitor, ParsedWebhook, Signal, SignalKind, SignalParseError, Slot,
};
