use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use ppm_signal::Instrument;

/// Per-instrument serialization: one async mutex per instrument, created up
/// front so lock acquisition never allocates on the hot path.
///
/// The lock is held across Stage-2 validation, sizing, the executor call,
/// and persistence, which makes an instrument's book updates linearizable;
/// distinct instruments proceed concurrently.
pub struct InstrumentLocks {
    locks: HashMap<Instrument, Arc<Mutex<()>>>,
}

impl InstrumentLocks {
    pub fn new() -> Self {
        let locks = Instrument::ALL
            .iter()
            .map(|i| (*i, Arc::new(Mutex::new(()))))
            .collect();
        Self { locks }
    }

    pub fn for_instrument(&self, instrument: Instrument) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .get(&instrument)
                .expect("every instrument has a lock"),
        )
    }
}

impl Default for InstrumentLocks {
    fn default() -> Self {
        Self::new()
    }
}
