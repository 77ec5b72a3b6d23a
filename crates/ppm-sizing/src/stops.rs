/// Monotonic trailing-stop ratchet for a long position.
///
/// Candidate = highest_close − trail_atr_mult × ATR. Returns `Some(new_stop)`
/// only when the candidate strictly improves on `current_stop`; the stop
/// never moves down and never below the initial stop.
pub fn ratchet_trailing_stop(
    current_stop: f64,
    highest_close: f64,
    atr: f64,
    trail_atr_mult: f64,
) -> Option<f64> {
    if atr <= 0.0 || trail_atr_mult <= 0.0 {
        return None;
    }
    let candidate = highest_close - trail_atr_mult * atr;
    if candidate > current_stop {
        Some(candidate)
    } else {
        None
    }
}
