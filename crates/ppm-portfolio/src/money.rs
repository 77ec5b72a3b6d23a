/// One paisa. Aggregate reconciliation and recovery validation treat two
/// amounts as equal when they differ by no more than this.
pub const MONEY_EPSILON: f64 = 0.01;

/// Equality within one paisa (plus float dust).
pub fn approx_eq_money(a: f64, b: f64) -> bool {
    (a - b).abs() <= MONEY_EPSILON + 1e-9
}

/// Round to whole paise. Applied before amounts are persisted so that a
/// recovered value compares clean against a recomputed one.
pub fn round_paise(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epsilon_comparison() {
        assert!(approx_eq_money(100.0, 100.01));
        assert!(approx_eq_money(100.0, 100.0));
        assert!(!approx_eq_money(100.0, 100.02));
    }

    #[test]
    fn paise_rounding() {
        assert_eq!(round_paise(12.3456), 12.35);
        assert_eq!(round_paise(-0.005), -0.01);
    }
}
