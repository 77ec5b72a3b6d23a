use std::fmt;

use serde::{Deserialize, Serialize};

use ppm_config::RiskLimitsConfig;

/// Everything the pyramid gate needs to answer "may this pyramid admit?".
/// The caller pre-computes the hypothetical portfolio rollups so the gate
/// stays a pure predicate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PyramidGateContext {
    /// New signal's entry price.
    pub price: f64,
    /// Price of the previous admitted entry on this instrument.
    pub last_pyramid_price: f64,
    /// The base trade's initial risk distance in points (entry − initial stop).
    pub initial_r: f64,
    pub atr: f64,
    /// Portfolio equity (initial capital + closed equity).
    pub equity: f64,
    /// Portfolio risk amount AFTER hypothetically admitting this pyramid.
    pub hypothetical_risk: f64,
    /// Portfolio volatility amount after hypothetical admission.
    pub hypothetical_vol: f64,
    /// Portfolio margin usage after hypothetical admission.
    pub hypothetical_margin: f64,
    /// Instrument-level unrealized P&L right now.
    pub instrument_unrealized_pnl: f64,
}

/// Why a pyramid was (or was not) admitted. Rendered to a stable snake_case
/// code for the webhook response and log fields.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum GateReason {
    Admitted,
    /// Too close to the previous entry: distance < max(initial_R, mult × ATR).
    InstrumentSpacing { distance: f64, required: f64 },
    RiskCapExceeded { pct: f64, cap: f64 },
    VolCapExceeded { pct: f64, cap: f64 },
    MarginCapExceeded { pct: f64, cap: f64 },
    /// Instrument not in profit; pyramids only ever add to winners.
    NotInProfit { unrealized_pnl: f64 },
}

impl GateReason {
    pub fn code(&self) -> &'static str {
        match self {
            GateReason::Admitted => "admitted",
            GateReason::InstrumentSpacing { .. } => "instrument_gate",
            GateReason::RiskCapExceeded { .. } => "risk_cap",
            GateReason::VolCapExceeded { .. } => "vol_cap",
            GateReason::MarginCapExceeded { .. } => "margin_cap",
            GateReason::NotInProfit { .. } => "profit_gate",
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateReason::Admitted => f.write_str("admitted"),
            GateReason::InstrumentSpacing { distance, required } => {
                write!(f, "instrument_gate: distance {distance:.2} < required {required:.2}")
            }
            GateReason::RiskCapExceeded { pct, cap } => {
                write!(f, "risk_cap: {:.2}% > {:.2}%", pct * 100.0, cap * 100.0)
            }
            GateReason::VolCapExceeded { pct, cap } => {
                write!(f, "vol_cap: {:.2}% > {:.2}%", pct * 100.0, cap * 100.0)
            }
            GateReason::MarginCapExceeded { pct, cap } => {
                write!(f, "margin_cap: {:.2}% > {:.2}%", pct * 100.0, cap * 100.0)
            }
            GateReason::NotInProfit { unrealized_pnl } => {
                write!(f, "profit_gate: unrealized {unrealized_pnl:.2} <= 0")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateDecision {
    pub admit: bool,
    pub reason: GateReason,
}

impl GateDecision {
    fn reject(reason: GateReason) -> Self {
        Self {
            admit: false,
            reason,
        }
    }
}

/// Three gates in fixed order; the first failure wins.
///
/// 1. Instrument spacing: the new entry must sit at least
///    max(initial_R, atr_spacing_mult × ATR) above the previous one.
/// 2. Portfolio caps, evaluated on the hypothetical post-admission rollups.
/// 3. Profit: the instrument must be in unrealized profit.
pub fn evaluate_pyramid_gate(limits: &RiskLimitsConfig, ctx: &PyramidGateContext) -> GateDecision {
    let distance = ctx.price - ctx.last_pyramid_price;
    let required = ctx.initial_r.max(limits.atr_spacing_mult * ctx.atr);
    if distance < required {
        return GateDecision::reject(GateReason::InstrumentSpacing { distance, required });
    }

    if ctx.equity > 0.0 {
        let risk_pct = ctx.hypothetical_risk / ctx.equity;
        if risk_pct > limits.risk_cap_pct {
            return GateDecision::reject(GateReason::RiskCapExceeded {
                pct: risk_pct,
                cap: limits.risk_cap_pct,
            });
        }
        let vol_pct = ctx.hypothetical_vol / ctx.equity;
        if vol_pct > limits.vol_cap_pct {
            return GateDecision::reject(GateReason::VolCapExceeded {
                pct: vol_pct,
                cap: limits.vol_cap_pct,
            });
        }
        let margin_pct = ctx.hypothetical_margin / ctx.equity;
        if margin_pct > limits.margin_cap_pct {
            return GateDecision::reject(GateReason::MarginCapExceeded {
                pct: margin_pct,
                cap: limits.margin_cap_pct,
            });
        }
    }

    if ctx.instrument_unrealized_pnl <= 0.0 {
        return GateDecision::reject(GateReason::NotInProfit {
            unrealized_pnl: ctx.instrument_unrealized_pnl,
        });
    }

    GateDecision {
        admit: true,
        reason: GateReason::Admitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RiskLimitsConfig {
        RiskLimitsConfig::default()
    }

    fn admitting_ctx() -> PyramidGateContext {
        PyramidGateContext {
            price: 52_400.0,
            last_pyramid_price: 52_000.0,
            initial_r: 350.0,
            atr: 350.0,
            equity: 5_000_000.0,
            hypothetical_risk: 80_000.0,   // 1.6%
            hypothetical_vol: 60_000.0,    // 1.2%
            hypothetical_margin: 1_080_000.0, // 21.6%
            instrument_unrealized_pnl: 42_000.0,
        }
    }

    #[test]
    fn admits_when_all_gates_pass() {
        let d = evaluate_pyramid_gate(&limits(), &admitting_ctx());
        assert!(d.admit);
        assert_eq!(d.reason, GateReason::Admitted);
    }

    #[test]
    fn spacing_gate_rejects_close_entries() {
        let mut ctx = admitting_ctx();
        // 100 points above the last entry; required = max(350, 1.0 * 350).
        ctx.price = 52_100.0;
        let d = evaluate_pyramid_gate(&limits(), &ctx);
        assert!(!d.admit);
        assert_eq!(d.reason.code(), "instrument_gate");
    }

    #[test]
    fn spacing_uses_the_larger_of_initial_r_and_atr_multiple() {
        let mut ctx = admitting_ctx();
        ctx.initial_r = 500.0;
        ctx.price = 52_400.0; // distance 400 >= 1*atr but < initial_R
        let d = evaluate_pyramid_gate(&limits(), &ctx);
        assert_eq!(d.reason.code(), "instrument_gate");
    }

    #[test]
    fn risk_cap_checked_before_vol_and_margin() {
        let mut ctx = admitting_ctx();
        ctx.hypothetical_risk = 700_000.0; // 14% > 12%
        ctx.hypothetical_vol = 300_000.0; // 6% > 4% too
        let d = evaluate_pyramid_gate(&limits(), &ctx);
        assert_eq!(d.reason.code(), "risk_cap");
    }

    #[test]
    fn margin_cap_rejects() {
        let mut ctx = admitting_ctx();
        ctx.hypothetical_margin = 3_200_000.0; // 64% > 60%
        let d = evaluate_pyramid_gate(&limits(), &ctx);
        assert_eq!(d.reason.code(), "margin_cap");
    }

    #[test]
    fn profit_gate_rejects_flat_or_losing_instrument() {
        let mut ctx = admitting_ctx();
        ctx.instrument_unrealized_pnl = 0.0;
        let d = evaluate_pyramid_gate(&limits(), &ctx);
        assert_eq!(d.reason.code(), "profit_gate");
    }
}
