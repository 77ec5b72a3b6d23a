use crate::types::{
    BaseEntryInput, BaseEntrySizing, PeelOffInput, PyramidInput, PyramidSizing, SizingError,
};

fn floor_lots(x: f64) -> i64 {
    if x.is_finite() {
        x.floor().max(0.0) as i64
    } else {
        0
    }
}

/// Triple-constraint base-entry sizer.
///
/// LotR = floor(((equity × risk_pct) / ((entry − stop) × point_value)) × er)
/// LotV = floor((equity × vol_pct) / (atr × point_value))
/// LotM = floor(available_margin / margin_per_lot)
///
/// Result = max(0, min(LotR, LotM)). LotV is reported but not binding; see
/// [`BaseEntrySizing`].
pub fn base_entry_lots(inp: BaseEntryInput) -> Result<BaseEntrySizing, SizingError> {
    if inp.entry <= inp.stop {
        return Err(SizingError::InvertedStop);
    }
    if inp.point_value <= 0.0 {
        return Err(SizingError::InvalidConfig("point_value"));
    }
    if inp.margin_per_lot <= 0.0 {
        return Err(SizingError::InvalidConfig("margin_per_lot"));
    }
    if inp.atr <= 0.0 {
        return Err(SizingError::InvalidConfig("atr"));
    }
    if inp.er <= 0.0 {
        return Err(SizingError::InvalidConfig("er"));
    }

    let risk_per_lot = (inp.entry - inp.stop) * inp.point_value;
    let lot_r = floor_lots((inp.equity * inp.risk_pct) / risk_per_lot * inp.er);
    let lot_v = floor_lots((inp.equity * inp.vol_pct) / (inp.atr * inp.point_value));
    let lot_m = floor_lots(inp.available_margin / inp.margin_per_lot);

    Ok(BaseEntrySizing {
        lot_r,
        lot_v,
        lot_m,
        lots: lot_r.min(lot_m).max(0),
    })
}

/// Triple-constraint pyramid sizer.
///
/// LotA = floor(free_margin / margin_per_lot)
/// LotB = floor(base_lots × 0.5^pyramid_index)        (geometric de-escalation)
/// LotC = floor(max(0, (accumulated_profit − base_risk) × 0.5)
///              / ((entry − new_stop) × point_value)) (risk only banked profit)
///
/// Result = max(0, min(LotA, LotB, LotC)).
pub fn pyramid_lots(inp: PyramidInput) -> Result<PyramidSizing, SizingError> {
    if inp.entry <= inp.new_stop {
        return Err(SizingError::InvertedStop);
    }
    if inp.point_value <= 0.0 {
        return Err(SizingError::InvalidConfig("point_value"));
    }
    if inp.margin_per_lot <= 0.0 {
        return Err(SizingError::InvalidConfig("margin_per_lot"));
    }

    let lot_a = floor_lots(inp.free_margin / inp.margin_per_lot);
    let lot_b = floor_lots(inp.base_lots as f64 * 0.5_f64.powi(inp.pyramid_index as i32));

    let excess_profit = (inp.accumulated_profit - inp.base_risk).max(0.0) * 0.5;
    let risk_per_lot = (inp.entry - inp.new_stop) * inp.point_value;
    let lot_c = floor_lots(excess_profit / risk_per_lot);

    Ok(PyramidSizing {
        lot_a,
        lot_b,
        lot_c,
        lots: lot_a.min(lot_b).min(lot_c).max(0),
    })
}

/// Lots to peel off a position when portfolio caps are breached.
///
/// The risk-driven and volatility-driven reductions are computed separately
/// and the LARGER wins: both caps have to end up satisfied, so the more
/// restrictive reduction is the binding one. Rounded up, since peeling one lot
/// short of the cap leaves the breach standing.
pub fn peel_off_lots(inp: PeelOffInput) -> i64 {
    if inp.position_lots <= 0 || inp.point_value <= 0.0 {
        return 0;
    }

    let risk_per_lot = (inp.entry - inp.current_stop) * inp.point_value;
    let vol_per_lot = inp.atr * inp.point_value;

    let from_risk = if inp.risk_over > 0.0 && risk_per_lot > 0.0 {
        (inp.risk_over / risk_per_lot).ceil() as i64
    } else {
        0
    };
    let from_vol = if inp.vol_over > 0.0 && vol_per_lot > 0.0 {
        (inp.vol_over / vol_per_lot).ceil() as i64
    } else {
        0
    };

    from_risk.max(from_vol).min(inp.position_lots)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Bank Nifty contract values used throughout the strategy docs:
    // point_value 35, margin_per_lot 270000, equity 5,000,000, risk 1%, er 0.82.
    fn bank_nifty_base() -> BaseEntryInput {
        BaseEntryInput {
            equity: 5_000_000.0,
            risk_pct: 0.01,
            vol_pct: 0.02,
            entry: 52_000.0,
            stop: 51_650.0,
            point_value: 35.0,
            er: 0.82,
            atr: 350.0,
            available_margin: 3_000_000.0,
            margin_per_lot: 270_000.0,
        }
    }

    #[test]
    fn base_entry_reference_numbers() {
        let s = base_entry_lots(bank_nifty_base()).expect("valid input");
        // LotR = floor((50000 / 12250) * 0.82) = floor(3.347) = 3
        assert_eq!(s.lot_r, 3);
        // LotM = floor(3_000_000 / 270_000) = 11
        assert_eq!(s.lot_m, 11);
        assert_eq!(s.lots, 3);
    }

    #[test]
    fn lot_v_reported_but_not_binding() {
        let mut inp = bank_nifty_base();
        // Tiny vol budget: LotV = floor(5M * 0.0001 / 12250) = 0.
        inp.vol_pct = 0.0001;
        let s = base_entry_lots(inp).expect("valid input");
        assert_eq!(s.lot_v, 0);
        assert_eq!(s.lots, 3, "LotV must not cap the result");
    }

    #[test]
    fn margin_floor_returns_zero_lots() {
        let mut inp = bank_nifty_base();
        inp.available_margin = 200_000.0; // below one lot's margin
        let s = base_entry_lots(inp).expect("valid input");
        assert_eq!(s.lot_m, 0);
        assert_eq!(s.lots, 0);
    }

    #[test]
    fn risk_floor_returns_zero_lots() {
        let mut inp = bank_nifty_base();
        // Stop so wide one lot already exceeds the risk budget / er.
        inp.stop = 50_000.0;
        inp.equity = 500_000.0;
        let s = base_entry_lots(inp).expect("valid input");
        assert_eq!(s.lot_r, 0);
        assert_eq!(s.lots, 0);
    }

    #[test]
    fn inverted_stop_is_rejected() {
        let mut inp = bank_nifty_base();
        inp.stop = 52_100.0;
        assert_eq!(base_entry_lots(inp), Err(SizingError::InvertedStop));
    }

    #[test]
    fn zero_denominators_are_rejected() {
        let mut inp = bank_nifty_base();
        inp.margin_per_lot = 0.0;
        assert_eq!(
            base_entry_lots(inp),
            Err(SizingError::InvalidConfig("margin_per_lot"))
        );

        let mut inp = bank_nifty_base();
        inp.atr = 0.0;
        assert_eq!(base_entry_lots(inp), Err(SizingError::InvalidConfig("atr")));
    }

    #[test]
    fn pyramid_reference_numbers() {
        // After the 3-lot base at 52000/51650, pyramiding at 52400/52050:
        // accumulated_profit = (52400-52000)*3*35 = 42000
        // base_risk          = (52000-51650)*3*35 = 36750
        // LotC = floor(((42000-36750)*0.5) / ((52400-52050)*35)) = floor(2625/12250) = 0
        let s = pyramid_lots(PyramidInput {
            free_margin: 2_190_000.0,
            margin_per_lot: 270_000.0,
            pyramid_index: 1,
            base_lots: 3,
            accumulated_profit: 42_000.0,
            base_risk: 36_750.0,
            entry: 52_400.0,
            new_stop: 52_050.0,
            point_value: 35.0,
        })
        .expect("valid input");
        assert_eq!(s.lot_a, 8);
        assert_eq!(s.lot_b, 1);
        assert_eq!(s.lot_c, 0);
        assert_eq!(s.lots, 0);
    }

    #[test]
    fn pyramid_admits_once_profit_covers_base_risk() {
        // Larger excursion: profit well past base risk.
        let s = pyramid_lots(PyramidInput {
            free_margin: 2_190_000.0,
            margin_per_lot: 270_000.0,
            pyramid_index: 1,
            base_lots: 3,
            accumulated_profit: 105_000.0, // 1000 points * 3 * 35
            base_risk: 36_750.0,
            entry: 53_000.0,
            new_stop: 52_650.0,
            point_value: 35.0,
        })
        .expect("valid input");
        // LotC = floor((68250 * 0.5) / 12250) = floor(2.78) = 2, LotB = 1 binds.
        assert_eq!(s.lot_c, 2);
        assert_eq!(s.lot_b, 1);
        assert_eq!(s.lots, 1);
    }

    #[test]
    fn pyramid_deescalates_geometrically() {
        for (index, expect) in [(1u32, 4i64), (2, 2), (3, 1), (4, 0)] {
            let s = pyramid_lots(PyramidInput {
                free_margin: 1e9,
                margin_per_lot: 270_000.0,
                pyramid_index: index,
                base_lots: 8,
                accumulated_profit: 1e9,
                base_risk: 0.0,
                entry: 52_400.0,
                new_stop: 52_050.0,
                point_value: 35.0,
            })
            .expect("valid input");
            assert_eq!(s.lot_b, expect, "index {index}");
        }
    }

    #[test]
    fn peel_off_takes_the_larger_reduction() {
        let inp = PeelOffInput {
            position_lots: 10,
            entry: 52_000.0,
            current_stop: 51_650.0,
            atr: 350.0,
            point_value: 35.0,
            // risk_per_lot = vol_per_lot = 12250
            risk_over: 13_000.0, // -> 2 lots
            vol_over: 40_000.0,  // -> 4 lots
        };
        assert_eq!(peel_off_lots(inp), 4);
    }

    #[test]
    fn peel_off_clamped_to_position_size() {
        let inp = PeelOffInput {
            position_lots: 2,
            entry: 52_000.0,
            current_stop: 51_650.0,
            atr: 350.0,
            point_value: 35.0,
            risk_over: 1e9,
            vol_over: 0.0,
        };
        assert_eq!(peel_off_lots(inp), 2);
    }

    #[test]
    fn peel_off_zero_when_caps_satisfied() {
        let inp = PeelOffInput {
            position_lots: 5,
            entry: 52_000.0,
            current_stop: 51_650.0,
            atr: 350.0,
            point_value: 35.0,
            risk_over: 0.0,
            vol_over: 0.0,
        };
        assert_eq!(peel_off_lots(inp), 0);
    }
}
