/// cost.rs — Cost Model (C1, spec §4.1)
///
/// Pure function estimating the cost in account currency of closing a
/// group of positions: spread + commission + slippage + a fixed buffer.
/// No I/O; callers pass the live spread in, falling back to the
/// configured default when unavailable.
use crate::config::EngineConfig;

/// Estimate closure cost for a group with total volume `volume_lots`.
///
/// `broker_spread_points` is the current live spread, if known; `None`
/// falls back to `cfg.default_spread_points`. Never returns zero: if
/// `volume_lots` is non-finite or non-positive, falls back to the
/// `3.0 × V_in_standard_lots` floor (spec §4.1).
pub fn estimate_cost(volume_lots: f64, broker_spread_points: Option<f64>, cfg: &EngineConfig) -> f64 {
    let safe_volume = if volume_lots.is_finite() && volume_lots > 0.0 {
        volume_lots
    } else {
        crate::config::LOT_STEP
    };
    let v_std = std_lots(safe_volume);
    let spread_points = broker_spread_points
        .filter(|s| s.is_finite() && *s > 0.0)
        .unwrap_or(cfg.default_spread_points)
        .max(cfg.default_spread_points);

    let spread_cost = spread_points * crate::config::POINT_VALUE * v_std;
    let commission = cfg.commission_per_std_lot * v_std;
    let slippage = cfg.slippage_per_std_lot * v_std;
    let buffer = cfg.buffer_per_std_lot * v_std;

    let cost = spread_cost + commission + slippage + buffer;
    if cost <= 0.0 || !cost.is_finite() {
        3.0 * v_std
    } else {
        cost
    }
}

/// `V_in_standard_lots = V / 0.01` (spec §4.1).
fn std_lots(volume_lots: f64) -> f64 {
    volume_lots / crate::config::LOT_STEP
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn default_cost_for_one_lot_step() {
        let c = estimate_cost(0.01, None, &cfg());
        // spread 1.5 + commission 0.30 + slippage 1.50 + buffer 1.00 = 4.30
        assert!((c - 4.30).abs() < 1e-9, "cost = {c}");
    }

    #[test]
    fn cost_is_monotone_in_volume() {
        let c1 = estimate_cost(0.01, None, &cfg());
        let c2 = estimate_cost(0.02, None, &cfg());
        assert!(c2 >= c1, "cost must be non-decreasing in V: {c1} vs {c2}");
    }

    #[test]
    fn never_returns_zero_on_invalid_input() {
        let c = estimate_cost(0.0, None, &cfg());
        assert!(c > 0.0);
        let c2 = estimate_cost(f64::NAN, None, &cfg());
        assert!(c2 > 0.0 && c2.is_finite());
    }

    #[test]
    fn falls_back_to_default_spread_when_broker_spread_tighter() {
        let narrow = estimate_cost(0.01, Some(0.1), &cfg());
        let wide = estimate_cost(0.01, Some(5.0), &cfg());
        assert!(narrow < wide);
        // narrow uses default_spread_points (1.5), not the tighter 0.1
        let default_only = estimate_cost(0.01, None, &cfg());
        assert!((narrow - default_only).abs() < 1e-9);
    }

    #[test]
    fn uses_real_spread_when_wider_than_default() {
        let cfg = cfg();
        let wide = estimate_cost(0.01, Some(4.0), &cfg);
        let default_based = estimate_cost(0.01, None, &cfg);
        assert!(wide > default_based);
    }
}
