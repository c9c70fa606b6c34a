//! Venue step sizes and quantity rounding.

use crate::EPSILON;
use autotrader_core::RiskPolicy;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Order quantity step for `symbol`.
///
/// Uses the policy's `step_overrides` when present, otherwise a prefix
/// heuristic: BTC 0.001, ETH 0.01, everything else 0.1.
#[must_use]
pub fn step_size(symbol: &str, policy: &RiskPolicy) -> Decimal {
    let upper = symbol.to_ascii_uppercase();
    if let Some(step) = policy.step_overrides.get(&upper) {
        if *step > Decimal::ZERO {
            return *step;
        }
    }
    if upper.starts_with("BTC") {
        Decimal::new(1, 3)
    } else if upper.starts_with("ETH") {
        Decimal::new(1, 2)
    } else {
        Decimal::new(1, 1)
    }
}

/// Floors `quantity` to a whole number of steps.
#[must_use]
pub fn round_down(quantity: f64, step: Decimal) -> f64 {
    let Some(qty) = Decimal::from_f64(quantity) else {
        return 0.0;
    };
    if step <= Decimal::ZERO || qty <= Decimal::ZERO {
        return 0.0;
    }
    // A hair of slack so 0.3 / 0.001 does not floor to 299.
    let slack = Decimal::new(1, 9);
    let steps = (qty / step + slack).floor();
    (steps * step).to_f64().unwrap_or(0.0)
}

/// Quantity to close for a partial close of `percentage` of `total`.
///
/// Requests within one step of the full size close everything; requests
/// below one step are raised to a single step (or the full size when the
/// position is only one step large). The result is floored to the step.
#[must_use]
pub fn partial_close_quantity(total: f64, percentage: f64, step: Decimal) -> f64 {
    let step_f = step.to_f64().unwrap_or(0.0);
    let mut requested = total * (percentage / 100.0);

    if total - requested < step_f {
        requested = total;
    } else if requested < step_f {
        requested = if total <= step_f + EPSILON { total } else { step_f };
    }

    round_down(requested, step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn prefix_heuristic_and_overrides() {
        let mut policy = RiskPolicy::default();
        assert_eq!(step_size("BTCUSDT", &policy), dec!(0.001));
        assert_eq!(step_size("ethusdt", &policy), dec!(0.01));
        assert_eq!(step_size("SOLUSDT", &policy), dec!(0.1));

        policy.step_overrides.insert("SOLUSDT".to_string(), dec!(0.01));
        assert_eq!(step_size("solusdt", &policy), dec!(0.01));
    }

    #[test]
    fn round_down_floors_to_step() {
        assert!((round_down(0.3, dec!(0.001)) - 0.3).abs() < 1e-12);
        assert!((round_down(0.12345, dec!(0.01)) - 0.12).abs() < 1e-12);
        assert!((round_down(0.05, dec!(0.1))).abs() < 1e-12);
        assert!((round_down(-1.0, dec!(0.1))).abs() < 1e-12);
    }

    #[test]
    fn partial_close_of_thirty_percent_btc() {
        let qty = partial_close_quantity(1.0, 30.0, dec!(0.001));
        assert!(qty <= 0.3 + 1e-12);
        assert!((qty - 0.3).abs() < 1e-12);
    }

    #[test]
    fn partial_close_near_full_closes_everything() {
        // 99.95% of 1.0 leaves 0.0005, less than a step
        let qty = partial_close_quantity(1.0, 99.95, dec!(0.001));
        assert!((qty - 1.0).abs() < 1e-12);
    }

    #[test]
    fn partial_close_below_step_is_raised_to_one_step() {
        let qty = partial_close_quantity(5.0, 1.0, dec!(0.1));
        assert!((qty - 0.1).abs() < 1e-12);
        // 0.1 * 50% = 0.05 < step, and the whole position is one step
        let single = partial_close_quantity(0.1, 50.0, dec!(0.1));
        assert!((single - 0.1).abs() < 1e-12);
    }
}
