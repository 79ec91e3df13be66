//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Convert a fractional rate to basis points (1 bp = 0.01%).
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Safe division that returns zero if the divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_basis_points_on_funding_differentials() {
        // The happy-path pair: +0.30% vs -0.20% per 8h is a 50 bps gap
        let fr_diff = dec!(0.003) - dec!(-0.002);
        assert_eq!(to_basis_points(fr_diff), dec!(50));
        // Sign carries through for negative rates
        assert_eq!(to_basis_points(dec!(-0.0004)), dec!(-4));
    }

    #[test]
    fn test_safe_div_for_failure_ratios() {
        // 1 failed of 4 attempted
        assert_eq!(safe_div(dec!(1), dec!(4)), dec!(0.25));
        // No attempts must not panic the anomaly check
        assert_eq!(safe_div(dec!(3), Decimal::ZERO), Decimal::ZERO);
    }
}
