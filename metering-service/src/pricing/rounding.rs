//! Rounding and balance helpers shared by the order path and the oracle.

use super::PricingError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Currencies whose payouts must be whole multiples of 100 minor units.
const ZERO_DECIMAL_PAYOUT_CURRENCIES: [&str; 4] = ["isk", "huf", "twd", "ugx"];

/// Round to integer minor units, halves away from zero.
///
/// `1.995 * 100 = 199.5` rounds to 200, `199.4` to 199, `-0.5` to -1.
pub fn round_half_away_from_zero(value: Decimal) -> Result<i64, PricingError> {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or(PricingError::Overflow)
}

/// Running sum clamped at zero after every step.
///
/// A debit that would take the balance negative is absorbed instead of
/// carried, so `[-5, 10, -20, 3]` ends at 3.
pub fn non_negative_running_sum<I>(values: I) -> i64
where
    I: IntoIterator<Item = i64>,
{
    values
        .into_iter()
        .fold(0i64, |acc, value| acc.saturating_add(value).max(0))
}

/// Every intermediate balance of [`non_negative_running_sum`].
pub fn running_balances<I>(values: I) -> Vec<i64>
where
    I: IntoIterator<Item = i64>,
{
    values
        .into_iter()
        .scan(0i64, |acc, value| {
            *acc = acc.saturating_add(value).max(0);
            Some(*acc)
        })
        .collect()
}

/// Split a payout into the transferable part and the remainder kept back.
///
/// Returns `(adjusted, remainder)` with `adjusted + remainder == amount`.
/// The adjusted part is floored, so the remainder is always in `0..100`,
/// negative amounts included.
pub fn adjust_payout_amount_for_zero_decimal_currency(amount: i64, currency: &str) -> (i64, i64) {
    let currency = currency.to_ascii_lowercase();
    if ZERO_DECIMAL_PAYOUT_CURRENCIES.contains(&currency.as_str()) {
        let remainder = amount.rem_euclid(100);
        (amount - remainder, remainder)
    } else {
        (amount, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_halves_away_from_zero() {
        assert_eq!(round_half_away_from_zero(dec!(1.995) * dec!(100)).unwrap(), 200);
        assert_eq!(round_half_away_from_zero(dec!(1.994) * dec!(100)).unwrap(), 199);
        assert_eq!(round_half_away_from_zero(dec!(1.996) * dec!(100)).unwrap(), 200);
        assert_eq!(round_half_away_from_zero(dec!(-0.5)).unwrap(), -1);
        assert_eq!(round_half_away_from_zero(dec!(2.5)).unwrap(), 3);
    }

    #[test]
    fn oversized_values_are_rejected() {
        let huge = Decimal::MAX;
        assert!(matches!(
            round_half_away_from_zero(huge),
            Err(PricingError::Overflow)
        ));
    }

    #[test]
    fn running_sum_never_goes_negative() {
        let values = [-5, 10, -20, 3];
        assert_eq!(running_balances(values), vec![0, 10, 0, 3]);
        assert_eq!(non_negative_running_sum(values), 3);
        assert_eq!(non_negative_running_sum(Vec::<i64>::new()), 0);
    }

    #[test]
    fn zero_decimal_payouts_keep_remainder() {
        assert_eq!(
            adjust_payout_amount_for_zero_decimal_currency(12345, "isk"),
            (12300, 45)
        );
        assert_eq!(
            adjust_payout_amount_for_zero_decimal_currency(12345, "HUF"),
            (12300, 45)
        );
        assert_eq!(
            adjust_payout_amount_for_zero_decimal_currency(12345, "usd"),
            (12345, 0)
        );
    }

    #[test]
    fn negative_zero_decimal_payouts_are_floored() {
        assert_eq!(
            adjust_payout_amount_for_zero_decimal_currency(-12345, "isk"),
            (-12400, 55)
        );
        assert_eq!(
            adjust_payout_amount_for_zero_decimal_currency(-200, "twd"),
            (-200, 0)
        );
    }
}
