//! Discounts, tax rounding and order totals.

use super::{round_half_away_from_zero, PricingError};
use crate::models::{Discount, DiscountDuration, DiscountKind, TimeWindow};
use chrono::Months;
use rust_decimal::Decimal;

/// Longest repeating discount honoured, in months.
pub const MAX_DISCOUNT_MONTHS: u32 = 999;

const BASIS_POINTS: i64 = 10_000;

/// Whether `discount` applies to the billing period `period`.
///
/// `once` covers the period the discount was redeemed in, `repeating` every
/// period starting within `duration_in_months` of redemption.
pub fn discount_applies(discount: &Discount, period: &TimeWindow) -> bool {
    if discount.redeemed_at >= period.end {
        return false;
    }
    match discount.duration {
        DiscountDuration::Forever => true,
        DiscountDuration::Once => discount.redeemed_at >= period.start,
        DiscountDuration::Repeating { duration_in_months } => {
            let months = duration_in_months.min(MAX_DISCOUNT_MONTHS);
            match discount.redeemed_at.checked_add_months(Months::new(months)) {
                Some(expires_at) => period.start < expires_at,
                None => true,
            }
        }
    }
}

pub fn applicable_discounts(discounts: &[Discount], period: &TimeWindow) -> Vec<Discount> {
    discounts
        .iter()
        .filter(|d| discount_applies(d, period))
        .cloned()
        .collect()
}

/// Total discount on `subtotal`.
///
/// Percentages are taken from the pre-discount subtotal first, fixed amounts
/// after; the result never exceeds the subtotal.
pub fn apply_discounts(subtotal: i64, discounts: &[Discount]) -> Result<i64, PricingError> {
    if subtotal <= 0 {
        return Ok(0);
    }

    let mut discount = 0i64;
    for d in discounts {
        if let DiscountKind::Percentage { basis_points } = d.kind {
            let raw = Decimal::from(subtotal) * Decimal::from(basis_points.min(10_000))
                / Decimal::from(BASIS_POINTS);
            discount += round_half_away_from_zero(raw)?;
        }
    }
    discount = discount.min(subtotal);

    for d in discounts {
        if let DiscountKind::Fixed { amount } = d.kind {
            let remaining = subtotal - discount;
            discount += amount.max(0).min(remaining);
        }
    }

    Ok(discount)
}

/// Tax on `taxable` at `rate_basis_points`.
pub fn tax_amount(taxable: i64, rate_basis_points: u32) -> Result<i64, PricingError> {
    if taxable <= 0 || rate_basis_points == 0 {
        return Ok(0);
    }
    let raw = Decimal::from(taxable) * Decimal::from(rate_basis_points) / Decimal::from(BASIS_POINTS);
    round_half_away_from_zero(raw)
}

/// Balance consumed by an order: zero or negative, never more than the total.
pub fn applied_balance(total: i64, available_balance: i64) -> i64 {
    -available_balance.max(0).min(total.max(0))
}

/// Order-level figures derived from the line subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: i64,
    pub discount: i64,
    pub tax: i64,
    pub total: i64,
    pub applied_balance: i64,
    pub due: i64,
}

impl OrderTotals {
    pub fn new(subtotal: i64, discount: i64, tax: i64, available_balance: i64) -> Self {
        let total = (subtotal - discount + tax).max(0);
        let applied_balance = applied_balance(total, available_balance);
        Self {
            subtotal,
            discount,
            tax,
            total,
            applied_balance,
            due: total + applied_balance,
        }
    }

    pub fn taxable(&self) -> i64 {
        self.subtotal - self.discount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use uuid::Uuid;

    fn month(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, m, 1, 0, 0, 0).unwrap()
    }

    fn discount(kind: DiscountKind, duration: DiscountDuration) -> Discount {
        Discount {
            id: Uuid::new_v4(),
            name: "promo".into(),
            kind,
            duration,
            redeemed_at: month(1),
        }
    }

    #[test]
    fn percentage_then_fixed() {
        let discounts = vec![
            discount(DiscountKind::Fixed { amount: 500 }, DiscountDuration::Forever),
            discount(
                DiscountKind::Percentage { basis_points: 1000 },
                DiscountDuration::Forever,
            ),
        ];
        // 10% of 10000, then 500 fixed
        assert_eq!(apply_discounts(10_000, &discounts).unwrap(), 1500);
    }

    #[test]
    fn discount_never_exceeds_subtotal() {
        let discounts = vec![discount(
            DiscountKind::Fixed { amount: 5000 },
            DiscountDuration::Forever,
        )];
        assert_eq!(apply_discounts(1200, &discounts).unwrap(), 1200);
    }

    #[test]
    fn repeating_discount_expires() {
        let d = discount(
            DiscountKind::Percentage { basis_points: 500 },
            DiscountDuration::Repeating {
                duration_in_months: 3,
            },
        );
        assert!(discount_applies(&d, &TimeWindow::new(month(1), month(2))));
        assert!(discount_applies(&d, &TimeWindow::new(month(3), month(4))));
        assert!(!discount_applies(&d, &TimeWindow::new(month(4), month(5))));
    }

    #[test]
    fn once_applies_to_the_redemption_period_only() {
        let d = discount(DiscountKind::Fixed { amount: 100 }, DiscountDuration::Once);
        assert!(discount_applies(&d, &TimeWindow::new(month(1), month(2))));
        assert!(!discount_applies(&d, &TimeWindow::new(month(2), month(3))));
    }

    #[test]
    fn tax_rounds_half_away_from_zero() {
        // 1234 * 25% = 308.5
        assert_eq!(tax_amount(1234, 2500).unwrap(), 309);
        assert_eq!(tax_amount(0, 2500).unwrap(), 0);
    }

    #[test]
    fn totals_keep_due_non_negative() {
        let totals = OrderTotals::new(10_000, 1_000, 2_250, 50_000);
        assert_eq!(totals.total, 11_250);
        assert_eq!(totals.applied_balance, -11_250);
        assert_eq!(totals.due, 0);
        assert_eq!(totals.total, totals.subtotal - totals.discount + totals.tax);

        let partial = OrderTotals::new(1000, 0, 0, 300);
        assert_eq!(partial.applied_balance, -300);
        assert_eq!(partial.due, 700);
    }
}
