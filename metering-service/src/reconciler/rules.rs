use crate::models::{
    ExpectedLineItem, ExpectedOrder, MismatchClassification, OracleMismatch, PersistedOrderItem,
    PersistedOrderSnapshot, ReconciliationResult, Severity,
};
use crate::pricing::{applied_balance, apply_discounts, tax_amount, PricingError};
use rust_decimal::Decimal;

/// Compare `expected` with `actual`.
///
/// Lines are matched on `(product_price_id, window)`. Amount differences up
/// to `tolerance_cents` are ignored. Order-level figures are recomputed from
/// the actual subtotal, so a single wrong line is reported once instead of
/// again in the tax, total and balance checks.
///
/// Fails when recomputing an order-level figure overflows.
pub fn reconcile(
    expected: &ExpectedOrder,
    actual: &PersistedOrderSnapshot,
    tolerance_cents: i64,
) -> Result<ReconciliationResult, PricingError> {
    let mut diff = Diff::new(tolerance_cents.max(0));
    let order_ref = format!("order:{}", actual.id);

    if expected.currency != actual.currency {
        diff.push(
            MismatchClassification::CurrencyMismatch,
            Severity::Critical,
            &expected.currency,
            &actual.currency,
            format!("{}.currency", order_ref),
        );
    }

    let mut unmatched: Vec<&PersistedOrderItem> = actual.items.iter().collect();
    for line in &expected.line_items {
        let position = unmatched.iter().position(|item| {
            item.product_price_id == Some(line.product_price_id) && item.window == line.window
        });
        match position {
            Some(index) => {
                let item = unmatched.remove(index);
                diff.compare_line(line, item);
            }
            None => diff.push(
                MismatchClassification::MissingLineItem,
                MismatchClassification::MissingLineItem.default_severity(),
                line.computed_amount,
                "absent",
                format!("price:{}@{}", line.product_price_id, line.window.start),
            ),
        }
    }
    for item in unmatched {
        diff.push(
            MismatchClassification::ExtraLineItem,
            MismatchClassification::ExtraLineItem.default_severity(),
            "absent",
            item.amount,
            format!("order_item:{}", item.id),
        );
    }

    diff.compare_order(expected, actual, &order_ref)?;

    Ok(ReconciliationResult::new(
        Some(actual.id),
        expected.subscription_id,
        diff.mismatches,
    ))
}

struct Diff {
    tolerance: i64,
    mismatches: Vec<OracleMismatch>,
}

impl Diff {
    fn new(tolerance: i64) -> Self {
        Self {
            tolerance,
            mismatches: Vec::new(),
        }
    }

    fn push(
        &mut self,
        classification: MismatchClassification,
        severity: Severity,
        expected: impl ToString,
        actual: impl ToString,
        entity_reference: String,
    ) {
        self.mismatches.push(OracleMismatch {
            classification,
            severity,
            expected_value: Some(expected.to_string()),
            actual_value: Some(actual.to_string()),
            entity_reference,
        });
    }

    fn exceeds(&self, expected: i64, actual: i64) -> bool {
        expected.abs_diff(actual) > self.tolerance.unsigned_abs()
    }

    fn compare_line(&mut self, line: &ExpectedLineItem, item: &PersistedOrderItem) {
        let item_ref = format!("order_item:{}", item.id);

        if line.currency != item.currency {
            self.push(
                MismatchClassification::CurrencyMismatch,
                Severity::Critical,
                &line.currency,
                &item.currency,
                format!("{}.currency", item_ref),
            );
        }

        // A quantity inside the settled/carried range is what ingestion-time
        // billing produces for events arriving around the period boundary.
        let drift_explained = quantity_within_drift(line, item.quantity);
        if item.quantity != line.quantity {
            self.push(
                MismatchClassification::QuantityMismatch,
                if drift_explained {
                    Severity::Warning
                } else {
                    Severity::Critical
                },
                line.quantity,
                item.quantity,
                format!("{}.quantity", item_ref),
            );
        }

        if self.exceeds(line.computed_amount, item.amount) {
            let severity = if item.quantity != line.quantity && drift_explained {
                Severity::Warning
            } else {
                Severity::Critical
            };
            self.push(
                MismatchClassification::AmountMismatch,
                severity,
                line.computed_amount,
                item.amount,
                format!("{}.amount", item_ref),
            );
        }

        if line.late_event_count > 0 {
            self.push(
                MismatchClassification::TimingDrift,
                Severity::Info,
                format!("{} late events", line.late_event_count),
                "billed in a later period",
                item_ref,
            );
        }
    }

    fn compare_order(
        &mut self,
        expected: &ExpectedOrder,
        actual: &PersistedOrderSnapshot,
        order_ref: &str,
    ) -> Result<(), PricingError> {
        let items_sum = actual.items_sum();
        if self.exceeds(items_sum, actual.subtotal_amount) {
            self.push(
                MismatchClassification::AmountMismatch,
                Severity::Critical,
                items_sum,
                actual.subtotal_amount,
                format!("{}.subtotal", order_ref),
            );
        }

        let subtotal = actual.subtotal_amount;
        let expected_discount = apply_discounts(subtotal, &expected.discounts)?;
        if self.exceeds(expected_discount, actual.discount_amount) {
            self.push(
                MismatchClassification::DiscountMismatch,
                MismatchClassification::DiscountMismatch.default_severity(),
                expected_discount,
                actual.discount_amount,
                format!("{}.discount", order_ref),
            );
        }

        let taxable = subtotal
            .checked_sub(actual.discount_amount)
            .ok_or(PricingError::Overflow)?;
        let expected_tax = match expected.tax_rate_basis_points {
            Some(rate) => tax_amount(taxable, rate)?,
            None => expected.tax_amount,
        };
        if self.exceeds(expected_tax, actual.tax.amount) {
            self.push(
                MismatchClassification::TaxMismatch,
                Severity::Critical,
                expected_tax,
                actual.tax.amount,
                format!("{}.tax", order_ref),
            );
        }

        let expected_total = taxable
            .checked_add(actual.tax.amount)
            .ok_or(PricingError::Overflow)?;
        if actual.total_amount != expected_total || actual.total_amount < 0 {
            self.push(
                MismatchClassification::AmountMismatch,
                Severity::Critical,
                expected_total.max(0),
                actual.total_amount,
                format!("{}.total", order_ref),
            );
        }

        let expected_applied = applied_balance(actual.total_amount, expected.available_balance);
        if self.exceeds(expected_applied, actual.applied_balance_amount)
            || actual.due_amount() < 0
        {
            self.push(
                MismatchClassification::AmountMismatch,
                Severity::Critical,
                expected_applied,
                actual.applied_balance_amount,
                format!("{}.applied_balance", order_ref),
            );
        }
        Ok(())
    }
}

fn quantity_within_drift(line: &ExpectedLineItem, actual: Decimal) -> bool {
    let low = line.settled_quantity.min(line.carried_quantity);
    let high = line.settled_quantity.max(line.carried_quantity);
    actual >= low && actual <= high
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaxCalculation, TimeWindow};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )
    }

    fn line(price_id: Uuid, quantity: Decimal, amount: i64) -> ExpectedLineItem {
        ExpectedLineItem {
            product_price_id: price_id,
            window: window(),
            quantity,
            unit_amount: dec!(50),
            proration_factor: Decimal::ONE,
            cap_amount: None,
            computed_amount: amount,
            currency: "usd".to_string(),
            settled_quantity: quantity,
            carried_quantity: quantity,
            late_event_count: 0,
        }
    }

    fn expected(lines: Vec<ExpectedLineItem>) -> ExpectedOrder {
        let subtotal = lines.iter().map(|l| l.computed_amount).sum();
        ExpectedOrder {
            organization_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            order_id: None,
            billing_period: window(),
            currency: "usd".to_string(),
            line_items: lines,
            subtotal_amount: subtotal,
            discount_amount: 0,
            tax_amount: 0,
            tax_rate_basis_points: Some(0),
            total_amount: subtotal,
            applied_balance_amount: 0,
            due_amount: subtotal,
            available_balance: 0,
            discounts: Vec::new(),
            events_scanned: 0,
            simulated_at: Utc::now(),
        }
    }

    /// Persisted order mirroring `expected`, with item amounts overridden.
    fn actual_from(expected: &ExpectedOrder, amounts: &[i64]) -> PersistedOrderSnapshot {
        let items: Vec<PersistedOrderItem> = expected
            .line_items
            .iter()
            .zip(amounts)
            .map(|(line, amount)| PersistedOrderItem {
                id: Uuid::new_v4(),
                product_price_id: Some(line.product_price_id),
                label: "usage".to_string(),
                window: line.window,
                quantity: line.quantity,
                unit_amount: line.unit_amount,
                proration_factor: line.proration_factor,
                amount: *amount,
                currency: line.currency.clone(),
            })
            .collect();
        let subtotal = items.iter().map(|i| i.amount).sum();
        PersistedOrderSnapshot {
            id: Uuid::new_v4(),
            organization_id: expected.organization_id,
            customer_id: expected.customer_id,
            subscription_id: Some(expected.subscription_id),
            billing_period: Some(expected.billing_period),
            currency: expected.currency.clone(),
            items,
            subtotal_amount: subtotal,
            discount_amount: 0,
            tax: TaxCalculation::none(),
            total_amount: subtotal,
            applied_balance_amount: 0,
            created_at: Utc::now(),
            voided_at: None,
        }
    }

    #[test]
    fn identical_orders_are_consistent() {
        let expected = expected(vec![line(Uuid::new_v4(), dec!(250), 7500)]);
        let actual = actual_from(&expected, &[7500]);

        let result = reconcile(&expected, &actual, 1).unwrap();
        assert!(result.is_consistent);
        assert!(result.mismatches.is_empty());
    }

    #[test]
    fn differences_within_tolerance_are_ignored() {
        let expected = expected(vec![line(Uuid::new_v4(), dec!(250), 7500)]);
        let actual = actual_from(&expected, &[7501]);

        let result = reconcile(&expected, &actual, 1).unwrap();
        assert!(result.mismatches.is_empty());
        assert!(result.is_consistent);
    }

    #[test]
    fn difference_beyond_tolerance_is_reported_once() {
        let expected = expected(vec![line(Uuid::new_v4(), dec!(250), 7500)]);
        let actual = actual_from(&expected, &[7502]);

        let result = reconcile(&expected, &actual, 1).unwrap();
        assert_eq!(result.mismatches.len(), 1);
        assert_eq!(result.count(MismatchClassification::AmountMismatch), 1);
        assert_eq!(result.mismatches[0].severity, Severity::Critical);
        assert!(!result.is_consistent);
    }

    #[test]
    fn unmatched_lines_are_missing_or_extra() {
        let expected_order = expected(vec![
            line(Uuid::new_v4(), dec!(1), 1000),
            line(Uuid::new_v4(), dec!(1), 500),
        ]);
        let mut actual = actual_from(&expected_order, &[1000, 500]);
        actual.items[1].product_price_id = Some(Uuid::new_v4());

        let result = reconcile(&expected_order, &actual, 1).unwrap();
        assert_eq!(result.count(MismatchClassification::MissingLineItem), 1);
        assert_eq!(result.count(MismatchClassification::ExtraLineItem), 1);
        assert_eq!(result.highest_severity(), Some(Severity::Critical));
    }

    #[test]
    fn boundary_drift_is_a_warning() {
        let mut drifted = line(Uuid::new_v4(), dec!(250), 7500);
        drifted.settled_quantity = dec!(240);
        drifted.late_event_count = 3;
        let expected = expected(vec![drifted]);
        let mut actual = actual_from(&expected, &[7000]);
        actual.items[0].quantity = dec!(240);

        let result = reconcile(&expected, &actual, 1).unwrap();
        assert_eq!(result.count(MismatchClassification::QuantityMismatch), 1);
        assert_eq!(result.count(MismatchClassification::AmountMismatch), 1);
        assert_eq!(result.count(MismatchClassification::TimingDrift), 1);
        assert_eq!(result.highest_severity(), Some(Severity::Warning));
        assert!(!result.is_consistent);
    }

    #[test]
    fn wrong_tax_and_total_are_critical() {
        let mut expected = expected(vec![line(Uuid::new_v4(), dec!(1), 10000)]);
        expected.tax_rate_basis_points = Some(2500);
        let mut actual = actual_from(&expected, &[10000]);
        actual.tax = TaxCalculation {
            amount: 2000,
            rate_basis_points: 2500,
            reason: "standard".to_string(),
        };
        actual.total_amount = 12500;

        let result = reconcile(&expected, &actual, 1).unwrap();
        assert_eq!(result.count(MismatchClassification::TaxMismatch), 1);
        assert_eq!(result.count(MismatchClassification::AmountMismatch), 1);
        assert!(result
            .mismatches
            .iter()
            .all(|m| m.severity == Severity::Critical));
    }

    #[test]
    fn overflowing_order_figures_are_an_error() {
        let expected = expected(vec![line(Uuid::new_v4(), dec!(1), 100)]);
        let mut actual = actual_from(&expected, &[100]);
        actual.discount_amount = i64::MIN;

        assert!(matches!(
            reconcile(&expected, &actual, 1),
            Err(PricingError::Overflow)
        ));
    }

    #[test]
    fn currency_mismatch_is_critical() {
        let expected = expected(vec![line(Uuid::new_v4(), dec!(1), 100)]);
        let mut actual = actual_from(&expected, &[100]);
        actual.currency = "eur".to_string();

        let result = reconcile(&expected, &actual, 1).unwrap();
        assert_eq!(result.count(MismatchClassification::CurrencyMismatch), 1);
        assert!(!result.is_consistent);
    }
}
