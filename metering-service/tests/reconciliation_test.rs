//! Integration tests for the billing oracle, reconciliation and sweeps.

mod common;

use chrono::Utc;
use common::{hours_ago, TestMetering};
use metering_service::config::MeteringSettings;
use metering_service::models::{
    Address, CreditTransaction, Discount, DiscountDuration, DiscountKind, MismatchClassification,
    Severity, SimulationTarget,
};
use metering_service::pricing::non_negative_running_sum;
use metering_service::reporting::ReconciliationService;
use metering_service::services::{CheckpointRepository, StaticTaxCalculator};
use metering_service::MeteringError;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::test]
async fn billed_usage_matches_the_oracle() {
    let t = TestMetering::spawn().await;
    // 250 units, 100 included, 50 per unit.
    t.ingest_usage(25, 10).await;

    let order_id = t.bill_current_period().await;
    let order = t.api.get_order(order_id).await.unwrap();
    assert_eq!(order.subtotal_amount, 7_500);
    assert_eq!(order.total_amount, 7_500);
    assert_eq!(order.items[0].quantity, dec!(250));

    let expected = t
        .api
        .simulate(t.organization_id, SimulationTarget::Order { order_id })
        .await
        .unwrap();
    assert_eq!(expected.total_amount, 7_500);
    assert_eq!(expected.events_scanned, 25);
    assert!(expected.is_conserved());

    let result = t.api.reconcile_order(order_id).await.unwrap();
    assert!(result.is_consistent, "{:?}", result.mismatches);
    assert!(result.mismatches.is_empty());
}

#[tokio::test]
async fn discounts_tax_and_excess_credit_reconcile() {
    let t = TestMetering::spawn_with_context(MeteringSettings::default(), |ctx| {
        ctx.with_tax_calculator(Arc::new(StaticTaxCalculator::new().with_rate("DE", 1900)))
    })
    .await;

    let mut terms = t.terms.clone();
    terms.billing_address = Some(Address {
        country: "DE".to_string(),
        ..Address::default()
    });
    terms.discounts = vec![
        Discount {
            id: Uuid::new_v4(),
            name: "ten percent".to_string(),
            kind: DiscountKind::Percentage { basis_points: 1_000 },
            duration: DiscountDuration::Forever,
            redeemed_at: hours_ago(2),
        },
        Discount {
            id: Uuid::new_v4(),
            name: "welcome".to_string(),
            kind: DiscountKind::Fixed { amount: 333 },
            duration: DiscountDuration::Forever,
            redeemed_at: hours_ago(2),
        },
    ];
    t.api.register_subscription(&terms).await.unwrap();

    let credits = &t.api.context().credits;
    credits
        .record_credit(&CreditTransaction {
            id: Uuid::new_v4(),
            organization_id: t.organization_id,
            customer_id: t.customer_id,
            amount: 20_000,
            currency: "usd".to_string(),
            order_id: None,
            created_at: hours_ago(1),
        })
        .await
        .unwrap();

    // 297 units: 197 billable at 50.
    t.ingest_usage(1, 297).await;
    let order_id = t.bill_current_period().await;

    let order = t.api.get_order(order_id).await.unwrap();
    assert_eq!(order.subtotal_amount, 9_850);
    assert_eq!(order.discount_amount, 985 + 333);
    assert_eq!(order.tax.amount, 1_621);
    assert_eq!(order.tax.rate_basis_points, 1_900);
    assert_eq!(order.total_amount, 9_850 - 1_318 + 1_621);
    assert_eq!(order.applied_balance_amount, -10_153);
    assert_eq!(order.due_amount(), 0);

    let expected = t
        .api
        .simulate(t.organization_id, SimulationTarget::Order { order_id })
        .await
        .unwrap();
    assert!(expected.is_conserved());
    assert_eq!(expected.discount_amount, order.discount_amount);
    assert_eq!(expected.tax_amount, order.tax.amount);
    assert_eq!(expected.total_amount, order.total_amount);
    assert_eq!(expected.available_balance, 20_000);
    assert_eq!(expected.applied_balance_amount, -10_153);
    assert_eq!(expected.due_amount, 0);

    let result = t.api.reconcile_order(order_id).await.unwrap();
    assert!(result.is_consistent, "{:?}", result.mismatches);
    assert!(result.mismatches.is_empty());

    let ledger = credits
        .list_credits(
            t.organization_id,
            t.customer_id,
            "usd",
            Utc::now() + chrono::Duration::seconds(1),
        )
        .await
        .unwrap();
    let remaining = non_negative_running_sum(ledger.iter().map(|c| c.amount));
    assert_eq!(remaining, 20_000 - 10_153);
}

#[tokio::test]
async fn period_can_be_simulated_before_it_is_billed() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(5, 30).await;

    let expected = t
        .api
        .simulate(
            t.organization_id,
            SimulationTarget::Period {
                subscription_id: t.terms.id,
                window: t.terms.current_period(),
            },
        )
        .await
        .unwrap();

    assert_eq!(expected.order_id, None);
    assert_eq!(expected.line_items.len(), 1);
    assert_eq!(expected.line_items[0].quantity, dec!(150));
    assert_eq!(expected.subtotal_amount, 2_500);
    assert_eq!(expected.tax_amount, 0);
}

#[tokio::test]
async fn drifted_line_amount_is_reported_once() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(25, 10).await;
    let order_id = t.bill_current_period().await;

    let mut order = t.api.get_order(order_id).await.unwrap();
    order.items[0].amount += 2;
    order.subtotal_amount += 2;
    order.total_amount += 2;
    t.store.replace_order(order).unwrap();

    let result = t.api.reconcile_order(order_id).await.unwrap();
    assert!(!result.is_consistent);
    assert_eq!(result.count(MismatchClassification::AmountMismatch), 1);
    assert_eq!(result.mismatches.len(), 1);
    assert_eq!(result.highest_severity(), Some(Severity::Critical));
}

#[tokio::test]
async fn one_cent_rounding_drift_is_tolerated() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(25, 10).await;
    let order_id = t.bill_current_period().await;

    let mut order = t.api.get_order(order_id).await.unwrap();
    order.items[0].amount += 1;
    order.subtotal_amount += 1;
    order.total_amount += 1;
    t.store.replace_order(order).unwrap();

    let result = t.api.reconcile_order(order_id).await.unwrap();
    assert!(result.is_consistent, "{:?}", result.mismatches);
}

#[tokio::test]
async fn purged_events_make_the_simulation_incomplete() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(3, 50).await;
    let order_id = t.bill_current_period().await;

    let purged = t
        .api
        .purge_events(t.organization_id, Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(purged, 3);

    let err = t.api.reconcile_order(order_id).await.unwrap_err();
    assert!(matches!(err, MeteringError::IncompleteSimulationInput(_)));
}

#[tokio::test]
async fn unknown_order_is_not_found() {
    let t = TestMetering::spawn().await;
    let err = t.api.reconcile_order(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, MeteringError::NotFound { .. }));
}

#[tokio::test]
async fn sweep_reconciles_recent_orders() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(25, 10).await;
    let order_id = t.bill_current_period().await;

    let report = t.api.run_sweep(24).await.unwrap();

    assert!(!report.cancelled);
    assert!(report.is_clean());
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].order_id, Some(order_id));
    assert!(report.checkpoint.finished);
    assert_eq!(report.checkpoint.completed_subscriptions, vec![t.terms.id]);
}

#[tokio::test]
async fn sweep_isolates_failing_orders() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(2, 10).await;
    t.bill_current_period().await;
    t.api
        .purge_events(t.organization_id, Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();

    let report = t.api.run_sweep(24).await.unwrap();

    assert!(report.results.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].subscription_id, Some(t.terms.id));
    assert!(report.checkpoint.finished);
}

#[tokio::test]
async fn cancelled_sweep_can_be_resumed() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(25, 10).await;
    t.bill_current_period().await;

    let token = CancellationToken::new();
    token.cancel();
    let cancelled = ReconciliationService::with_shutdown(t.api.context(), token);
    let report = cancelled.run_sweep(24).await.unwrap();

    assert!(report.cancelled);
    assert!(report.results.is_empty());
    assert!(!report.checkpoint.finished);

    let resumed = t.api.resume_sweep(report.sweep_id).await.unwrap();
    assert!(!resumed.cancelled);
    assert_eq!(resumed.results.len(), 1);
    assert!(resumed.checkpoint.finished);
}

#[tokio::test]
async fn unfinished_sweeps_are_picked_up_without_their_id() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(25, 10).await;
    t.bill_current_period().await;

    let token = CancellationToken::new();
    token.cancel();
    let cancelled = ReconciliationService::with_shutdown(t.api.context(), token);
    let report = cancelled.run_sweep(24).await.unwrap();
    assert!(!report.checkpoint.finished);

    let resumed = t.api.resume_unfinished_sweeps().await.unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].sweep_id, report.sweep_id);
    assert!(resumed[0].checkpoint.finished);
    assert_eq!(resumed[0].results.len(), 1);

    let checkpoints = &t.api.context().checkpoints;
    assert!(checkpoints
        .list_unfinished_checkpoints(10)
        .await
        .unwrap()
        .is_empty());
    assert!(t.api.resume_unfinished_sweeps().await.unwrap().is_empty());
}

#[tokio::test]
async fn sweep_window_must_be_positive() {
    let t = TestMetering::spawn().await;
    let err = t.api.run_sweep(0).await.unwrap_err();
    assert!(matches!(err, MeteringError::InvalidInput(_)));
}
