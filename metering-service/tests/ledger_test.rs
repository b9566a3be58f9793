//! Integration tests for the billing entry ledger.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{fixed_price, metered_price, TestMetering};
use metering_service::config::MeteringSettings;
use metering_service::events::EventStore;
use metering_service::models::{
    BillingEntry, BillingPeriod, PeriodState, SubscriptionPrice, SubscriptionStatus,
    SubscriptionTerms,
};
use metering_service::services::{LedgerRepository, UsageInsert};
use metering_service::MeteringError;
use rust_decimal_macros::dec;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

/// Ledger whose usage inserts stall before reaching storage, widening the
/// window between the accruing check and the write.
struct SlowUsageInsert {
    inner: Arc<dyn LedgerRepository>,
    delay: std::time::Duration,
}

#[async_trait]
impl LedgerRepository for SlowUsageInsert {
    async fn insert_period_if_absent(&self, period: &BillingPeriod) -> Result<BillingPeriod, AppError> {
        self.inner.insert_period_if_absent(period).await
    }

    async fn get_period(&self, id: Uuid) -> Result<Option<BillingPeriod>, AppError> {
        self.inner.get_period(id).await
    }

    async fn find_period_at(
        &self,
        subscription_id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<Option<BillingPeriod>, AppError> {
        self.inner.find_period_at(subscription_id, instant).await
    }

    async fn find_period_by_start(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<Option<BillingPeriod>, AppError> {
        self.inner.find_period_by_start(subscription_id, period_start).await
    }

    async fn find_period_by_order(&self, order_id: Uuid) -> Result<Option<BillingPeriod>, AppError> {
        self.inner.find_period_by_order(order_id).await
    }

    async fn latest_period(&self, subscription_id: Uuid) -> Result<Option<BillingPeriod>, AppError> {
        self.inner.latest_period(subscription_id).await
    }

    async fn first_period_in(
        &self,
        subscription_id: Uuid,
        states: &[PeriodState],
    ) -> Result<Option<BillingPeriod>, AppError> {
        self.inner.first_period_in(subscription_id, states).await
    }

    async fn last_period_in(
        &self,
        subscription_id: Uuid,
        states: &[PeriodState],
    ) -> Result<Option<BillingPeriod>, AppError> {
        self.inner.last_period_in(subscription_id, states).await
    }

    async fn update_period(&self, period: &BillingPeriod) -> Result<(), AppError> {
        self.inner.update_period(period).await
    }

    async fn list_periods(
        &self,
        state: PeriodState,
        ended_by: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<BillingPeriod>, AppError> {
        self.inner.list_periods(state, ended_by, limit).await
    }

    async fn insert_entries(&self, entries: &[BillingEntry]) -> Result<(), AppError> {
        self.inner.insert_entries(entries).await
    }

    async fn insert_usage_entry(&self, entry: &BillingEntry) -> Result<UsageInsert, AppError> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_usage_entry(entry).await
    }

    async fn list_entries(&self, period_id: Uuid) -> Result<Vec<BillingEntry>, AppError> {
        self.inner.list_entries(period_id).await
    }

    async fn entries_for_event(&self, event_id: Uuid) -> Result<Vec<BillingEntry>, AppError> {
        self.inner.entries_for_event(event_id).await
    }

    async fn assign_amounts(&self, amounts: &[(Uuid, i64)]) -> Result<u64, AppError> {
        self.inner.assign_amounts(amounts).await
    }

    async fn link_order_items(&self, links: &[(Uuid, Uuid)]) -> Result<(), AppError> {
        self.inner.link_order_items(links).await
    }

    async fn soft_delete_entries(
        &self,
        ids: &[Uuid],
        deleted_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        self.inner.soft_delete_entries(ids, deleted_at).await
    }
}

async fn spawn_with_slow_inserts(delay_ms: u64) -> TestMetering {
    TestMetering::spawn_with_context(MeteringSettings::default(), |mut ctx| {
        ctx.ledger = Arc::new(SlowUsageInsert {
            inner: ctx.ledger.clone(),
            delay: std::time::Duration::from_millis(delay_ms),
        });
        ctx
    })
    .await
}

#[tokio::test]
async fn materializing_twice_returns_the_same_items() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(3, 60).await;

    let period_id = t.current_period_id().await;
    t.api.close_period(t.terms.id).await.unwrap();
    t.api.price_period(t.terms.id).await.unwrap();

    let first = t.api.materialize_period(t.terms.id).await.unwrap();
    let second = t.api.materialize_period(t.terms.id).await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first, second);

    let period = t.api.get_period(period_id).await.unwrap();
    assert_eq!(period.state, PeriodState::Materialized);
    assert_eq!(period.order_id, Some(first[0].order_id));
    assert!(t
        .store
        .all_entries()
        .unwrap()
        .iter()
        .all(|e| e.order_item_id == Some(first[0].order_item_id)));
}

#[tokio::test]
async fn usage_after_close_is_deferred_to_the_next_period() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(1, 1).await;

    let period_id = t.current_period_id().await;
    t.api.close_period(t.terms.id).await.unwrap();

    let outcome = t
        .api
        .ingest_event(t.usage_event(1, None))
        .await
        .unwrap();

    let entries = t.store.all_entries().unwrap();
    let late = entries
        .iter()
        .find(|e| e.event_id == outcome.event().id)
        .unwrap();
    assert!(late.deferred);
    assert_ne!(late.period_id, period_id);

    let next = t.api.get_period(late.period_id).await.unwrap();
    assert_eq!(next.state, PeriodState::Accruing);
    assert_eq!(next.period_start, t.terms.current_period_end);
}

#[tokio::test]
async fn transitions_out_of_order_are_rejected() {
    let t = TestMetering::spawn().await;

    let err = t.api.price_period(t.terms.id).await.unwrap_err();
    assert!(matches!(
        err,
        MeteringError::InvalidTransition {
            expected: PeriodState::Closing,
            actual: PeriodState::Accruing,
            ..
        }
    ));

    let err = t.api.materialize_period(t.terms.id).await.unwrap_err();
    assert!(matches!(err, MeteringError::InvalidTransition { .. }));
}

#[tokio::test]
async fn pricing_failure_keeps_the_period_closing() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(2, 10).await;

    let period_id = t.current_period_id().await;
    t.api.close_period(t.terms.id).await.unwrap();

    // Detach the metered price the entries were accrued against.
    let mut terms = t.terms.clone();
    terms.prices = vec![SubscriptionPrice::new(fixed_price(1_000))];
    t.api.register_subscription(&terms).await.unwrap();

    let err = t.api.price_period(t.terms.id).await.unwrap_err();
    assert!(matches!(err, MeteringError::PricingFailure { .. }));

    let period = t.api.get_period(period_id).await.unwrap();
    assert_eq!(period.state, PeriodState::Closing);
    assert_eq!(period.pricing_attempts, 1);
    assert!(period.last_error.is_some());
    assert!(t.store.all_entries().unwrap().iter().all(|e| e.amount.is_none()));
}

#[tokio::test]
async fn static_prices_are_billed_through_synthetic_entries() {
    let t = TestMetering::spawn().await;
    let mut terms = t.terms.clone();
    terms.prices.push(SubscriptionPrice::new(fixed_price(2_000)));
    t.api.register_subscription(&terms).await.unwrap();
    t.ingest_usage(1, 150).await;

    t.api.close_period(t.terms.id).await.unwrap();
    let priced = t.api.price_period(t.terms.id).await.unwrap();

    let subtotal: i64 = priced.priced_lines.iter().map(|l| l.amount).sum();
    assert_eq!(subtotal, 2_000 + 50 * 50);

    let entries = t.store.all_entries().unwrap();
    assert_eq!(entries.iter().filter(|e| e.synthetic).count(), 1);
    assert_eq!(
        entries.iter().filter_map(|e| e.amount).sum::<i64>(),
        subtotal
    );
}

#[tokio::test]
async fn tick_bills_periods_that_have_ended() {
    let t = TestMetering::spawn().await;
    let now = Utc::now();

    let ended = SubscriptionTerms {
        id: Uuid::new_v4(),
        customer_id: Uuid::new_v4(),
        external_customer_id: None,
        current_period_start: now - Duration::hours(3),
        current_period_end: now - Duration::hours(1),
        prices: vec![
            SubscriptionPrice::new(metered_price(t.meter.id)),
            SubscriptionPrice::new(fixed_price(900)),
        ],
        ..t.terms.clone()
    };
    let period = t.api.register_subscription(&ended).await.unwrap();

    let report = t.api.process_due_periods(now).await.unwrap();
    assert_eq!(report.closed, 1);
    assert_eq!(report.priced, 1);
    assert_eq!(report.materialized, 1);
    assert!(report.failures.is_empty());

    let period = t.api.get_period(period.id).await.unwrap();
    assert_eq!(period.state, PeriodState::Materialized);
    let order = t.api.get_order(period.order_id.unwrap()).await.unwrap();
    assert_eq!(order.total_amount, 900);

    // The fixture's own period has not ended yet.
    let current = t.api.get_period(t.current_period_id().await).await.unwrap();
    assert_eq!(current.state, PeriodState::Accruing);
}

#[tokio::test]
async fn canceled_subscriptions_do_not_accrue() {
    let t = TestMetering::spawn().await;
    let mut terms = t.terms.clone();
    terms.status = SubscriptionStatus::Canceled;
    t.api.register_subscription(&terms).await.unwrap();

    t.ingest_usage(2, 10).await;
    assert!(t.store.all_entries().unwrap().is_empty());
}

#[tokio::test]
async fn voiding_an_order_releases_its_entries() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(3, 50).await;
    let order_id = t.bill_current_period().await;

    let voided = t.api.void_order(order_id).await.unwrap();
    assert_eq!(voided, 3);

    let order = t.api.get_order(order_id).await.unwrap();
    assert!(order.voided_at.is_some());
    assert!(t.store.all_entries().unwrap().iter().all(|e| !e.is_active()));
}

#[tokio::test]
async fn usage_racing_a_close_is_deferred_not_lost() {
    let t = spawn_with_slow_inserts(200).await;
    t.ingest_usage(2, 90).await;
    let period_id = t.current_period_id().await;

    let racing = t.usage_event(100, None);
    let (outcome, order_id) = tokio::join!(t.api.ingest_event(racing), async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        t.bill_current_period().await
    });
    let outcome = outcome.unwrap();

    let order = t.api.get_order(order_id).await.unwrap();
    assert_eq!(order.items[0].quantity, dec!(180));
    assert_eq!(order.subtotal_amount, 80 * 50);

    let entries = t.store.all_entries().unwrap();
    let racing_entry = entries
        .iter()
        .find(|e| e.event_id == outcome.event().id)
        .expect("racing event was not accrued");
    assert!(racing_entry.deferred);
    assert_ne!(racing_entry.period_id, period_id);
    assert_eq!(racing_entry.order_item_id, None);

    let next = t.api.get_period(racing_entry.period_id).await.unwrap();
    assert_eq!(next.state, PeriodState::Accruing);
    assert_eq!(next.period_start, t.terms.current_period_end);
    assert_eq!(t.current_period_id().await, next.id);
}

#[tokio::test]
async fn concurrent_accrual_of_one_event_bills_it_once() {
    let t = spawn_with_slow_inserts(50).await;
    let stored = EventStore::new(t.api.context())
        .ingest(t.usage_event(300, None))
        .await
        .unwrap();
    let event = stored.event();

    let (first, second) = tokio::join!(t.api.accrue(event), t.api.accrue(event));
    assert_eq!(first.unwrap().len() + second.unwrap().len(), 1);

    let entries = t.store.all_entries().unwrap();
    assert_eq!(entries.iter().filter(|e| e.event_id == event.id).count(), 1);

    let order_id = t.bill_current_period().await;
    let order = t.api.get_order(order_id).await.unwrap();
    assert_eq!(order.items[0].quantity, dec!(300));
    assert_eq!(order.subtotal_amount, 200 * 50);
}

#[tokio::test]
async fn subscription_transitions_follow_the_current_period() {
    let t = TestMetering::spawn().await;
    t.ingest_usage(1, 120).await;
    let first_period = t.current_period_id().await;

    let closed = t.api.close_period(t.terms.id).await.unwrap();
    assert_eq!(closed.id, first_period);
    assert_eq!(t.current_period_id().await, first_period);

    t.api.price_period(t.terms.id).await.unwrap();
    t.api.materialize_period(t.terms.id).await.unwrap();

    let current = t.api.current_period(t.terms.id).await.unwrap();
    assert_ne!(current.id, first_period);
    assert_eq!(current.state, PeriodState::Accruing);
    assert_eq!(current.period_start, t.terms.current_period_end);

    let err = t.api.current_period(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, MeteringError::NotFound { .. }));
}
