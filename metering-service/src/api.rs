//! Operations exposed by the metering core.

use crate::context::MeteringContext;
use crate::error::{MeteringError, MeteringResult};
use crate::events::EventStore;
use crate::ledger::{LedgerService, TickReport};
use crate::metering::MeterAggregator;
use crate::models::{
    BillingEntry, BillingPeriod, CreateMeter, CustomerRef, Event, ExpectedOrder, IngestEvent,
    IngestOutcome, Meter, OrderItemRef, PersistedOrderSnapshot, ReconciliationResult,
    SimulationTarget, SubscriptionTerms, TimeWindow,
};
use crate::oracle::BillingOracle;
use crate::reporting::{ReconciliationService, SweepReport};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Facade over the event store, aggregator, ledger, oracle and reporter,
/// all sharing one [`MeteringContext`].
#[derive(Clone)]
pub struct MeteringApi {
    ctx: MeteringContext,
    events: EventStore,
    meters: MeterAggregator,
    ledger: LedgerService,
    oracle: BillingOracle,
    reporting: ReconciliationService,
}

impl MeteringApi {
    pub fn new(ctx: MeteringContext) -> Self {
        Self::with_shutdown(ctx, CancellationToken::new())
    }

    /// `shutdown` aborts running sweeps between subscriptions.
    pub fn with_shutdown(ctx: MeteringContext, shutdown: CancellationToken) -> Self {
        Self {
            events: EventStore::new(&ctx),
            meters: MeterAggregator::new(&ctx),
            ledger: LedgerService::new(&ctx),
            oracle: BillingOracle::new(&ctx),
            reporting: ReconciliationService::with_shutdown(&ctx, shutdown),
            ctx,
        }
    }

    pub fn context(&self) -> &MeteringContext {
        &self.ctx
    }

    // =========================================================================
    // Events and meters
    // =========================================================================

    /// Store an event and accrue it against the customer's subscriptions.
    ///
    /// A duplicate external id returns the stored event; accrual is repeated
    /// for it, which is a no-op once its entries exist.
    #[instrument(skip(self, input), fields(organization_id = %input.organization_id))]
    pub async fn ingest_event(&self, input: IngestEvent) -> MeteringResult<IngestOutcome> {
        let outcome = self.events.ingest(input).await?;
        self.ledger.accrue(outcome.event()).await?;
        Ok(outcome)
    }

    /// Ingest many events; failures are reported per event.
    pub async fn ingest_events(&self, inputs: Vec<IngestEvent>) -> Vec<MeteringResult<IngestOutcome>> {
        let mut outcomes = Vec::with_capacity(inputs.len());
        for outcome in self.events.ingest_batch(inputs).await {
            let outcome = match outcome {
                Ok(o) => match self.ledger.accrue(o.event()).await {
                    Ok(_) => Ok(o),
                    Err(e) => {
                        warn!(event_id = %o.event().id, error = %e, "Accrual failed");
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn purge_events(
        &self,
        organization_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> MeteringResult<u64> {
        self.events.purge_before(organization_id, cutoff).await
    }

    pub async fn create_meter(&self, input: CreateMeter) -> MeteringResult<Meter> {
        self.meters.create_meter(input).await
    }

    pub async fn archive_meter(&self, organization_id: Uuid, meter_id: Uuid) -> MeteringResult<Meter> {
        self.meters.archive_meter(organization_id, meter_id).await
    }

    pub async fn aggregate_meter(
        &self,
        organization_id: Uuid,
        meter_id: Uuid,
        customer: &CustomerRef,
        window: TimeWindow,
    ) -> MeteringResult<Decimal> {
        let meter = self.meters.get_meter(organization_id, meter_id).await?;
        self.meters.aggregate(&meter, customer, window).await
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    pub async fn register_subscription(
        &self,
        terms: &SubscriptionTerms,
    ) -> MeteringResult<BillingPeriod> {
        self.ledger.register_subscription(terms).await
    }

    pub async fn accrue(&self, event: &Event) -> MeteringResult<Vec<BillingEntry>> {
        self.ledger.accrue(event).await
    }

    /// Close the subscription's accruing period and open the next one.
    pub async fn close_period(&self, subscription_id: Uuid) -> MeteringResult<BillingPeriod> {
        self.ledger.close_current(subscription_id).await
    }

    pub async fn price_period(&self, subscription_id: Uuid) -> MeteringResult<BillingPeriod> {
        self.ledger.price_current(subscription_id).await
    }

    /// Turn the subscription's priced period into an order. Repeating the
    /// call returns the same item references.
    pub async fn materialize_period(
        &self,
        subscription_id: Uuid,
    ) -> MeteringResult<Vec<OrderItemRef>> {
        self.ledger.materialize_current(subscription_id).await
    }

    /// The subscription's earliest period without an order, read-only.
    pub async fn current_period(&self, subscription_id: Uuid) -> MeteringResult<BillingPeriod> {
        self.ledger.current_period(subscription_id).await
    }

    pub async fn process_due_periods(&self, now: DateTime<Utc>) -> MeteringResult<TickReport> {
        self.ledger.process_due_periods(now).await
    }

    pub async fn void_order(&self, order_id: Uuid) -> MeteringResult<u64> {
        self.ledger.void_order(order_id).await
    }

    pub async fn get_period(&self, period_id: Uuid) -> MeteringResult<BillingPeriod> {
        self.ctx
            .ledger
            .get_period(period_id)
            .await?
            .ok_or_else(|| MeteringError::not_found("billing period", period_id))
    }

    pub async fn get_order(&self, order_id: Uuid) -> MeteringResult<PersistedOrderSnapshot> {
        self.ctx
            .orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| MeteringError::not_found("order", order_id))
    }

    // =========================================================================
    // Oracle and reconciliation
    // =========================================================================

    pub async fn simulate(
        &self,
        organization_id: Uuid,
        target: SimulationTarget,
    ) -> MeteringResult<ExpectedOrder> {
        self.oracle.simulate(organization_id, target).await
    }

    pub fn reconcile(
        &self,
        expected: &ExpectedOrder,
        actual: &PersistedOrderSnapshot,
    ) -> MeteringResult<ReconciliationResult> {
        self.reporting.reconcile(expected, actual)
    }

    pub async fn reconcile_order(&self, order_id: Uuid) -> MeteringResult<ReconciliationResult> {
        self.reporting.reconcile_order(order_id).await
    }

    pub async fn run_sweep(&self, hours: i64) -> MeteringResult<SweepReport> {
        self.reporting.run_sweep(hours).await
    }

    pub async fn resume_sweep(&self, sweep_id: Uuid) -> MeteringResult<SweepReport> {
        self.reporting.resume_sweep(sweep_id).await
    }

    pub async fn resume_unfinished_sweeps(&self) -> MeteringResult<Vec<SweepReport>> {
        self.reporting.resume_unfinished().await
    }
}
