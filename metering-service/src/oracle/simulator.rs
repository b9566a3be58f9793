use super::usage::{UsageBreakdown, UsageSplitter};
use crate::context::MeteringContext;
use crate::error::{MeteringError, MeteringResult};
use crate::events::EventStore;
use crate::models::{
    CustomerRef, ExpectedLineItem, ExpectedOrder, Meter, PersistedOrderSnapshot, SimulationTarget,
    SubscriptionPrice, SubscriptionTerms, TimeWindow,
};
use crate::pricing::{
    applicable_discounts, apply_discounts, non_negative_running_sum, quote_line, tax_amount,
    OrderTotals,
};
use chrono::{Duration, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const EVENT_LOOKUP_CHUNK: usize = 1_000;

/// Recomputes orders from subscription terms and raw events.
///
/// Ledger amounts are never read; the ledger is consulted only to verify
/// that the events its entries reference still exist.
#[derive(Clone)]
pub struct BillingOracle {
    ctx: MeteringContext,
    events: EventStore,
}

struct SimulationInput {
    terms: SubscriptionTerms,
    window: TimeWindow,
    order: Option<PersistedOrderSnapshot>,
}

impl BillingOracle {
    pub fn new(ctx: &MeteringContext) -> Self {
        Self {
            ctx: ctx.clone(),
            events: EventStore::new(ctx),
        }
    }

    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub async fn simulate(
        &self,
        organization_id: Uuid,
        target: SimulationTarget,
    ) -> MeteringResult<ExpectedOrder> {
        let input = self.load_input(organization_id, target).await?;
        let SimulationInput {
            terms,
            window,
            order,
        } = input;

        self.verify_entry_events(organization_id, &terms, &window)
            .await?;

        let grace = Duration::from_std(self.ctx.settings.late_arrival_grace)
            .map_err(|e| MeteringError::InvalidInput(format!("late arrival grace: {}", e)))?;
        let customer = terms.customer_ref();

        let mut scanned = 0u64;
        let mut line_items = Vec::new();
        for sub_price in &terms.prices {
            if let Some(line) = self
                .expected_line(organization_id, sub_price, &customer, &window, grace, &mut scanned)
                .await?
            {
                line_items.push(line);
            }
        }

        let subtotal: i64 = line_items.iter().map(ExpectedLineItem::total).sum();
        let discounts = applicable_discounts(&terms.discounts, &window);
        let discount = apply_discounts(subtotal, &discounts)
            .map_err(|e| MeteringError::InvalidInput(format!("discount computation failed: {}", e)))?;

        let tax_rate = order.as_ref().map(|o| o.tax.rate_basis_points);
        let tax = match tax_rate {
            Some(rate) => tax_amount(subtotal - discount, rate)
                .map_err(|e| MeteringError::InvalidInput(format!("tax computation failed: {}", e)))?,
            None => 0,
        };

        let credits_before = order.as_ref().map(|o| o.created_at).unwrap_or_else(Utc::now);
        let credits = self
            .ctx
            .credits
            .list_credits(organization_id, terms.customer_id, &terms.currency, credits_before)
            .await?;
        let available = non_negative_running_sum(credits.iter().map(|c| c.amount));
        let totals = OrderTotals::new(subtotal, discount, tax, available);

        let expected = ExpectedOrder {
            organization_id,
            subscription_id: terms.id,
            customer_id: terms.customer_id,
            order_id: order.as_ref().map(|o| o.id),
            billing_period: window,
            currency: terms.currency.clone(),
            line_items,
            subtotal_amount: totals.subtotal,
            discount_amount: totals.discount,
            tax_amount: totals.tax,
            tax_rate_basis_points: tax_rate,
            total_amount: totals.total,
            applied_balance_amount: totals.applied_balance,
            due_amount: totals.due,
            available_balance: available,
            discounts,
            events_scanned: scanned,
            simulated_at: Utc::now(),
        };

        info!(
            subscription_id = %expected.subscription_id,
            order_id = ?expected.order_id,
            total = expected.total_amount,
            events_scanned = scanned,
            "Order simulated"
        );
        Ok(expected)
    }

    async fn load_input(
        &self,
        organization_id: Uuid,
        target: SimulationTarget,
    ) -> MeteringResult<SimulationInput> {
        let (subscription_id, window, order) = match target {
            SimulationTarget::Order { order_id } => {
                let order = self
                    .ctx
                    .orders
                    .get_order(order_id)
                    .await?
                    .filter(|o| o.organization_id == organization_id)
                    .ok_or_else(|| {
                        MeteringError::incomplete(format!("order {} not found", order_id))
                    })?;
                let subscription_id = order.subscription_id.ok_or_else(|| {
                    MeteringError::incomplete(format!("order {} has no subscription", order_id))
                })?;
                let window = order.billing_period.ok_or_else(|| {
                    MeteringError::incomplete(format!("order {} has no billing period", order_id))
                })?;
                (subscription_id, window, Some(order))
            }
            SimulationTarget::Period {
                subscription_id,
                window,
            } => (subscription_id, window, None),
        };

        if window.is_empty() {
            return Err(MeteringError::InvalidInput(format!(
                "empty billing period {} - {}",
                window.start, window.end
            )));
        }

        let terms = self
            .ctx
            .subscriptions
            .get_subscription(organization_id, subscription_id)
            .await?
            .ok_or_else(|| {
                MeteringError::incomplete(format!("subscription {} not found", subscription_id))
            })?;

        Ok(SimulationInput {
            terms,
            window,
            order,
        })
    }

    /// Every event referenced by the period's ledger entries must still be
    /// in the event store.
    async fn verify_entry_events(
        &self,
        organization_id: Uuid,
        terms: &SubscriptionTerms,
        window: &TimeWindow,
    ) -> MeteringResult<()> {
        let Some(period) = self
            .ctx
            .ledger
            .find_period_by_start(terms.id, window.start)
            .await?
        else {
            debug!(subscription_id = %terms.id, "No ledger period for window");
            return Ok(());
        };

        let ids: Vec<Uuid> = self
            .ctx
            .ledger
            .list_entries(period.id)
            .await?
            .into_iter()
            .filter(|e| !e.synthetic)
            .map(|e| e.event_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut found = 0usize;
        for chunk in ids.chunks(EVENT_LOOKUP_CHUNK) {
            found += self.events.get_events(organization_id, chunk).await?.len();
        }
        if found != ids.len() {
            return Err(MeteringError::incomplete(format!(
                "{} events referenced by period {} are missing",
                ids.len() - found,
                period.id
            )));
        }
        Ok(())
    }

    async fn expected_line(
        &self,
        organization_id: Uuid,
        sub_price: &SubscriptionPrice,
        customer: &CustomerRef,
        window: &TimeWindow,
        grace: Duration,
        scanned: &mut u64,
    ) -> MeteringResult<Option<ExpectedLineItem>> {
        let Some(effective) = sub_price.effective_window(window) else {
            return Ok(None);
        };
        let price_id = sub_price.price.id;

        let usage = match sub_price.price.spec.meter_id() {
            Some(meter_id) => {
                let meter = self
                    .ctx
                    .meters
                    .get_meter(organization_id, meter_id)
                    .await?
                    .ok_or_else(|| {
                        MeteringError::incomplete(format!("meter {} not found", meter_id))
                    })?;
                Some(
                    self.scan_usage(&meter, customer, *window, effective, grace, scanned)
                        .await?,
                )
            }
            None => None,
        };

        let quantity = usage.as_ref().map_or(Decimal::ZERO, |u| u.quantity);
        let Some(quote) = quote_line(sub_price, window, quantity)
            .map_err(|e| MeteringError::pricing(price_id, e.to_string()))?
        else {
            return Ok(None);
        };

        let (settled, carried, late) = match &usage {
            Some(u) => (u.settled, u.carried, u.late_events),
            None => (quote.quantity, quote.quantity, 0),
        };

        Ok(Some(ExpectedLineItem {
            product_price_id: price_id,
            window: quote.window,
            quantity: quote.quantity,
            unit_amount: quote.unit_amount,
            proration_factor: quote.proration_factor,
            cap_amount: quote.cap_amount,
            computed_amount: quote.amount,
            currency: quote.currency,
            settled_quantity: settled,
            carried_quantity: carried,
            late_event_count: late,
        }))
    }

    /// Single bounded scan feeding every usage view of one metered line.
    async fn scan_usage(
        &self,
        meter: &Meter,
        customer: &CustomerRef,
        period: TimeWindow,
        effective: TimeWindow,
        grace: Duration,
        scanned: &mut u64,
    ) -> MeteringResult<UsageBreakdown> {
        // Events ingested after archival were never accrued.
        let effective = match meter.archived_at {
            Some(archived_at) => TimeWindow::new(effective.start, effective.end.min(archived_at)),
            None => effective,
        };

        let mut splitter = UsageSplitter::new(&meter.aggregation, period, effective, grace);
        let mut stream = self.events.query(
            meter.organization_id,
            Some(meter.filter.clone()),
            Some(customer.clone()),
            splitter.scan_window(),
        );

        let ceiling = self.ctx.settings.max_simulation_events;
        while let Some(event) = stream.try_next().await? {
            *scanned += 1;
            if *scanned > ceiling {
                return Err(MeteringError::incomplete(format!(
                    "simulation exceeds the ceiling of {} events",
                    ceiling
                )));
            }
            splitter.push(&event);
        }
        Ok(splitter.finish())
    }
}
