//! Billing entry ledger.
//!
//! Each (subscription, period) moves `accruing -> closing -> priced ->
//! materialized`. Accrual takes no lease: each usage entry is written only
//! while its period is still accruing. The three later transitions run under
//! a per-subscription lease.

use super::lock::Lease;
use crate::context::MeteringContext;
use crate::error::{LockError, MeteringError, MeteringResult};
use crate::metering::{aggregate_events, filter};
use crate::models::{
    BillingEntry, BillingPeriod, CreditTransaction, CustomerRef, Direction, Event, Meter,
    NewBillingEntry, OrderDraft, OrderItemDraft, OrderItemRef, PeriodState, PricedLine,
    SubscriptionPrice, SubscriptionTerms, TimeWindow,
};
use crate::pricing::{
    applicable_discounts, apply_discounts, non_negative_running_sum, quote_line, OrderTotals,
};
use crate::services::metrics::{
    record_entries_accrued, record_error, record_period_transition, record_pricing_failure,
};
use crate::services::repository::UsageInsert;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Periods a single accrual may open ahead of the latest known one.
const MAX_PERIOD_ADVANCE: usize = 366;

/// Periods handled per state in one scheduler tick.
const TICK_BATCH: usize = 500;

/// States of a period still moving towards an order.
const OPEN_STATES: [PeriodState; 3] = [
    PeriodState::Accruing,
    PeriodState::Closing,
    PeriodState::Priced,
];

/// Event ids fetched per lookup while pricing.
const EVENT_LOOKUP_CHUNK: usize = 1_000;

/// Outcome of one [`LedgerService::process_due_periods`] tick.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub closed: usize,
    pub priced: usize,
    pub materialized: usize,
    pub failures: Vec<(Uuid, String)>,
}

#[derive(Clone)]
pub struct LedgerService {
    ctx: MeteringContext,
}

impl LedgerService {
    pub fn new(ctx: &MeteringContext) -> Self {
        Self { ctx: ctx.clone() }
    }

    // =========================================================================
    // Period bookkeeping
    // =========================================================================

    /// Store the terms of a subscription and open its current period.
    #[instrument(skip(self, terms), fields(subscription_id = %terms.id))]
    pub async fn register_subscription(
        &self,
        terms: &SubscriptionTerms,
    ) -> MeteringResult<BillingPeriod> {
        if terms.current_period().is_empty() {
            return Err(MeteringError::InvalidInput(format!(
                "subscription {} has an empty current period",
                terms.id
            )));
        }
        self.ctx.subscriptions.upsert_subscription(terms).await?;
        self.open_period(terms, terms.current_period_start, terms.current_period_end)
            .await
    }

    async fn open_period(
        &self,
        terms: &SubscriptionTerms,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MeteringResult<BillingPeriod> {
        let period = BillingPeriod::open(
            terms.organization_id,
            terms.customer_id,
            terms.id,
            terms.currency.clone(),
            TimeWindow::new(start, end),
        );
        Ok(self.ctx.ledger.insert_period_if_absent(&period).await?)
    }

    async fn open_next(
        &self,
        terms: &SubscriptionTerms,
        period: &BillingPeriod,
    ) -> MeteringResult<BillingPeriod> {
        let next = terms.next_period(&period.window());
        self.open_period(terms, next.start, next.end).await
    }

    /// Period of `terms` whose window contains `instant`, opening periods
    /// forward from the latest one as needed. `None` when `instant` precedes
    /// the subscription's ledger history.
    async fn period_at(
        &self,
        terms: &SubscriptionTerms,
        instant: DateTime<Utc>,
    ) -> MeteringResult<Option<BillingPeriod>> {
        if let Some(period) = self.ctx.ledger.find_period_at(terms.id, instant).await? {
            return Ok(Some(period));
        }

        let mut current = match self.ctx.ledger.latest_period(terms.id).await? {
            Some(period) => period,
            None => {
                self.open_period(terms, terms.current_period_start, terms.current_period_end)
                    .await?
            }
        };

        for _ in 0..MAX_PERIOD_ADVANCE {
            if current.window().contains(instant) {
                return Ok(Some(current));
            }
            if instant < current.period_start {
                return Ok(None);
            }
            current = self.open_next(terms, &current).await?;
        }
        Err(MeteringError::InvalidInput(format!(
            "instant {} is too far past the ledger of subscription {}",
            instant, terms.id
        )))
    }

    async fn load_period(&self, period_id: Uuid) -> MeteringResult<BillingPeriod> {
        self.ctx
            .ledger
            .get_period(period_id)
            .await?
            .ok_or_else(|| MeteringError::not_found("billing period", period_id))
    }

    async fn load_terms(&self, period: &BillingPeriod) -> MeteringResult<SubscriptionTerms> {
        self.ctx
            .subscriptions
            .get_subscription(period.organization_id, period.subscription_id)
            .await?
            .ok_or_else(|| MeteringError::not_found("subscription", period.subscription_id))
    }

    // =========================================================================
    // Accrual
    // =========================================================================

    /// Create debit entries for every metered price the event bills against.
    ///
    /// The period is picked by ingestion time. An event whose own timestamp
    /// precedes that period is flagged `late_arrival`; a period that already
    /// stopped accruing hands the entry to its successor, flagged `deferred`.
    /// Re-accruing the same event is a no-op.
    #[instrument(skip(self, event), fields(event_id = %event.id, organization_id = %event.organization_id))]
    pub async fn accrue(&self, event: &Event) -> MeteringResult<Vec<BillingEntry>> {
        let customer = CustomerRef {
            customer_id: event.customer_id,
            external_customer_id: event.external_customer_id.clone(),
        };
        if customer.is_empty() {
            debug!("Event carries no customer, nothing to accrue");
            return Ok(Vec::new());
        }

        let already: HashSet<(Option<Uuid>, Uuid)> = self
            .ctx
            .ledger
            .entries_for_event(event.id)
            .await?
            .into_iter()
            .map(|e| (e.subscription_id, e.product_price_id))
            .collect();

        let subscriptions = self
            .ctx
            .subscriptions
            .find_subscriptions_for_customer(event.organization_id, &customer)
            .await?;

        let mut meters: HashMap<Uuid, Option<Meter>> = HashMap::new();
        let mut entries = Vec::new();

        for terms in subscriptions.iter().filter(|t| t.status.accrues_usage()) {
            for sub_price in &terms.prices {
                let Some(meter_id) = sub_price.price.spec.meter_id() else {
                    continue;
                };
                if !sub_price.is_effective_at(event.ingested_at)
                    || already.contains(&(Some(terms.id), sub_price.price.id))
                {
                    continue;
                }

                let meter = match meters.get(&meter_id) {
                    Some(cached) => cached.clone(),
                    None => {
                        let loaded = self
                            .ctx
                            .meters
                            .get_meter(event.organization_id, meter_id)
                            .await?;
                        meters.insert(meter_id, loaded.clone());
                        loaded
                    }
                };
                let Some(meter) = meter.filter(|m| !m.is_archived()) else {
                    continue;
                };
                if !filter::matches(event, &meter.filter) {
                    continue;
                }

                if let Some(entry) = self.accrue_usage(terms, sub_price, event).await? {
                    entries.push(entry);
                }
            }
        }

        if entries.is_empty() {
            return Ok(entries);
        }

        let deferred = entries.iter().filter(|e| e.deferred).count() as u64;
        let late = entries.iter().filter(|e| e.late_arrival).count() as u64;
        record_entries_accrued("usage", entries.len() as u64);
        if deferred > 0 {
            record_entries_accrued("deferred", deferred);
        }
        if late > 0 {
            record_entries_accrued("late_arrival", late);
        }
        debug!(entries = entries.len(), deferred, late, "Event accrued");
        Ok(entries)
    }

    /// Write the entry for one subscription price. A period that stops
    /// accruing before the write lands hands the entry to its successor.
    /// `None` when the event predates the ledger or is already accrued.
    async fn accrue_usage(
        &self,
        terms: &SubscriptionTerms,
        sub_price: &SubscriptionPrice,
        event: &Event,
    ) -> MeteringResult<Option<BillingEntry>> {
        let Some(mut period) = self.period_at(terms, event.ingested_at).await? else {
            debug!(subscription_id = %terms.id, "Event predates subscription ledger");
            return Ok(None);
        };

        let mut deferred = false;
        for _ in 0..MAX_PERIOD_ADVANCE {
            if period.state == PeriodState::Accruing {
                let entry = usage_entry(terms, sub_price, event, &period, deferred);
                match self.ctx.ledger.insert_usage_entry(&entry).await? {
                    UsageInsert::Inserted => return Ok(Some(entry)),
                    UsageInsert::Duplicate => {
                        debug!(subscription_id = %terms.id, price_id = %sub_price.price.id, "Event already accrued");
                        return Ok(None);
                    }
                    UsageInsert::PeriodClosed => {
                        debug!(period_id = %period.id, "Period closed during accrual, deferring");
                    }
                }
            }
            deferred = true;
            period = self.open_next(terms, &period).await?;
        }

        Err(MeteringError::InvalidTransition {
            period_id: period.id,
            expected: PeriodState::Accruing,
            actual: period.state,
        })
    }

    // =========================================================================
    // Leases
    // =========================================================================

    async fn acquire(&self, subscription_id: Uuid) -> MeteringResult<Lease> {
        let key = Lease::subscription_key(subscription_id);
        self.ctx
            .locks
            .acquire(&key, self.ctx.settings.lock_ttl, self.ctx.settings.lock_wait)
            .await
            .map_err(|e| lock_conflict(subscription_id, e))
    }

    async fn ensure_held(&self, subscription_id: Uuid, lease: &Lease) -> MeteringResult<()> {
        self.ctx
            .locks
            .ensure_held(lease)
            .await
            .map_err(|e| lock_conflict(subscription_id, e))
    }

    async fn release(&self, lease: &Lease) {
        match self.ctx.locks.release(&lease.key, &lease.token).await {
            Ok(true) => {}
            Ok(false) => warn!(key = %lease.key, "Lease already expired at release"),
            Err(e) => warn!(key = %lease.key, error = %e, "Failed to release lease"),
        }
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// `accruing -> closing`: freeze usage, add the static-price entries and
    /// open the next period.
    #[instrument(skip(self))]
    pub async fn close_period(&self, period_id: Uuid) -> MeteringResult<BillingPeriod> {
        let period = self.load_period(period_id).await?;
        let lease = self.acquire(period.subscription_id).await?;
        let result = self.close_locked(period_id, &lease).await;
        self.release(&lease).await;
        result
    }

    async fn close_locked(&self, period_id: Uuid, lease: &Lease) -> MeteringResult<BillingPeriod> {
        let mut period = self.load_period(period_id).await?;
        expect_state(&period, PeriodState::Accruing)?;
        let terms = self.load_terms(&period).await?;

        let window = period.window();
        let synthetic: Vec<BillingEntry> = terms
            .prices
            .iter()
            .filter(|p| p.price.spec.is_static())
            .filter_map(|p| p.effective_window(&window).map(|w| (p, w)))
            .map(|(p, effective)| {
                NewBillingEntry {
                    organization_id: period.organization_id,
                    customer_id: period.customer_id,
                    subscription_id: Some(period.subscription_id),
                    product_price_id: p.price.id,
                    period_id: period.id,
                    start_timestamp: effective.start,
                    end_timestamp: effective.end,
                    direction: Direction::Debit,
                    currency: p.price.currency.clone(),
                    event_id: Uuid::new_v4(),
                    synthetic: true,
                    late_arrival: false,
                    deferred: false,
                }
                .into_entry()
            })
            .collect();

        self.ensure_held(period.subscription_id, lease).await?;
        period.state = PeriodState::Closing;
        self.ctx.ledger.update_period(&period).await?;
        if !synthetic.is_empty() {
            self.ctx.ledger.insert_entries(&synthetic).await?;
            record_entries_accrued("synthetic", synthetic.len() as u64);
        }
        let next = self.open_next(&terms, &period).await?;

        record_period_transition(PeriodState::Closing.as_str());
        info!(
            subscription_id = %period.subscription_id,
            next_period_id = %next.id,
            synthetic_entries = synthetic.len(),
            "Billing period closed"
        );
        Ok(period)
    }

    // =========================================================================
    // Price
    // =========================================================================

    /// `closing -> priced`: one pricing per subscription price. A failure
    /// keeps the period `closing` with the error and attempt recorded.
    #[instrument(skip(self))]
    pub async fn price_period(&self, period_id: Uuid) -> MeteringResult<BillingPeriod> {
        let period = self.load_period(period_id).await?;
        let lease = self.acquire(period.subscription_id).await?;
        let result = self.price_locked(period_id, &lease).await;
        self.release(&lease).await;
        result
    }

    async fn price_locked(&self, period_id: Uuid, lease: &Lease) -> MeteringResult<BillingPeriod> {
        let mut period = self.load_period(period_id).await?;
        expect_state(&period, PeriodState::Closing)?;
        let terms = self.load_terms(&period).await?;
        let entries = self.ctx.ledger.list_entries(period.id).await?;

        let (lines, amounts) = match self.price_entries(&terms, &period, &entries).await {
            Ok(priced) => priced,
            Err(e) => {
                period.pricing_attempts += 1;
                period.last_error = Some(e.to_string());
                self.ensure_held(period.subscription_id, lease).await?;
                self.ctx.ledger.update_period(&period).await?;
                if let MeteringError::PricingFailure { price_id, .. } = &e {
                    let kind = terms
                        .find_price(*price_id)
                        .map(|p| p.price.spec.as_str())
                        .unwrap_or("unknown");
                    record_pricing_failure(kind);
                }
                error!(
                    period_id = %period.id,
                    attempts = period.pricing_attempts,
                    error = %e,
                    "Pricing failed, period stays closing"
                );
                return Err(e);
            }
        };

        self.ensure_held(period.subscription_id, lease).await?;
        let assigned = self.ctx.ledger.assign_amounts(&amounts).await?;
        if assigned as usize != amounts.len() {
            warn!(
                expected = amounts.len(),
                assigned = assigned,
                "Some entries already carried an amount"
            );
        }

        period.priced_lines = lines;
        period.state = PeriodState::Priced;
        period.last_error = None;
        self.ctx.ledger.update_period(&period).await?;

        record_period_transition(PeriodState::Priced.as_str());
        info!(
            period_id = %period.id,
            lines = period.priced_lines.len(),
            subtotal = period.priced_lines.iter().map(|l| l.amount).sum::<i64>(),
            "Billing period priced"
        );
        Ok(period)
    }

    async fn price_entries(
        &self,
        terms: &SubscriptionTerms,
        period: &BillingPeriod,
        entries: &[BillingEntry],
    ) -> MeteringResult<(Vec<PricedLine>, Vec<(Uuid, i64)>)> {
        let mut groups: BTreeMap<Uuid, Vec<&BillingEntry>> = BTreeMap::new();
        for entry in entries {
            groups.entry(entry.product_price_id).or_default().push(entry);
        }
        if let Some(orphan) = groups.keys().find(|id| terms.find_price(**id).is_none()) {
            return Err(MeteringError::pricing(
                *orphan,
                "price is no longer attached to the subscription",
            ));
        }

        let window = period.window();
        let mut lines = Vec::new();
        let mut amounts = Vec::new();

        for sub_price in &terms.prices {
            let price_id = sub_price.price.id;
            let group = groups.remove(&price_id).unwrap_or_default();

            let usage = match sub_price.price.spec.meter_id() {
                Some(meter_id) => {
                    self.metered_quantity(period.organization_id, meter_id, price_id, &group)
                        .await?
                }
                None => Decimal::ZERO,
            };

            let Some(quote) = quote_line(sub_price, &window, usage)
                .map_err(|e| MeteringError::pricing(price_id, e.to_string()))?
            else {
                continue;
            };

            let debits: Vec<&BillingEntry> = group
                .iter()
                .copied()
                .filter(|e| e.direction == Direction::Debit)
                .collect();
            if debits.is_empty() && quote.amount != 0 {
                return Err(MeteringError::pricing(
                    price_id,
                    "no ledger entry to carry a non-zero amount",
                ));
            }

            for (entry, share) in debits.iter().zip(split_evenly(quote.amount, debits.len())) {
                amounts.push((entry.id, share));
            }
            for credit in group.iter().filter(|e| e.direction == Direction::Credit) {
                amounts.push((credit.id, 0));
            }

            lines.push(PricedLine {
                product_price_id: price_id,
                window: quote.window,
                quantity: quote.quantity,
                unit_amount: quote.unit_amount,
                proration_factor: quote.proration_factor,
                cap_amount: quote.cap_amount,
                amount: quote.amount,
                currency: quote.currency,
                entry_ids: group.iter().map(|e| e.id).collect(),
            });
        }

        Ok((lines, amounts))
    }

    /// Debit usage minus credit usage, floored at zero.
    async fn metered_quantity(
        &self,
        organization_id: Uuid,
        meter_id: Uuid,
        price_id: Uuid,
        group: &[&BillingEntry],
    ) -> MeteringResult<Decimal> {
        let meter = self
            .ctx
            .meters
            .get_meter(organization_id, meter_id)
            .await?
            .ok_or_else(|| MeteringError::pricing(price_id, format!("meter {} not found", meter_id)))?;

        let usage_entries: Vec<&BillingEntry> =
            group.iter().copied().filter(|e| !e.synthetic).collect();
        let ids: Vec<Uuid> = usage_entries
            .iter()
            .map(|e| e.event_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut events: HashMap<Uuid, Event> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(EVENT_LOOKUP_CHUNK) {
            for event in self.ctx.events.get_events(organization_id, chunk).await? {
                events.insert(event.id, event);
            }
        }
        if events.len() != ids.len() {
            return Err(MeteringError::pricing(
                price_id,
                format!("{} accrued events are missing", ids.len() - events.len()),
            ));
        }

        let debit = aggregate_events(
            &meter.aggregation,
            events_on_side(&usage_entries, &events, Direction::Debit),
        );
        let credit = aggregate_events(
            &meter.aggregation,
            events_on_side(&usage_entries, &events, Direction::Credit),
        );
        Ok((debit - credit).max(Decimal::ZERO))
    }

    // =========================================================================
    // Materialize
    // =========================================================================

    /// `priced -> materialized`, exactly once. Calling it again on a
    /// materialized period returns the same order item references.
    #[instrument(skip(self))]
    pub async fn materialize_period(&self, period_id: Uuid) -> MeteringResult<Vec<OrderItemRef>> {
        let period = self.load_period(period_id).await?;
        if period.state == PeriodState::Materialized {
            return Ok(period.order_items);
        }
        let lease = self.acquire(period.subscription_id).await?;
        let result = self.materialize_locked(period_id, &lease).await;
        self.release(&lease).await;
        result
    }

    async fn materialize_locked(
        &self,
        period_id: Uuid,
        lease: &Lease,
    ) -> MeteringResult<Vec<OrderItemRef>> {
        let mut period = self.load_period(period_id).await?;
        if period.state == PeriodState::Materialized {
            return Ok(period.order_items);
        }
        expect_state(&period, PeriodState::Priced)?;
        let terms = self.load_terms(&period).await?;
        let window = period.window();

        let subtotal: i64 = period.priced_lines.iter().map(|l| l.amount).sum();
        let discounts = applicable_discounts(&terms.discounts, &window);
        let discount = apply_discounts(subtotal, &discounts)
            .map_err(|e| MeteringError::InvalidInput(format!("discount computation failed: {}", e)))?;
        let tax = self
            .ctx
            .tax
            .calculate_tax(
                subtotal - discount,
                &period.currency,
                terms.billing_address.as_ref(),
                &terms.tax_ids,
            )
            .await?;

        let now = Utc::now();
        let credits = self
            .ctx
            .credits
            .list_credits(period.organization_id, period.customer_id, &period.currency, now)
            .await?;
        let balance = non_negative_running_sum(credits.iter().map(|c| c.amount));
        let totals = OrderTotals::new(subtotal, discount, tax.amount, balance);

        let draft = OrderDraft {
            organization_id: period.organization_id,
            customer_id: period.customer_id,
            subscription_id: period.subscription_id,
            billing_period: window,
            currency: period.currency.clone(),
            items: period
                .priced_lines
                .iter()
                .map(|line| OrderItemDraft {
                    product_price_id: line.product_price_id,
                    label: item_label(&terms, line),
                    window: line.window,
                    quantity: line.quantity,
                    unit_amount: line.unit_amount,
                    proration_factor: line.proration_factor,
                    amount: line.amount,
                })
                .collect(),
            subtotal_amount: totals.subtotal,
            discount_amount: totals.discount,
            tax,
            total_amount: totals.total,
            applied_balance_amount: totals.applied_balance,
        };

        self.ensure_held(period.subscription_id, lease).await?;
        let order = self.ctx.orders.create_order(&draft).await?;

        if totals.applied_balance < 0 {
            self.ctx
                .credits
                .record_credit(&CreditTransaction {
                    id: Uuid::new_v4(),
                    organization_id: period.organization_id,
                    customer_id: period.customer_id,
                    amount: totals.applied_balance,
                    currency: period.currency.clone(),
                    order_id: Some(order.id),
                    created_at: order.created_at,
                })
                .await?;
        }

        let mut refs = Vec::with_capacity(order.items.len());
        let mut links = Vec::new();
        for (item, line) in order.items.iter().zip(&period.priced_lines) {
            refs.push(OrderItemRef {
                order_id: order.id,
                order_item_id: item.id,
                product_price_id: line.product_price_id,
            });
            links.extend(line.entry_ids.iter().map(|entry_id| (*entry_id, item.id)));
        }
        self.ctx.ledger.link_order_items(&links).await?;

        period.order_id = Some(order.id);
        period.order_items = refs.clone();
        period.state = PeriodState::Materialized;
        self.ctx.ledger.update_period(&period).await?;

        record_period_transition(PeriodState::Materialized.as_str());
        info!(
            period_id = %period.id,
            order_id = %order.id,
            total = order.total_amount,
            applied_balance = order.applied_balance_amount,
            "Billing period materialized"
        );
        Ok(refs)
    }

    // =========================================================================
    // Subscription-keyed transitions
    // =========================================================================

    /// Earliest period of the subscription not yet materialized, or the
    /// latest period once all are.
    pub async fn current_period(&self, subscription_id: Uuid) -> MeteringResult<BillingPeriod> {
        if let Some(period) = self
            .ctx
            .ledger
            .first_period_in(subscription_id, &OPEN_STATES)
            .await?
        {
            return Ok(period);
        }
        self.ctx
            .ledger
            .latest_period(subscription_id)
            .await?
            .ok_or_else(|| MeteringError::not_found("billing period of subscription", subscription_id))
    }

    /// Close the earliest accruing period of the subscription.
    #[instrument(skip(self))]
    pub async fn close_current(&self, subscription_id: Uuid) -> MeteringResult<BillingPeriod> {
        let lease = self.acquire(subscription_id).await?;
        let result: MeteringResult<BillingPeriod> = async {
            let period = self
                .ctx
                .ledger
                .first_period_in(subscription_id, &[PeriodState::Accruing])
                .await?
                .ok_or_else(|| {
                    MeteringError::not_found("accruing period of subscription", subscription_id)
                })?;
            self.close_locked(period.id, &lease).await
        }
        .await;
        self.release(&lease).await;
        result
    }

    /// Price the current period of the subscription, which must be closing.
    #[instrument(skip(self))]
    pub async fn price_current(&self, subscription_id: Uuid) -> MeteringResult<BillingPeriod> {
        let lease = self.acquire(subscription_id).await?;
        let result: MeteringResult<BillingPeriod> = async {
            let period = self.current_period(subscription_id).await?;
            self.price_locked(period.id, &lease).await
        }
        .await;
        self.release(&lease).await;
        result
    }

    /// Materialize the current period of the subscription. When nothing is
    /// awaiting materialization, returns the items of the last materialized
    /// period.
    #[instrument(skip(self))]
    pub async fn materialize_current(
        &self,
        subscription_id: Uuid,
    ) -> MeteringResult<Vec<OrderItemRef>> {
        let lease = self.acquire(subscription_id).await?;
        let result: MeteringResult<Vec<OrderItemRef>> = async {
            let period = self.current_period(subscription_id).await?;
            if period.state == PeriodState::Accruing {
                let done = self
                    .ctx
                    .ledger
                    .last_period_in(subscription_id, &[PeriodState::Materialized])
                    .await?;
                if let Some(done) = done.filter(|d| d.period_start < period.period_start) {
                    return Ok(done.order_items);
                }
            }
            self.materialize_locked(period.id, &lease).await
        }
        .await;
        self.release(&lease).await;
        result
    }

    // =========================================================================
    // Void
    // =========================================================================

    /// Void an order and soft-delete the entries it was built from.
    #[instrument(skip(self))]
    pub async fn void_order(&self, order_id: Uuid) -> MeteringResult<u64> {
        let period = self
            .ctx
            .ledger
            .find_period_by_order(order_id)
            .await?
            .ok_or_else(|| MeteringError::not_found("order", order_id))?;

        let lease = self.acquire(period.subscription_id).await?;
        let result: MeteringResult<u64> = async {
            let ids: Vec<Uuid> = self
                .ctx
                .ledger
                .list_entries(period.id)
                .await?
                .into_iter()
                .filter(|e| e.is_materialized())
                .map(|e| e.id)
                .collect();
            self.ensure_held(period.subscription_id, &lease).await?;
            let deleted = self.ctx.ledger.soft_delete_entries(&ids, Utc::now()).await?;
            self.ctx.orders.void_order(order_id, Utc::now()).await?;
            info!(order_id = %order_id, entries = deleted, "Order voided");
            Ok(deleted)
        }
        .await;
        self.release(&lease).await;
        result
    }

    // =========================================================================
    // Scheduler tick
    // =========================================================================

    /// Close due periods, retry pricing of closing ones and materialize
    /// priced ones. A failing period does not stop the others.
    #[instrument(skip(self))]
    pub async fn process_due_periods(&self, now: DateTime<Utc>) -> MeteringResult<TickReport> {
        let mut report = TickReport::default();

        let due = self
            .ctx
            .ledger
            .list_periods(PeriodState::Accruing, Some(now), TICK_BATCH)
            .await?;
        for period in due {
            match self.with_conflict_retry(|| self.close_period(period.id)).await {
                Ok(_) => report.closed += 1,
                Err(e) => report_failure(&mut report, period.id, "close_period", e),
            }
        }

        let closing = self
            .ctx
            .ledger
            .list_periods(PeriodState::Closing, None, TICK_BATCH)
            .await?;
        for period in closing {
            match self.with_conflict_retry(|| self.price_period(period.id)).await {
                Ok(_) => report.priced += 1,
                Err(e) => report_failure(&mut report, period.id, "price_period", e),
            }
        }

        let priced = self
            .ctx
            .ledger
            .list_periods(PeriodState::Priced, None, TICK_BATCH)
            .await?;
        for period in priced {
            match self
                .with_conflict_retry(|| self.materialize_period(period.id))
                .await
            {
                Ok(_) => report.materialized += 1,
                Err(e) => report_failure(&mut report, period.id, "materialize_period", e),
            }
        }

        if report.closed + report.priced + report.materialized > 0 || !report.failures.is_empty() {
            info!(
                closed = report.closed,
                priced = report.priced,
                materialized = report.materialized,
                failures = report.failures.len(),
                "Ledger tick completed"
            );
        }
        Ok(report)
    }

    /// Retry lease conflicts with exponential backoff; other errors fail fast.
    async fn with_conflict_retry<T, F, Fut>(&self, op: F) -> MeteringResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = MeteringResult<T>>,
    {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_elapsed_time: Some(self.ctx.settings.lock_wait * 3),
            ..Default::default()
        };
        retry(backoff, || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| match e {
                    MeteringError::ConcurrentMaterializationConflict { .. } => {
                        backoff::Error::transient(e)
                    }
                    other => backoff::Error::permanent(other),
                })
            }
        })
        .await
    }
}

fn expect_state(period: &BillingPeriod, expected: PeriodState) -> MeteringResult<()> {
    if period.state == expected {
        Ok(())
    } else {
        Err(MeteringError::InvalidTransition {
            period_id: period.id,
            expected,
            actual: period.state,
        })
    }
}

fn usage_entry(
    terms: &SubscriptionTerms,
    sub_price: &SubscriptionPrice,
    event: &Event,
    period: &BillingPeriod,
    deferred: bool,
) -> BillingEntry {
    NewBillingEntry {
        organization_id: terms.organization_id,
        customer_id: terms.customer_id,
        subscription_id: Some(terms.id),
        product_price_id: sub_price.price.id,
        period_id: period.id,
        start_timestamp: period.period_start,
        end_timestamp: period.period_end,
        direction: Direction::Debit,
        currency: sub_price.price.currency.clone(),
        event_id: event.id,
        synthetic: false,
        late_arrival: event.timestamp < period.period_start,
        deferred,
    }
    .into_entry()
}

fn lock_conflict(subscription_id: Uuid, err: LockError) -> MeteringError {
    match err {
        LockError::Backend(app) => MeteringError::Storage(app),
        other => MeteringError::ConcurrentMaterializationConflict {
            subscription_id,
            reason: other.to_string(),
        },
    }
}

fn events_on_side<'a>(
    entries: &'a [&'a BillingEntry],
    events: &'a HashMap<Uuid, Event>,
    direction: Direction,
) -> impl Iterator<Item = &'a Event> + 'a {
    entries
        .iter()
        .filter(move |e| e.direction == direction)
        .filter_map(move |e| events.get(&e.event_id))
}

fn report_failure(report: &mut TickReport, period_id: Uuid, operation: &str, err: MeteringError) {
    record_error(err.kind(), operation);
    warn!(period_id = %period_id, operation, error = %err, "Ledger transition failed");
    report.failures.push((period_id, err.to_string()));
}

/// Split `amount` into `parts` shares differing by at most one minor unit;
/// the shares sum to `amount`.
pub(crate) fn split_evenly(amount: i64, parts: usize) -> Vec<i64> {
    if parts == 0 {
        return Vec::new();
    }
    let n = parts as i64;
    let base = amount.div_euclid(n);
    let remainder = amount.rem_euclid(n);
    (0..n).map(|i| base + i64::from(i < remainder)).collect()
}

fn item_label(terms: &SubscriptionTerms, line: &PricedLine) -> String {
    let kind = terms
        .find_price(line.product_price_id)
        .map(|p| p.price.spec.as_str())
        .unwrap_or("price");
    format!(
        "{} {} ({} - {})",
        kind,
        line.product_price_id,
        line.window.start.format("%Y-%m-%d"),
        line.window.end.format("%Y-%m-%d")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_the_total() {
        assert_eq!(split_evenly(10, 3), vec![4, 3, 3]);
        assert_eq!(split_evenly(7500, 250).iter().sum::<i64>(), 7500);
        assert_eq!(split_evenly(0, 2), vec![0, 0]);
        assert!(split_evenly(5, 0).is_empty());
    }
}
