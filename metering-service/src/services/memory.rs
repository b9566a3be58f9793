//! In-memory storage backend.
//!
//! Backs the `memory` storage mode and the test suite. All repositories share
//! one mutex-guarded state so multi-repository flows observe each other's
//! writes immediately.

use super::repository::{
    CheckpointRepository, CreditRepository, EventCursor, EventRepository, EventScan,
    LedgerRepository, MeterRepository, OrderRepository, SubscriptionRepository, SweepCheckpoint,
    UsageInsert,
};
use crate::models::{
    BillingEntry, BillingPeriod, CreditTransaction, CustomerRef, Event, IngestOutcome, Meter,
    OrderDraft, PeriodState, PersistedOrderItem, PersistedOrderSnapshot, SubscriptionTerms,
    TimeWindow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

type EventKey = (DateTime<Utc>, Uuid);

#[derive(Default)]
struct State {
    events: BTreeMap<EventKey, Event>,
    event_keys: HashMap<Uuid, EventKey>,
    external_ids: HashMap<(Uuid, String), Uuid>,
    meters: HashMap<Uuid, Meter>,
    subscriptions: HashMap<Uuid, SubscriptionTerms>,
    credits: Vec<CreditTransaction>,
    periods: HashMap<Uuid, BillingPeriod>,
    entries: HashMap<Uuid, BillingEntry>,
    orders: HashMap<Uuid, PersistedOrderSnapshot>,
    checkpoints: HashMap<Uuid, SweepCheckpoint>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("In-memory store mutex poisoned: {}", e)))
    }
}

fn customer_matches(customer: &CustomerRef, customer_id: Option<Uuid>, external: Option<&str>) -> bool {
    let by_id = customer.customer_id.is_some() && customer.customer_id == customer_id;
    let by_external = customer.external_customer_id.is_some()
        && customer.external_customer_id.as_deref() == external;
    by_id || by_external
}

// =========================================================================
// Event Operations
// =========================================================================

#[async_trait]
impl EventRepository for InMemoryStore {
    async fn insert_event(&self, event: &Event) -> Result<IngestOutcome, AppError> {
        let mut state = self.lock()?;

        if let Some(external_id) = &event.external_id {
            let dedup_key = (event.organization_id, external_id.clone());
            if let Some(existing) = state
                .external_ids
                .get(&dedup_key)
                .and_then(|id| state.event_keys.get(id))
                .and_then(|key| state.events.get(key))
            {
                return Ok(IngestOutcome::DuplicateExternalId(existing.clone()));
            }
            state.external_ids.insert(dedup_key, event.id);
        }

        let key = (event.ingested_at, event.id);
        state.event_keys.insert(event.id, key);
        state.events.insert(key, event.clone());
        Ok(IngestOutcome::Created(event.clone()))
    }

    async fn scan_events(
        &self,
        scan: &EventScan,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<Event>, AppError> {
        let state = self.lock()?;
        let lower = match after {
            Some(cursor) => Bound::Excluded((cursor.ingested_at, cursor.id)),
            None => Bound::Included((scan.ingested.start, Uuid::nil())),
        };

        let page = state
            .events
            .range((lower, Bound::Unbounded))
            .map(|(_, event)| event)
            .take_while(|event| event.ingested_at < scan.ingested.end)
            .filter(|event| event.ingested_at >= scan.ingested.start)
            .filter(|event| event.organization_id == scan.organization_id)
            .filter(|event| {
                scan.customer.as_ref().is_none_or(|customer| {
                    customer_matches(
                        customer,
                        event.customer_id,
                        event.external_customer_id.as_deref(),
                    )
                })
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(page)
    }

    async fn get_events(
        &self,
        organization_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<Event>, AppError> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.event_keys.get(id))
            .filter_map(|key| state.events.get(key))
            .filter(|event| event.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn purge_events_before(
        &self,
        organization_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        let doomed: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.organization_id == organization_id && e.timestamp < cutoff)
            .cloned()
            .collect();

        for event in &doomed {
            state.events.remove(&(event.ingested_at, event.id));
            state.event_keys.remove(&event.id);
            if let Some(external_id) = &event.external_id {
                state
                    .external_ids
                    .remove(&(event.organization_id, external_id.clone()));
            }
        }
        Ok(doomed.len() as u64)
    }
}

// =========================================================================
// Meter Operations
// =========================================================================

#[async_trait]
impl MeterRepository for InMemoryStore {
    async fn insert_meter(&self, meter: &Meter) -> Result<Meter, AppError> {
        let mut state = self.lock()?;
        let duplicate = state.meters.values().any(|m| {
            m.organization_id == meter.organization_id && m.name == meter.name && !m.is_archived()
        });
        if duplicate {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Meter {} already exists",
                meter.name
            )));
        }
        state.meters.insert(meter.id, meter.clone());
        Ok(meter.clone())
    }

    async fn get_meter(&self, organization_id: Uuid, id: Uuid) -> Result<Option<Meter>, AppError> {
        let state = self.lock()?;
        Ok(state
            .meters
            .get(&id)
            .filter(|m| m.organization_id == organization_id)
            .cloned())
    }

    async fn list_meters(&self, organization_id: Uuid) -> Result<Vec<Meter>, AppError> {
        let state = self.lock()?;
        let mut meters: Vec<Meter> = state
            .meters
            .values()
            .filter(|m| m.organization_id == organization_id)
            .cloned()
            .collect();
        meters.sort_by_key(|m| m.created_at);
        Ok(meters)
    }

    async fn archive_meter(
        &self,
        organization_id: Uuid,
        id: Uuid,
        archived_at: DateTime<Utc>,
    ) -> Result<Option<Meter>, AppError> {
        let mut state = self.lock()?;
        Ok(state
            .meters
            .get_mut(&id)
            .filter(|m| m.organization_id == organization_id)
            .map(|m| {
                m.archived_at.get_or_insert(archived_at);
                m.clone()
            }))
    }
}

// =========================================================================
// Subscription and Credit Operations
// =========================================================================

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn upsert_subscription(&self, terms: &SubscriptionTerms) -> Result<(), AppError> {
        let mut state = self.lock()?;
        state.subscriptions.insert(terms.id, terms.clone());
        Ok(())
    }

    async fn get_subscription(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SubscriptionTerms>, AppError> {
        let state = self.lock()?;
        Ok(state
            .subscriptions
            .get(&id)
            .filter(|s| s.organization_id == organization_id)
            .cloned())
    }

    async fn find_subscriptions_for_customer(
        &self,
        organization_id: Uuid,
        customer: &CustomerRef,
    ) -> Result<Vec<SubscriptionTerms>, AppError> {
        let state = self.lock()?;
        let mut found: Vec<SubscriptionTerms> = state
            .subscriptions
            .values()
            .filter(|s| s.organization_id == organization_id)
            .filter(|s| {
                customer_matches(
                    customer,
                    Some(s.customer_id),
                    s.external_customer_id.as_deref(),
                )
            })
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }
}

#[async_trait]
impl CreditRepository for InMemoryStore {
    async fn record_credit(&self, transaction: &CreditTransaction) -> Result<(), AppError> {
        let mut state = self.lock()?;
        state.credits.push(transaction.clone());
        Ok(())
    }

    async fn list_credits(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
        currency: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>, AppError> {
        let state = self.lock()?;
        let mut credits: Vec<CreditTransaction> = state
            .credits
            .iter()
            .filter(|c| {
                c.organization_id == organization_id
                    && c.customer_id == customer_id
                    && c.currency.eq_ignore_ascii_case(currency)
                    && c.created_at < before
            })
            .cloned()
            .collect();
        credits.sort_by_key(|c| (c.created_at, c.id));
        Ok(credits)
    }
}

// =========================================================================
// Ledger Operations
// =========================================================================

#[async_trait]
impl LedgerRepository for InMemoryStore {
    async fn insert_period_if_absent(
        &self,
        period: &BillingPeriod,
    ) -> Result<BillingPeriod, AppError> {
        let mut state = self.lock()?;
        if let Some(existing) = state.periods.values().find(|p| {
            p.subscription_id == period.subscription_id && p.period_start == period.period_start
        }) {
            return Ok(existing.clone());
        }
        state.periods.insert(period.id, period.clone());
        Ok(period.clone())
    }

    async fn get_period(&self, id: Uuid) -> Result<Option<BillingPeriod>, AppError> {
        Ok(self.lock()?.periods.get(&id).cloned())
    }

    async fn find_period_at(
        &self,
        subscription_id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<Option<BillingPeriod>, AppError> {
        let state = self.lock()?;
        Ok(state
            .periods
            .values()
            .filter(|p| p.subscription_id == subscription_id && p.window().contains(instant))
            .min_by_key(|p| p.period_start)
            .cloned())
    }

    async fn find_period_by_start(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<Option<BillingPeriod>, AppError> {
        let state = self.lock()?;
        Ok(state
            .periods
            .values()
            .find(|p| p.subscription_id == subscription_id && p.period_start == period_start)
            .cloned())
    }

    async fn find_period_by_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<BillingPeriod>, AppError> {
        let state = self.lock()?;
        Ok(state
            .periods
            .values()
            .find(|p| p.order_id == Some(order_id))
            .cloned())
    }

    async fn latest_period(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<BillingPeriod>, AppError> {
        let state = self.lock()?;
        Ok(state
            .periods
            .values()
            .filter(|p| p.subscription_id == subscription_id)
            .max_by_key(|p| p.period_start)
            .cloned())
    }

    async fn first_period_in(
        &self,
        subscription_id: Uuid,
        states: &[PeriodState],
    ) -> Result<Option<BillingPeriod>, AppError> {
        let state = self.lock()?;
        Ok(state
            .periods
            .values()
            .filter(|p| p.subscription_id == subscription_id && states.contains(&p.state))
            .min_by_key(|p| p.period_start)
            .cloned())
    }

    async fn last_period_in(
        &self,
        subscription_id: Uuid,
        states: &[PeriodState],
    ) -> Result<Option<BillingPeriod>, AppError> {
        let state = self.lock()?;
        Ok(state
            .periods
            .values()
            .filter(|p| p.subscription_id == subscription_id && states.contains(&p.state))
            .max_by_key(|p| p.period_start)
            .cloned())
    }

    async fn update_period(&self, period: &BillingPeriod) -> Result<(), AppError> {
        let mut state = self.lock()?;
        match state.periods.get_mut(&period.id) {
            Some(stored) => {
                *stored = period.clone();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Billing period {} not found",
                period.id
            ))),
        }
    }

    async fn list_periods(
        &self,
        state_filter: PeriodState,
        ended_by: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<BillingPeriod>, AppError> {
        let state = self.lock()?;
        let mut periods: Vec<BillingPeriod> = state
            .periods
            .values()
            .filter(|p| p.state == state_filter)
            .filter(|p| ended_by.is_none_or(|cutoff| p.period_end <= cutoff))
            .cloned()
            .collect();
        periods.sort_by_key(|p| (p.period_end, p.id));
        periods.truncate(limit);
        Ok(periods)
    }

    async fn insert_entries(&self, entries: &[BillingEntry]) -> Result<(), AppError> {
        let mut state = self.lock()?;
        for entry in entries {
            state.entries.insert(entry.id, entry.clone());
        }
        Ok(())
    }

    async fn insert_usage_entry(&self, entry: &BillingEntry) -> Result<UsageInsert, AppError> {
        let mut state = self.lock()?;
        let accruing = state
            .periods
            .get(&entry.period_id)
            .is_some_and(|p| p.state == PeriodState::Accruing);
        if !accruing {
            return Ok(UsageInsert::PeriodClosed);
        }
        let duplicate = state.entries.values().any(|e| {
            e.is_active()
                && !e.synthetic
                && e.event_id == entry.event_id
                && e.subscription_id == entry.subscription_id
                && e.product_price_id == entry.product_price_id
        });
        if duplicate {
            return Ok(UsageInsert::Duplicate);
        }
        state.entries.insert(entry.id, entry.clone());
        Ok(UsageInsert::Inserted)
    }

    async fn list_entries(&self, period_id: Uuid) -> Result<Vec<BillingEntry>, AppError> {
        let state = self.lock()?;
        let mut entries: Vec<BillingEntry> = state
            .entries
            .values()
            .filter(|e| e.period_id == period_id && e.is_active())
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        Ok(entries)
    }

    async fn entries_for_event(&self, event_id: Uuid) -> Result<Vec<BillingEntry>, AppError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .values()
            .filter(|e| e.event_id == event_id && e.is_active())
            .cloned()
            .collect())
    }

    async fn assign_amounts(&self, amounts: &[(Uuid, i64)]) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        let mut assigned = 0;
        for (id, amount) in amounts {
            if let Some(entry) = state.entries.get_mut(id) {
                if entry.amount.is_none() {
                    entry.amount = Some(*amount);
                    assigned += 1;
                }
            }
        }
        Ok(assigned)
    }

    async fn link_order_items(&self, links: &[(Uuid, Uuid)]) -> Result<(), AppError> {
        let mut state = self.lock()?;
        for (entry_id, order_item_id) in links {
            if let Some(entry) = state.entries.get_mut(entry_id) {
                entry.order_item_id = Some(*order_item_id);
            }
        }
        Ok(())
    }

    async fn soft_delete_entries(
        &self,
        ids: &[Uuid],
        deleted_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        let mut deleted = 0;
        for id in ids {
            if let Some(entry) = state.entries.get_mut(id) {
                if entry.deleted_at.is_none() {
                    entry.deleted_at = Some(deleted_at);
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

// =========================================================================
// Order and Checkpoint Operations
// =========================================================================

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn create_order(&self, draft: &OrderDraft) -> Result<PersistedOrderSnapshot, AppError> {
        let items = draft
            .items
            .iter()
            .map(|item| PersistedOrderItem {
                id: Uuid::new_v4(),
                product_price_id: Some(item.product_price_id),
                label: item.label.clone(),
                window: item.window,
                quantity: item.quantity,
                unit_amount: item.unit_amount,
                proration_factor: item.proration_factor,
                amount: item.amount,
                currency: draft.currency.clone(),
            })
            .collect();

        let order = PersistedOrderSnapshot {
            id: Uuid::new_v4(),
            organization_id: draft.organization_id,
            customer_id: draft.customer_id,
            subscription_id: Some(draft.subscription_id),
            billing_period: Some(draft.billing_period),
            currency: draft.currency.clone(),
            items,
            subtotal_amount: draft.subtotal_amount,
            discount_amount: draft.discount_amount,
            tax: draft.tax.clone(),
            total_amount: draft.total_amount,
            applied_balance_amount: draft.applied_balance_amount,
            created_at: Utc::now(),
            voided_at: None,
        };

        let mut state = self.lock()?;
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<PersistedOrderSnapshot>, AppError> {
        Ok(self.lock()?.orders.get(&id).cloned())
    }

    async fn list_orders_created_in(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<PersistedOrderSnapshot>, AppError> {
        let state = self.lock()?;
        let mut orders: Vec<PersistedOrderSnapshot> = state
            .orders
            .values()
            .filter(|o| o.voided_at.is_none() && window.contains(o.created_at))
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_at, o.id));
        Ok(orders)
    }

    async fn void_order(&self, id: Uuid, voided_at: DateTime<Utc>) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        Ok(match state.orders.get_mut(&id) {
            Some(order) if order.voided_at.is_none() => {
                order.voided_at = Some(voided_at);
                true
            }
            _ => false,
        })
    }
}

#[async_trait]
impl CheckpointRepository for InMemoryStore {
    async fn save_checkpoint(&self, checkpoint: &SweepCheckpoint) -> Result<(), AppError> {
        let mut state = self.lock()?;
        state
            .checkpoints
            .insert(checkpoint.sweep_id, checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, sweep_id: Uuid) -> Result<Option<SweepCheckpoint>, AppError> {
        Ok(self.lock()?.checkpoints.get(&sweep_id).cloned())
    }

    async fn list_unfinished_checkpoints(
        &self,
        limit: usize,
    ) -> Result<Vec<SweepCheckpoint>, AppError> {
        let state = self.lock()?;
        let mut unfinished: Vec<SweepCheckpoint> = state
            .checkpoints
            .values()
            .filter(|c| !c.finished)
            .cloned()
            .collect();
        unfinished.sort_by_key(|c| (c.updated_at, c.sweep_id));
        unfinished.truncate(limit);
        Ok(unfinished)
    }
}

/// Test and tooling helpers that bypass the ledger.
impl InMemoryStore {
    /// Overwrite a persisted order, e.g. to simulate drift in tests.
    pub fn replace_order(&self, order: PersistedOrderSnapshot) -> Result<(), AppError> {
        self.lock()?.orders.insert(order.id, order);
        Ok(())
    }

    pub fn all_entries(&self) -> Result<Vec<BillingEntry>, AppError> {
        let state = self.lock()?;
        let mut entries: Vec<BillingEntry> = state.entries.values().cloned().collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        Ok(entries)
    }
}
