//! Storage seams consumed by the metering core.
//!
//! Each trait has a Postgres implementation ([`crate::services::Database`])
//! and an in-memory one ([`crate::services::InMemoryStore`]).

use crate::models::{
    BillingEntry, BillingPeriod, CreditTransaction, CustomerRef, Event, IngestOutcome, Meter,
    OrderDraft, PeriodState, PersistedOrderSnapshot, SubscriptionTerms, TimeWindow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

/// Selection of events for a paginated scan.
#[derive(Debug, Clone)]
pub struct EventScan {
    pub organization_id: Uuid,
    pub customer: Option<CustomerRef>,
    /// Range over `ingested_at`.
    pub ingested: TimeWindow,
}

/// Position after the last event of a page. Scans are ordered by
/// `(ingested_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCursor {
    pub ingested_at: DateTime<Utc>,
    pub id: Uuid,
}

impl From<&Event> for EventCursor {
    fn from(event: &Event) -> Self {
        Self {
            ingested_at: event.ingested_at,
            id: event.id,
        }
    }
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Insert unless an event with the same `(organization_id, external_id)`
    /// exists, in which case the stored event is returned.
    async fn insert_event(&self, event: &Event) -> Result<IngestOutcome, AppError>;

    async fn scan_events(
        &self,
        scan: &EventScan,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<Event>, AppError>;

    async fn get_events(&self, organization_id: Uuid, ids: &[Uuid])
        -> Result<Vec<Event>, AppError>;

    async fn purge_events_before(
        &self,
        organization_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError>;
}

#[async_trait]
pub trait MeterRepository: Send + Sync {
    async fn insert_meter(&self, meter: &Meter) -> Result<Meter, AppError>;

    async fn get_meter(&self, organization_id: Uuid, id: Uuid) -> Result<Option<Meter>, AppError>;

    async fn list_meters(&self, organization_id: Uuid) -> Result<Vec<Meter>, AppError>;

    async fn archive_meter(
        &self,
        organization_id: Uuid,
        id: Uuid,
        archived_at: DateTime<Utc>,
    ) -> Result<Option<Meter>, AppError>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn upsert_subscription(&self, terms: &SubscriptionTerms) -> Result<(), AppError>;

    async fn get_subscription(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SubscriptionTerms>, AppError>;

    /// Subscriptions whose customer matches either identifier of `customer`.
    async fn find_subscriptions_for_customer(
        &self,
        organization_id: Uuid,
        customer: &CustomerRef,
    ) -> Result<Vec<SubscriptionTerms>, AppError>;
}

#[async_trait]
pub trait CreditRepository: Send + Sync {
    async fn record_credit(&self, transaction: &CreditTransaction) -> Result<(), AppError>;

    /// Transactions created strictly before `before`, oldest first.
    async fn list_credits(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
        currency: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>, AppError>;
}

/// Outcome of [`LedgerRepository::insert_usage_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageInsert {
    Inserted,
    /// The event already has an active entry for the subscription price.
    Duplicate,
    /// The target period left `accruing` before the insert; nothing written.
    PeriodClosed,
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Insert unless a period with the same `(subscription_id, period_start)`
    /// exists; returns the stored period either way.
    async fn insert_period_if_absent(
        &self,
        period: &BillingPeriod,
    ) -> Result<BillingPeriod, AppError>;

    async fn get_period(&self, id: Uuid) -> Result<Option<BillingPeriod>, AppError>;

    async fn find_period_at(
        &self,
        subscription_id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<Option<BillingPeriod>, AppError>;

    async fn find_period_by_start(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<Option<BillingPeriod>, AppError>;

    async fn find_period_by_order(&self, order_id: Uuid)
        -> Result<Option<BillingPeriod>, AppError>;

    async fn latest_period(&self, subscription_id: Uuid)
        -> Result<Option<BillingPeriod>, AppError>;

    /// Earliest period of the subscription, by `period_start`, in one of `states`.
    async fn first_period_in(
        &self,
        subscription_id: Uuid,
        states: &[PeriodState],
    ) -> Result<Option<BillingPeriod>, AppError>;

    /// Latest period of the subscription, by `period_start`, in one of `states`.
    async fn last_period_in(
        &self,
        subscription_id: Uuid,
        states: &[PeriodState],
    ) -> Result<Option<BillingPeriod>, AppError>;

    async fn update_period(&self, period: &BillingPeriod) -> Result<(), AppError>;

    /// Periods in `state`, optionally only those ending at or before
    /// `ended_by`, oldest first.
    async fn list_periods(
        &self,
        state: PeriodState,
        ended_by: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<BillingPeriod>, AppError>;

    async fn insert_entries(&self, entries: &[BillingEntry]) -> Result<(), AppError>;

    /// Insert a usage entry atomically with respect to period transitions:
    /// the write happens only while the entry's period is `accruing`, and at
    /// most once per `(event_id, subscription_id, product_price_id)`.
    async fn insert_usage_entry(&self, entry: &BillingEntry) -> Result<UsageInsert, AppError>;

    /// Active (not soft-deleted) entries of a period.
    async fn list_entries(&self, period_id: Uuid) -> Result<Vec<BillingEntry>, AppError>;

    async fn entries_for_event(&self, event_id: Uuid) -> Result<Vec<BillingEntry>, AppError>;

    /// Set amounts on entries that have none yet. Returns how many were set.
    async fn assign_amounts(&self, amounts: &[(Uuid, i64)]) -> Result<u64, AppError>;

    async fn link_order_items(&self, links: &[(Uuid, Uuid)]) -> Result<(), AppError>;

    async fn soft_delete_entries(
        &self,
        ids: &[Uuid],
        deleted_at: DateTime<Utc>,
    ) -> Result<u64, AppError>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create_order(&self, draft: &OrderDraft) -> Result<PersistedOrderSnapshot, AppError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<PersistedOrderSnapshot>, AppError>;

    /// Non-void orders with `created_at` inside `window`, oldest first.
    async fn list_orders_created_in(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<PersistedOrderSnapshot>, AppError>;

    async fn void_order(&self, id: Uuid, voided_at: DateTime<Utc>) -> Result<bool, AppError>;
}

/// Progress of one reconciliation sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepCheckpoint {
    pub sweep_id: Uuid,
    pub window: TimeWindow,
    pub completed_subscriptions: Vec<Uuid>,
    pub finished: bool,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn save_checkpoint(&self, checkpoint: &SweepCheckpoint) -> Result<(), AppError>;

    async fn get_checkpoint(&self, sweep_id: Uuid) -> Result<Option<SweepCheckpoint>, AppError>;

    /// Sweeps that stopped before finishing, least recently updated first.
    async fn list_unfinished_checkpoints(
        &self,
        limit: usize,
    ) -> Result<Vec<SweepCheckpoint>, AppError>;
}
