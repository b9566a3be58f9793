//! Database service for metering-service.

use crate::models::{
    BillingEntry, BillingPeriod, CreditTransaction, CustomerRef, Event, IngestOutcome, Meter,
    OrderDraft, PeriodState, PersistedOrderItem, PersistedOrderSnapshot, SubscriptionTerms,
    TaxCalculation, TimeWindow,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{
    CheckpointRepository, CreditRepository, EventCursor, EventRepository, EventScan,
    LedgerRepository, MeterRepository, OrderRepository, SubscriptionRepository, SweepCheckpoint,
    UsageInsert,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const EVENT_COLUMNS: &str = r#"id, organization_id, customer_id, external_customer_id, name, "timestamp", ingested_at, external_id, user_metadata"#;

const PERIOD_COLUMNS: &str = "id, organization_id, customer_id, subscription_id, currency, period_start, period_end, state, priced_lines, order_id, order_items, pricing_attempts, last_error, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, organization_id, customer_id, subscription_id, product_price_id, period_id, start_timestamp, end_timestamp, direction, amount, currency, event_id, synthetic, late_arrival, deferred, order_item_id, created_at, deleted_at";

const ORDER_COLUMNS: &str = "id, organization_id, customer_id, subscription_id, period_start, period_end, currency, items, subtotal_amount, discount_amount, tax, total_amount, applied_balance_amount, created_at, voided_at";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", context, e))
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "metering-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn find_event_by_external_id(
        &self,
        organization_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Event>, AppError> {
        sqlx::query_as::<_, Event>(&format!(
            "SELECT {} FROM events WHERE organization_id = $1 AND external_id = $2",
            EVENT_COLUMNS
        ))
        .bind(organization_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("fetch event by external id", e))
    }
}

// =============================================================================
// Event Operations
// =============================================================================

#[async_trait]
impl EventRepository for Database {
    #[instrument(skip(self, event), fields(event_id = %event.id, organization_id = %event.organization_id))]
    async fn insert_event(&self, event: &Event) -> Result<IngestOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_event"])
            .start_timer();

        let inserted = sqlx::query_as::<_, Event>(&format!(
            r#"
            INSERT INTO events (id, organization_id, customer_id, external_customer_id, name, "timestamp", ingested_at, external_id, user_metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (organization_id, external_id) WHERE external_id IS NOT NULL DO NOTHING
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(event.id)
        .bind(event.organization_id)
        .bind(event.customer_id)
        .bind(&event.external_customer_id)
        .bind(&event.name)
        .bind(event.timestamp)
        .bind(event.ingested_at)
        .bind(&event.external_id)
        .bind(Json(&event.user_metadata))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("insert event", e))?;

        let outcome = match (inserted, event.external_id.as_deref()) {
            (Some(stored), _) => IngestOutcome::Created(stored),
            (None, Some(external_id)) => {
                let existing = self
                    .find_event_by_external_id(event.organization_id, external_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::DatabaseError(anyhow::anyhow!(
                            "Event with external id '{}' vanished after conflict",
                            external_id
                        ))
                    })?;
                IngestOutcome::DuplicateExternalId(existing)
            }
            (None, None) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Event {} was not inserted",
                    event.id
                )))
            }
        };

        timer.observe_duration();
        Ok(outcome)
    }

    #[instrument(skip(self, scan), fields(organization_id = %scan.organization_id))]
    async fn scan_events(
        &self,
        scan: &EventScan,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<Event>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["scan_events"])
            .start_timer();

        let customer = scan.customer.clone().unwrap_or_default();
        let events = sqlx::query_as::<_, Event>(&format!(
            r#"
            SELECT {}
            FROM events
            WHERE organization_id = $1
              AND ingested_at >= $2 AND ingested_at < $3
              AND (NOT $4 OR customer_id = $5 OR external_customer_id = $6)
              AND ($7::timestamptz IS NULL OR (ingested_at, id) > ($7, $8))
            ORDER BY ingested_at, id
            LIMIT $9
            "#,
            EVENT_COLUMNS
        ))
        .bind(scan.organization_id)
        .bind(scan.ingested.start)
        .bind(scan.ingested.end)
        .bind(scan.customer.is_some())
        .bind(customer.customer_id)
        .bind(&customer.external_customer_id)
        .bind(after.map(|c| c.ingested_at))
        .bind(after.map(|c| c.id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("scan events", e))?;

        timer.observe_duration();
        debug!(count = events.len(), "Event page fetched");
        Ok(events)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_events(
        &self,
        organization_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<Event>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_events"])
            .start_timer();

        let events = sqlx::query_as::<_, Event>(&format!(
            "SELECT {} FROM events WHERE organization_id = $1 AND id = ANY($2)",
            EVENT_COLUMNS
        ))
        .bind(organization_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get events", e))?;

        timer.observe_duration();
        Ok(events)
    }

    #[instrument(skip(self))]
    async fn purge_events_before(
        &self,
        organization_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["purge_events"])
            .start_timer();

        let result = sqlx::query(
            r#"DELETE FROM events WHERE organization_id = $1 AND "timestamp" < $2"#,
        )
        .bind(organization_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("purge events", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Meter Operations
// =============================================================================

#[async_trait]
impl MeterRepository for Database {
    #[instrument(skip(self, meter), fields(organization_id = %meter.organization_id, name = %meter.name))]
    async fn insert_meter(&self, meter: &Meter) -> Result<Meter, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_meter"])
            .start_timer();

        let stored = sqlx::query_as::<_, Meter>(
            r#"
            INSERT INTO meters (id, organization_id, name, filter, aggregation, archived_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, organization_id, name, filter, aggregation, archived_at, created_at
            "#,
        )
        .bind(meter.id)
        .bind(meter.organization_id)
        .bind(&meter.name)
        .bind(Json(&meter.filter))
        .bind(Json(&meter.aggregation))
        .bind(meter.archived_at)
        .bind(meter.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Meter '{}' already exists for organization",
                    meter.name
                ))
            }
            _ => db_error("insert meter", e),
        })?;

        timer.observe_duration();
        info!(meter_id = %stored.id, aggregation = stored.aggregation.as_str(), "Meter created");
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn get_meter(&self, organization_id: Uuid, id: Uuid) -> Result<Option<Meter>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_meter"])
            .start_timer();

        let meter = sqlx::query_as::<_, Meter>(
            r#"
            SELECT id, organization_id, name, filter, aggregation, archived_at, created_at
            FROM meters
            WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(organization_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get meter", e))?;

        timer.observe_duration();
        Ok(meter)
    }

    #[instrument(skip(self))]
    async fn list_meters(&self, organization_id: Uuid) -> Result<Vec<Meter>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_meters"])
            .start_timer();

        let meters = sqlx::query_as::<_, Meter>(
            r#"
            SELECT id, organization_id, name, filter, aggregation, archived_at, created_at
            FROM meters
            WHERE organization_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list meters", e))?;

        timer.observe_duration();
        Ok(meters)
    }

    #[instrument(skip(self))]
    async fn archive_meter(
        &self,
        organization_id: Uuid,
        id: Uuid,
        archived_at: DateTime<Utc>,
    ) -> Result<Option<Meter>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["archive_meter"])
            .start_timer();

        let meter = sqlx::query_as::<_, Meter>(
            r#"
            UPDATE meters
            SET archived_at = COALESCE(archived_at, $3)
            WHERE organization_id = $1 AND id = $2
            RETURNING id, organization_id, name, filter, aggregation, archived_at, created_at
            "#,
        )
        .bind(organization_id)
        .bind(id)
        .bind(archived_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("archive meter", e))?;

        timer.observe_duration();
        Ok(meter)
    }
}

// =============================================================================
// Subscription Operations
// =============================================================================

#[async_trait]
impl SubscriptionRepository for Database {
    #[instrument(skip(self, terms), fields(subscription_id = %terms.id))]
    async fn upsert_subscription(&self, terms: &SubscriptionTerms) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_subscription"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, organization_id, customer_id, external_customer_id, terms, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (id) DO UPDATE
            SET customer_id = EXCLUDED.customer_id,
                external_customer_id = EXCLUDED.external_customer_id,
                terms = EXCLUDED.terms,
                updated_at = NOW()
            "#,
        )
        .bind(terms.id)
        .bind(terms.organization_id)
        .bind(terms.customer_id)
        .bind(&terms.external_customer_id)
        .bind(Json(terms))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("upsert subscription", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_subscription(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SubscriptionTerms>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let terms = sqlx::query_scalar::<_, Json<SubscriptionTerms>>(
            "SELECT terms FROM subscriptions WHERE organization_id = $1 AND id = $2",
        )
        .bind(organization_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get subscription", e))?;

        timer.observe_duration();
        Ok(terms.map(|Json(t)| t))
    }

    #[instrument(skip(self, customer))]
    async fn find_subscriptions_for_customer(
        &self,
        organization_id: Uuid,
        customer: &CustomerRef,
    ) -> Result<Vec<SubscriptionTerms>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscriptions_for_customer"])
            .start_timer();

        let rows = sqlx::query_scalar::<_, Json<SubscriptionTerms>>(
            r#"
            SELECT terms
            FROM subscriptions
            WHERE organization_id = $1
              AND (customer_id = $2 OR external_customer_id = $3)
            ORDER BY id
            "#,
        )
        .bind(organization_id)
        .bind(customer.customer_id)
        .bind(&customer.external_customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("find subscriptions", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(|Json(t)| t).collect())
    }
}

// =============================================================================
// Credit Operations
// =============================================================================

#[async_trait]
impl CreditRepository for Database {
    #[instrument(skip(self, transaction), fields(customer_id = %transaction.customer_id, amount = transaction.amount))]
    async fn record_credit(&self, transaction: &CreditTransaction) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_credit"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO credit_transactions (id, organization_id, customer_id, amount, currency, order_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.organization_id)
        .bind(transaction.customer_id)
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(transaction.order_id)
        .bind(transaction.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("record credit", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_credits(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
        currency: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_credits"])
            .start_timer();

        let credits = sqlx::query_as::<_, CreditTransaction>(
            r#"
            SELECT id, organization_id, customer_id, amount, currency, order_id, created_at
            FROM credit_transactions
            WHERE organization_id = $1 AND customer_id = $2 AND currency = $3 AND created_at < $4
            ORDER BY created_at, id
            "#,
        )
        .bind(organization_id)
        .bind(customer_id)
        .bind(currency)
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list credits", e))?;

        timer.observe_duration();
        Ok(credits)
    }
}

// =============================================================================
// Ledger Operations
// =============================================================================

impl Database {
    async fn fetch_period(
        &self,
        query: &str,
        label: &str,
        binds: PeriodLookup,
    ) -> Result<Option<BillingPeriod>, AppError> {
        let timer = DB_QUERY_DURATION.with_label_values(&[label]).start_timer();
        let sql = format!("SELECT {} FROM billing_periods WHERE {}", PERIOD_COLUMNS, query);
        let q = sqlx::query_as::<_, BillingPeriod>(&sql);
        let q = match binds {
            PeriodLookup::Id(id) => q.bind(id),
            PeriodLookup::At(subscription_id, instant) => q.bind(subscription_id).bind(instant),
        };
        let period = q
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error(label, e))?;
        timer.observe_duration();
        Ok(period)
    }

    async fn period_in_states(
        &self,
        subscription_id: Uuid,
        states: &[PeriodState],
        order: &str,
    ) -> Result<Option<BillingPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["period_in_states"])
            .start_timer();
        let states: Vec<&str> = states.iter().map(PeriodState::as_str).collect();
        let period = sqlx::query_as::<_, BillingPeriod>(&format!(
            "SELECT {} FROM billing_periods WHERE subscription_id = $1 AND state = ANY($2) ORDER BY period_start {} LIMIT 1",
            PERIOD_COLUMNS, order
        ))
        .bind(subscription_id)
        .bind(states)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find billing period by state", e))?;
        timer.observe_duration();
        Ok(period)
    }
}

enum PeriodLookup {
    Id(Uuid),
    At(Uuid, DateTime<Utc>),
}

#[async_trait]
impl LedgerRepository for Database {
    #[instrument(skip(self, period), fields(subscription_id = %period.subscription_id, period_start = %period.period_start))]
    async fn insert_period_if_absent(
        &self,
        period: &BillingPeriod,
    ) -> Result<BillingPeriod, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_period"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO billing_periods (id, organization_id, customer_id, subscription_id, currency, period_start, period_end, state, priced_lines, order_id, order_items, pricing_attempts, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (subscription_id, period_start) DO NOTHING
            "#,
        )
        .bind(period.id)
        .bind(period.organization_id)
        .bind(period.customer_id)
        .bind(period.subscription_id)
        .bind(&period.currency)
        .bind(period.period_start)
        .bind(period.period_end)
        .bind(period.state.as_str())
        .bind(Json(&period.priced_lines))
        .bind(period.order_id)
        .bind(Json(&period.order_items))
        .bind(period.pricing_attempts)
        .bind(&period.last_error)
        .bind(period.created_at)
        .bind(period.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert billing period", e))?;

        timer.observe_duration();

        self.find_period_by_start(period.subscription_id, period.period_start)
            .await?
            .ok_or_else(|| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Billing period of subscription {} at {} missing after insert",
                    period.subscription_id,
                    period.period_start
                ))
            })
    }

    async fn get_period(&self, id: Uuid) -> Result<Option<BillingPeriod>, AppError> {
        self.fetch_period("id = $1", "get_period", PeriodLookup::Id(id))
            .await
    }

    async fn find_period_at(
        &self,
        subscription_id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<Option<BillingPeriod>, AppError> {
        self.fetch_period(
            "subscription_id = $1 AND period_start <= $2 AND period_end > $2 ORDER BY period_start DESC LIMIT 1",
            "find_period_at",
            PeriodLookup::At(subscription_id, instant),
        )
        .await
    }

    async fn find_period_by_start(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<Option<BillingPeriod>, AppError> {
        self.fetch_period(
            "subscription_id = $1 AND period_start = $2",
            "find_period_by_start",
            PeriodLookup::At(subscription_id, period_start),
        )
        .await
    }

    async fn find_period_by_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<BillingPeriod>, AppError> {
        self.fetch_period("order_id = $1", "find_period_by_order", PeriodLookup::Id(order_id))
            .await
    }

    async fn latest_period(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<BillingPeriod>, AppError> {
        self.fetch_period(
            "subscription_id = $1 ORDER BY period_start DESC LIMIT 1",
            "latest_period",
            PeriodLookup::Id(subscription_id),
        )
        .await
    }

    async fn first_period_in(
        &self,
        subscription_id: Uuid,
        states: &[PeriodState],
    ) -> Result<Option<BillingPeriod>, AppError> {
        self.period_in_states(subscription_id, states, "ASC").await
    }

    async fn last_period_in(
        &self,
        subscription_id: Uuid,
        states: &[PeriodState],
    ) -> Result<Option<BillingPeriod>, AppError> {
        self.period_in_states(subscription_id, states, "DESC").await
    }

    #[instrument(skip(self, period), fields(period_id = %period.id, state = %period.state))]
    async fn update_period(&self, period: &BillingPeriod) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_period"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE billing_periods
            SET state = $2,
                priced_lines = $3,
                order_id = $4,
                order_items = $5,
                pricing_attempts = $6,
                last_error = $7,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(period.id)
        .bind(period.state.as_str())
        .bind(Json(&period.priced_lines))
        .bind(period.order_id)
        .bind(Json(&period.order_items))
        .bind(period.pricing_attempts)
        .bind(&period.last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update billing period", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Billing period {} not found",
                period.id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_periods(
        &self,
        state: PeriodState,
        ended_by: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<BillingPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_periods"])
            .start_timer();

        let periods = sqlx::query_as::<_, BillingPeriod>(&format!(
            r#"
            SELECT {}
            FROM billing_periods
            WHERE state = $1 AND ($2::timestamptz IS NULL OR period_end <= $2)
            ORDER BY period_end, id
            LIMIT $3
            "#,
            PERIOD_COLUMNS
        ))
        .bind(state.as_str())
        .bind(ended_by)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list billing periods", e))?;

        timer.observe_duration();
        Ok(periods)
    }

    #[instrument(skip(self, entries), fields(count = entries.len()))]
    async fn insert_entries(&self, entries: &[BillingEntry]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_entries"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO billing_entries (id, organization_id, customer_id, subscription_id, product_price_id, period_id, start_timestamp, end_timestamp, direction, amount, currency, event_id, synthetic, late_arrival, deferred, order_item_id, created_at, deleted_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                "#,
            )
            .bind(entry.id)
            .bind(entry.organization_id)
            .bind(entry.customer_id)
            .bind(entry.subscription_id)
            .bind(entry.product_price_id)
            .bind(entry.period_id)
            .bind(entry.start_timestamp)
            .bind(entry.end_timestamp)
            .bind(entry.direction.as_str())
            .bind(entry.amount)
            .bind(&entry.currency)
            .bind(entry.event_id)
            .bind(entry.synthetic)
            .bind(entry.late_arrival)
            .bind(entry.deferred)
            .bind(entry.order_item_id)
            .bind(entry.created_at)
            .bind(entry.deleted_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("insert billing entry", e))?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    /// The period row is share-locked for the insert, so a concurrent state
    /// change either commits first (and the entry is refused) or waits for it.
    #[instrument(skip(self, entry), fields(event_id = %entry.event_id, period_id = %entry.period_id))]
    async fn insert_usage_entry(&self, entry: &BillingEntry) -> Result<UsageInsert, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_usage_entry"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM billing_periods WHERE id = $1 FOR SHARE")
                .bind(entry.period_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| db_error("lock billing period", e))?;

        if state.as_deref() != Some(PeriodState::Accruing.as_str()) {
            debug!(state = ?state, "Period no longer accruing");
            timer.observe_duration();
            return Ok(UsageInsert::PeriodClosed);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO billing_entries (id, organization_id, customer_id, subscription_id, product_price_id, period_id, start_timestamp, end_timestamp, direction, amount, currency, event_id, synthetic, late_arrival, deferred, order_item_id, created_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (event_id, subscription_id, product_price_id)
                WHERE deleted_at IS NULL AND synthetic = FALSE
            DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.organization_id)
        .bind(entry.customer_id)
        .bind(entry.subscription_id)
        .bind(entry.product_price_id)
        .bind(entry.period_id)
        .bind(entry.start_timestamp)
        .bind(entry.end_timestamp)
        .bind(entry.direction.as_str())
        .bind(entry.amount)
        .bind(&entry.currency)
        .bind(entry.event_id)
        .bind(entry.synthetic)
        .bind(entry.late_arrival)
        .bind(entry.deferred)
        .bind(entry.order_item_id)
        .bind(entry.created_at)
        .bind(entry.deleted_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("insert usage entry", e))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        if result.rows_affected() == 1 {
            Ok(UsageInsert::Inserted)
        } else {
            Ok(UsageInsert::Duplicate)
        }
    }

    #[instrument(skip(self))]
    async fn list_entries(&self, period_id: Uuid) -> Result<Vec<BillingEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_entries"])
            .start_timer();

        let entries = sqlx::query_as::<_, BillingEntry>(&format!(
            "SELECT {} FROM billing_entries WHERE period_id = $1 AND deleted_at IS NULL ORDER BY created_at, id",
            ENTRY_COLUMNS
        ))
        .bind(period_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list billing entries", e))?;

        timer.observe_duration();
        Ok(entries)
    }

    async fn entries_for_event(&self, event_id: Uuid) -> Result<Vec<BillingEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["entries_for_event"])
            .start_timer();

        let entries = sqlx::query_as::<_, BillingEntry>(&format!(
            "SELECT {} FROM billing_entries WHERE event_id = $1 AND deleted_at IS NULL",
            ENTRY_COLUMNS
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list entries for event", e))?;

        timer.observe_duration();
        Ok(entries)
    }

    #[instrument(skip(self, amounts), fields(count = amounts.len()))]
    async fn assign_amounts(&self, amounts: &[(Uuid, i64)]) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["assign_amounts"])
            .start_timer();

        let (ids, values): (Vec<Uuid>, Vec<i64>) = amounts.iter().copied().unzip();
        let result = sqlx::query(
            r#"
            UPDATE billing_entries AS e
            SET amount = v.amount
            FROM UNNEST($1::uuid[], $2::bigint[]) AS v(id, amount)
            WHERE e.id = v.id AND e.amount IS NULL
            "#,
        )
        .bind(&ids)
        .bind(&values)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("assign entry amounts", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, links), fields(count = links.len()))]
    async fn link_order_items(&self, links: &[(Uuid, Uuid)]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["link_order_items"])
            .start_timer();

        let (entry_ids, item_ids): (Vec<Uuid>, Vec<Uuid>) = links.iter().copied().unzip();
        sqlx::query(
            r#"
            UPDATE billing_entries AS e
            SET order_item_id = v.order_item_id
            FROM UNNEST($1::uuid[], $2::uuid[]) AS v(id, order_item_id)
            WHERE e.id = v.id
            "#,
        )
        .bind(&entry_ids)
        .bind(&item_ids)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("link order items", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn soft_delete_entries(
        &self,
        ids: &[Uuid],
        deleted_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["soft_delete_entries"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE billing_entries SET deleted_at = $2 WHERE id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(ids)
        .bind(deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("soft delete entries", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Order Operations
// =============================================================================

#[derive(FromRow)]
struct OrderRow {
    id: Uuid,
    organization_id: Uuid,
    customer_id: Uuid,
    subscription_id: Option<Uuid>,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    currency: String,
    #[sqlx(json)]
    items: Vec<PersistedOrderItem>,
    subtotal_amount: i64,
    discount_amount: i64,
    #[sqlx(json)]
    tax: TaxCalculation,
    total_amount: i64,
    applied_balance_amount: i64,
    created_at: DateTime<Utc>,
    voided_at: Option<DateTime<Utc>>,
}

impl From<OrderRow> for PersistedOrderSnapshot {
    fn from(row: OrderRow) -> Self {
        let billing_period = match (row.period_start, row.period_end) {
            (Some(start), Some(end)) => Some(TimeWindow::new(start, end)),
            _ => None,
        };
        Self {
            id: row.id,
            organization_id: row.organization_id,
            customer_id: row.customer_id,
            subscription_id: row.subscription_id,
            billing_period,
            currency: row.currency,
            items: row.items,
            subtotal_amount: row.subtotal_amount,
            discount_amount: row.discount_amount,
            tax: row.tax,
            total_amount: row.total_amount,
            applied_balance_amount: row.applied_balance_amount,
            created_at: row.created_at,
            voided_at: row.voided_at,
        }
    }
}

#[async_trait]
impl OrderRepository for Database {
    #[instrument(skip(self, draft), fields(subscription_id = %draft.subscription_id, total = draft.total_amount))]
    async fn create_order(&self, draft: &OrderDraft) -> Result<PersistedOrderSnapshot, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_order"])
            .start_timer();

        let items: Vec<PersistedOrderItem> = draft
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

        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            INSERT INTO orders (id, organization_id, customer_id, subscription_id, period_start, period_end, currency, items, subtotal_amount, discount_amount, tax, total_amount, applied_balance_amount, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(draft.organization_id)
        .bind(draft.customer_id)
        .bind(draft.subscription_id)
        .bind(draft.billing_period.start)
        .bind(draft.billing_period.end)
        .bind(&draft.currency)
        .bind(Json(&items))
        .bind(draft.subtotal_amount)
        .bind(draft.discount_amount)
        .bind(Json(&draft.tax))
        .bind(draft.total_amount)
        .bind(draft.applied_balance_amount)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("create order", e))?;

        timer.observe_duration();
        info!(order_id = %row.id, "Order created");
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn get_order(&self, id: Uuid) -> Result<Option<PersistedOrderSnapshot>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_order"])
            .start_timer();

        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get order", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn list_orders_created_in(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<PersistedOrderSnapshot>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_orders_created_in"])
            .start_timer();

        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            SELECT {}
            FROM orders
            WHERE created_at >= $1 AND created_at < $2 AND voided_at IS NULL
            ORDER BY created_at, id
            "#,
            ORDER_COLUMNS
        ))
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list orders", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn void_order(&self, id: Uuid, voided_at: DateTime<Utc>) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["void_order"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE orders SET voided_at = $2 WHERE id = $1 AND voided_at IS NULL",
        )
        .bind(id)
        .bind(voided_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("void order", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Sweep Checkpoint Operations
// =============================================================================

#[derive(FromRow)]
struct CheckpointRow {
    sweep_id: Uuid,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    completed_subscriptions: Vec<Uuid>,
    finished: bool,
    updated_at: DateTime<Utc>,
}

impl From<CheckpointRow> for SweepCheckpoint {
    fn from(row: CheckpointRow) -> Self {
        SweepCheckpoint {
            sweep_id: row.sweep_id,
            window: TimeWindow::new(row.window_start, row.window_end),
            completed_subscriptions: row.completed_subscriptions,
            finished: row.finished,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl CheckpointRepository for Database {
    #[instrument(skip(self, checkpoint), fields(sweep_id = %checkpoint.sweep_id))]
    async fn save_checkpoint(&self, checkpoint: &SweepCheckpoint) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_checkpoint"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO sweep_checkpoints (sweep_id, window_start, window_end, completed_subscriptions, finished, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (sweep_id) DO UPDATE
            SET completed_subscriptions = EXCLUDED.completed_subscriptions,
                finished = EXCLUDED.finished,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(checkpoint.sweep_id)
        .bind(checkpoint.window.start)
        .bind(checkpoint.window.end)
        .bind(&checkpoint.completed_subscriptions)
        .bind(checkpoint.finished)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("save sweep checkpoint", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_checkpoint(&self, sweep_id: Uuid) -> Result<Option<SweepCheckpoint>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_checkpoint"])
            .start_timer();

        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT sweep_id, window_start, window_end, completed_subscriptions, finished, updated_at
            FROM sweep_checkpoints
            WHERE sweep_id = $1
            "#,
        )
        .bind(sweep_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get sweep checkpoint", e))?;

        timer.observe_duration();
        Ok(row.map(SweepCheckpoint::from))
    }

    #[instrument(skip(self))]
    async fn list_unfinished_checkpoints(
        &self,
        limit: usize,
    ) -> Result<Vec<SweepCheckpoint>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unfinished_checkpoints"])
            .start_timer();

        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT sweep_id, window_start, window_end, completed_subscriptions, finished, updated_at
            FROM sweep_checkpoints
            WHERE finished = FALSE
            ORDER BY updated_at, sweep_id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list unfinished sweep checkpoints", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(SweepCheckpoint::from).collect())
    }
}
