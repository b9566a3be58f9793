//! Billing ledger entry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Entry direction (debit or credit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of billable usage (or credit) attributed to a customer, price and
/// period. `amount` stays `None` until the period is priced and is assigned
/// once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BillingEntry {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub product_price_id: Uuid,
    pub period_id: Uuid,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub amount: Option<i64>,
    pub currency: String,
    /// Source event, or a generated id for static-price entries.
    pub event_id: Uuid,
    pub synthetic: bool,
    /// The event's own timestamp precedes the period it was billed in.
    pub late_arrival: bool,
    /// Admitted to the following period because this one had stopped
    /// accruing.
    pub deferred: bool,
    pub order_item_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BillingEntry {
    pub fn is_materialized(&self) -> bool {
        self.order_item_id.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Input for creating an entry.
#[derive(Debug, Clone)]
pub struct NewBillingEntry {
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub product_price_id: Uuid,
    pub period_id: Uuid,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub currency: String,
    pub event_id: Uuid,
    pub synthetic: bool,
    pub late_arrival: bool,
    pub deferred: bool,
}

impl NewBillingEntry {
    pub fn into_entry(self) -> BillingEntry {
        BillingEntry {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            customer_id: self.customer_id,
            subscription_id: self.subscription_id,
            product_price_id: self.product_price_id,
            period_id: self.period_id,
            start_timestamp: self.start_timestamp,
            end_timestamp: self.end_timestamp,
            direction: self.direction,
            amount: None,
            currency: self.currency,
            event_id: self.event_id,
            synthetic: self.synthetic,
            late_arrival: self.late_arrival,
            deferred: self.deferred,
            order_item_id: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}
