//! Billing period state kept by the ledger.

use super::TimeWindow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Ledger state of one subscription period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PeriodState {
    Accruing,
    Closing,
    Priced,
    Materialized,
}

impl PeriodState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodState::Accruing => "accruing",
            PeriodState::Closing => "closing",
            PeriodState::Priced => "priced",
            PeriodState::Materialized => "materialized",
        }
    }
}

impl std::fmt::Display for PeriodState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pricing outcome for one subscription price within a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedLine {
    pub product_price_id: Uuid,
    pub window: TimeWindow,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    pub proration_factor: Decimal,
    pub cap_amount: Option<i64>,
    pub amount: i64,
    pub currency: String,
    pub entry_ids: Vec<Uuid>,
}

/// Order item produced when a period is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderItemRef {
    pub order_id: Uuid,
    pub order_item_id: Uuid,
    pub product_price_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BillingPeriod {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Uuid,
    pub currency: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub state: PeriodState,
    #[sqlx(json)]
    pub priced_lines: Vec<PricedLine>,
    pub order_id: Option<Uuid>,
    #[sqlx(json)]
    pub order_items: Vec<OrderItemRef>,
    pub pricing_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn open(
        organization_id: Uuid,
        customer_id: Uuid,
        subscription_id: Uuid,
        currency: String,
        window: TimeWindow,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            customer_id,
            subscription_id,
            currency,
            period_start: window.start,
            period_end: window.end,
            state: PeriodState::Accruing,
            priced_lines: Vec::new(),
            order_id: None,
            order_items: Vec::new(),
            pricing_attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.period_start, self.period_end)
    }
}
