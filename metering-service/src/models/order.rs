//! Persisted order model.

use super::TimeWindow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Tax result captured when the order was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxCalculation {
    pub amount: i64,
    /// Rate in basis points (2500 = 25%).
    pub rate_basis_points: u32,
    pub reason: String,
}

impl TaxCalculation {
    pub fn none() -> Self {
        Self {
            amount: 0,
            rate_basis_points: 0,
            reason: "not_applicable".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedOrderItem {
    pub id: Uuid,
    pub product_price_id: Option<Uuid>,
    pub label: String,
    pub window: TimeWindow,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    pub proration_factor: Decimal,
    pub amount: i64,
    pub currency: String,
}

/// Read-only view of an order as it was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedOrderSnapshot {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub billing_period: Option<TimeWindow>,
    pub currency: String,
    pub items: Vec<PersistedOrderItem>,
    pub subtotal_amount: i64,
    pub discount_amount: i64,
    pub tax: TaxCalculation,
    pub total_amount: i64,
    /// Customer balance applied to the order; zero or negative.
    pub applied_balance_amount: i64,
    pub created_at: DateTime<Utc>,
    pub voided_at: Option<DateTime<Utc>>,
}

impl PersistedOrderSnapshot {
    pub fn due_amount(&self) -> i64 {
        self.total_amount + self.applied_balance_amount
    }

    pub fn items_sum(&self) -> i64 {
        self.items.iter().map(|item| item.amount).sum()
    }
}

#[derive(Debug, Clone)]
pub struct OrderItemDraft {
    pub product_price_id: Uuid,
    pub label: String,
    pub window: TimeWindow,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    pub proration_factor: Decimal,
    pub amount: i64,
}

/// Order produced by materializing a billing period.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Uuid,
    pub billing_period: TimeWindow,
    pub currency: String,
    pub items: Vec<OrderItemDraft>,
    pub subtotal_amount: i64,
    pub discount_amount: i64,
    pub tax: TaxCalculation,
    pub total_amount: i64,
    pub applied_balance_amount: i64,
}

/// Signed movement of a customer's credit balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    /// Grants are positive, consumption negative.
    pub amount: i64,
    pub currency: String,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
