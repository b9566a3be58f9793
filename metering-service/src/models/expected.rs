//! Oracle output: what an order should contain.

use super::{Discount, TimeWindow};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What the oracle is asked to simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimulationTarget {
    /// A persisted order; its period and captured tax are used.
    Order { order_id: Uuid },
    /// A subscription period that may not have an order yet.
    Period {
        subscription_id: Uuid,
        window: TimeWindow,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedLineItem {
    pub product_price_id: Uuid,
    pub window: TimeWindow,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    pub proration_factor: Decimal,
    pub cap_amount: Option<i64>,
    pub computed_amount: i64,
    pub currency: String,
    /// Usage excluding events ingested inside the grace window before the
    /// period end. Equals `quantity` for static prices.
    pub settled_quantity: Decimal,
    /// Usage including events ingested inside the grace window before the
    /// period start, which the ledger may have deferred into this period.
    pub carried_quantity: Decimal,
    /// Events whose own timestamp falls in the period but that were ingested
    /// after it ended.
    pub late_event_count: u64,
}

impl ExpectedLineItem {
    pub fn total(&self) -> i64 {
        self.computed_amount
    }

    pub fn is_metered(&self) -> bool {
        self.settled_quantity != self.quantity || self.carried_quantity != self.quantity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedOrder {
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub order_id: Option<Uuid>,
    pub billing_period: TimeWindow,
    pub currency: String,
    pub line_items: Vec<ExpectedLineItem>,
    pub subtotal_amount: i64,
    pub discount_amount: i64,
    pub tax_amount: i64,
    /// Captured rate the tax was derived from, if any.
    pub tax_rate_basis_points: Option<u32>,
    pub total_amount: i64,
    /// Zero or negative.
    pub applied_balance_amount: i64,
    pub due_amount: i64,
    pub available_balance: i64,
    /// Discounts that applied to this period.
    pub discounts: Vec<Discount>,
    pub events_scanned: u64,
    pub simulated_at: DateTime<Utc>,
}

impl ExpectedOrder {
    /// `total == Σ line totals - discount + tax` and `total >= 0`.
    pub fn is_conserved(&self) -> bool {
        let lines: i64 = self.line_items.iter().map(ExpectedLineItem::total).sum();
        self.subtotal_amount == lines
            && self.total_amount == lines - self.discount_amount + self.tax_amount
            && self.total_amount >= 0
            && self.due_amount >= 0
    }
}
