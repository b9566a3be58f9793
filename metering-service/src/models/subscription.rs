//! Subscription terms as seen by the metering core.

use super::{CustomerRef, ProductPrice, TimeWindow};
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Active,
        }
    }

    /// Whether usage still accrues for the subscription.
    pub fn accrues_usage(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

/// Billing interval for recurring periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Day => "day",
            BillingInterval::Week => "week",
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "day" => BillingInterval::Day,
            "week" => BillingInterval::Week,
            "year" => BillingInterval::Year,
            _ => BillingInterval::Month,
        }
    }

    /// End of the period that starts at `start`.
    pub fn advance(&self, start: DateTime<Utc>, count: u32) -> DateTime<Utc> {
        let count = count.max(1);
        match self {
            BillingInterval::Day => start + Duration::days(count as i64),
            BillingInterval::Week => start + Duration::weeks(count as i64),
            BillingInterval::Month => start
                .checked_add_months(Months::new(count))
                .unwrap_or(start + Duration::days(30 * count as i64)),
            BillingInterval::Year => start
                .checked_add_months(Months::new(12 * count))
                .unwrap_or(start + Duration::days(365 * count as i64)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscountKind {
    Percentage { basis_points: u32 },
    Fixed { amount: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "duration", rename_all = "snake_case")]
pub enum DiscountDuration {
    Once,
    Forever,
    Repeating { duration_in_months: u32 },
}

/// A discount redeemed on a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discount {
    pub id: Uuid,
    pub name: String,
    pub kind: DiscountKind,
    pub duration: DiscountDuration,
    pub redeemed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    pub country: String,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub line1: Option<String>,
}

/// A price as attached to a subscription, with the window it applies to.
///
/// A mid-period plan change ends one price's window and starts another's;
/// each is prorated by its overlap with the billing period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPrice {
    pub price: ProductPrice,
    pub effective_from: Option<DateTime<Utc>>,
    pub effective_until: Option<DateTime<Utc>>,
    pub seats: Option<u32>,
    pub custom_amount: Option<i64>,
}

impl SubscriptionPrice {
    pub fn new(price: ProductPrice) -> Self {
        Self {
            price,
            effective_from: None,
            effective_until: None,
            seats: None,
            custom_amount: None,
        }
    }

    /// Portion of `period` this price is in effect for.
    pub fn effective_window(&self, period: &TimeWindow) -> Option<TimeWindow> {
        let window = TimeWindow::new(
            self.effective_from.unwrap_or(period.start),
            self.effective_until.unwrap_or(period.end),
        );
        period.intersect(&window)
    }

    pub fn is_effective_at(&self, instant: DateTime<Utc>) -> bool {
        self.effective_from.is_none_or(|from| instant >= from)
            && self.effective_until.is_none_or(|until| instant < until)
    }
}

/// Everything the ledger and the oracle need to know about a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionTerms {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub external_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub currency: String,
    pub interval: BillingInterval,
    pub interval_count: u32,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub prices: Vec<SubscriptionPrice>,
    pub discounts: Vec<Discount>,
    pub billing_address: Option<Address>,
    pub tax_ids: Vec<String>,
}

impl SubscriptionTerms {
    pub fn customer_ref(&self) -> CustomerRef {
        CustomerRef {
            customer_id: Some(self.customer_id),
            external_customer_id: self.external_customer_id.clone(),
        }
    }

    pub fn current_period(&self) -> TimeWindow {
        TimeWindow::new(self.current_period_start, self.current_period_end)
    }

    /// Period immediately following `period`.
    pub fn next_period(&self, period: &TimeWindow) -> TimeWindow {
        TimeWindow::new(
            period.end,
            self.interval.advance(period.end, self.interval_count),
        )
    }

    pub fn find_price(&self, price_id: Uuid) -> Option<&SubscriptionPrice> {
        self.prices.iter().find(|p| p.price.id == price_id)
    }
}
