//! Product price model.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One seat tier. `max_seats = None` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatTier {
    pub min_seats: u32,
    pub max_seats: Option<u32>,
    pub price_per_seat: i64,
}

impl SeatTier {
    pub fn contains(&self, seats: u32) -> bool {
        seats >= self.min_seats && self.max_seats.is_none_or(|max| seats <= max)
    }
}

/// Price specification. Amounts are minor currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "amount_type", rename_all = "snake_case")]
pub enum PriceSpec {
    Fixed {
        price_amount: i64,
    },
    Free,
    Custom {
        minimum_amount: Option<i64>,
        maximum_amount: Option<i64>,
        preset_amount: Option<i64>,
    },
    MeteredUnit {
        meter_id: Uuid,
        unit_amount: Decimal,
        #[serde(default)]
        included_units: Decimal,
        cap_amount: Option<i64>,
    },
    SeatTiered {
        tiers: Vec<SeatTier>,
    },
}

impl PriceSpec {
    /// Static prices are charged per period regardless of usage.
    pub fn is_static(&self) -> bool {
        !matches!(self, PriceSpec::MeteredUnit { .. })
    }

    pub fn meter_id(&self) -> Option<Uuid> {
        match self {
            PriceSpec::MeteredUnit { meter_id, .. } => Some(*meter_id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSpec::Fixed { .. } => "fixed",
            PriceSpec::Free => "free",
            PriceSpec::Custom { .. } => "custom",
            PriceSpec::MeteredUnit { .. } => "metered_unit",
            PriceSpec::SeatTiered { .. } => "seat_tiered",
        }
    }
}

/// A price attached to a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPrice {
    pub id: Uuid,
    pub product_id: Uuid,
    pub currency: String,
    pub spec: PriceSpec,
}
