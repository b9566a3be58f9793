//! Proration and pricing engine.
//!
//! All amounts are integer minor units; quantities, rates and proration
//! factors are exact decimals rounded once, half away from zero.

mod discount;
mod engine;
mod proration;
mod rounding;

pub use discount::{
    applicable_discounts, applied_balance, apply_discounts, discount_applies, tax_amount,
    OrderTotals, MAX_DISCOUNT_MONTHS,
};
pub use engine::{clamp_custom_amount, compute_amount, quote_line, LineQuote, PricingInput};
pub use proration::proration_factor;
pub use rounding::{
    adjust_payout_amount_for_zero_decimal_currency, non_negative_running_sum,
    round_half_away_from_zero, running_balances,
};

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PricingError {
    #[error("amount does not fit in minor units")]
    Overflow,

    #[error("negative quantity {0}")]
    NegativeQuantity(Decimal),

    #[error("proration factor {0} outside [0, 1]")]
    InvalidProration(Decimal),

    #[error("no seat tier covers {0} seats")]
    NoSeatTier(u32),

    #[error("seat count {0} is not a whole number")]
    FractionalSeats(Decimal),

    #[error("seat-based price without a seat count")]
    MissingSeats,

    #[error("custom price without an amount")]
    MissingCustomAmount,
}
