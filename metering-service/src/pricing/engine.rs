//! Amount computation for every price kind.

use super::{proration_factor, round_half_away_from_zero, PricingError};
use crate::models::{PriceSpec, SubscriptionPrice, TimeWindow};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Inputs to [`compute_amount`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingInput {
    /// Metered units, or seats for seat-tiered prices.
    pub quantity: Decimal,
    pub proration_factor: Decimal,
    /// Amount chosen by the customer for custom prices.
    pub custom_amount: Option<i64>,
}

impl PricingInput {
    pub fn new(quantity: Decimal, proration_factor: Decimal) -> Self {
        Self {
            quantity,
            proration_factor,
            custom_amount: None,
        }
    }
}

/// Amount in minor units for one price.
pub fn compute_amount(spec: &PriceSpec, input: &PricingInput) -> Result<i64, PricingError> {
    if input.quantity < Decimal::ZERO {
        return Err(PricingError::NegativeQuantity(input.quantity));
    }
    if input.proration_factor < Decimal::ZERO || input.proration_factor > Decimal::ONE {
        return Err(PricingError::InvalidProration(input.proration_factor));
    }

    match spec {
        PriceSpec::Free => Ok(0),
        PriceSpec::Fixed { price_amount } => {
            let raw = Decimal::from(*price_amount)
                .checked_mul(input.proration_factor)
                .ok_or(PricingError::Overflow)?;
            round_half_away_from_zero(raw)
        }
        PriceSpec::Custom {
            minimum_amount,
            maximum_amount,
            preset_amount,
        } => {
            let amount = input
                .custom_amount
                .or(*preset_amount)
                .ok_or(PricingError::MissingCustomAmount)?;
            Ok(clamp_custom_amount(amount, *minimum_amount, *maximum_amount))
        }
        PriceSpec::MeteredUnit {
            unit_amount,
            included_units,
            cap_amount,
            ..
        } => {
            let billable = (input.quantity - *included_units).max(Decimal::ZERO);
            let raw = billable
                .checked_mul(*unit_amount)
                .and_then(|v| v.checked_mul(input.proration_factor))
                .ok_or(PricingError::Overflow)?;
            let amount = round_half_away_from_zero(raw)?;
            Ok(match cap_amount {
                Some(cap) => amount.min(*cap),
                None => amount,
            })
        }
        PriceSpec::SeatTiered { tiers } => {
            let seats = seat_count(input.quantity)?;
            let tier = tiers
                .iter()
                .find(|tier| tier.contains(seats))
                .ok_or(PricingError::NoSeatTier(seats))?;
            let raw = Decimal::from(tier.price_per_seat)
                .checked_mul(Decimal::from(seats))
                .and_then(|v| v.checked_mul(input.proration_factor))
                .ok_or(PricingError::Overflow)?;
            round_half_away_from_zero(raw)
        }
    }
}

/// Clamp into `[minimum, maximum]`; an amount below the minimum is raised.
pub fn clamp_custom_amount(amount: i64, minimum: Option<i64>, maximum: Option<i64>) -> i64 {
    let amount = match maximum {
        Some(max) => amount.min(max),
        None => amount,
    };
    match minimum {
        Some(min) => amount.max(min),
        None => amount,
    }
}

fn seat_count(quantity: Decimal) -> Result<u32, PricingError> {
    if quantity.fract() != Decimal::ZERO {
        return Err(PricingError::FractionalSeats(quantity));
    }
    quantity.to_u32().ok_or(PricingError::Overflow)
}

/// One priced line of a period, before it is written to an order.
#[derive(Debug, Clone, PartialEq)]
pub struct LineQuote {
    pub product_price_id: Uuid,
    pub window: TimeWindow,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    pub proration_factor: Decimal,
    pub cap_amount: Option<i64>,
    pub amount: i64,
    pub currency: String,
}

/// Price a subscription price for `period`.
///
/// `usage` is the aggregated quantity for metered prices and ignored for
/// static ones. Returns `None` when the price is not in effect during the
/// period. Metered usage is already bounded by the effective window, so it
/// is never prorated again; custom amounts are not prorated either.
pub fn quote_line(
    subscription_price: &SubscriptionPrice,
    period: &TimeWindow,
    usage: Decimal,
) -> Result<Option<LineQuote>, PricingError> {
    let Some(window) = subscription_price.effective_window(period) else {
        return Ok(None);
    };
    let price = &subscription_price.price;
    let prorated = proration_factor(period, &window);

    let (quantity, unit_amount, factor, cap_amount) = match &price.spec {
        PriceSpec::Free => (Decimal::ONE, Decimal::ZERO, prorated, None),
        PriceSpec::Fixed { price_amount } => {
            (Decimal::ONE, Decimal::from(*price_amount), prorated, None)
        }
        PriceSpec::Custom {
            minimum_amount,
            maximum_amount,
            preset_amount,
        } => {
            let amount = subscription_price
                .custom_amount
                .or(*preset_amount)
                .ok_or(PricingError::MissingCustomAmount)?;
            let unit = clamp_custom_amount(amount, *minimum_amount, *maximum_amount);
            (Decimal::ONE, Decimal::from(unit), Decimal::ONE, None)
        }
        PriceSpec::MeteredUnit {
            unit_amount,
            cap_amount,
            ..
        } => (usage, *unit_amount, Decimal::ONE, *cap_amount),
        PriceSpec::SeatTiered { tiers } => {
            let seats = subscription_price.seats.ok_or(PricingError::MissingSeats)?;
            let per_seat = tiers
                .iter()
                .find(|tier| tier.contains(seats))
                .map(|tier| Decimal::from(tier.price_per_seat))
                .ok_or(PricingError::NoSeatTier(seats))?;
            (Decimal::from(seats), per_seat, prorated, None)
        }
    };

    let amount = compute_amount(
        &price.spec,
        &PricingInput {
            quantity,
            proration_factor: factor,
            custom_amount: subscription_price.custom_amount,
        },
    )?;

    Ok(Some(LineQuote {
        product_price_id: price.id,
        window,
        quantity,
        unit_amount,
        proration_factor: factor,
        cap_amount,
        amount,
        currency: price.currency.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProductPrice, SeatTier};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn metered(unit_amount: Decimal, included: Decimal, cap: Option<i64>) -> PriceSpec {
        PriceSpec::MeteredUnit {
            meter_id: Uuid::nil(),
            unit_amount,
            included_units: included,
            cap_amount: cap,
        }
    }

    fn seats() -> PriceSpec {
        PriceSpec::SeatTiered {
            tiers: vec![
                SeatTier {
                    min_seats: 1,
                    max_seats: Some(5),
                    price_per_seat: 1000,
                },
                SeatTier {
                    min_seats: 6,
                    max_seats: None,
                    price_per_seat: 800,
                },
            ],
        }
    }

    #[test]
    fn metered_rounding_at_the_half_cent() {
        let spec = metered(dec!(100), Decimal::ZERO, None);
        let amount = |q| compute_amount(&spec, &PricingInput::new(q, Decimal::ONE)).unwrap();
        assert_eq!(amount(dec!(1.995)), 200);
        assert_eq!(amount(dec!(1.994)), 199);
        assert_eq!(amount(dec!(1.996)), 200);
    }

    #[test]
    fn metered_subtracts_included_units_and_caps() {
        let spec = metered(dec!(50), dec!(100), None);
        let input = PricingInput::new(dec!(250), Decimal::ONE);
        assert_eq!(compute_amount(&spec, &input).unwrap(), 7500);

        let under = PricingInput::new(dec!(40), Decimal::ONE);
        assert_eq!(compute_amount(&spec, &under).unwrap(), 0);

        let capped = metered(dec!(50), dec!(100), Some(5000));
        assert_eq!(compute_amount(&capped, &input).unwrap(), 5000);
    }

    #[test]
    fn fixed_is_prorated() {
        let spec = PriceSpec::Fixed { price_amount: 999 };
        let input = PricingInput::new(Decimal::ONE, dec!(0.5));
        // 499.5 rounds up
        assert_eq!(compute_amount(&spec, &input).unwrap(), 500);
    }

    #[test]
    fn custom_amount_is_clamped() {
        let spec = PriceSpec::Custom {
            minimum_amount: Some(500),
            maximum_amount: Some(10_000),
            preset_amount: None,
        };
        let mut input = PricingInput::new(Decimal::ONE, Decimal::ONE);
        input.custom_amount = Some(100);
        assert_eq!(compute_amount(&spec, &input).unwrap(), 500);
        input.custom_amount = Some(20_000);
        assert_eq!(compute_amount(&spec, &input).unwrap(), 10_000);
        input.custom_amount = None;
        assert!(matches!(
            compute_amount(&spec, &input),
            Err(PricingError::MissingCustomAmount)
        ));
    }

    #[test]
    fn seat_tiers_pick_the_matching_tier() {
        let spec = seats();
        let three = PricingInput::new(dec!(3), Decimal::ONE);
        assert_eq!(compute_amount(&spec, &three).unwrap(), 3000);
        let ten = PricingInput::new(dec!(10), Decimal::ONE);
        assert_eq!(compute_amount(&spec, &ten).unwrap(), 8000);
        let none = PricingInput::new(Decimal::ZERO, Decimal::ONE);
        assert!(matches!(
            compute_amount(&spec, &none),
            Err(PricingError::NoSeatTier(0))
        ));
    }

    #[test]
    fn free_is_zero() {
        let input = PricingInput::new(dec!(42), Decimal::ONE);
        assert_eq!(compute_amount(&PriceSpec::Free, &input).unwrap(), 0);
    }

    #[test]
    fn quote_prorates_a_mid_period_price() {
        let period = TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        );
        let mut price = SubscriptionPrice::new(ProductPrice {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            currency: "usd".into(),
            spec: PriceSpec::Fixed { price_amount: 3000 },
        });
        price.effective_from = Some(Utc.with_ymd_and_hms(2024, 4, 16, 0, 0, 0).unwrap());

        let quote = quote_line(&price, &period, Decimal::ZERO).unwrap().unwrap();
        assert_eq!(quote.proration_factor, dec!(0.5));
        assert_eq!(quote.amount, 1500);
        assert_eq!(quote.window.start, price.effective_from.unwrap());

        price.effective_from = Some(period.end);
        assert!(quote_line(&price, &period, Decimal::ZERO).unwrap().is_none());
    }
}
