//! Tax capability used when orders are created.

use crate::models::{Address, TaxCalculation};
use crate::pricing::tax_amount;
use async_trait::async_trait;
use service_core::error::AppError;
use std::collections::HashMap;

#[async_trait]
pub trait TaxCalculator: Send + Sync {
    async fn calculate_tax(
        &self,
        amount: i64,
        currency: &str,
        address: Option<&Address>,
        tax_ids: &[String],
    ) -> Result<TaxCalculation, AppError>;
}

/// Flat per-country rates in basis points.
///
/// Customers with a tax id are reverse-charged (rate 0).
#[derive(Debug, Clone, Default)]
pub struct StaticTaxCalculator {
    rates: HashMap<String, u32>,
}

impl StaticTaxCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, country: &str, rate_basis_points: u32) -> Self {
        self.rates
            .insert(country.to_ascii_uppercase(), rate_basis_points);
        self
    }
}

#[async_trait]
impl TaxCalculator for StaticTaxCalculator {
    async fn calculate_tax(
        &self,
        amount: i64,
        _currency: &str,
        address: Option<&Address>,
        tax_ids: &[String],
    ) -> Result<TaxCalculation, AppError> {
        let Some(address) = address else {
            return Ok(TaxCalculation::none());
        };
        if !tax_ids.is_empty() {
            return Ok(TaxCalculation {
                amount: 0,
                rate_basis_points: 0,
                reason: "reverse_charge".to_string(),
            });
        }
        let Some(&rate) = self.rates.get(&address.country.to_ascii_uppercase()) else {
            return Ok(TaxCalculation::none());
        };

        let amount = tax_amount(amount, rate)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Tax rounding failed: {}", e)))?;

        Ok(TaxCalculation {
            amount,
            rate_basis_points: rate,
            reason: "standard_rate".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(country: &str) -> Address {
        Address {
            country: country.to_string(),
            ..Address::default()
        }
    }

    #[tokio::test]
    async fn standard_rate_applies_by_country() {
        let calc = StaticTaxCalculator::new().with_rate("se", 2500);
        let tax = calc
            .calculate_tax(10_000, "sek", Some(&address("SE")), &[])
            .await
            .unwrap();
        assert_eq!(tax.amount, 2500);
        assert_eq!(tax.rate_basis_points, 2500);
    }

    #[tokio::test]
    async fn tax_id_is_reverse_charged() {
        let calc = StaticTaxCalculator::new().with_rate("DE", 1900);
        let tax = calc
            .calculate_tax(10_000, "eur", Some(&address("DE")), &["DE123".to_string()])
            .await
            .unwrap();
        assert_eq!(tax.amount, 0);
        assert_eq!(tax.reason, "reverse_charge");
    }
}
