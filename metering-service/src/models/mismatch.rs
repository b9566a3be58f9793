//! Reconciliation output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchClassification {
    AmountMismatch,
    MissingLineItem,
    ExtraLineItem,
    QuantityMismatch,
    CurrencyMismatch,
    TaxMismatch,
    DiscountMismatch,
    TimingDrift,
}

impl MismatchClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AmountMismatch => "amount_mismatch",
            Self::MissingLineItem => "missing_line_item",
            Self::ExtraLineItem => "extra_line_item",
            Self::QuantityMismatch => "quantity_mismatch",
            Self::CurrencyMismatch => "currency_mismatch",
            Self::TaxMismatch => "tax_mismatch",
            Self::DiscountMismatch => "discount_mismatch",
            Self::TimingDrift => "timing_drift",
        }
    }

    /// Default severity when no special rule applies.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::AmountMismatch
            | Self::MissingLineItem
            | Self::ExtraLineItem
            | Self::QuantityMismatch
            | Self::CurrencyMismatch
            | Self::TaxMismatch => Severity::Critical,
            Self::DiscountMismatch => Severity::Warning,
            Self::TimingDrift => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// One detected discrepancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleMismatch {
    pub classification: MismatchClassification,
    pub severity: Severity,
    pub expected_value: Option<String>,
    pub actual_value: Option<String>,
    /// What the mismatch is about, e.g. `order_item:<id>` or `order:<id>.tax`.
    pub entity_reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub order_id: Option<Uuid>,
    pub subscription_id: Uuid,
    pub mismatches: Vec<OracleMismatch>,
    pub is_consistent: bool,
    pub reconciled_at: DateTime<Utc>,
}

impl ReconciliationResult {
    pub fn new(order_id: Option<Uuid>, subscription_id: Uuid, mismatches: Vec<OracleMismatch>) -> Self {
        let is_consistent = mismatches
            .iter()
            .all(|m| m.severity == Severity::Info);
        Self {
            order_id,
            subscription_id,
            mismatches,
            is_consistent,
            reconciled_at: Utc::now(),
        }
    }

    pub fn count(&self, classification: MismatchClassification) -> usize {
        self.mismatches
            .iter()
            .filter(|m| m.classification == classification)
            .count()
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.mismatches.iter().map(|m| m.severity).max()
    }
}
