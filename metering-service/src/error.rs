//! Error types for metering-service.

use crate::models::PeriodState;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the metering core.
#[derive(Debug, Error)]
pub enum MeteringError {
    /// A simulation input (event, meter, terms, order) could not be loaded or
    /// the scan would exceed its ceiling.
    #[error("Incomplete simulation input: {0}")]
    IncompleteSimulationInput(String),

    #[error("Pricing failed for price {price_id}: {reason}")]
    PricingFailure { price_id: Uuid, reason: String },

    #[error("Concurrent materialization conflict on subscription {subscription_id}: {reason}")]
    ConcurrentMaterializationConflict {
        subscription_id: Uuid,
        reason: String,
    },

    #[error("Billing period {period_id} is {actual}, expected {expected}")]
    InvalidTransition {
        period_id: Uuid,
        expected: PeriodState,
        actual: PeriodState,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl MeteringError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        MeteringError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn incomplete(reason: impl Into<String>) -> Self {
        MeteringError::IncompleteSimulationInput(reason.into())
    }

    pub fn pricing(price_id: Uuid, reason: impl Into<String>) -> Self {
        MeteringError::PricingFailure {
            price_id,
            reason: reason.into(),
        }
    }

    /// Label used for the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            MeteringError::IncompleteSimulationInput(_) => "incomplete_simulation_input",
            MeteringError::PricingFailure { .. } => "pricing_failure",
            MeteringError::ConcurrentMaterializationConflict { .. } => {
                "concurrent_materialization_conflict"
            }
            MeteringError::InvalidTransition { .. } => "invalid_transition",
            MeteringError::InvalidInput(_) => "invalid_input",
            MeteringError::NotFound { .. } => "not_found",
            MeteringError::Storage(_) => "storage",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeteringError::ConcurrentMaterializationConflict { .. }
                | MeteringError::Storage(AppError::DatabaseError(_))
                | MeteringError::Storage(AppError::RedisError(_))
                | MeteringError::Storage(AppError::ServiceUnavailable)
        )
    }
}

impl From<MeteringError> for AppError {
    fn from(err: MeteringError) -> Self {
        match err {
            MeteringError::Storage(inner) => inner,
            MeteringError::NotFound { .. } => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            MeteringError::InvalidInput(_) => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            MeteringError::ConcurrentMaterializationConflict { .. }
            | MeteringError::InvalidTransition { .. } => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            other => AppError::InternalError(anyhow::anyhow!(other.to_string())),
        }
    }
}

/// Lease lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out waiting for lock {key}")]
    Timeout { key: String },

    #[error("Lock {key} expired or was taken over")]
    Expired { key: String },

    #[error(transparent)]
    Backend(#[from] AppError),
}

pub type MeteringResult<T> = Result<T, MeteringError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_transient() {
        let err = MeteringError::ConcurrentMaterializationConflict {
            subscription_id: Uuid::nil(),
            reason: "lease lost".into(),
        };
        assert!(err.is_transient());
        assert!(!MeteringError::incomplete("missing meter").is_transient());
    }

    #[test]
    fn not_found_maps_to_app_not_found() {
        let app: AppError = MeteringError::not_found("order", Uuid::nil()).into();
        assert!(matches!(app, AppError::NotFound(_)));
    }
}
