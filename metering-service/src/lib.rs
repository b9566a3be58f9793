//! Metering Service - usage metering, billing ledger and billing-oracle
//! reconciliation.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metering;
pub mod models;
pub mod oracle;
pub mod pricing;
pub mod reconciler;
pub mod reporting;
pub mod services;
pub mod startup;
pub mod workers;

pub use api::MeteringApi;
pub use context::MeteringContext;
pub use error::{MeteringError, MeteringResult};
