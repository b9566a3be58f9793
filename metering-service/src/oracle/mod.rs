//! Billing oracle: an independent recomputation of what an order should be.

mod simulator;
mod usage;

pub use simulator::BillingOracle;
pub use usage::UsageBreakdown;
