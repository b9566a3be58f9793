//! Order reconciliation runs and nightly sweeps.

mod sweep;

pub use sweep::{ReconciliationService, SweepFailure, SweepReport};
