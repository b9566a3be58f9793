//! Storage adapters, metrics and the tax capability.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod repository;
pub mod tax;

pub use database::Database;
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use repository::{
    CheckpointRepository, CreditRepository, EventCursor, EventRepository, EventScan,
    LedgerRepository, MeterRepository, OrderRepository, SubscriptionRepository, SweepCheckpoint,
    UsageInsert,
};
pub use tax::{StaticTaxCalculator, TaxCalculator};
