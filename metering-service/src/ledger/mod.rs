//! Billing entry ledger and its per-subscription leases.

mod lock;
mod redis_lock;
mod service;

pub use lock::{InMemoryLockManager, Lease, LockManager};
pub use redis_lock::RedisLockManager;
pub use service::{LedgerService, TickReport};
