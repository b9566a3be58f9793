//! Explicit dependency bundle handed to every metering component.

use crate::config::{MeteringConfig, MeteringSettings, StorageBackend};
use crate::ledger::{InMemoryLockManager, LockManager, RedisLockManager};
use crate::services::{
    CheckpointRepository, CreditRepository, Database, EventRepository, InMemoryStore,
    LedgerRepository, MeterRepository, OrderRepository, StaticTaxCalculator,
    SubscriptionRepository, TaxCalculator,
};
use service_core::error::AppError;
use std::sync::Arc;

#[derive(Clone)]
pub struct MeteringContext {
    pub events: Arc<dyn EventRepository>,
    pub meters: Arc<dyn MeterRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub credits: Arc<dyn CreditRepository>,
    pub ledger: Arc<dyn LedgerRepository>,
    pub orders: Arc<dyn OrderRepository>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub locks: Arc<dyn LockManager>,
    pub tax: Arc<dyn TaxCalculator>,
    pub settings: MeteringSettings,
}

/// Storage handle kept alongside the context for readiness checks.
#[derive(Clone)]
pub enum StorageHandle {
    Postgres(Arc<Database>),
    Memory(Arc<InMemoryStore>),
}

impl StorageHandle {
    pub async fn health_check(&self) -> Result<(), AppError> {
        match self {
            StorageHandle::Postgres(db) => db.health_check().await,
            StorageHandle::Memory(_) => Ok(()),
        }
    }
}

impl MeteringContext {
    /// Context whose repositories all live in `store`.
    pub fn from_store<S>(store: Arc<S>, locks: Arc<dyn LockManager>, settings: MeteringSettings) -> Self
    where
        S: EventRepository
            + MeterRepository
            + SubscriptionRepository
            + CreditRepository
            + LedgerRepository
            + OrderRepository
            + CheckpointRepository
            + 'static,
    {
        Self {
            events: store.clone(),
            meters: store.clone(),
            subscriptions: store.clone(),
            credits: store.clone(),
            ledger: store.clone(),
            orders: store.clone(),
            checkpoints: store,
            locks,
            tax: Arc::new(StaticTaxCalculator::new()),
            settings,
        }
    }

    /// Fully in-process context with default settings.
    pub fn in_memory() -> (Self, Arc<InMemoryStore>) {
        Self::in_memory_with(MeteringSettings::default())
    }

    pub fn in_memory_with(settings: MeteringSettings) -> (Self, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let ctx = Self::from_store(store.clone(), Arc::new(InMemoryLockManager::new()), settings);
        (ctx, store)
    }

    pub fn with_tax_calculator(mut self, tax: Arc<dyn TaxCalculator>) -> Self {
        self.tax = tax;
        self
    }

    /// Build the context described by `config`.
    pub async fn build(config: &MeteringConfig, run_migrations: bool) -> Result<(Self, StorageHandle), AppError> {
        let locks: Arc<dyn LockManager> = match &config.redis {
            Some(redis) => Arc::new(RedisLockManager::new(redis).await?),
            None => {
                tracing::warn!("REDIS_URL not set, using process-local lease locks");
                Arc::new(InMemoryLockManager::new())
            }
        };

        match config.storage {
            StorageBackend::Postgres => {
                let db = Database::new(
                    &config.database.url,
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await?;
                if run_migrations {
                    db.run_migrations().await?;
                }
                let db = Arc::new(db);
                let ctx = Self::from_store(db.clone(), locks, config.metering.clone());
                Ok((ctx, StorageHandle::Postgres(db)))
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; data is lost on restart");
                let store = Arc::new(InMemoryStore::new());
                let ctx = Self::from_store(store.clone(), locks, config.metering.clone());
                Ok((ctx, StorageHandle::Memory(store)))
            }
        }
    }
}
