//! Per-subscription lease locks.

use crate::error::LockError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A held lease. Dropping it does not release the lock; call
/// [`LockManager::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
}

impl Lease {
    pub fn subscription_key(subscription_id: Uuid) -> String {
        format!("metering:lease:subscription:{}", subscription_id)
    }
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Take the lock if it is free or expired.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Release the lock if `token` still holds it.
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;

    async fn is_held(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// Poll until the lock is taken or `wait` runs out.
    async fn acquire(&self, key: &str, ttl: Duration, wait: Duration) -> Result<Lease, LockError> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;
        loop {
            if self.try_acquire(key, &token, ttl).await? {
                return Ok(Lease {
                    key: key.to_string(),
                    token,
                });
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Fail with [`LockError::Expired`] when the lease was lost.
    async fn ensure_held(&self, lease: &Lease) -> Result<(), LockError> {
        if self.is_held(&lease.key, &lease.token).await? {
            Ok(())
        } else {
            Err(LockError::Expired {
                key: lease.key.clone(),
            })
        }
    }
}

/// Process-local leases.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    leases: DashMap<String, (String, Instant)>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().1 <= now {
                    held.insert((token.to_string(), now + ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(free) => {
                free.insert((token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        Ok(self
            .leases
            .remove_if(key, |_, (holder, _)| holder == token)
            .is_some())
    }

    async fn is_held(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        Ok(self
            .leases
            .get(key)
            .is_some_and(|held| held.0 == token && held.1 > now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out() {
        let locks = InMemoryLockManager::new();
        let lease = locks
            .acquire("k", Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap();

        let err = locks
            .acquire("k", Duration::from_secs(30), Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        assert!(locks.release(&lease.key, &lease.token).await.unwrap());
        assert!(locks
            .acquire("k", Duration::from_secs(30), Duration::ZERO)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn expired_lease_is_lost() {
        let locks = InMemoryLockManager::new();
        let lease = locks
            .acquire("k", Duration::from_millis(10), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let thief = locks
            .acquire("k", Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(
            locks.ensure_held(&lease).await,
            Err(LockError::Expired { .. })
        ));
        assert!(!locks.release(&lease.key, &lease.token).await.unwrap());
        assert!(locks.ensure_held(&thief).await.is_ok());
    }
}
