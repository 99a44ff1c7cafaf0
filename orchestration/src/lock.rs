//! Registration-level mutual exclusion.
//!
//! A lock is an owner + expiry record keyed by registration (provider
//! session × child). It is taken before `reserve` and released after
//! finalize or on a terminal failure; a crashed run's lock simply lapses.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::store::{StoreError, StoreResult};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Registration {key} is held by {owner} until {expires_at}")]
    Held {
        key: String,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Lock for {key} is no longer held by this token")]
    NotHeld { key: String },

    #[error("Lock store error: {0}")]
    Store(#[from] StoreError),
}

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationLock {
    pub key: String,
    pub owner: String,
    /// Distinguishes successive holders with the same owner name
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RegistrationLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Store `lock` unless a different owner holds an unexpired lock on the
    /// same key, in which case that holder is returned and nothing changes.
    async fn try_insert(
        &self,
        lock: &RegistrationLock,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RegistrationLock>>;

    /// Remove the lock if `token` still matches. Returns whether it did.
    async fn remove(&self, key: &str, token: &str) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<RegistrationLock>>;
}

#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<String, RegistrationLock>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_insert(
        &self,
        lock: &RegistrationLock,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RegistrationLock>> {
        let mut locks = self.locks.lock().await;
        if let Some(existing) = locks.get(&lock.key) {
            if !existing.is_expired(now) && existing.owner != lock.owner {
                return Ok(Some(existing.clone()));
            }
        }
        locks.insert(lock.key.clone(), lock.clone());
        Ok(None)
    }

    async fn remove(&self, key: &str, token: &str) -> StoreResult<bool> {
        let mut locks = self.locks.lock().await;
        if locks.get(key).is_some_and(|l| l.token == token) {
            locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<RegistrationLock>> {
        Ok(self.locks.lock().await.get(key).cloned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_secs: 10 * 60 }
    }
}

pub struct RegistrationLockManager {
    store: Arc<dyn LockStore>,
    clock: SharedClock,
    ttl: Duration,
}

impl RegistrationLockManager {
    pub fn new(store: Arc<dyn LockStore>, clock: SharedClock, config: &LockConfig) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::seconds(config.ttl_secs as i64),
        }
    }

    /// Key for one child's registration in one provider session.
    pub fn registration_key(host: &str, candidate_id: &str, child_token: &str) -> String {
        format!("{host}/{candidate_id}/{child_token}")
    }

    /// Take (or refresh, for the same owner) the lock on `key`.
    pub async fn acquire(&self, key: &str, owner: &str) -> LockResult<RegistrationLock> {
        let now = self.clock.now();
        let lock = RegistrationLock {
            key: key.to_string(),
            owner: owner.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: now + self.ttl,
        };
        if let Some(holder) = self.store.try_insert(&lock, now).await? {
            debug!(key, owner, holder = %holder.owner, "Registration lock contended");
            return Err(LockError::Held {
                key: holder.key,
                owner: holder.owner,
                expires_at: holder.expires_at,
            });
        }
        info!(key, owner, expires_at = %lock.expires_at, "Registration lock acquired");
        Ok(lock)
    }

    pub async fn release(&self, lock: &RegistrationLock) -> LockResult<()> {
        if self.store.remove(&lock.key, &lock.token).await? {
            info!(key = %lock.key, owner = %lock.owner, "Registration lock released");
            Ok(())
        } else {
            Err(LockError::NotHeld {
                key: lock.key.clone(),
            })
        }
    }

    pub async fn holder(&self, key: &str) -> LockResult<Option<RegistrationLock>> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(key)
            .await?
            .filter(|lock| !lock.is_expired(now)))
    }
}
