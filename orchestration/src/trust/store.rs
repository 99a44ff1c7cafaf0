//! Persistence for per-hostname trust records.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::TrustRecord;
use crate::store::StoreResult;

#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn load(&self, host: &str) -> StoreResult<Option<TrustRecord>>;
    async fn save(&self, record: &TrustRecord) -> StoreResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryTrustStore {
    records: RwLock<HashMap<String, TrustRecord>>,
}

impl InMemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl TrustStore for InMemoryTrustStore {
    async fn load(&self, host: &str) -> StoreResult<Option<TrustRecord>> {
        Ok(self.records.read().await.get(host).cloned())
    }

    async fn save(&self, record: &TrustRecord) -> StoreResult<()> {
        self.records
            .write()
            .await
            .insert(record.host.clone(), record.clone());
        Ok(())
    }
}
