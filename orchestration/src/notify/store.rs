//! Persistence for notification records, opt-outs and the escalation schedule.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::scheduler::ScheduledTask;
use super::types::{DeliveryMethod, NotificationRecord};
use crate::store::{StoreError, StoreResult};

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, record: &NotificationRecord) -> StoreResult<()>;

    /// Replace an existing record. Fails with `NotFound` for unknown ids.
    async fn update(&self, record: &NotificationRecord) -> StoreResult<()>;

    async fn get(&self, id: &str) -> StoreResult<Option<NotificationRecord>>;

    /// Up to `limit` of the user's records, newest first.
    async fn recent_for_user(&self, user_id: &str, limit: usize) -> StoreResult<Vec<NotificationRecord>>;

    async fn opt_outs(&self, user_id: &str) -> StoreResult<HashSet<DeliveryMethod>>;

    async fn save_schedule(&self, tasks: &[ScheduledTask]) -> StoreResult<()>;

    async fn load_schedule(&self) -> StoreResult<Vec<ScheduledTask>>;
}

#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    records: RwLock<HashMap<String, NotificationRecord>>,
    opt_outs: RwLock<HashMap<String, HashSet<DeliveryMethod>>>,
    schedule: RwLock<Vec<ScheduledTask>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_opt_outs(&self, user_id: impl Into<String>, methods: impl IntoIterator<Item = DeliveryMethod>) {
        self.opt_outs
            .write()
            .await
            .insert(user_id.into(), methods.into_iter().collect());
    }

    pub async fn all(&self) -> Vec<NotificationRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, record: &NotificationRecord) -> StoreResult<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &NotificationRecord) -> StoreResult<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id.clone())),
        }
    }

    async fn get(&self, id: &str) -> StoreResult<Option<NotificationRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn recent_for_user(&self, user_id: &str, limit: usize) -> StoreResult<Vec<NotificationRecord>> {
        let records = self.records.read().await;
        let mut mine: Vec<_> = records
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        mine.truncate(limit);
        Ok(mine)
    }

    async fn opt_outs(&self, user_id: &str) -> StoreResult<HashSet<DeliveryMethod>> {
        Ok(self
            .opt_outs
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_schedule(&self, tasks: &[ScheduledTask]) -> StoreResult<()> {
        *self.schedule.write().await = tasks.to_vec();
        Ok(())
    }

    async fn load_schedule(&self) -> StoreResult<Vec<ScheduledTask>> {
        Ok(self.schedule.read().await.clone())
    }
}
