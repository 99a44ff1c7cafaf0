//! Workflow snapshot persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::state::WorkflowSnapshot;
use crate::store::{StoreError, StoreResult};

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> StoreResult<()>;
    async fn load(&self, workflow_id: &str) -> StoreResult<Option<WorkflowSnapshot>>;
}

#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    snapshots: RwLock<HashMap<String, WorkflowSnapshot>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> StoreResult<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> StoreResult<Option<WorkflowSnapshot>> {
        Ok(self.snapshots.read().await.get(workflow_id).cloned())
    }
}

/// One pretty-printed JSON file per workflow under `dir`.
#[derive(Debug, Clone)]
pub struct JsonFileWorkflowStore {
    dir: PathBuf,
}

impl JsonFileWorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        let file: String = workflow_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

#[async_trait]
impl WorkflowStore for JsonFileWorkflowStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&snapshot.id);
        tokio::fs::write(&path, json).await?;
        debug!(path = %path.display(), "Workflow snapshot saved");
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> StoreResult<Option<WorkflowSnapshot>> {
        let path = self.path_for(workflow_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_str(&json)
            .map_err(|e| StoreError::Deserialization(format!("{}: {e}", path.display())))?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::{AssistanceKind, AssistancePriority, AssistanceRequest};
    use chrono::Utc;

    fn snapshot(id: &str) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: id.to_string(),
            requests: vec![AssistanceRequest::new(
                AssistanceKind::Captcha,
                "solve verification",
                AssistancePriority::High,
            )],
            started: true,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_json_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileWorkflowStore::new(dir.path().join("workflows"));

        assert!(store.load("wf-1").await.unwrap().is_none());
        let snap = snapshot("wf-1");
        store.save(&snap).await.unwrap();
        assert_eq!(store.load("wf-1").await.unwrap(), Some(snap));

        let raw = std::fs::read_to_string(dir.path().join("workflows/wf-1.json")).unwrap();
        assert!(raw.contains("\"kind\": \"captcha\""), "pretty JSON expected: {raw}");
    }

    #[tokio::test]
    async fn test_json_file_store_sanitizes_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileWorkflowStore::new(dir.path());
        store.save(&snapshot("../escape")).await.unwrap();
        assert!(dir.path().join("___escape.json").exists());
        assert!(store.load("../escape").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        let store = JsonFileWorkflowStore::new(dir.path());
        assert!(matches!(
            store.load("bad").await,
            Err(StoreError::Deserialization(_))
        ));
    }
}
