//! Assistance workflow engine: human-in-the-loop steps as a resumable queue.

pub mod engine;
pub mod sessions;
pub mod state;
pub mod store;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

pub use engine::AssistanceWorkflow;
pub use sessions::SessionWorkflows;
pub use state::{
    AssistanceKind, AssistancePriority, AssistanceRequest, AssistanceStatus, WorkflowEvent,
    WorkflowProgress, WorkflowSnapshot,
};
pub use store::{InMemoryWorkflowStore, JsonFileWorkflowStore, WorkflowStore};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid transition for request {request_id}: {from} -> {to}")]
    InvalidTransition {
        request_id: String,
        from: AssistanceStatus,
        to: AssistanceStatus,
    },

    #[error("Assistance request not found: {0}")]
    NotFound(String),

    #[error("Workflow store error: {0}")]
    Store(#[from] StoreError),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Pause between finishing one request and activating the next
    pub advance_delay_ms: u64,
    /// Snapshot directory for the file-backed store; in-memory when unset
    pub state_dir: Option<std::path::PathBuf>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            advance_delay_ms: 1_500,
            state_dir: None,
        }
    }
}
