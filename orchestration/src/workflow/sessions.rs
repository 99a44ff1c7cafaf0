//! One assistance workflow per provider run.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::engine::AssistanceWorkflow;
use super::store::WorkflowStore;
use super::{WorkflowConfig, WorkflowResult};
use crate::clock::SharedClock;

/// Hands out the workflow for a session, creating it on first use or
/// restoring it from the store when a snapshot already exists.
pub struct SessionWorkflows {
    store: Arc<dyn WorkflowStore>,
    clock: SharedClock,
    config: WorkflowConfig,
    workflows: Mutex<HashMap<String, AssistanceWorkflow>>,
}

impl SessionWorkflows {
    pub fn new(store: Arc<dyn WorkflowStore>, clock: SharedClock, config: &WorkflowConfig) -> Self {
        Self {
            store,
            clock,
            config: config.clone(),
            workflows: Mutex::new(HashMap::new()),
        }
    }

    /// Store key of the workflow backing `session_id`.
    pub fn workflow_id(session_id: &str) -> String {
        format!("assistance-{session_id}")
    }

    pub async fn for_session(&self, session_id: &str) -> WorkflowResult<AssistanceWorkflow> {
        let mut workflows = self.workflows.lock().await;
        if let Some(workflow) = workflows.get(session_id) {
            return Ok(workflow.clone());
        }

        let id = Self::workflow_id(session_id);
        let workflow = match AssistanceWorkflow::load(&id, Arc::clone(&self.store), self.clock.clone(), &self.config)
            .await?
        {
            Some(workflow) => workflow,
            None => {
                debug!(session_id, workflow_id = %id, "New assistance workflow");
                AssistanceWorkflow::new(id, Arc::clone(&self.store), self.clock.clone(), &self.config)
            }
        };
        workflows.insert(session_id.to_string(), workflow.clone());
        Ok(workflow)
    }
}
