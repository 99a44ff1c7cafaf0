//! The assistance workflow: a queue of human-help requests driven one at a
//! time.
//!
//! At most one request is `Active` (or `Paused`) at any moment. Completing
//! the active request schedules the next `Queued` one after `advance_delay`;
//! failures never auto-advance. Every mutation is persisted before it is
//! broadcast, so a restarted process can [`AssistanceWorkflow::restore`]
//! exactly where it left off.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::state::{
    is_legal_transition, AssistanceRequest, AssistanceStatus, WorkflowEvent, WorkflowProgress,
    WorkflowSnapshot,
};
use super::store::WorkflowStore;
use super::{WorkflowConfig, WorkflowError, WorkflowResult};
use crate::clock::SharedClock;

const CHANNEL_CAPACITY: usize = 256;

struct WorkflowState {
    requests: Vec<AssistanceRequest>,
    started: bool,
}

impl WorkflowState {
    fn index_of(&self, request_id: &str) -> WorkflowResult<usize> {
        self.requests
            .iter()
            .position(|r| r.id == request_id)
            .ok_or_else(|| WorkflowError::NotFound(request_id.to_string()))
    }

    fn has_current(&self) -> bool {
        self.requests
            .iter()
            .any(|r| matches!(r.status, AssistanceStatus::Active | AssistanceStatus::Paused))
    }

    fn has_queued(&self) -> bool {
        self.requests
            .iter()
            .any(|r| r.status == AssistanceStatus::Queued)
    }

    fn transition(&mut self, idx: usize, to: AssistanceStatus) -> WorkflowResult<()> {
        let request = &mut self.requests[idx];
        if !is_legal_transition(request.status, to) {
            return Err(WorkflowError::InvalidTransition {
                request_id: request.id.clone(),
                from: request.status,
                to,
            });
        }
        debug!(request_id = %request.id, from = %request.status, to = %to, "Assistance transition");
        request.status = to;
        Ok(())
    }
}

struct Inner {
    id: String,
    state: Mutex<WorkflowState>,
    store: Arc<dyn WorkflowStore>,
    clock: SharedClock,
    events: broadcast::Sender<WorkflowEvent>,
    advance_delay: Duration,
}

/// Cheaply cloneable handle to one workflow.
#[derive(Clone)]
pub struct AssistanceWorkflow {
    inner: Arc<Inner>,
}

impl AssistanceWorkflow {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn WorkflowStore>,
        clock: SharedClock,
        config: &WorkflowConfig,
    ) -> Self {
        Self::from_parts(id.into(), Vec::new(), false, store, clock, config)
    }

    /// Rebuild a workflow from a persisted snapshot.
    ///
    /// A snapshot taken between completing one request and activating the
    /// next resumes the pending advance, so this must run inside a Tokio
    /// runtime.
    pub fn restore(
        snapshot: WorkflowSnapshot,
        store: Arc<dyn WorkflowStore>,
        clock: SharedClock,
        config: &WorkflowConfig,
    ) -> Self {
        let pending_advance = snapshot.started
            && !snapshot
                .requests
                .iter()
                .any(|r| matches!(r.status, AssistanceStatus::Active | AssistanceStatus::Paused))
            && snapshot
                .requests
                .iter()
                .any(|r| r.status == AssistanceStatus::Queued);

        info!(
            workflow_id = %snapshot.id,
            requests = snapshot.requests.len(),
            pending_advance,
            "Restoring assistance workflow"
        );
        let workflow = Self::from_parts(
            snapshot.id,
            snapshot.requests,
            snapshot.started,
            store,
            clock,
            config,
        );
        if pending_advance {
            workflow.schedule_advance();
        }
        workflow
    }

    /// Load and restore `workflow_id`, if the store has it.
    pub async fn load(
        workflow_id: &str,
        store: Arc<dyn WorkflowStore>,
        clock: SharedClock,
        config: &WorkflowConfig,
    ) -> WorkflowResult<Option<Self>> {
        Ok(store
            .load(workflow_id)
            .await?
            .map(|snapshot| Self::restore(snapshot, Arc::clone(&store), clock, config)))
    }

    fn from_parts(
        id: String,
        requests: Vec<AssistanceRequest>,
        started: bool,
        store: Arc<dyn WorkflowStore>,
        clock: SharedClock,
        config: &WorkflowConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(WorkflowState { requests, started }),
                store,
                clock,
                events,
                advance_delay: Duration::from_millis(config.advance_delay_ms),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: WorkflowEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    async fn persist(&self, state: &WorkflowState) -> WorkflowResult<()> {
        let snapshot = WorkflowSnapshot {
            id: self.inner.id.clone(),
            requests: state.requests.clone(),
            started: state.started,
            updated_at: self.inner.clock.now(),
        };
        self.inner.store.save(&snapshot).await?;
        Ok(())
    }

    /// Append a request. It is stamped `Queued` with the current time.
    pub async fn enqueue(&self, mut request: AssistanceRequest) -> WorkflowResult<AssistanceRequest> {
        request.status = AssistanceStatus::Queued;
        request.created_at = self.inner.clock.now();

        let mut state = self.inner.state.lock().await;
        state.requests.push(request.clone());
        self.persist(&state).await?;
        drop(state);

        info!(workflow_id = %self.inner.id, request_id = %request.id, kind = %request.kind, "Assistance request queued");
        self.emit(WorkflowEvent::RequestQueued {
            request_id: request.id.clone(),
            kind: request.kind,
        });
        Ok(request)
    }

    /// Activate the first queued request. Returns the request that is now
    /// current, or `None` when nothing is queued.
    pub async fn start(&self) -> WorkflowResult<Option<AssistanceRequest>> {
        let mut state = self.inner.state.lock().await;
        state.started = true;
        if let Some(current) = state
            .requests
            .iter()
            .find(|r| matches!(r.status, AssistanceStatus::Active | AssistanceStatus::Paused))
        {
            return Ok(Some(current.clone()));
        }
        let activated = self.activate_next_locked(&mut state).await?;
        drop(state);

        if let Some(request) = &activated {
            self.emit(WorkflowEvent::RequestActivated {
                request_id: request.id.clone(),
            });
        }
        Ok(activated)
    }

    async fn activate_next_locked(
        &self,
        state: &mut WorkflowState,
    ) -> WorkflowResult<Option<AssistanceRequest>> {
        let Some(idx) = state
            .requests
            .iter()
            .position(|r| r.status == AssistanceStatus::Queued)
        else {
            self.persist(state).await?;
            return Ok(None);
        };
        state.transition(idx, AssistanceStatus::Active)?;
        self.persist(state).await?;
        Ok(Some(state.requests[idx].clone()))
    }

    /// Activate the next queued request after `advance_delay`.
    fn schedule_advance(&self) {
        let workflow = self.clone();
        let delay = self.inner.advance_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = workflow.inner.state.lock().await;
            if state.has_current() {
                return;
            }
            let activated = workflow.activate_next_locked(&mut state).await;
            drop(state);
            match activated {
                Ok(Some(request)) => workflow.emit(WorkflowEvent::RequestActivated {
                    request_id: request.id,
                }),
                Ok(None) => {}
                Err(e) => warn!(workflow_id = %workflow.inner.id, error = %e, "Auto-advance failed"),
            }
        });
    }

    /// Record the parent's answer for the active request.
    pub async fn complete(
        &self,
        request_id: &str,
        response: serde_json::Value,
    ) -> WorkflowResult<AssistanceRequest> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;
        let idx = state.index_of(request_id)?;
        state.transition(idx, AssistanceStatus::Completed)?;
        {
            let request = &mut state.requests[idx];
            request.parent_response = Some(response);
            request.completed_at = Some(now);
            request.actual_duration = Some((now - request.created_at).to_std().unwrap_or_default());
        }
        self.persist(&state).await?;
        let completed = state.requests[idx].clone();
        let more_queued = state.has_queued();
        drop(state);

        info!(workflow_id = %self.inner.id, request_id, "Assistance request completed");
        self.emit(WorkflowEvent::RequestCompleted {
            request_id: request_id.to_string(),
        });
        if more_queued {
            self.schedule_advance();
        } else {
            info!(workflow_id = %self.inner.id, "Assistance workflow complete");
            self.emit(WorkflowEvent::WorkflowCompleted {
                workflow_id: self.inner.id.clone(),
            });
        }
        Ok(completed)
    }

    /// Mark the active request failed. The workflow does not move on by itself.
    pub async fn fail(&self, request_id: &str, reason: impl Into<String>) -> WorkflowResult<AssistanceRequest> {
        let reason = reason.into();
        let mut state = self.inner.state.lock().await;
        let idx = state.index_of(request_id)?;
        state.transition(idx, AssistanceStatus::Failed)?;
        state.requests[idx].failure_reason = Some(reason.clone());
        self.persist(&state).await?;
        let failed = state.requests[idx].clone();
        drop(state);

        warn!(workflow_id = %self.inner.id, request_id, %reason, "Assistance request failed");
        self.emit(WorkflowEvent::RequestFailed {
            request_id: request_id.to_string(),
            reason,
        });
        Ok(failed)
    }

    /// Send a failed request back to the queue; it restarts after `advance_delay`.
    pub async fn retry(&self, request_id: &str) -> WorkflowResult<AssistanceRequest> {
        let mut state = self.inner.state.lock().await;
        let idx = state.index_of(request_id)?;
        state.transition(idx, AssistanceStatus::Queued)?;
        {
            let request = &mut state.requests[idx];
            request.parent_response = None;
            request.failure_reason = None;
        }
        self.persist(&state).await?;
        let queued = state.requests[idx].clone();
        drop(state);

        info!(workflow_id = %self.inner.id, request_id, "Assistance request retried");
        self.emit(WorkflowEvent::RequestQueued {
            request_id: queued.id.clone(),
            kind: queued.kind,
        });
        self.schedule_advance();
        Ok(queued)
    }

    /// Pause the active request. No-op when nothing is active.
    pub async fn pause(&self) -> WorkflowResult<Option<AssistanceRequest>> {
        self.swap_current(AssistanceStatus::Active, AssistanceStatus::Paused)
            .await
    }

    /// Reactivate the paused request. No-op when nothing is paused.
    pub async fn resume(&self) -> WorkflowResult<Option<AssistanceRequest>> {
        self.swap_current(AssistanceStatus::Paused, AssistanceStatus::Active)
            .await
    }

    async fn swap_current(
        &self,
        from: AssistanceStatus,
        to: AssistanceStatus,
    ) -> WorkflowResult<Option<AssistanceRequest>> {
        let mut state = self.inner.state.lock().await;
        let Some(idx) = state.requests.iter().position(|r| r.status == from) else {
            return Ok(None);
        };
        state.transition(idx, to)?;
        self.persist(&state).await?;
        let request = state.requests[idx].clone();
        drop(state);

        let request_id = request.id.clone();
        self.emit(match to {
            AssistanceStatus::Paused => WorkflowEvent::RequestPaused { request_id },
            _ => WorkflowEvent::RequestResumed { request_id },
        });
        Ok(Some(request))
    }

    pub async fn progress(&self) -> WorkflowProgress {
        WorkflowProgress::compute(&self.inner.state.lock().await.requests)
    }

    pub async fn snapshot(&self) -> WorkflowSnapshot {
        let state = self.inner.state.lock().await;
        WorkflowSnapshot {
            id: self.inner.id.clone(),
            requests: state.requests.clone(),
            started: state.started,
            updated_at: self.inner.clock.now(),
        }
    }

    pub async fn get(&self, request_id: &str) -> Option<AssistanceRequest> {
        self.inner
            .state
            .lock()
            .await
            .requests
            .iter()
            .find(|r| r.id == request_id)
            .cloned()
    }

    /// Unresolved request blocking the provider run `session_id`, if any.
    pub async fn unresolved_for_session(&self, session_id: &str) -> Option<AssistanceRequest> {
        self.inner
            .state
            .lock()
            .await
            .requests
            .iter()
            .find(|r| r.is_unresolved() && r.session_id.as_deref() == Some(session_id))
            .cloned()
    }

    /// Latest completed request for `session_id`.
    pub async fn completed_for_session(&self, session_id: &str) -> Option<AssistanceRequest> {
        self.inner
            .state
            .lock()
            .await
            .requests
            .iter()
            .rev()
            .find(|r| {
                r.status == AssistanceStatus::Completed && r.session_id.as_deref() == Some(session_id)
            })
            .cloned()
    }
}
