//! Assistance request model and the legal status transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the parent is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistanceKind {
    AccountCreation,
    Captcha,
    Payment,
    FormCompletion,
}

impl AssistanceKind {
    /// Typical time a parent needs for this kind of step.
    pub fn default_estimate(self) -> Duration {
        match self {
            Self::Captcha => Duration::from_secs(2 * 60),
            Self::Payment => Duration::from_secs(3 * 60),
            Self::AccountCreation => Duration::from_secs(5 * 60),
            Self::FormCompletion => Duration::from_secs(10 * 60),
        }
    }
}

impl std::fmt::Display for AssistanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccountCreation => write!(f, "account_creation"),
            Self::Captcha => write!(f, "captcha"),
            Self::Payment => write!(f, "payment"),
            Self::FormCompletion => write!(f, "form_completion"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistanceStatus {
    Queued,
    Active,
    Completed,
    Failed,
    Paused,
}

impl AssistanceStatus {
    /// No further progress without an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for AssistanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistancePriority {
    Low,
    Medium,
    High,
}

/// One unit of human help inside a workflow. Never deleted, only moved to
/// a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistanceRequest {
    pub id: String,
    pub kind: AssistanceKind,
    /// Free-form step label shown to the parent ("solve verification")
    pub stage: String,
    pub status: AssistanceStatus,
    pub priority: AssistancePriority,
    #[serde(default)]
    pub context: serde_json::Value,
    pub estimated_duration: Duration,
    #[serde(default)]
    pub actual_duration: Option<Duration>,
    #[serde(default)]
    pub parent_response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Provider run this request unblocks
    #[serde(default)]
    pub session_id: Option<String>,
}

impl AssistanceRequest {
    pub fn new(kind: AssistanceKind, stage: impl Into<String>, priority: AssistancePriority) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            stage: stage.into(),
            status: AssistanceStatus::Queued,
            priority,
            context: serde_json::Value::Null,
            estimated_duration: kind.default_estimate(),
            actual_duration: None,
            parent_response: None,
            created_at: Utc::now(),
            completed_at: None,
            failure_reason: None,
            session_id: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration = estimate;
        self
    }

    pub fn is_unresolved(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Transition table for [`AssistanceStatus`].
pub(crate) fn is_legal_transition(from: AssistanceStatus, to: AssistanceStatus) -> bool {
    use AssistanceStatus::*;

    matches!(
        (from, to),
        (Queued, Active)
            | (Active, Completed)
            | (Active, Failed)
            | (Active, Paused)
            | (Paused, Active)
            // retry
            | (Failed, Queued)
    )
}

/// Persisted form of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub requests: Vec<AssistanceRequest>,
    pub started: bool,
    pub updated_at: DateTime<Utc>,
}

/// Derived view of how far along a workflow is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    /// 0.0 – 100.0
    pub percent_complete: f64,
    pub completed: usize,
    pub total: usize,
    /// Index of the active (or paused) request
    pub current_index: Option<usize>,
    pub estimated_remaining: Duration,
}

impl WorkflowProgress {
    pub fn compute(requests: &[AssistanceRequest]) -> Self {
        let total = requests.len();
        let completed = requests
            .iter()
            .filter(|r| r.status == AssistanceStatus::Completed)
            .count();
        let current_index = requests
            .iter()
            .position(|r| matches!(r.status, AssistanceStatus::Active | AssistanceStatus::Paused));

        let estimated_remaining = match current_index {
            Some(idx) => requests[idx + 1..]
                .iter()
                .map(|r| r.estimated_duration)
                .sum(),
            None => requests
                .iter()
                .filter(|r| r.status == AssistanceStatus::Queued)
                .map(|r| r.estimated_duration)
                .sum(),
        };

        let percent_complete = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64 * 100.0
        };

        Self {
            percent_complete,
            completed,
            total,
            current_index,
            estimated_remaining,
        }
    }
}

/// Broadcast on every workflow mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RequestQueued { request_id: String, kind: AssistanceKind },
    RequestActivated { request_id: String },
    RequestCompleted { request_id: String },
    RequestFailed { request_id: String, reason: String },
    RequestPaused { request_id: String },
    RequestResumed { request_id: String },
    WorkflowCompleted { workflow_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use AssistanceStatus::*;

    fn req(status: AssistanceStatus, minutes: u64) -> AssistanceRequest {
        let mut r = AssistanceRequest::new(AssistanceKind::FormCompletion, "step", AssistancePriority::Medium)
            .with_estimate(Duration::from_secs(minutes * 60));
        r.status = status;
        r
    }

    #[test]
    fn test_transition_table() {
        assert!(is_legal_transition(Queued, Active));
        assert!(is_legal_transition(Active, Completed));
        assert!(is_legal_transition(Active, Failed));
        assert!(is_legal_transition(Failed, Queued));

        // only the active request can fail
        assert!(!is_legal_transition(Queued, Failed));
        assert!(!is_legal_transition(Paused, Failed));
        assert!(!is_legal_transition(Queued, Completed));
        assert!(!is_legal_transition(Completed, Queued));
        assert!(!is_legal_transition(Completed, Failed));
        assert!(!is_legal_transition(Paused, Completed));
    }

    #[test]
    fn test_progress_sums_after_current() {
        let requests = vec![req(Completed, 1), req(Active, 2), req(Queued, 3), req(Queued, 4)];
        let p = WorkflowProgress::compute(&requests);
        assert_eq!(p.completed, 1);
        assert_eq!(p.total, 4);
        assert_eq!(p.percent_complete, 25.0);
        assert_eq!(p.current_index, Some(1));
        assert_eq!(p.estimated_remaining, Duration::from_secs(7 * 60));
    }

    #[test]
    fn test_progress_without_active_request() {
        let p = WorkflowProgress::compute(&[]);
        assert_eq!(p.percent_complete, 0.0);
        assert_eq!(p.current_index, None);

        let p = WorkflowProgress::compute(&[req(Completed, 1), req(Queued, 5)]);
        assert_eq!(p.estimated_remaining, Duration::from_secs(5 * 60));
    }

    #[test]
    fn test_request_serializes_snake_case() {
        let r = AssistanceRequest::new(AssistanceKind::AccountCreation, "create account", AssistancePriority::High);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["kind"], "account_creation");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["priority"], "high");
    }
}
