//! Notification escalation engine.
//!
//! Delivers "the parent needs to act" messages over the best available
//! channel and keeps escalating on a durable schedule until the parent
//! opens the notification or it expires.

pub mod engine;
pub mod scheduler;
pub mod store;
pub mod types;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

pub use engine::{FireOutcome, NotificationDelivery, NotificationEngine, SkipReason};
pub use scheduler::{EscalationScheduler, ScheduledTask, TaskAction};
pub use store::{InMemoryNotificationStore, NotificationStore};
pub use types::{
    DeliveryAttempt, DeliveryMethod, DeliveryTrigger, EscalationRule, NotificationKind,
    NotificationOptions, NotificationPriority, NotificationRecord, NotificationTemplate,
    UrgencyLevel,
};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery via {method} failed: {message}")]
    Delivery {
        method: DeliveryMethod,
        message: String,
    },

    #[error("Notification not found: {0}")]
    NotFound(String),

    #[error("User {0} has opted out of every delivery channel")]
    NoChannel(String),

    #[error("Notification store error: {0}")]
    Store(#[from] StoreError),
}

pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Delay before retrying a failed first delivery on the fallback channel
    pub fallback_delay_secs: u64,
    /// Recent records per user considered for channel performance
    pub performance_window: usize,
    /// Minimum open ratio a channel must keep
    pub performance_floor: f64,
    /// Samples needed before the floor applies to a channel
    pub min_samples: usize,
    pub dispatch_interval_ms: u64,
    /// Rules attached to assistance notifications
    pub escalation_rules: Vec<EscalationRule>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            fallback_delay_secs: 30,
            performance_window: 50,
            performance_floor: 0.2,
            min_samples: 5,
            dispatch_interval_ms: 1_000,
            escalation_rules: vec![
                EscalationRule {
                    trigger_after: std::time::Duration::from_secs(5 * 60),
                    method: DeliveryMethod::Sms,
                    priority: NotificationPriority::High,
                },
                EscalationRule {
                    trigger_after: std::time::Duration::from_secs(10 * 60),
                    method: DeliveryMethod::Sms,
                    priority: NotificationPriority::Critical,
                },
            ],
        }
    }
}
