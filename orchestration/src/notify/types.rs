//! Notification data model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::AssistanceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CaptchaAssistance,
    PaymentAuthorization,
    AccountCreation,
    FormCompletion,
    RegistrationUpdate,
}

impl NotificationKind {
    /// How long the parent has before the ask goes stale.
    pub fn default_expiration(self) -> Duration {
        match self {
            Self::CaptchaAssistance => Duration::from_secs(15 * 60),
            Self::PaymentAuthorization => Duration::from_secs(30 * 60),
            Self::AccountCreation => Duration::from_secs(2 * 3600),
            Self::FormCompletion | Self::RegistrationUpdate => Duration::from_secs(24 * 3600),
        }
    }
}

impl From<AssistanceKind> for NotificationKind {
    fn from(kind: AssistanceKind) -> Self {
        match kind {
            AssistanceKind::Captcha => Self::CaptchaAssistance,
            AssistanceKind::Payment => Self::PaymentAuthorization,
            AssistanceKind::AccountCreation => Self::AccountCreation,
            AssistanceKind::FormCompletion => Self::FormCompletion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    Low,
    Normal,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl NotificationPriority {
    /// Delivery channels to try, best first.
    pub fn preferred_methods(self) -> &'static [DeliveryMethod] {
        use DeliveryMethod::*;
        match self {
            Self::Critical => &[Sms, Push, Email],
            Self::High => &[Push, Sms, Email],
            Self::Medium => &[Push, Email],
            Self::Low => &[Email, Push],
        }
    }
}

impl std::fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Sms,
    Email,
    Push,
    InApp,
}

impl DeliveryMethod {
    pub const ALL: [Self; 4] = [Self::Sms, Self::Email, Self::Push, Self::InApp];

    /// Next channel in the sms → email → push → in_app → sms cycle.
    pub fn fallback(self) -> Self {
        match self {
            Self::Sms => Self::Email,
            Self::Email => Self::Push,
            Self::Push => Self::InApp,
            Self::InApp => Self::Sms,
        }
    }
}

impl std::fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sms => write!(f, "sms"),
            Self::Email => write!(f, "email"),
            Self::Push => write!(f, "push"),
            Self::InApp => write!(f, "in_app"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub urgency: UrgencyLevel,
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Redeliver through `method` if the notification is still unopened
/// `trigger_after` its creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRule {
    #[serde(rename = "trigger_after_secs", with = "duration_secs")]
    pub trigger_after: Duration,
    pub method: DeliveryMethod,
    pub priority: NotificationPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub user_id: String,
    pub template: NotificationTemplate,
    pub priority: NotificationPriority,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub escalation_rules: Vec<EscalationRule>,
    /// Overrides the kind's default expiration
    #[serde(default)]
    pub expires_in: Option<Duration>,
}

impl NotificationOptions {
    pub fn new(
        user_id: impl Into<String>,
        template: NotificationTemplate,
        priority: NotificationPriority,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            template,
            priority,
            action_url: None,
            escalation_rules: Vec::new(),
            expires_in: None,
        }
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    pub fn with_escalation(mut self, rules: Vec<EscalationRule>) -> Self {
        self.escalation_rules = rules;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum DeliveryTrigger {
    Initial,
    Escalation { rule_index: usize },
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub method: DeliveryMethod,
    pub priority: NotificationPriority,
    pub trigger: DeliveryTrigger,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// A sent notification. Identity and content are fixed at creation; only
/// delivery attempts and interaction timestamps change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub user_id: String,
    pub template: NotificationTemplate,
    pub priority: NotificationPriority,
    #[serde(default)]
    pub action_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_attempts: Vec<DeliveryAttempt>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clicked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_opened(&self) -> bool {
        self.opened_at.is_some()
    }

    /// Method of the most recent successful delivery.
    pub fn delivered_method(&self) -> Option<DeliveryMethod> {
        self.delivery_attempts
            .iter()
            .rev()
            .find(|a| a.success)
            .map(|a| a.method)
    }
}
