//! Provider data model: profiles, contexts, intents, candidates and the
//! tagged outcomes of each lifecycle stage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key holding a credential-vault reference for provider login.
pub const CREDENTIAL_REF_KEY: &str = "credential_ref";

/// Known registration-system kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// CampBrain class/camp management
    #[serde(rename = "campbrain")]
    CampBrain,
    /// ActiveNet / ActiveCommunities recreation portals
    ActiveCommunities,
    /// Shopify storefront checkout
    Shopify,
    /// WooCommerce checkout
    Woocommerce,
    /// Club-management tools (team/club registrations)
    ClubManager,
    /// Hand-built provider site with no known platform
    Custom,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CampBrain => write!(f, "campbrain"),
            Self::ActiveCommunities => write!(f, "active_communities"),
            Self::Shopify => write!(f, "shopify"),
            Self::Woocommerce => write!(f, "woocommerce"),
            Self::ClubManager => write!(f, "club_manager"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// How the provider authenticates the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginType {
    #[default]
    None,
    EmailPassword,
    AccountRequired,
}

impl LoginType {
    /// Whether a stored credential is needed before reserving.
    pub fn requires_credentials(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Routing rule for one provider platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// Display name for logs
    #[serde(default)]
    pub name: String,
    pub platform: Platform,
    /// Hostname globs; `*` matches any run of characters
    pub domain_patterns: Vec<String>,
    #[serde(default)]
    pub login_type: LoginType,
    #[serde(default)]
    pub captcha_expected: bool,
    /// Provider charges the parent directly; we only collect our service fee
    #[serde(default)]
    pub provider_collects_payment: bool,
}

impl ProviderProfile {
    pub fn new(platform: Platform, domain_patterns: Vec<&str>) -> Self {
        Self {
            name: platform.to_string(),
            platform,
            domain_patterns: domain_patterns.into_iter().map(String::from).collect(),
            login_type: LoginType::None,
            captcha_expected: false,
            provider_collects_payment: false,
        }
    }

    pub fn with_login(mut self, login_type: LoginType) -> Self {
        self.login_type = login_type;
        self
    }

    pub fn with_captcha_expected(mut self) -> Self {
        self.captcha_expected = true;
        self
    }
}

/// Retry/timeout budget an adapter should use for remote calls.
///
/// Derived from the provider's trust record; adapters never mutate it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdapterTuning {
    pub retry_attempts: u32,
    pub timeout_ms: u64,
    pub concurrency_limit: u32,
    /// Provider has been reliable enough for preemptive behaviour
    pub aggressive: bool,
}

impl Default for AdapterTuning {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            timeout_ms: 30_000,
            concurrency_limit: 2,
            aggressive: false,
        }
    }
}

/// Everything an adapter knows about the run it is serving.
///
/// `child_token` and the `metadata` values are references into external
/// stores; raw child PII and raw secrets never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderContext {
    pub canonical_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_token: Option<String>,
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Parent explicitly agreed to automation against this provider
    #[serde(default)]
    pub consent_granted: bool,
    #[serde(default)]
    pub tuning: AdapterTuning,
}

impl ProviderContext {
    pub fn new(
        canonical_url: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            canonical_url: canonical_url.into(),
            child_token: None,
            user_id: user_id.into(),
            session_id: session_id.into(),
            metadata: HashMap::new(),
            consent_granted: false,
            tuning: AdapterTuning::default(),
        }
    }

    pub fn with_child_token(mut self, token: impl Into<String>) -> Self {
        self.child_token = Some(token.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_consent(mut self) -> Self {
        self.consent_granted = true;
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// What the parent is looking for. All fields empty means "everything".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderIntent {
    /// ISO date or timestamp naming the desired week
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub priority: bool,
    /// IANA zone the provider advertises in; falls back to the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ProviderIntent {
    pub fn for_week(date: impl Into<String>) -> Self {
        Self {
            date: Some(date.into()),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, needle: impl Into<String>) -> Self {
        self.title_contains = Some(needle.into());
        self
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.date.is_none()
            && self.title_contains.is_none()
            && self.location.is_none()
            && self.quantity.is_none()
            && !self.priority
    }
}

/// A discovered, not-yet-reserved registration slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSessionCandidate {
    pub id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    /// `None` = unknown, `Some(0)` = full
    #[serde(default)]
    pub capacity: Option<u32>,
    /// Provider-side identifier, set once a reservation succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<u64>,
}

impl ProviderSessionCandidate {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            title: title.into(),
            start_at: None,
            end_at: None,
            capacity: None,
            provider_id: None,
            location: None,
            price_cents: None,
        }
    }

    pub fn starting_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_price(mut self, cents: u64) -> Self {
        self.price_cents = Some(cents);
        self
    }

    /// Known to have no seats left.
    pub fn is_full(&self) -> bool {
        self.capacity == Some(0)
    }
}

/// Result of the read-only precheck stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PrecheckResult {
    Ok,
    Rejected { reason: String },
}

impl PrecheckResult {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Terminal outcome of one reserve call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReserveOutcome {
    /// Seat held; `provider_id` is the provider's registration identifier
    Reserved { provider_id: String },
    /// Provider put the child on a waitlist; no further escalation
    Waitlisted,
    /// Provider demands human verification (`provider` names the system, e.g. "recaptcha")
    NeedsCaptcha { provider: String },
    /// Hard failure with a human-readable reason
    Failed { reason: String },
}

impl ReserveOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }
}

/// What was actually charged during finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChargeKind {
    /// Provider collects its own price; only our fee was charged
    ServiceFeeOnly { cents: u64 },
    /// We submitted the provider's price on the parent's behalf
    FullPrice { cents: u64 },
    /// Registration was already confirmed; nothing charged this call
    AlreadyCharged,
}

/// Terminal outcome of one finalize call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    Confirmed {
        confirmation_id: String,
        charged: ChargeKind,
    },
    /// Provider deferred confirmation
    Waitlisted,
    Failed {
        error: String,
    },
}

impl FinalizeOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_empty() {
        assert!(ProviderIntent::default().is_empty());
        assert!(!ProviderIntent::for_week("2024-06-10").is_empty());
        // timezone alone does not narrow anything
        assert!(ProviderIntent::default()
            .with_timezone("America/Chicago")
            .is_empty());
    }

    #[test]
    fn test_metadata_ignores_blank_values() {
        let ctx = ProviderContext::new("https://x.campbrain.com", "u1", "s1")
            .with_metadata(CREDENTIAL_REF_KEY, "  ");
        assert_eq!(ctx.metadata(CREDENTIAL_REF_KEY), None);

        let ctx = ctx.with_metadata(CREDENTIAL_REF_KEY, "vault://parents/u1/campbrain");
        assert_eq!(
            ctx.metadata(CREDENTIAL_REF_KEY),
            Some("vault://parents/u1/campbrain")
        );
    }

    #[test]
    fn test_reserve_outcome_serialization() {
        let outcome = ReserveOutcome::NeedsCaptcha {
            provider: "recaptcha".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"outcome\":\"needs_captcha\""), "JSON: {json}");
        assert!(json.contains("\"provider\":\"recaptcha\""), "JSON: {json}");
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_profile_deserializes_with_defaults() {
        let profile: ProviderProfile = serde_json::from_str(
            r#"{"platform":"campbrain","domain_patterns":["*.campbrain.com"]}"#,
        )
        .unwrap();
        assert_eq!(profile.platform, Platform::CampBrain);
        assert_eq!(profile.login_type, LoginType::None);
        assert!(!profile.captcha_expected);
    }

    #[test]
    fn test_candidate_full() {
        let c = ProviderSessionCandidate::new("a", "Soccer", "https://x/a");
        assert!(!c.is_full());
        assert!(c.clone().with_capacity(0).is_full());
        assert!(!c.with_capacity(3).is_full());
    }
}
