//! Provider trust gate: which automations may run against a hostname.
//!
//! Two layers:
//! 1. [`TrustGate::classify`]: static compliance verdict from curated
//!    trusted/blocked suffix lists. No I/O.
//! 2. [`TrustGate::analyze`]: the per-host [`TrustRecord`] (relationship,
//!    capabilities, rolling metrics, adapter tuning), cached in memory for
//!    `cache_ttl_secs` and re-classified after `recheck_secs`.
//!
//! Unknown hosts are Yellow and always require parent consent. Whether a
//! URL that cannot even be parsed is Yellow or Red is the `fail_open`
//! switch; the chosen path is recorded in [`ComplianceBasis`].

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::provider::types::AdapterTuning;
use crate::registry::hostname;
use crate::store::StoreError;

pub use store::{InMemoryTrustStore, TrustStore};

const MAX_RETRY_ATTEMPTS: u32 = 5;
const MAX_TIMEOUT_MS: u64 = 60_000;
const DEGRADED_SUCCESS_RATE: f64 = 0.8;
const AGGRESSIVE_SUCCESS_RATE: f64 = 0.95;
/// Attempts required before a provider can earn aggressive mode
const MIN_ATTEMPTS_FOR_AGGRESSIVE: u64 = 10;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("Cannot derive hostname from '{0}'")]
    InvalidUrl(String),

    #[error("Trust store error: {0}")]
    Store(#[from] StoreError),
}

pub type TrustResult<T> = Result<T, TrustError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    /// Curated, known to permit automation
    Green,
    /// Unknown; proceed only with explicit consent
    Yellow,
    /// Explicitly blocked
    Red,
}

impl std::fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Red => write!(f, "red"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    Partner,
    Neutral,
    Restricted,
}

/// Why a verdict came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceBasis {
    StaticTrusted,
    StaticBlocked,
    DefaultUnknown,
    /// URL could not be classified; status reflects the `fail_open` setting
    ClassificationError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceVerdict {
    pub status: ComplianceStatus,
    pub can_proceed: bool,
    pub requires_consent: bool,
    pub basis: ComplianceBasis,
    pub reason: String,
}

/// Automation categories gated per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationType {
    FormAutomation,
    CaptchaPrevention,
    QueueManagement,
    PaymentProcessing,
}

impl std::fmt::Display for AutomationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FormAutomation => write!(f, "form_automation"),
            Self::CaptchaPrevention => write!(f, "captcha_prevention"),
            Self::QueueManagement => write!(f, "queue_management"),
            Self::PaymentProcessing => write!(f, "payment_processing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrustCapabilities {
    pub form_automation: bool,
    pub captcha_prevention: bool,
    pub queue_management: bool,
    pub payment_processing: bool,
}

impl TrustCapabilities {
    /// Defaults for a compliance/relationship pair.
    pub fn derive(compliance: ComplianceStatus, relationship: RelationshipStatus) -> Self {
        match (compliance, relationship) {
            (ComplianceStatus::Red, _) | (_, RelationshipStatus::Restricted) => Self::default(),
            (ComplianceStatus::Green, RelationshipStatus::Partner) => Self {
                form_automation: true,
                captcha_prevention: true,
                queue_management: true,
                payment_processing: true,
            },
            (ComplianceStatus::Green, RelationshipStatus::Neutral) => Self {
                form_automation: true,
                captcha_prevention: false,
                queue_management: true,
                payment_processing: true,
            },
            (ComplianceStatus::Yellow, _) => Self {
                form_automation: true,
                ..Self::default()
            },
        }
    }

    pub fn allows(&self, kind: AutomationType) -> bool {
        match kind {
            AutomationType::FormAutomation => self.form_automation,
            AutomationType::CaptchaPrevention => self.captcha_prevention,
            AutomationType::QueueManagement => self.queue_management,
            AutomationType::PaymentProcessing => self.payment_processing,
        }
    }
}

/// Rolling automation outcomes for one host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustMetrics {
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub attempts: u64,
}

impl Default for TrustMetrics {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            avg_response_ms: 0.0,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub host: String,
    pub compliance: ComplianceStatus,
    pub relationship: RelationshipStatus,
    pub capabilities: TrustCapabilities,
    pub metrics: TrustMetrics,
    pub config: AdapterTuning,
    pub analyzed_at: DateTime<Utc>,
    pub compliance_checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationDecision {
    pub allowed: bool,
    pub reason: String,
    pub confidence: f64,
}

impl AutomationDecision {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub trusted_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
    pub partner_domains: Vec<String>,
    pub restricted_domains: Vec<String>,
    /// In-memory record lifetime
    pub cache_ttl_secs: u64,
    /// Age after which compliance is re-derived even for stored records
    pub recheck_secs: u64,
    /// Unclassifiable URLs become Yellow (true) or Red (false)
    pub fail_open: bool,
    pub ema_alpha: f64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            trusted_domains: vec!["campbrain.com".to_string()],
            blocked_domains: Vec::new(),
            partner_domains: Vec::new(),
            restricted_domains: Vec::new(),
            cache_ttl_secs: 6 * 3600,
            recheck_secs: 24 * 3600,
            fail_open: true,
            ema_alpha: 0.1,
        }
    }
}

/// `host` is `domain` or a subdomain of it.
fn suffix_match(host: &str, domains: &[String]) -> bool {
    domains.iter().any(|d| {
        let d = d.trim().trim_start_matches('.').to_ascii_lowercase();
        !d.is_empty() && (host == d || host.ends_with(&format!(".{d}")))
    })
}

pub struct TrustGate {
    config: TrustConfig,
    clock: SharedClock,
    store: Arc<dyn TrustStore>,
    cache: RwLock<HashMap<String, TrustRecord>>,
}

impl TrustGate {
    pub fn new(config: TrustConfig, clock: SharedClock, store: Arc<dyn TrustStore>) -> Self {
        Self {
            config,
            clock,
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    fn classify_host(&self, host: &str) -> ComplianceVerdict {
        if suffix_match(host, &self.config.blocked_domains) {
            return ComplianceVerdict {
                status: ComplianceStatus::Red,
                can_proceed: false,
                requires_consent: false,
                basis: ComplianceBasis::StaticBlocked,
                reason: format!("{host} is on the blocked list"),
            };
        }
        if suffix_match(host, &self.config.trusted_domains) {
            return ComplianceVerdict {
                status: ComplianceStatus::Green,
                can_proceed: true,
                requires_consent: true,
                basis: ComplianceBasis::StaticTrusted,
                reason: format!("{host} is a trusted provider"),
            };
        }
        ComplianceVerdict {
            status: ComplianceStatus::Yellow,
            can_proceed: true,
            requires_consent: true,
            basis: ComplianceBasis::DefaultUnknown,
            reason: format!("{host} is unknown; explicit consent required"),
        }
    }

    /// Static compliance verdict for `url`.
    pub fn classify(&self, url: &str) -> ComplianceVerdict {
        let Some(host) = hostname(url) else {
            warn!(url, fail_open = self.config.fail_open, "Trust classification failed");
            let (status, can_proceed, requires_consent) = if self.config.fail_open {
                (ComplianceStatus::Yellow, true, true)
            } else {
                (ComplianceStatus::Red, false, false)
            };
            return ComplianceVerdict {
                status,
                can_proceed,
                requires_consent,
                basis: ComplianceBasis::ClassificationError,
                reason: format!("could not classify '{url}'"),
            };
        };
        self.classify_host(&host)
    }

    fn relationship_for(&self, host: &str) -> RelationshipStatus {
        if suffix_match(host, &self.config.restricted_domains) {
            RelationshipStatus::Restricted
        } else if suffix_match(host, &self.config.partner_domains) {
            RelationshipStatus::Partner
        } else {
            RelationshipStatus::Neutral
        }
    }

    fn fresh_record(&self, host: &str, now: DateTime<Utc>) -> TrustRecord {
        let compliance = self.classify_host(host).status;
        let relationship = self.relationship_for(host);
        TrustRecord {
            host: host.to_string(),
            compliance,
            relationship,
            capabilities: TrustCapabilities::derive(compliance, relationship),
            metrics: TrustMetrics::default(),
            config: AdapterTuning::default(),
            analyzed_at: now,
            compliance_checked_at: now,
        }
    }

    /// Trust record for `url`, from cache, store, or freshly derived.
    pub async fn analyze(&self, url: &str) -> TrustResult<TrustRecord> {
        let host = hostname(url).ok_or_else(|| TrustError::InvalidUrl(url.to_string()))?;
        let now = self.clock.now();
        let ttl = Duration::seconds(self.config.cache_ttl_secs as i64);

        if let Some(record) = self.cache.read().await.get(&host) {
            if now - record.analyzed_at < ttl {
                return Ok(record.clone());
            }
        }

        let mut record = match self.store.load(&host).await? {
            Some(mut stored) => {
                let recheck = Duration::seconds(self.config.recheck_secs as i64);
                if now - stored.compliance_checked_at >= recheck {
                    let compliance = self.classify_host(&host).status;
                    let relationship = self.relationship_for(&host);
                    if compliance != stored.compliance || relationship != stored.relationship {
                        info!(%host, from = %stored.compliance, to = %compliance, "Trust re-check changed compliance");
                    }
                    stored.compliance = compliance;
                    stored.relationship = relationship;
                    stored.capabilities = TrustCapabilities::derive(compliance, relationship);
                    stored.compliance_checked_at = now;
                }
                stored
            }
            None => {
                debug!(%host, "Creating trust record");
                self.fresh_record(&host, now)
            }
        };
        record.analyzed_at = now;

        self.store.save(&record).await?;
        self.cache.write().await.insert(host, record.clone());
        Ok(record)
    }

    /// Whether `kind` may run against `url`.
    pub async fn is_automation_allowed(
        &self,
        url: &str,
        kind: AutomationType,
    ) -> TrustResult<AutomationDecision> {
        let record = self.analyze(url).await?;

        if record.compliance == ComplianceStatus::Red {
            return Ok(AutomationDecision::deny(format!("{} is blocked", record.host)));
        }
        if !record.capabilities.allows(kind) {
            return Ok(AutomationDecision::deny(format!(
                "{kind} is not permitted for {}",
                record.host
            )));
        }
        if record.relationship == RelationshipStatus::Restricted {
            return Ok(AutomationDecision::deny(format!(
                "{} has a restricted relationship",
                record.host
            )));
        }

        let (confidence, reason) = match (record.relationship, record.compliance) {
            (RelationshipStatus::Partner, _) => (0.95, "partner provider"),
            (_, ComplianceStatus::Green) => (0.8, "trusted provider"),
            _ => (0.6, "unknown provider; caution mode"),
        };
        Ok(AutomationDecision {
            allowed: true,
            reason: reason.to_string(),
            confidence,
        })
    }

    /// Fold one automation attempt into the host's metrics and re-tune.
    pub async fn record_attempt(
        &self,
        url: &str,
        success: bool,
        response_ms: u64,
    ) -> TrustResult<TrustRecord> {
        let mut record = self.analyze(url).await?;
        let alpha = self.config.ema_alpha.clamp(0.0, 1.0);
        let outcome = if success { 1.0 } else { 0.0 };

        let m = &mut record.metrics;
        m.success_rate = alpha * outcome + (1.0 - alpha) * m.success_rate;
        m.avg_response_ms = if m.attempts == 0 {
            response_ms as f64
        } else {
            alpha * response_ms as f64 + (1.0 - alpha) * m.avg_response_ms
        };
        m.attempts += 1;

        let tuning = &mut record.config;
        if m.success_rate < DEGRADED_SUCCESS_RATE {
            tuning.retry_attempts = (tuning.retry_attempts + 1).min(MAX_RETRY_ATTEMPTS);
            tuning.timeout_ms = ((tuning.timeout_ms as f64 * 1.5) as u64).min(MAX_TIMEOUT_MS);
            tuning.aggressive = false;
        } else if m.success_rate > AGGRESSIVE_SUCCESS_RATE && m.attempts >= MIN_ATTEMPTS_FOR_AGGRESSIVE {
            tuning.aggressive = true;
        }

        debug!(
            host = %record.host,
            success,
            success_rate = m.success_rate,
            retry_attempts = tuning.retry_attempts,
            timeout_ms = tuning.timeout_ms,
            "Trust metrics updated"
        );
        self.store.save(&record).await?;
        self.cache
            .write()
            .await
            .insert(record.host.clone(), record.clone());
        Ok(record)
    }

    /// Adapter tuning currently derived for `url`.
    pub async fn tuning(&self, url: &str) -> TrustResult<AdapterTuning> {
        Ok(self.analyze(url).await?.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> TrustConfig {
        TrustConfig {
            trusted_domains: vec!["campbrain.com".into(), "daysmart.com".into()],
            blocked_domains: vec!["blocked.example".into()],
            partner_domains: vec!["daysmart.com".into()],
            restricted_domains: vec!["grumpy.org".into()],
            ..Default::default()
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn gate_with(config: TrustConfig, store: Arc<dyn TrustStore>) -> (TrustGate, ManualClock) {
        let clock = ManualClock::new(start());
        (TrustGate::new(config, Arc::new(clock.clone()), store), clock)
    }

    fn gate() -> (TrustGate, ManualClock) {
        gate_with(config(), Arc::new(InMemoryTrustStore::new()))
    }

    /// Counts loads so cache hits are observable.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryTrustStore,
        loads: AtomicU32,
    }

    #[async_trait]
    impl TrustStore for CountingStore {
        async fn load(&self, host: &str) -> crate::store::StoreResult<Option<TrustRecord>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(host).await
        }
        async fn save(&self, record: &TrustRecord) -> crate::store::StoreResult<()> {
            self.inner.save(record).await
        }
    }

    #[test]
    fn test_trusted_suffix_fast_path() {
        let (gate, _) = gate();
        for url in ["https://campbrain.com/x", "https://register.lakeside.campbrain.com"] {
            let v = gate.classify(url);
            assert_eq!(v.status, ComplianceStatus::Green);
            assert!(v.can_proceed);
            assert!(v.requires_consent);
            assert_eq!(v.basis, ComplianceBasis::StaticTrusted);
        }
        // suffix match is on label boundaries
        assert_eq!(
            gate.classify("https://notcampbrain.com").status,
            ComplianceStatus::Yellow
        );
    }

    #[test]
    fn test_blocked_and_unknown() {
        let (gate, _) = gate();
        let v = gate.classify("https://www.blocked.example/signup");
        assert_eq!(v.status, ComplianceStatus::Red);
        assert!(!v.can_proceed);

        let v = gate.classify("https://some-camp.org");
        assert_eq!(v.status, ComplianceStatus::Yellow);
        assert!(v.requires_consent);
        assert_eq!(v.basis, ComplianceBasis::DefaultUnknown);
    }

    #[test]
    fn test_classification_error_respects_fail_open() {
        let (gate, _) = gate();
        let v = gate.classify("not a url");
        assert_eq!(v.status, ComplianceStatus::Yellow);
        assert_eq!(v.basis, ComplianceBasis::ClassificationError);

        let (strict, _) = gate_with(
            TrustConfig {
                fail_open: false,
                ..config()
            },
            Arc::new(InMemoryTrustStore::new()),
        );
        let v = strict.classify("not a url");
        assert_eq!(v.status, ComplianceStatus::Red);
        assert!(!v.can_proceed);
    }

    #[tokio::test]
    async fn test_analyze_caches_for_ttl() {
        let store = Arc::new(CountingStore::default());
        let (gate, clock) = gate_with(config(), store.clone());

        gate.analyze("https://register.campbrain.com").await.unwrap();
        clock.advance(Duration::hours(5));
        gate.analyze("https://register.campbrain.com").await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);

        clock.advance(Duration::hours(2));
        gate.analyze("https://register.campbrain.com").await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_compliance_is_rechecked() {
        let store = Arc::new(InMemoryTrustStore::new());
        let (gate, clock) = gate_with(config(), store.clone());
        let mut stale = gate.fresh_record("register.campbrain.com", start());
        stale.compliance = ComplianceStatus::Red;
        stale.capabilities = TrustCapabilities::default();
        store.save(&stale).await.unwrap();

        clock.advance(Duration::hours(12));
        let record = gate.analyze("https://register.campbrain.com").await.unwrap();
        assert_eq!(record.compliance, ComplianceStatus::Red, "not yet due for re-check");

        clock.advance(Duration::hours(13));
        let record = gate.analyze("https://register.campbrain.com").await.unwrap();
        assert_eq!(record.compliance, ComplianceStatus::Green);
        assert_eq!(record.compliance_checked_at, start() + Duration::hours(25));
    }

    #[tokio::test]
    async fn test_automation_decisions() {
        let (gate, _) = gate();
        let partner = gate
            .is_automation_allowed("https://x.daysmart.com", AutomationType::CaptchaPrevention)
            .await
            .unwrap();
        assert!(partner.allowed);
        assert_eq!(partner.confidence, 0.95);

        let neutral = gate
            .is_automation_allowed("https://x.campbrain.com", AutomationType::FormAutomation)
            .await
            .unwrap();
        assert_eq!(neutral.confidence, 0.8);

        let no_captcha = gate
            .is_automation_allowed("https://x.campbrain.com", AutomationType::CaptchaPrevention)
            .await
            .unwrap();
        assert!(!no_captcha.allowed);

        let unknown = gate
            .is_automation_allowed("https://somecamp.org", AutomationType::FormAutomation)
            .await
            .unwrap();
        assert!(unknown.allowed);
        assert_eq!(unknown.confidence, 0.6);

        let unknown_pay = gate
            .is_automation_allowed("https://somecamp.org", AutomationType::PaymentProcessing)
            .await
            .unwrap();
        assert!(!unknown_pay.allowed);

        for url in ["https://blocked.example", "https://grumpy.org"] {
            let d = gate
                .is_automation_allowed(url, AutomationType::FormAutomation)
                .await
                .unwrap();
            assert!(!d.allowed, "{url} should be denied");
        }
    }

    #[tokio::test]
    async fn test_record_attempt_ema_and_tuning() {
        let (gate, _) = gate();
        let url = "https://register.campbrain.com";

        let r = gate.record_attempt(url, false, 1200).await.unwrap();
        assert!((r.metrics.success_rate - 0.9).abs() < 1e-9);
        assert_eq!(r.metrics.avg_response_ms, 1200.0);
        assert_eq!(r.config, AdapterTuning::default());

        let r = gate.record_attempt(url, false, 200).await.unwrap();
        assert!((r.metrics.success_rate - 0.81).abs() < 1e-9);
        assert!((r.metrics.avg_response_ms - 1100.0).abs() < 1e-9);

        let r = gate.record_attempt(url, false, 200).await.unwrap();
        assert!(r.metrics.success_rate < 0.8);
        assert_eq!(r.config.retry_attempts, 4);
        assert_eq!(r.config.timeout_ms, 45_000);
        assert!(!r.config.aggressive);

        let r = gate.record_attempt(url, false, 200).await.unwrap();
        assert_eq!(r.config.retry_attempts, 5);
        assert_eq!(r.config.timeout_ms, MAX_TIMEOUT_MS);

        let r = gate.record_attempt(url, false, 200).await.unwrap();
        assert_eq!(r.config.retry_attempts, 5, "retries are capped");

        assert_eq!(gate.tuning(url).await.unwrap(), r.config);
    }

    #[tokio::test]
    async fn test_sustained_success_enables_aggressive_mode() {
        let (gate, _) = gate();
        let url = "https://register.campbrain.com";
        for _ in 0..MIN_ATTEMPTS_FOR_AGGRESSIVE - 1 {
            let r = gate.record_attempt(url, true, 300).await.unwrap();
            assert!(!r.config.aggressive);
        }
        let r = gate.record_attempt(url, true, 300).await.unwrap();
        assert!(r.config.aggressive);
    }
}
