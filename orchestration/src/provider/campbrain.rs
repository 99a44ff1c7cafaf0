//! Reference adapter for CampBrain-hosted registration sites.
//!
//! Discovery, reservation and confirmation go through a [`ProviderTransport`];
//! login material comes from a [`CredentialVault`] and charges from a
//! [`PaymentGateway`]. Expected provider failures are folded into the
//! `Failed` variants of each stage; only discovery reports
//! [`AdapterError::ProviderUnavailable`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use tracing::{debug, info, warn};
use url::Url;

use super::adapter::{apply_intent, AdapterError, AdapterResult, ProviderAdapter};
use super::backends::{ChargeRequest, CredentialVault, PaymentGateway};
use super::http::{
    RemoteSession, ReservationRequest, ReservationResponse, TransportError, TransportResult,
    ProviderTransport,
};
use super::types::{
    AdapterTuning, ChargeKind, FinalizeOutcome, LoginType, Platform, PrecheckResult,
    ProviderContext, ProviderIntent, ProviderProfile, ProviderSessionCandidate, ReserveOutcome,
    CREDENTIAL_REF_KEY,
};
use crate::lock::RegistrationLockManager;
use crate::registry::hostname;

const CAMPBRAIN_DOMAIN: &str = "campbrain.com";

/// Metadata key for the number of seats to request.
pub const QUANTITY_KEY: &str = "quantity";

/// Service fee charged when the provider collects its own price.
pub const DEFAULT_SERVICE_FEE_CENTS: u64 = 2_000;

/// Static knobs for [`CampBrainAdapter`].
#[derive(Debug, Clone)]
pub struct CampBrainSettings {
    pub login_type: LoginType,
    /// Known up front from the profile; otherwise asked of the site at finalize
    pub provider_collects_payment: bool,
    pub service_fee_cents: u64,
    /// Zone used for week ranking when the intent names none
    pub default_timezone: Tz,
}

impl Default for CampBrainSettings {
    fn default() -> Self {
        Self {
            login_type: LoginType::None,
            provider_collects_payment: false,
            service_fee_cents: DEFAULT_SERVICE_FEE_CENTS,
            default_timezone: chrono_tz::America::Chicago,
        }
    }
}

impl CampBrainSettings {
    pub fn for_profile(profile: &ProviderProfile) -> Self {
        Self {
            login_type: profile.login_type,
            provider_collects_payment: profile.provider_collects_payment,
            ..Default::default()
        }
    }
}

/// Removes a registration from the in-flight set when the reserve call ends.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            in_flight: Arc::clone(in_flight),
            key: key.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.key);
    }
}

pub struct CampBrainAdapter {
    transport: Arc<dyn ProviderTransport>,
    vault: Option<Arc<dyn CredentialVault>>,
    payments: Option<Arc<dyn PaymentGateway>>,
    settings: CampBrainSettings,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl CampBrainAdapter {
    pub fn new(transport: Arc<dyn ProviderTransport>) -> Self {
        Self {
            transport,
            vault: None,
            payments: None,
            settings: CampBrainSettings::default(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_payments(mut self, payments: Arc<dyn PaymentGateway>) -> Self {
        self.payments = Some(payments);
        self
    }

    pub fn with_settings(mut self, settings: CampBrainSettings) -> Self {
        self.settings = settings;
        self
    }

    fn is_campbrain_host(host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        host == CAMPBRAIN_DOMAIN || host.ends_with(&format!(".{CAMPBRAIN_DOMAIN}"))
    }

    fn base_url(ctx: &ProviderContext) -> Result<Url, String> {
        Url::parse(&ctx.canonical_url).map_err(|e| format!("invalid provider URL: {e}"))
    }

    /// Run an idempotent transport call under the tuning's timeout, retrying
    /// transient failures with linear backoff.
    async fn with_retry<T, F, Fut>(tuning: &AdapterTuning, op: &str, call: F) -> TransportResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let attempts = tuning.retry_attempts.max(1);
        let per_call = Duration::from_millis(tuning.timeout_ms);
        let mut last = TransportError::Timeout;

        for attempt in 1..=attempts {
            let err = match tokio::time::timeout(per_call, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout,
            };
            warn!(op, attempt, attempts, error = %err, "Transient provider error");
            last = err;
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
            }
        }
        Err(last)
    }

    /// One attempt, bounded by the tuning timeout. Used for calls with side effects.
    async fn once<T, Fut>(tuning: &AdapterTuning, call: Fut) -> TransportResult<T>
    where
        Fut: Future<Output = TransportResult<T>>,
    {
        tokio::time::timeout(Duration::from_millis(tuning.timeout_ms), call)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    fn to_candidate(base: &Url, remote: RemoteSession) -> ProviderSessionCandidate {
        let url = remote.url.unwrap_or_else(|| {
            base.join(&format!("/sessions/{}", remote.id))
                .map(String::from)
                .unwrap_or_else(|_| base.to_string())
        });
        ProviderSessionCandidate {
            id: remote.id,
            url,
            title: remote.title,
            start_at: remote.starts_at,
            end_at: remote.ends_at,
            capacity: remote.spots_remaining,
            provider_id: None,
            location: remote.location,
            price_cents: remote.price_cents,
        }
    }

    /// Resolve the parent's credential and sign in, if this provider needs it.
    async fn authenticate(&self, ctx: &ProviderContext, base: &Url) -> Result<Option<String>, String> {
        if !self.settings.login_type.requires_credentials() {
            return Ok(None);
        }
        let reference = ctx
            .metadata(CREDENTIAL_REF_KEY)
            .ok_or_else(|| "missing credential reference".to_string())?;
        let vault = self
            .vault
            .as_ref()
            .ok_or_else(|| "no credential vault configured".to_string())?;
        let creds = vault
            .resolve(reference)
            .await
            .map_err(|e| format!("credential lookup failed: {e}"))?;

        let token = Self::with_retry(&ctx.tuning, "sign_in", || {
            self.transport.sign_in(base, &creds.username, &creds.secret)
        })
        .await
        .map_err(|e| format!("provider sign-in failed: {e}"))?;
        Ok(Some(token))
    }

    fn map_reservation(response: ReservationResponse) -> ReserveOutcome {
        match response {
            ReservationResponse::Confirmed { registration_id } => ReserveOutcome::Reserved {
                provider_id: registration_id,
            },
            ReservationResponse::Waitlisted => ReserveOutcome::Waitlisted,
            ReservationResponse::Challenge { challenge } => {
                ReserveOutcome::NeedsCaptcha { provider: challenge }
            }
            ReservationResponse::Rejected { message } => ReserveOutcome::failed(message),
        }
    }

    fn charge_for(&self, provider_collects: bool, candidate: &ProviderSessionCandidate) -> Result<ChargeKind, String> {
        if provider_collects {
            return Ok(ChargeKind::ServiceFeeOnly {
                cents: self.settings.service_fee_cents,
            });
        }
        candidate
            .price_cents
            .map(|cents| ChargeKind::FullPrice { cents })
            .ok_or_else(|| "session price unknown".to_string())
    }
}

#[async_trait]
impl ProviderAdapter for CampBrainAdapter {
    fn platform(&self) -> Platform {
        Platform::CampBrain
    }

    async fn precheck(&self, ctx: &ProviderContext) -> PrecheckResult {
        let url = match Self::base_url(ctx) {
            Ok(url) => url,
            Err(reason) => return PrecheckResult::rejected(reason),
        };
        if url.scheme() != "https" {
            return PrecheckResult::rejected("provider URL must use https");
        }
        match url.host_str() {
            Some(host) if Self::is_campbrain_host(host) => {}
            _ => return PrecheckResult::rejected("URL is not a CampBrain site"),
        }
        if ctx.child_token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return PrecheckResult::rejected("missing child token");
        }
        if self.settings.login_type.requires_credentials()
            && ctx.metadata(CREDENTIAL_REF_KEY).is_none()
        {
            return PrecheckResult::rejected("provider requires login but no credential reference was supplied");
        }
        PrecheckResult::Ok
    }

    async fn find_sessions(
        &self,
        ctx: &ProviderContext,
        intent: Option<&ProviderIntent>,
    ) -> AdapterResult<Vec<ProviderSessionCandidate>> {
        let base = Self::base_url(ctx).map_err(AdapterError::unavailable)?;

        let remote = match Self::with_retry(&ctx.tuning, "list_sessions", || {
            self.transport.list_sessions(&base)
        })
        .await
        {
            Ok(sessions) => sessions,
            Err(TransportError::Status { status: 404, .. }) => Vec::new(),
            Err(e) => return Err(AdapterError::unavailable(e.to_string())),
        };

        let candidates: Vec<_> = remote
            .into_iter()
            .map(|s| Self::to_candidate(&base, s))
            .collect();
        debug!(count = candidates.len(), url = %base, "CampBrain sessions discovered");
        Ok(apply_intent(candidates, intent, self.settings.default_timezone))
    }

    async fn reserve(
        &self,
        ctx: &ProviderContext,
        candidate: &ProviderSessionCandidate,
    ) -> AdapterResult<ReserveOutcome> {
        // Same registration tuple the orchestrator locks on
        let key = RegistrationLockManager::registration_key(
            &hostname(&ctx.canonical_url).unwrap_or_else(|| ctx.canonical_url.clone()),
            &candidate.id,
            ctx.child_token.as_deref().unwrap_or_default(),
        );
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &key) else {
            return Ok(ReserveOutcome::failed("reservation already in flight"));
        };

        let base = match Self::base_url(ctx) {
            Ok(base) => base,
            Err(reason) => return Ok(ReserveOutcome::failed(reason)),
        };
        let Some(child_token) = ctx.child_token.clone() else {
            return Ok(ReserveOutcome::failed("missing child token"));
        };
        let auth_token = match self.authenticate(ctx, &base).await {
            Ok(token) => token,
            Err(reason) => return Ok(ReserveOutcome::failed(reason)),
        };

        let request = ReservationRequest {
            session_id: candidate.id.clone(),
            child_token,
            auth_token,
            quantity: ctx
                .metadata(QUANTITY_KEY)
                .and_then(|q| q.parse().ok())
                .unwrap_or(1),
        };

        let outcome = match Self::once(&ctx.tuning, self.transport.submit_reservation(&base, &request)).await {
            Ok(response) => Self::map_reservation(response),
            Err(e) => ReserveOutcome::failed(format!("reservation request failed: {e}")),
        };
        info!(candidate = %candidate.id, outcome = ?outcome, "CampBrain reserve finished");
        Ok(outcome)
    }

    async fn finalize_payment(
        &self,
        ctx: &ProviderContext,
        candidate: &ProviderSessionCandidate,
    ) -> AdapterResult<FinalizeOutcome> {
        let base = match Self::base_url(ctx) {
            Ok(base) => base,
            Err(reason) => return Ok(FinalizeOutcome::failed(reason)),
        };
        let Some(registration_id) = candidate.provider_id.as_deref() else {
            return Ok(FinalizeOutcome::failed("candidate has not been reserved"));
        };

        // Provider state is the source of truth for whether we already paid
        match Self::with_retry(&ctx.tuning, "lookup_confirmation", || {
            self.transport.lookup_confirmation(&base, registration_id)
        })
        .await
        {
            Ok(Some(confirmation_id)) => {
                info!(registration_id, %confirmation_id, "Registration already confirmed; skipping charge");
                return Ok(FinalizeOutcome::Confirmed {
                    confirmation_id,
                    charged: ChargeKind::AlreadyCharged,
                });
            }
            Ok(None) => {}
            Err(e) => {
                return Ok(FinalizeOutcome::failed(format!(
                    "could not verify confirmation status: {e}"
                )))
            }
        }

        let provider_collects = if self.settings.provider_collects_payment {
            true
        } else {
            match Self::with_retry(&ctx.tuning, "payment_mode", || self.transport.payment_mode(&base)).await {
                Ok(mode) => mode.provider_collects_payment,
                Err(e) => return Ok(FinalizeOutcome::failed(format!("could not read payment mode: {e}"))),
            }
        };
        let charged = match self.charge_for(provider_collects, candidate) {
            Ok(kind) => kind,
            Err(reason) => return Ok(FinalizeOutcome::failed(reason)),
        };
        let amount_cents = match charged {
            ChargeKind::ServiceFeeOnly { cents } | ChargeKind::FullPrice { cents } => cents,
            ChargeKind::AlreadyCharged => 0,
        };

        let payment_reference = if amount_cents == 0 {
            format!("no-charge:{registration_id}")
        } else {
            let Some(payments) = self.payments.as_ref() else {
                return Ok(FinalizeOutcome::failed("no payment gateway configured"));
            };
            let request = ChargeRequest {
                user_id: ctx.user_id.clone(),
                idempotency_key: format!("{}:{}", ctx.session_id, candidate.id),
                amount_cents,
                description: format!("{} ({})", candidate.title, registration_id),
            };
            match payments.charge(&request).await {
                Ok(receipt) => receipt.reference,
                Err(e) => return Ok(FinalizeOutcome::failed(e.to_string())),
            }
        };

        let confirmed = Self::with_retry(&ctx.tuning, "confirm", || {
            self.transport
                .confirm(&base, registration_id, &payment_reference)
        })
        .await;
        Ok(match confirmed {
            Ok(resp) if resp.waitlisted => FinalizeOutcome::Waitlisted,
            Ok(resp) => match resp.confirmation_id {
                Some(confirmation_id) => {
                    info!(registration_id, %confirmation_id, ?charged, "CampBrain registration confirmed");
                    FinalizeOutcome::Confirmed {
                        confirmation_id,
                        charged,
                    }
                }
                None => FinalizeOutcome::failed("provider did not return a confirmation"),
            },
            Err(e) => FinalizeOutcome::failed(format!("confirmation failed after payment: {e}")),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::provider::backends::{
        ChargeReceipt, InMemoryCredentialVault, PaymentError,
    };
    use crate::provider::http::{ConfirmResponse, PaymentMode};
    use chrono::{TimeZone, Utc};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted provider used across adapter and orchestrator tests.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub sessions: Mutex<Vec<RemoteSession>>,
        pub list_failures: Mutex<VecDeque<TransportError>>,
        pub reservations: Mutex<VecDeque<ReservationResponse>>,
        pub reserve_delay: Option<Duration>,
        pub provider_collects_payment: bool,
        pub confirmations: Mutex<HashMap<String, String>>,
        pub sign_ins: AtomicU32,
        pub reserve_calls: AtomicU32,
        pub confirm_calls: AtomicU32,
    }

    impl ScriptedTransport {
        pub fn with_sessions(sessions: Vec<RemoteSession>) -> Self {
            Self {
                sessions: Mutex::new(sessions),
                ..Default::default()
            }
        }

        pub fn push_reservation(&self, response: ReservationResponse) {
            self.reservations.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl ProviderTransport for ScriptedTransport {
        async fn list_sessions(&self, _base: &Url) -> TransportResult<Vec<RemoteSession>> {
            if let Some(err) = self.list_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(self.sessions.lock().unwrap().clone())
        }

        async fn sign_in(&self, _base: &Url, username: &str, _secret: &str) -> TransportResult<String> {
            self.sign_ins.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{username}"))
        }

        async fn submit_reservation(
            &self,
            _base: &Url,
            request: &ReservationRequest,
        ) -> TransportResult<ReservationResponse> {
            self.reserve_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.reserve_delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.reservations.lock().unwrap().pop_front();
            Ok(scripted.unwrap_or(ReservationResponse::Confirmed {
                registration_id: format!("REG-{}", request.session_id),
            }))
        }

        async fn payment_mode(&self, _base: &Url) -> TransportResult<PaymentMode> {
            Ok(PaymentMode {
                provider_collects_payment: self.provider_collects_payment,
            })
        }

        async fn lookup_confirmation(
            &self,
            _base: &Url,
            registration_id: &str,
        ) -> TransportResult<Option<String>> {
            Ok(self.confirmations.lock().unwrap().get(registration_id).cloned())
        }

        async fn confirm(
            &self,
            _base: &Url,
            registration_id: &str,
            _payment_reference: &str,
        ) -> TransportResult<ConfirmResponse> {
            self.confirm_calls.fetch_add(1, Ordering::SeqCst);
            let confirmation_id = format!("CONF-{registration_id}");
            self.confirmations
                .lock()
                .unwrap()
                .insert(registration_id.to_string(), confirmation_id.clone());
            Ok(ConfirmResponse {
                confirmation_id: Some(confirmation_id),
                waitlisted: false,
            })
        }
    }

    /// Records every charge it accepts.
    #[derive(Default)]
    pub(crate) struct RecordingGateway {
        pub charges: Mutex<Vec<ChargeRequest>>,
    }

    #[async_trait]
    impl PaymentGateway for RecordingGateway {
        async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, PaymentError> {
            self.charges.lock().unwrap().push(request.clone());
            Ok(ChargeReceipt {
                reference: format!("pay-{}", request.idempotency_key),
                amount_cents: request.amount_cents,
            })
        }
    }

    pub(crate) fn remote(id: &str, title: &str, starts_at: chrono::DateTime<Utc>) -> RemoteSession {
        RemoteSession {
            id: id.into(),
            title: title.into(),
            url: None,
            starts_at: Some(starts_at),
            ends_at: None,
            spots_remaining: Some(5),
            location: None,
            price_cents: Some(45_000),
        }
    }

    fn ctx() -> ProviderContext {
        ProviderContext::new("https://register.campbrain.com/lakeside", "u1", "s1")
            .with_child_token("child-tok")
    }

    fn adapter(transport: Arc<ScriptedTransport>) -> CampBrainAdapter {
        CampBrainAdapter::new(transport)
    }

    #[tokio::test]
    async fn test_precheck_rules() {
        let a = adapter(Arc::new(ScriptedTransport::default()));
        assert!(a.precheck(&ctx()).await.is_ok());

        let http = ProviderContext::new("http://register.campbrain.com", "u", "s").with_child_token("c");
        assert!(!a.precheck(&http).await.is_ok());

        let lookalike = ProviderContext::new("https://campbrain.com.evil.io", "u", "s").with_child_token("c");
        assert!(!a.precheck(&lookalike).await.is_ok());

        let no_child = ProviderContext::new("https://register.campbrain.com", "u", "s");
        assert_eq!(
            a.precheck(&no_child).await,
            PrecheckResult::rejected("missing child token")
        );
    }

    #[tokio::test]
    async fn test_precheck_requires_credential_ref_when_login_needed() {
        let a = adapter(Arc::new(ScriptedTransport::default())).with_settings(CampBrainSettings {
            login_type: LoginType::EmailPassword,
            ..Default::default()
        });
        assert!(!a.precheck(&ctx()).await.is_ok());
        let with_ref = ctx().with_metadata(CREDENTIAL_REF_KEY, "vault://u1/campbrain");
        assert!(a.precheck(&with_ref).await.is_ok());
    }

    #[tokio::test]
    async fn test_find_sessions_ranks_requested_week_first() {
        let tz = chrono_tz::America::Chicago;
        let transport = Arc::new(ScriptedTransport::with_sessions(vec![
            remote("s1", "Week 2", tz.with_ymd_and_hms(2024, 6, 18, 9, 0, 0).unwrap().with_timezone(&Utc)),
            remote("s2", "Week 1", tz.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap().with_timezone(&Utc)),
        ]));
        let a = adapter(transport);
        let intent = ProviderIntent::for_week("2024-06-10");
        let found = a.find_sessions(&ctx(), Some(&intent)).await.unwrap();
        assert_eq!(found[0].id, "s2");
        assert_eq!(found[1].id, "s1");
        assert!(found[0].url.ends_with("/sessions/s2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_sessions_retries_transient_errors() {
        let transport = Arc::new(ScriptedTransport::default());
        transport
            .list_failures
            .lock()
            .unwrap()
            .push_back(TransportError::Status { status: 503, body: String::new() });
        let a = adapter(transport.clone());
        assert!(a.find_sessions(&ctx(), None).await.unwrap().is_empty());

        transport
            .list_failures
            .lock()
            .unwrap()
            .push_back(TransportError::Decode("not json".into()));
        let err = a.find_sessions(&ctx(), None).await.unwrap_err();
        assert!(!err.is_fault());
    }

    #[tokio::test]
    async fn test_reserve_maps_provider_responses() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_reservation(ReservationResponse::Challenge {
            challenge: "recaptcha".into(),
        });
        transport.push_reservation(ReservationResponse::Waitlisted);
        transport.push_reservation(ReservationResponse::Rejected {
            message: "age requirement not met".into(),
        });
        let a = adapter(transport);
        let c = ProviderSessionCandidate::new("s1", "Week 1", "https://x/s1");

        assert_eq!(
            a.reserve(&ctx(), &c).await.unwrap(),
            ReserveOutcome::NeedsCaptcha { provider: "recaptcha".into() }
        );
        assert_eq!(a.reserve(&ctx(), &c).await.unwrap(), ReserveOutcome::Waitlisted);
        assert_eq!(
            a.reserve(&ctx(), &c).await.unwrap(),
            ReserveOutcome::failed("age requirement not met")
        );
        assert_eq!(
            a.reserve(&ctx(), &c).await.unwrap(),
            ReserveOutcome::Reserved { provider_id: "REG-s1".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reserve_is_rejected() {
        let transport = Arc::new(ScriptedTransport {
            reserve_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let a = adapter(transport.clone());
        let c = ProviderSessionCandidate::new("s1", "Week 1", "https://x/s1");
        let context = ctx();

        let (first, second) = tokio::join!(a.reserve(&context, &c), a.reserve(&context, &c));
        assert!(first.unwrap().is_success());
        assert_eq!(
            second.unwrap(),
            ReserveOutcome::failed("reservation already in flight")
        );
        assert_eq!(transport.reserve_calls.load(Ordering::SeqCst), 1);

        // The guard is released once the call finishes
        assert!(a.reserve(&context, &c).await.unwrap().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_guard_is_per_registration() {
        let transport = Arc::new(ScriptedTransport {
            reserve_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let a = adapter(transport.clone());
        let c = ProviderSessionCandidate::new("101", "Week 1", "https://x/101");
        let lakeside = ProviderContext::new("https://lakeside.campbrain.com", "u1", "s1").with_child_token("child-a");
        let pinecrest = ProviderContext::new("https://pinecrest.campbrain.com", "u2", "s2").with_child_token("child-b");
        let sibling = ProviderContext::new("https://lakeside.campbrain.com", "u1", "s3").with_child_token("child-c");

        let (first, second, third) = tokio::join!(
            a.reserve(&lakeside, &c),
            a.reserve(&pinecrest, &c),
            a.reserve(&sibling, &c)
        );
        assert!(first.unwrap().is_success());
        assert!(second.unwrap().is_success());
        assert!(third.unwrap().is_success());
        assert_eq!(transport.reserve_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reserve_signs_in_with_vault_credentials() {
        let transport = Arc::new(ScriptedTransport::default());
        let vault = InMemoryCredentialVault::new().with_entry("vault://u1/cb", "parent", "pw");
        let a = adapter(transport.clone())
            .with_vault(Arc::new(vault))
            .with_settings(CampBrainSettings {
                login_type: LoginType::AccountRequired,
                ..Default::default()
            });
        let c = ProviderSessionCandidate::new("s1", "Week 1", "https://x/s1");

        let missing = ctx().with_metadata(CREDENTIAL_REF_KEY, "vault://nobody");
        assert!(matches!(a.reserve(&missing, &c).await.unwrap(), ReserveOutcome::Failed { .. }));

        let good = ctx().with_metadata(CREDENTIAL_REF_KEY, "vault://u1/cb");
        assert!(a.reserve(&good, &c).await.unwrap().is_success());
        assert_eq!(transport.sign_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::default());
        let gateway = Arc::new(RecordingGateway::default());
        let a = adapter(transport.clone()).with_payments(gateway.clone());
        let mut c = ProviderSessionCandidate::new("s1", "Week 1", "https://x/s1").with_price(45_000);
        c.provider_id = Some("REG-s1".into());

        let first = a.finalize_payment(&ctx(), &c).await.unwrap();
        assert_eq!(
            first,
            FinalizeOutcome::Confirmed {
                confirmation_id: "CONF-REG-s1".into(),
                charged: ChargeKind::FullPrice { cents: 45_000 },
            }
        );
        let second = a.finalize_payment(&ctx(), &c).await.unwrap();
        assert_eq!(
            second,
            FinalizeOutcome::Confirmed {
                confirmation_id: "CONF-REG-s1".into(),
                charged: ChargeKind::AlreadyCharged,
            }
        );
        let charges = gateway.charges.lock().unwrap();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].idempotency_key, "s1:s1");
        assert_eq!(transport.confirm_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finalize_charges_service_fee_when_provider_collects() {
        let transport = Arc::new(ScriptedTransport {
            provider_collects_payment: true,
            ..Default::default()
        });
        let gateway = Arc::new(RecordingGateway::default());
        let a = adapter(transport).with_payments(gateway.clone());
        let mut c = ProviderSessionCandidate::new("s1", "Week 1", "https://x/s1").with_price(45_000);
        c.provider_id = Some("REG-s1".into());

        match a.finalize_payment(&ctx(), &c).await.unwrap() {
            FinalizeOutcome::Confirmed { charged, .. } => assert_eq!(
                charged,
                ChargeKind::ServiceFeeOnly { cents: DEFAULT_SERVICE_FEE_CENTS }
            ),
            other => panic!("expected confirmation, got {other:?}"),
        }
        assert_eq!(gateway.charges.lock().unwrap()[0].amount_cents, DEFAULT_SERVICE_FEE_CENTS);
    }

    #[tokio::test]
    async fn test_profile_payment_flag_skips_payment_mode_lookup() {
        // the site itself would report that we collect the full price
        let transport = Arc::new(ScriptedTransport::default());
        let gateway = Arc::new(RecordingGateway::default());
        let profile = ProviderProfile {
            provider_collects_payment: true,
            ..ProviderProfile::new(Platform::CampBrain, vec!["*.campbrain.com"])
        };
        let a = adapter(transport)
            .with_payments(gateway.clone())
            .with_settings(CampBrainSettings::for_profile(&profile));
        let mut c = ProviderSessionCandidate::new("s1", "Week 1", "https://x/s1").with_price(45_000);
        c.provider_id = Some("REG-s1".into());

        match a.finalize_payment(&ctx(), &c).await.unwrap() {
            FinalizeOutcome::Confirmed { charged, .. } => assert_eq!(
                charged,
                ChargeKind::ServiceFeeOnly { cents: DEFAULT_SERVICE_FEE_CENTS }
            ),
            other => panic!("expected confirmation, got {other:?}"),
        }
        assert_eq!(gateway.charges.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_without_gateway_or_reservation_fails() {
        let a = adapter(Arc::new(ScriptedTransport::default()));
        let c = ProviderSessionCandidate::new("s1", "Week 1", "https://x/s1").with_price(100);
        assert_eq!(
            a.finalize_payment(&ctx(), &c).await.unwrap(),
            FinalizeOutcome::failed("candidate has not been reserved")
        );

        let mut reserved = c.clone();
        reserved.provider_id = Some("REG-s1".into());
        assert_eq!(
            a.finalize_payment(&ctx(), &reserved).await.unwrap(),
            FinalizeOutcome::failed("no payment gateway configured")
        );
    }
}
