//! Drives one provider run through the adapter lifecycle.
//!
//! Order per run: registry lookup, trust authorization, `precheck`,
//! `find_sessions`, registration lock, `reserve`, `finalize_payment`,
//! lock release. Whenever the parent has to act (CAPTCHA, account
//! creation, payment approval) the run parks: an assistance request is
//! queued, the parent is notified, and [`Orchestrator::resume`] picks the
//! run back up once the request is resolved.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::OrchestrationConfig;
use crate::lock::{InMemoryLockStore, LockError, RegistrationLock, RegistrationLockManager};
use crate::notify::{
    InMemoryNotificationStore, NotificationDelivery, NotificationEngine, NotificationOptions,
    NotificationPriority, NotificationTemplate, NotifyError, UrgencyLevel,
};
use crate::provider::{
    AdapterError, AdapterRegistry, CaptchaSolver, ChargeKind, FinalizeOutcome, LoginType, Platform,
    PrecheckResult, ProviderAdapter, ProviderContext, ProviderIntent, ProviderProfile,
    ProviderSessionCandidate, ReserveOutcome, CREDENTIAL_REF_KEY,
};
use crate::registry::{hostname, ProviderRegistry, RegistryError};
use crate::trust::{AutomationType, InMemoryTrustStore, TrustError, TrustGate};
use crate::workflow::{
    AssistanceKind, AssistancePriority, AssistanceRequest, AssistanceStatus, AssistanceWorkflow,
    InMemoryWorkflowStore, JsonFileWorkflowStore, SessionWorkflows, WorkflowError, WorkflowStore,
};

/// Parent response key carrying a confirmation the parent obtained themselves.
pub const CONFIRMATION_ID_KEY: &str = "confirmation_id";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No provider profile matches {url}")]
    PlatformNotRecognized { url: String },

    #[error("Automation not authorized for {url}: {reason}")]
    NotAuthorized { url: String, reason: String },

    #[error("Registration {key} is locked by {owner}")]
    RegistrationLocked { key: String, owner: String },

    #[error("A run for session {0} is already in progress")]
    RunInProgress(String),

    #[error("{host} already has {limit} runs in progress")]
    ProviderBusy { host: String, limit: u32 },

    #[error("Session {session_id} is waiting on assistance request {request_id}")]
    AwaitingAssistance {
        session_id: String,
        request_id: String,
    },

    #[error("Session {0} has no parked run")]
    NoPendingRun(String),

    /// An adapter returned something it should have folded into an outcome
    #[error("Adapter fault in {platform} {stage}: {message}")]
    AdapterFault {
        platform: Platform,
        stage: &'static str,
        message: String,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Lock(LockError),
}

impl From<LockError> for OrchestratorError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { key, owner, .. } => Self::RegistrationLocked { key, owner },
            other => Self::Lock(other),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// How a run ended (or where it parked).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Confirmed {
        candidate: ProviderSessionCandidate,
        confirmation_id: String,
        charged: ChargeKind,
    },
    Waitlisted {
        candidate_id: String,
    },
    /// Parked until the parent resolves `request_id`
    AwaitingAssistance {
        request_id: String,
        kind: AssistanceKind,
        notification_id: String,
    },
    NoSessions,
    PrecheckFailed {
        reason: String,
    },
    DiscoveryFailed {
        reason: String,
    },
    ReserveFailed {
        reason: String,
    },
    FinalizeFailed {
        reason: String,
    },
    AssistanceFailed {
        request_id: String,
        reason: String,
    },
}

impl RunOutcome {
    /// Whether the parent has to do something before this run can succeed.
    pub fn needs_parent_input(&self) -> bool {
        matches!(
            self,
            Self::AwaitingAssistance { .. }
                | Self::PrecheckFailed { .. }
                | Self::FinalizeFailed { .. }
                | Self::AssistanceFailed { .. }
        )
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

/// Where a parked run picks up again.
#[derive(Debug, Clone)]
enum ResumePoint {
    /// Nothing reserved yet; start over from discovery
    Discover { intent: Option<ProviderIntent> },
    /// Seat not held yet; retry reserve on the same candidate
    Reserve {
        candidate: ProviderSessionCandidate,
        lock: RegistrationLock,
    },
    /// Seat held; finalize once the parent approves payment
    Finalize {
        candidate: ProviderSessionCandidate,
        lock: RegistrationLock,
    },
}

impl ResumePoint {
    fn stage(&self) -> &'static str {
        match self {
            Self::Discover { .. } => "discover",
            Self::Reserve { .. } => "reserve",
            Self::Finalize { .. } => "finalize",
        }
    }

    fn candidate(&self) -> Option<&ProviderSessionCandidate> {
        match self {
            Self::Discover { .. } => None,
            Self::Reserve { candidate, .. } | Self::Finalize { candidate, .. } => Some(candidate),
        }
    }

    fn into_lock(self) -> Option<RegistrationLock> {
        match self {
            Self::Discover { .. } => None,
            Self::Reserve { lock, .. } | Self::Finalize { lock, .. } => Some(lock),
        }
    }
}

#[derive(Debug, Clone)]
struct ParkedRun {
    request_id: String,
    notification_id: String,
    point: ResumePoint,
}

/// One lifecycle call per session at a time; released on drop.
struct RunSlot<'a> {
    active: &'a StdMutex<HashSet<String>>,
    session_id: String,
}

impl<'a> RunSlot<'a> {
    fn acquire(active: &'a StdMutex<HashSet<String>>, session_id: &str) -> OrchestratorResult<Self> {
        let mut set = active.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(session_id.to_string()) {
            return Err(OrchestratorError::RunInProgress(session_id.to_string()));
        }
        Ok(Self {
            active,
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        let mut set = self.active.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.session_id);
    }
}

/// Counts runs talking to one host, capped at the tuned concurrency limit.
struct HostSlot<'a> {
    load: &'a StdMutex<HashMap<String, u32>>,
    host: String,
}

impl<'a> HostSlot<'a> {
    fn acquire(load: &'a StdMutex<HashMap<String, u32>>, host: &str, limit: u32) -> OrchestratorResult<Self> {
        let mut map = load.lock().unwrap_or_else(|e| e.into_inner());
        let running = map.entry(host.to_string()).or_insert(0);
        let limit = limit.max(1);
        if *running >= limit {
            return Err(OrchestratorError::ProviderBusy {
                host: host.to_string(),
                limit,
            });
        }
        *running += 1;
        Ok(Self {
            load,
            host: host.to_string(),
        })
    }
}

impl Drop for HostSlot<'_> {
    fn drop(&mut self) {
        let mut map = self.load.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = map.get_mut(&self.host) {
            *running = running.saturating_sub(1);
            if *running == 0 {
                map.remove(&self.host);
            }
        }
    }
}

pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    adapters: AdapterRegistry,
    trust: Arc<TrustGate>,
    workflows: SessionWorkflows,
    notifications: Arc<NotificationEngine>,
    locks: RegistrationLockManager,
    captcha: Option<Arc<dyn CaptchaSolver>>,
    active: StdMutex<HashSet<String>>,
    host_load: StdMutex<HashMap<String, u32>>,
    parked: Mutex<HashMap<String, ParkedRun>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        adapters: AdapterRegistry,
        trust: Arc<TrustGate>,
        workflows: SessionWorkflows,
        notifications: Arc<NotificationEngine>,
        locks: RegistrationLockManager,
    ) -> Self {
        Self {
            registry,
            adapters,
            trust,
            workflows,
            notifications,
            locks,
            captcha: None,
            active: StdMutex::new(HashSet::new()),
            host_load: StdMutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Wire every subsystem from `config` with in-memory stores. Session
    /// workflows are file-backed when `workflow.state_dir` is set.
    pub fn from_config(
        config: &OrchestrationConfig,
        registry: Arc<ProviderRegistry>,
        adapters: AdapterRegistry,
        delivery: Arc<dyn NotificationDelivery>,
        clock: SharedClock,
    ) -> Self {
        let trust = TrustGate::new(
            config.trust.clone(),
            clock.clone(),
            Arc::new(InMemoryTrustStore::new()),
        );
        let workflow_store: Arc<dyn WorkflowStore> = match &config.workflow.state_dir {
            Some(dir) => Arc::new(JsonFileWorkflowStore::new(dir.clone())),
            None => Arc::new(InMemoryWorkflowStore::new()),
        };
        let workflows = SessionWorkflows::new(workflow_store, clock.clone(), &config.workflow);
        let notifications = NotificationEngine::new(
            Arc::new(InMemoryNotificationStore::new()),
            delivery,
            clock.clone(),
            config.notify.clone(),
        );
        let locks = RegistrationLockManager::new(Arc::new(InMemoryLockStore::new()), clock, &config.lock);
        Self::new(
            registry,
            adapters,
            Arc::new(trust),
            workflows,
            Arc::new(notifications),
            locks,
        )
    }

    pub fn with_captcha_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.captcha = Some(solver);
        self
    }

    /// Assistance workflow of one provider run.
    pub async fn workflow(&self, session_id: &str) -> OrchestratorResult<AssistanceWorkflow> {
        Ok(self.workflows.for_session(session_id).await?)
    }

    pub fn notifications(&self) -> &Arc<NotificationEngine> {
        &self.notifications
    }

    pub fn trust(&self) -> &TrustGate {
        &self.trust
    }

    pub fn locks(&self) -> &RegistrationLockManager {
        &self.locks
    }

    /// Run the full lifecycle for `ctx`.
    ///
    /// Refused while another call for the same session is running or while
    /// an assistance request tied to the session is unresolved.
    pub async fn run(
        &self,
        ctx: ProviderContext,
        intent: Option<&ProviderIntent>,
    ) -> OrchestratorResult<RunOutcome> {
        let _slot = RunSlot::acquire(&self.active, &ctx.session_id)?;
        let workflow = self.workflow(&ctx.session_id).await?;
        if let Some(request) = workflow.unresolved_for_session(&ctx.session_id).await {
            return Err(OrchestratorError::AwaitingAssistance {
                session_id: ctx.session_id,
                request_id: request.id,
            });
        }
        info!(session_id = %ctx.session_id, url = %ctx.canonical_url, "Provider run started");
        self.drive(ctx, intent).await
    }

    /// Continue a parked run once its assistance request is resolved.
    pub async fn resume(&self, ctx: ProviderContext) -> OrchestratorResult<RunOutcome> {
        let _slot = RunSlot::acquire(&self.active, &ctx.session_id)?;
        let parked = self
            .parked
            .lock()
            .await
            .get(&ctx.session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoPendingRun(ctx.session_id.clone()))?;
        let request = self
            .workflow(&ctx.session_id)
            .await?
            .get(&parked.request_id)
            .await
            .ok_or_else(|| WorkflowError::NotFound(parked.request_id.clone()))?;

        match request.status {
            AssistanceStatus::Completed | AssistanceStatus::Failed => {}
            _ => {
                return Err(OrchestratorError::AwaitingAssistance {
                    session_id: ctx.session_id,
                    request_id: request.id,
                })
            }
        }
        self.parked.lock().await.remove(&ctx.session_id);
        if let Err(e) = self.notifications.mark_completed(&parked.notification_id).await {
            warn!(notification_id = %parked.notification_id, error = %e, "Could not close notification");
        }

        if request.status == AssistanceStatus::Failed {
            if let Some(lock) = parked.point.into_lock() {
                self.release(&lock).await;
            }
            let reason = request
                .failure_reason
                .unwrap_or_else(|| "assistance request failed".to_string());
            warn!(session_id = %ctx.session_id, request_id = %request.id, %reason, "Parked run abandoned");
            return Ok(RunOutcome::AssistanceFailed {
                request_id: request.id,
                reason,
            });
        }

        let mut ctx = ctx;
        let response = request.parent_response.unwrap_or_default();
        if let Some(reference) = response.get(CREDENTIAL_REF_KEY).and_then(|v| v.as_str()) {
            ctx.metadata
                .insert(CREDENTIAL_REF_KEY.to_string(), reference.to_string());
        }
        info!(session_id = %ctx.session_id, stage = parked.point.stage(), "Resuming provider run");

        match parked.point {
            ResumePoint::Discover { intent } => self.drive(ctx, intent.as_ref()).await,
            ResumePoint::Reserve { candidate, lock } => {
                let (adapter, lock, _host) = self.reauthorize(&mut ctx, lock).await?;
                self.reserve(&ctx, adapter.as_ref(), candidate, lock, false).await
            }
            ResumePoint::Finalize { candidate, lock } => {
                if let Some(confirmation_id) = response.get(CONFIRMATION_ID_KEY).and_then(|v| v.as_str()) {
                    self.release(&lock).await;
                    info!(session_id = %ctx.session_id, confirmation_id, "Parent completed registration directly");
                    return Ok(RunOutcome::Confirmed {
                        candidate,
                        confirmation_id: confirmation_id.to_string(),
                        charged: ChargeKind::AlreadyCharged,
                    });
                }
                let (adapter, lock, _host) = self.reauthorize(&mut ctx, lock).await?;
                self.finalize(&ctx, adapter.as_ref(), candidate, lock, true).await
            }
        }
    }

    /// Resolve the profile and check trust. Fills `ctx.tuning`.
    async fn authorize(&self, ctx: &mut ProviderContext) -> OrchestratorResult<ProviderProfile> {
        let url = ctx.canonical_url.clone();
        let profile = self
            .registry
            .detect_platform(&url)
            .await?
            .ok_or_else(|| OrchestratorError::PlatformNotRecognized { url: url.clone() })?;

        let verdict = self.trust.classify(&url);
        let denied = |reason: String| {
            warn!(%url, %reason, "Provider run not authorized");
            OrchestratorError::NotAuthorized {
                url: url.clone(),
                reason,
            }
        };
        if !verdict.can_proceed {
            return Err(denied(verdict.reason));
        }
        if verdict.requires_consent && !ctx.consent_granted {
            return Err(denied(format!("{}; parent consent not granted", verdict.reason)));
        }
        let decision = self
            .trust
            .is_automation_allowed(&url, AutomationType::FormAutomation)
            .await?;
        if !decision.allowed {
            return Err(denied(decision.reason));
        }

        ctx.tuning = self.trust.tuning(&url).await?;
        debug!(
            %url,
            platform = %profile.platform,
            compliance = %verdict.status,
            confidence = decision.confidence,
            "Provider run authorized"
        );
        Ok(profile)
    }

    /// Re-check trust for a resumed run and refresh its lock. The lock is
    /// released when authorization no longer holds or the host is at its
    /// concurrency limit.
    async fn reauthorize(
        &self,
        ctx: &mut ProviderContext,
        lock: RegistrationLock,
    ) -> OrchestratorResult<(Arc<dyn ProviderAdapter>, RegistrationLock, HostSlot<'_>)> {
        let admitted = match self.authorize(ctx).await {
            Ok(profile) => self.admit(ctx).map(|slot| (profile, slot)),
            Err(e) => Err(e),
        };
        let (profile, slot) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                self.release(&lock).await;
                return Err(e);
            }
        };
        let lock = self.locks.acquire(&lock.key, &lock.owner).await?;
        Ok((self.adapters.get(profile.platform), lock, slot))
    }

    fn admit(&self, ctx: &ProviderContext) -> OrchestratorResult<HostSlot<'_>> {
        let host = hostname(&ctx.canonical_url).unwrap_or_default();
        HostSlot::acquire(&self.host_load, &host, ctx.tuning.concurrency_limit)
    }

    async fn drive(
        &self,
        mut ctx: ProviderContext,
        intent: Option<&ProviderIntent>,
    ) -> OrchestratorResult<RunOutcome> {
        let profile = self.authorize(&mut ctx).await?;
        let _host = self.admit(&ctx)?;
        let platform = profile.platform;
        let adapter = self.adapters.get(platform);

        if profile.login_type == LoginType::AccountRequired && ctx.metadata(CREDENTIAL_REF_KEY).is_none() {
            info!(session_id = %ctx.session_id, %platform, "Provider account required");
            return self
                .park(
                    &ctx,
                    AssistanceKind::AccountCreation,
                    AssistancePriority::Medium,
                    ResumePoint::Discover {
                        intent: intent.cloned(),
                    },
                )
                .await;
        }

        if let PrecheckResult::Rejected { reason } = adapter.precheck(&ctx).await {
            warn!(session_id = %ctx.session_id, %platform, %reason, "Precheck rejected");
            return Ok(RunOutcome::PrecheckFailed { reason });
        }

        let candidates = match adapter.find_sessions(&ctx, intent).await {
            Ok(candidates) => candidates,
            Err(e) => return self.adapter_error(platform, "find_sessions", e),
        };
        // Ranked order; a full session is only tried when nothing else is left
        let Some(candidate) = candidates
            .iter()
            .find(|c| !c.is_full())
            .or_else(|| candidates.first())
            .cloned()
        else {
            info!(session_id = %ctx.session_id, %platform, "No sessions matched");
            return Ok(RunOutcome::NoSessions);
        };

        let host = hostname(&ctx.canonical_url).unwrap_or_default();
        let key = RegistrationLockManager::registration_key(
            &host,
            &candidate.id,
            ctx.child_token.as_deref().unwrap_or_default(),
        );
        let lock = self.locks.acquire(&key, &ctx.session_id).await?;
        self.reserve(&ctx, adapter.as_ref(), candidate, lock, true).await
    }

    /// Reserve with the lock held. The lock travels into finalize or a
    /// parked run; every other ending releases it.
    async fn reserve(
        &self,
        ctx: &ProviderContext,
        adapter: &dyn ProviderAdapter,
        mut candidate: ProviderSessionCandidate,
        lock: RegistrationLock,
        mut try_solver: bool,
    ) -> OrchestratorResult<RunOutcome> {
        let outcome = loop {
            let started = Instant::now();
            let outcome = match adapter.reserve(ctx, &candidate).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.release(&lock).await;
                    return self.adapter_error(adapter.platform(), "reserve", e);
                }
            };
            let succeeded = !matches!(outcome, ReserveOutcome::Failed { .. });
            self.record_attempt(&ctx.canonical_url, succeeded, started).await;

            if let ReserveOutcome::NeedsCaptcha { provider } = &outcome {
                if try_solver {
                    match self.solve_captcha(ctx, &candidate, provider).await {
                        Ok(true) => {
                            try_solver = false;
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            self.release(&lock).await;
                            return Err(e);
                        }
                    }
                }
            }
            break outcome;
        };

        match outcome {
            ReserveOutcome::Reserved { provider_id } => {
                info!(session_id = %ctx.session_id, candidate = %candidate.id, %provider_id, "Seat reserved");
                candidate.provider_id = Some(provider_id);
                self.finalize(ctx, adapter, candidate, lock, false).await
            }
            ReserveOutcome::Waitlisted => {
                self.release(&lock).await;
                info!(session_id = %ctx.session_id, candidate = %candidate.id, "Waitlisted");
                Ok(RunOutcome::Waitlisted {
                    candidate_id: candidate.id,
                })
            }
            ReserveOutcome::NeedsCaptcha { provider } => {
                info!(session_id = %ctx.session_id, candidate = %candidate.id, %provider, "Human verification required");
                self.park(
                    ctx,
                    AssistanceKind::Captcha,
                    AssistancePriority::High,
                    ResumePoint::Reserve { candidate, lock },
                )
                .await
            }
            ReserveOutcome::Failed { reason } => {
                self.release(&lock).await;
                warn!(session_id = %ctx.session_id, candidate = %candidate.id, %reason, "Reserve failed");
                Ok(RunOutcome::ReserveFailed { reason })
            }
        }
    }

    /// Try the automated solver, if one is configured and trust permits it.
    async fn solve_captcha(
        &self,
        ctx: &ProviderContext,
        candidate: &ProviderSessionCandidate,
        provider: &str,
    ) -> OrchestratorResult<bool> {
        let Some(solver) = &self.captcha else {
            return Ok(false);
        };
        let decision = self
            .trust
            .is_automation_allowed(&ctx.canonical_url, AutomationType::CaptchaPrevention)
            .await?;
        if !decision.allowed {
            debug!(url = %ctx.canonical_url, reason = %decision.reason, "Automated CAPTCHA solving not permitted");
            return Ok(false);
        }
        let solved = solver.solve(ctx, candidate, provider).await;
        info!(candidate = %candidate.id, provider, solved, "Automated CAPTCHA attempt");
        Ok(solved)
    }

    async fn finalize(
        &self,
        ctx: &ProviderContext,
        adapter: &dyn ProviderAdapter,
        candidate: ProviderSessionCandidate,
        lock: RegistrationLock,
        payment_approved: bool,
    ) -> OrchestratorResult<RunOutcome> {
        if !payment_approved {
            let decision = match self
                .trust
                .is_automation_allowed(&ctx.canonical_url, AutomationType::PaymentProcessing)
                .await
            {
                Ok(decision) => decision,
                Err(e) => {
                    self.release(&lock).await;
                    return Err(e.into());
                }
            };
            if !decision.allowed {
                info!(session_id = %ctx.session_id, reason = %decision.reason, "Payment needs parent approval");
                return self
                    .park(
                        ctx,
                        AssistanceKind::Payment,
                        AssistancePriority::High,
                        ResumePoint::Finalize { candidate, lock },
                    )
                    .await;
            }
        }

        let started = Instant::now();
        let result = adapter.finalize_payment(ctx, &candidate).await;
        self.release(&lock).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return self.adapter_error(adapter.platform(), "finalize_payment", e),
        };
        self.record_attempt(
            &ctx.canonical_url,
            !matches!(outcome, FinalizeOutcome::Failed { .. }),
            started,
        )
        .await;

        Ok(match outcome {
            FinalizeOutcome::Confirmed {
                confirmation_id,
                charged,
            } => {
                info!(session_id = %ctx.session_id, candidate = %candidate.id, %confirmation_id, "Registration confirmed");
                RunOutcome::Confirmed {
                    candidate,
                    confirmation_id,
                    charged,
                }
            }
            FinalizeOutcome::Waitlisted => RunOutcome::Waitlisted {
                candidate_id: candidate.id,
            },
            FinalizeOutcome::Failed { error } => {
                warn!(session_id = %ctx.session_id, candidate = %candidate.id, %error, "Finalize failed");
                RunOutcome::FinalizeFailed { reason: error }
            }
        })
    }

    /// Queue an assistance request, notify the parent and remember where
    /// to pick up. A held lock stays held while the run is parked.
    async fn park(
        &self,
        ctx: &ProviderContext,
        kind: AssistanceKind,
        priority: AssistancePriority,
        point: ResumePoint,
    ) -> OrchestratorResult<RunOutcome> {
        match self.request_assistance(ctx, kind, priority, &point).await {
            Ok((request_id, notification_id)) => {
                self.parked.lock().await.insert(
                    ctx.session_id.clone(),
                    ParkedRun {
                        request_id: request_id.clone(),
                        notification_id: notification_id.clone(),
                        point,
                    },
                );
                Ok(RunOutcome::AwaitingAssistance {
                    request_id,
                    kind,
                    notification_id,
                })
            }
            Err(e) => {
                if let Some(lock) = point.into_lock() {
                    self.release(&lock).await;
                }
                Err(e)
            }
        }
    }

    async fn request_assistance(
        &self,
        ctx: &ProviderContext,
        kind: AssistanceKind,
        priority: AssistancePriority,
        point: &ResumePoint,
    ) -> OrchestratorResult<(String, String)> {
        let candidate = point.candidate();
        let request = AssistanceRequest::new(kind, point.stage(), priority)
            .for_session(&ctx.session_id)
            .with_context(json!({
                "url": ctx.canonical_url,
                "candidate": candidate,
            }));
        let workflow = self.workflow(&ctx.session_id).await?;
        let request = workflow.enqueue(request).await?;
        workflow.start().await?;

        let mut options = NotificationOptions::new(
            ctx.user_id.clone(),
            template_for(kind, &ctx.canonical_url, candidate),
            notification_priority(priority),
        )
        .with_escalation(self.notifications.config().escalation_rules.clone());
        if let Some(candidate) = candidate {
            options = options.with_action_url(candidate.url.clone());
        }
        let notification = self.notifications.send_notification(options).await?;

        info!(
            session_id = %ctx.session_id,
            request_id = %request.id,
            notification_id = %notification.id,
            %kind,
            "Run parked for parent assistance"
        );
        Ok((request.id, notification.id))
    }

    fn adapter_error(
        &self,
        platform: Platform,
        stage: &'static str,
        err: AdapterError,
    ) -> OrchestratorResult<RunOutcome> {
        match err {
            AdapterError::ProviderUnavailable { reason } => {
                warn!(%platform, stage, %reason, "Provider unavailable");
                Ok(RunOutcome::DiscoveryFailed { reason })
            }
            AdapterError::Fault { message } => {
                error!(%platform, stage, %message, "Adapter fault");
                Err(OrchestratorError::AdapterFault {
                    platform,
                    stage,
                    message,
                })
            }
        }
    }

    async fn record_attempt(&self, url: &str, success: bool, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = self.trust.record_attempt(url, success, elapsed_ms).await {
            warn!(url, error = %e, "Could not record trust metrics");
        }
    }

    async fn release(&self, lock: &RegistrationLock) {
        if let Err(e) = self.locks.release(lock).await {
            warn!(key = %lock.key, error = %e, "Registration lock release failed");
        }
    }
}

fn notification_priority(priority: AssistancePriority) -> NotificationPriority {
    match priority {
        AssistancePriority::Low => NotificationPriority::Low,
        AssistancePriority::Medium => NotificationPriority::Medium,
        AssistancePriority::High => NotificationPriority::High,
    }
}

fn template_for(
    kind: AssistanceKind,
    url: &str,
    candidate: Option<&ProviderSessionCandidate>,
) -> NotificationTemplate {
    let host = hostname(url).unwrap_or_else(|| url.to_string());
    let session = candidate.map_or("your session", |c| c.title.as_str());
    let (title, message, urgency) = match kind {
        AssistanceKind::Captcha => (
            "Verification needed",
            format!("{session} on {host} needs a quick check to hold your spot."),
            UrgencyLevel::Urgent,
        ),
        AssistanceKind::Payment => (
            "Approve payment",
            format!("A seat in {session} is held. Approve payment to confirm it."),
            UrgencyLevel::Urgent,
        ),
        AssistanceKind::AccountCreation => (
            "Provider account needed",
            format!("{host} requires an account before we can register."),
            UrgencyLevel::Normal,
        ),
        AssistanceKind::FormCompletion => (
            "More details needed",
            format!("{host} is asking for information only you can provide."),
            UrgencyLevel::Normal,
        ),
    };
    NotificationTemplate {
        kind: kind.into(),
        title: title.to_string(),
        message,
        urgency,
    }
}
