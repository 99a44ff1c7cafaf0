//! End-to-end provider runs through the public API.
//!
//! A scripted CampBrain site stands in for the network. Covers:
//! - profiles and config loaded from TOML files
//! - week-of ranking driving which session gets reserved
//! - CAPTCHA → assistance request → immediate notification → resume
//! - service-fee-only charging when the provider collects its own price
//! - idempotent finalize

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use orchestration::clock::ManualClock;
use orchestration::notify::{
    DeliveryMethod, NotificationDelivery, NotificationPriority, NotificationRecord, NotifyResult,
};
use orchestration::provider::http::{
    ConfirmResponse, PaymentMode, RemoteSession, ReservationRequest, ReservationResponse,
    TransportResult,
};
use orchestration::provider::{
    AdapterRegistry, CampBrainAdapter, ChargeKind, ChargeReceipt, ChargeRequest, FinalizeOutcome,
    PaymentError, PaymentGateway, Platform, ProviderAdapter, ProviderContext, ProviderIntent,
    ProviderTransport, ReserveOutcome,
};
use orchestration::registry::{ProviderRegistry, TomlProfileSource};
use orchestration::workflow::{AssistanceKind, AssistancePriority, WorkflowEvent};
use orchestration::{OrchestrationConfig, Orchestrator, RunOutcome};
use serde_json::json;
use url::Url;

const URL: &str = "https://lakeside.campbrain.com/summer";

// ── Fakes ──────────────────────────────────────────────────────────

#[derive(Default)]
struct LakesideSite {
    sessions: Vec<RemoteSession>,
    reservations: Mutex<VecDeque<ReservationResponse>>,
    confirmed: Mutex<HashMap<String, String>>,
    reserve_calls: AtomicU32,
}

impl LakesideSite {
    fn new() -> Self {
        let session = |id: &str, title: &str, starts_at: DateTime<Utc>| RemoteSession {
            id: id.into(),
            title: title.into(),
            url: None,
            starts_at: Some(starts_at),
            ends_at: None,
            spots_remaining: Some(4),
            location: Some("Lakeside Park".into()),
            price_cents: Some(32_500),
        };
        Self {
            sessions: vec![
                session("art-0701", "Art Camp", Utc.with_ymd_and_hms(2024, 7, 1, 14, 0, 0).unwrap()),
                session("soc-0708", "Soccer Camp", Utc.with_ymd_and_hms(2024, 7, 8, 14, 0, 0).unwrap()),
                session("soc-0715", "Soccer Camp", Utc.with_ymd_and_hms(2024, 7, 15, 14, 0, 0).unwrap()),
                // Sunday 23:30 in Chicago, still the week of July 8
                session("soc-late", "Soccer Camp (evening)", Utc.with_ymd_and_hms(2024, 7, 15, 4, 30, 0).unwrap()),
            ],
            ..Default::default()
        }
    }
}

#[async_trait]
impl ProviderTransport for LakesideSite {
    async fn list_sessions(&self, _base: &Url) -> TransportResult<Vec<RemoteSession>> {
        Ok(self.sessions.clone())
    }

    async fn sign_in(&self, _base: &Url, username: &str, _secret: &str) -> TransportResult<String> {
        Ok(format!("tok-{username}"))
    }

    async fn submit_reservation(
        &self,
        _base: &Url,
        request: &ReservationRequest,
    ) -> TransportResult<ReservationResponse> {
        self.reserve_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.reservations.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or(ReservationResponse::Confirmed {
            registration_id: format!("LS-{}", request.session_id),
        }))
    }

    async fn payment_mode(&self, _base: &Url) -> TransportResult<PaymentMode> {
        Ok(PaymentMode {
            provider_collects_payment: true,
        })
    }

    async fn lookup_confirmation(&self, _base: &Url, registration_id: &str) -> TransportResult<Option<String>> {
        Ok(self.confirmed.lock().unwrap().get(registration_id).cloned())
    }

    async fn confirm(
        &self,
        _base: &Url,
        registration_id: &str,
        _payment_reference: &str,
    ) -> TransportResult<ConfirmResponse> {
        let id = format!("C-{registration_id}");
        self.confirmed
            .lock()
            .unwrap()
            .insert(registration_id.to_string(), id.clone());
        Ok(ConfirmResponse {
            confirmation_id: Some(id),
            waitlisted: false,
        })
    }
}

#[derive(Default)]
struct Ledger {
    charges: Mutex<Vec<ChargeRequest>>,
}

#[async_trait]
impl PaymentGateway for Ledger {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, PaymentError> {
        self.charges.lock().unwrap().push(request.clone());
        Ok(ChargeReceipt {
            reference: format!("ch_{}", self.charges.lock().unwrap().len()),
            amount_cents: request.amount_cents,
        })
    }
}

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, DeliveryMethod, NotificationPriority)>>,
}

#[async_trait]
impl NotificationDelivery for Outbox {
    async fn deliver(
        &self,
        record: &NotificationRecord,
        method: DeliveryMethod,
        priority: NotificationPriority,
    ) -> NotifyResult<()> {
        self.sent.lock().unwrap().push((record.id.clone(), method, priority));
        Ok(())
    }
}

struct World {
    orchestrator: Orchestrator,
    site: Arc<LakesideSite>,
    ledger: Arc<Ledger>,
    outbox: Arc<Outbox>,
    _dir: tempfile::TempDir,
}

fn world() -> World {
    let dir = tempfile::tempdir().unwrap();
    let profiles = dir.path().join("profiles.toml");
    std::fs::write(
        &profiles,
        r#"
        [[profiles]]
        name = "CampBrain"
        platform = "campbrain"
        domain_patterns = ["*.campbrain.com"]
        captcha_expected = true

        [[profiles]]
        name = "Shopify"
        platform = "shopify"
        domain_patterns = ["*.myshopify.com"]
        "#,
    )
    .unwrap();
    let config_path = dir.path().join("signup.toml");
    std::fs::write(
        &config_path,
        r#"
        default_timezone = "America/Chicago"

        [workflow]
        advance_delay_ms = 10
        "#,
    )
    .unwrap();
    let config = OrchestrationConfig::load(&config_path).unwrap();

    let site = Arc::new(LakesideSite::new());
    let ledger = Arc::new(Ledger::default());
    let outbox = Arc::new(Outbox::default());
    let adapter = CampBrainAdapter::new(site.clone()).with_payments(ledger.clone());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());

    let orchestrator = Orchestrator::from_config(
        &config,
        Arc::new(ProviderRegistry::new(Arc::new(TomlProfileSource::new(profiles)))),
        AdapterRegistry::new().with(Arc::new(adapter)),
        outbox.clone(),
        Arc::new(clock),
    );
    World {
        orchestrator,
        site,
        ledger,
        outbox,
        _dir: dir,
    }
}

fn ctx(session: &str) -> ProviderContext {
    ProviderContext::new(URL, "parent-7", session)
        .with_child_token("child-ref-42")
        .with_consent()
}

fn soccer_week_of_july_8() -> ProviderIntent {
    ProviderIntent::for_week("2024-07-08").with_title("soccer")
}

// ── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_week_matched_session_is_reserved_and_fee_charged() {
    let w = world();
    let outcome = w
        .orchestrator
        .run(ctx("run-1"), Some(&soccer_week_of_july_8()))
        .await
        .unwrap();

    let RunOutcome::Confirmed {
        candidate,
        confirmation_id,
        charged,
    } = outcome
    else {
        panic!("expected confirmation, got {outcome:?}");
    };
    assert_eq!(candidate.id, "soc-0708");
    assert_eq!(candidate.provider_id.as_deref(), Some("LS-soc-0708"));
    assert_eq!(confirmation_id, "C-LS-soc-0708");
    assert_eq!(charged, ChargeKind::ServiceFeeOnly { cents: 2_000 });

    let charges = w.ledger.charges.lock().unwrap();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].amount_cents, 2_000);
    assert_eq!(charges[0].idempotency_key, "run-1:soc-0708");
    assert!(w.outbox.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_captcha_round_trip_through_assistance() {
    let w = world();
    let workflow = w.orchestrator.workflow("run-1").await.unwrap();
    let mut events = workflow.subscribe();
    w.site
        .reservations
        .lock()
        .unwrap()
        .push_back(ReservationResponse::Challenge {
            challenge: "recaptcha".into(),
        });

    let parked = w
        .orchestrator
        .run(ctx("run-1"), Some(&soccer_week_of_july_8()))
        .await
        .unwrap();
    let RunOutcome::AwaitingAssistance {
        request_id,
        kind,
        notification_id,
    } = parked
    else {
        panic!("expected to park, got {parked:?}");
    };
    assert_eq!(kind, AssistanceKind::Captcha);

    let request = workflow.get(&request_id).await.unwrap();
    assert_eq!(request.priority, AssistancePriority::High);
    assert_eq!(request.session_id.as_deref(), Some("run-1"));
    assert_eq!(request.context["candidate"]["id"], "soc-0708");

    assert!(matches!(events.recv().await.unwrap(), WorkflowEvent::RequestQueued { .. }));
    assert!(matches!(events.recv().await.unwrap(), WorkflowEvent::RequestActivated { .. }));

    // delivered immediately at the request's priority
    let sent = w.outbox.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![(notification_id.clone(), DeliveryMethod::Push, NotificationPriority::High)]);

    workflow
        .complete(&request_id, json!({ "solved": true }))
        .await
        .unwrap();
    let outcome = w.orchestrator.resume(ctx("run-1")).await.unwrap();
    assert!(outcome.is_confirmed(), "got {outcome:?}");
    assert_eq!(w.site.reserve_calls.load(Ordering::SeqCst), 2);

    let progress = workflow.progress().await;
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.percent_complete, 100.0);
}

#[tokio::test]
async fn test_unrecognized_and_unsupported_platforms() {
    let w = world();
    let err = w
        .orchestrator
        .run(
            ProviderContext::new("https://camps.example.net", "parent-7", "r").with_consent(),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("No provider profile"), "{err}");

    // Shopify has a profile but no adapter; unknown host also needs consent
    let outcome = w
        .orchestrator
        .run(
            ProviderContext::new("https://kids-camp.myshopify.com", "parent-7", "s")
                .with_child_token("c")
                .with_consent(),
            None,
        )
        .await
        .unwrap();
    match outcome {
        RunOutcome::PrecheckFailed { reason } => assert!(reason.contains("not implemented"), "{reason}"),
        other => panic!("expected precheck failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_finalize_is_idempotent() {
    let site = Arc::new(LakesideSite::new());
    let ledger = Arc::new(Ledger::default());
    let adapter = CampBrainAdapter::new(site.clone()).with_payments(ledger.clone());
    assert_eq!(adapter.platform(), Platform::CampBrain);

    let ctx = ctx("run-9");
    let candidates = adapter
        .find_sessions(&ctx, Some(&soccer_week_of_july_8()))
        .await
        .unwrap();
    let mut candidate = candidates[0].clone();
    let ReserveOutcome::Reserved { provider_id } = adapter.reserve(&ctx, &candidate).await.unwrap() else {
        panic!("expected reservation");
    };
    candidate.provider_id = Some(provider_id);

    let first = adapter.finalize_payment(&ctx, &candidate).await.unwrap();
    let second = adapter.finalize_payment(&ctx, &candidate).await.unwrap();
    assert!(matches!(
        first,
        FinalizeOutcome::Confirmed {
            charged: ChargeKind::ServiceFeeOnly { .. },
            ..
        }
    ));
    assert!(matches!(
        second,
        FinalizeOutcome::Confirmed {
            charged: ChargeKind::AlreadyCharged,
            ..
        }
    ));
    assert_eq!(ledger.charges.lock().unwrap().len(), 1);
}
