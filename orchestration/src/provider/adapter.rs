//! The four-stage adapter contract and platform → adapter dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use thiserror::Error;
use tracing::debug;

use super::types::{
    FinalizeOutcome, Platform, PrecheckResult, ProviderContext, ProviderIntent,
    ProviderSessionCandidate, ReserveOutcome,
};
use crate::week;

/// Errors an adapter may return instead of a structured outcome.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Provider could not be reached or answered garbage during discovery.
    /// Structured: the caller reports it, no bug implied.
    #[error("Provider unavailable: {reason}")]
    ProviderUnavailable { reason: String },

    /// Anything the adapter did not anticipate. Treated as a bug upstream.
    #[error("Adapter fault: {message}")]
    Fault { message: String },
}

impl AdapterError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            reason: reason.into(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault {
            message: message.into(),
        }
    }

    /// Whether this error indicates a defect rather than an expected failure.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault { .. })
    }
}

/// Result type alias for adapter calls
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Platform-specific implementation of the registration lifecycle.
///
/// Call order per context is always `precheck` → `find_sessions` →
/// `reserve` → `finalize_payment`; the orchestrator never skips ahead.
/// Implementations must hold no per-context state between calls.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Read-only validation of the context. No network, no side effects.
    async fn precheck(&self, ctx: &ProviderContext) -> PrecheckResult;

    /// Discover sessions, filtered and ranked per `intent`.
    async fn find_sessions(
        &self,
        ctx: &ProviderContext,
        intent: Option<&ProviderIntent>,
    ) -> AdapterResult<Vec<ProviderSessionCandidate>>;

    /// Try to hold a seat for `candidate`.
    async fn reserve(
        &self,
        ctx: &ProviderContext,
        candidate: &ProviderSessionCandidate,
    ) -> AdapterResult<ReserveOutcome>;

    /// Pay for (or confirm) a reserved candidate. Must be idempotent.
    async fn finalize_payment(
        &self,
        ctx: &ProviderContext,
        candidate: &ProviderSessionCandidate,
    ) -> AdapterResult<FinalizeOutcome>;
}

/// Apply an intent to a raw discovery list.
///
/// Title filter (case-insensitive substring) first, then week ranking when
/// `intent.date` is set. `None` or an empty intent returns the list as-is.
pub fn apply_intent(
    candidates: Vec<ProviderSessionCandidate>,
    intent: Option<&ProviderIntent>,
    default_tz: Tz,
) -> Vec<ProviderSessionCandidate> {
    let Some(intent) = intent else {
        return candidates;
    };

    let mut filtered = match intent.title_contains.as_deref().map(str::trim) {
        Some(needle) if !needle.is_empty() => {
            let needle = needle.to_lowercase();
            candidates
                .into_iter()
                .filter(|c| c.title.to_lowercase().contains(&needle))
                .collect()
        }
        _ => candidates,
    };

    if let Some(date) = intent.date.as_deref() {
        let tz = intent
            .timezone
            .as_deref()
            .and_then(week::parse_timezone)
            .unwrap_or(default_tz);
        filtered = week::rank_candidates(filtered, date, tz, 0);
    }
    filtered
}

/// Adapter for platforms nobody has implemented yet.
///
/// Every stage answers with a structured refusal instead of an error.
pub struct UnsupportedAdapter {
    platform: Platform,
}

impl UnsupportedAdapter {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    fn reason(&self) -> String {
        format!("platform '{}' is not implemented", self.platform)
    }
}

#[async_trait]
impl ProviderAdapter for UnsupportedAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn precheck(&self, _ctx: &ProviderContext) -> PrecheckResult {
        PrecheckResult::rejected(self.reason())
    }

    async fn find_sessions(
        &self,
        _ctx: &ProviderContext,
        _intent: Option<&ProviderIntent>,
    ) -> AdapterResult<Vec<ProviderSessionCandidate>> {
        Ok(Vec::new())
    }

    async fn reserve(
        &self,
        _ctx: &ProviderContext,
        _candidate: &ProviderSessionCandidate,
    ) -> AdapterResult<ReserveOutcome> {
        Ok(ReserveOutcome::failed(self.reason()))
    }

    async fn finalize_payment(
        &self,
        _ctx: &ProviderContext,
        _candidate: &ProviderSessionCandidate,
    ) -> AdapterResult<FinalizeOutcome> {
        Ok(FinalizeOutcome::failed(self.reason()))
    }
}

/// Platform tag → adapter instance, populated at startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own platform tag, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> &mut Self {
        let platform = adapter.platform();
        debug!(%platform, "Adapter registered");
        self.adapters.insert(platform, adapter);
        self
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Adapter for `platform`, or an [`UnsupportedAdapter`].
    pub fn get(&self, platform: Platform) -> Arc<dyn ProviderAdapter> {
        self.adapters
            .get(&platform)
            .cloned()
            .unwrap_or_else(|| Arc::new(UnsupportedAdapter::new(platform)))
    }

    pub fn is_supported(&self, platform: Platform) -> bool {
        self.adapters.contains_key(&platform)
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.adapters.keys().copied().collect()
    }
}
