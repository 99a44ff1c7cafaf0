//! Provider adapters: the pluggable per-platform registration lifecycle.
//!
//! - [`types`]: profiles, contexts, intents, candidates and stage outcomes
//! - [`adapter`]: the [`ProviderAdapter`] trait and platform dispatch
//! - [`http`]: the transport seam adapters use to reach providers
//! - [`backends`]: vault, payment and CAPTCHA-solver seams
//! - [`campbrain`]: reference adapter for CampBrain sites

pub mod adapter;
pub mod backends;
pub mod campbrain;
pub mod http;
pub mod types;

pub use adapter::{apply_intent, AdapterError, AdapterRegistry, AdapterResult, ProviderAdapter, UnsupportedAdapter};
pub use backends::{
    CaptchaSolver, ChargeReceipt, ChargeRequest, CredentialVault, Credentials,
    InMemoryCredentialVault, PaymentError, PaymentGateway, VaultError,
};
pub use campbrain::{CampBrainAdapter, CampBrainSettings};
pub use http::{HttpTransport, ProviderTransport, TransportError};
pub use types::{
    AdapterTuning, ChargeKind, FinalizeOutcome, LoginType, Platform, PrecheckResult,
    ProviderContext, ProviderIntent, ProviderProfile, ProviderSessionCandidate, ReserveOutcome,
    CREDENTIAL_REF_KEY,
};
