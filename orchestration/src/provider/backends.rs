//! External backends adapters call out to: the credential vault, the
//! payment processor and the automated CAPTCHA solver.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{ProviderContext, ProviderSessionCandidate};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("No credential stored under reference '{0}'")]
    NotFound(String),

    #[error("Vault unavailable: {0}")]
    Unavailable(String),
}

/// Login material resolved from a vault reference.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Secret store keyed by opaque references such as `vault://parents/u1/campbrain`.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<Credentials, VaultError>;
}

/// Vault backed by a map, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryCredentialVault {
    entries: HashMap<String, Credentials>,
}

impl InMemoryCredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(
        mut self,
        reference: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.entries.insert(
            reference.into(),
            Credentials {
                username: username.into(),
                secret: secret.into(),
            },
        );
        self
    }
}

#[async_trait]
impl CredentialVault for InMemoryCredentialVault {
    async fn resolve(&self, reference: &str) -> Result<Credentials, VaultError> {
        self.entries
            .get(reference)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(reference.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Payment declined: {0}")]
    Declined(String),

    #[error("Payment processor unavailable: {0}")]
    Unavailable(String),
}

/// One charge submitted to the payment processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub user_id: String,
    /// Stable per registration so a retried finalize cannot double-charge
    pub idempotency_key: String,
    pub amount_cents: u64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub reference: String,
    pub amount_cents: u64,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, PaymentError>;
}

/// Automated verification backend, tried before asking the parent.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Returns `true` when the challenge was cleared and reserve may be retried.
    async fn solve(
        &self,
        ctx: &ProviderContext,
        candidate: &ProviderSessionCandidate,
        provider: &str,
    ) -> bool;
}
