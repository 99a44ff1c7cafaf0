//! Remote-provider transport: the network seam under platform adapters.
//!
//! Adapters speak to providers only through [`ProviderTransport`], which keeps
//! page/API specifics out of the lifecycle logic and lets tests substitute a
//! scripted provider. [`HttpTransport`] is the reqwest-backed implementation
//! for JSON registration APIs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors raised by a transport call
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode provider response: {0}")]
    Decode(String),

    #[error("Request timed out")]
    Timeout,
}

impl TransportError {
    /// Worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

/// Result type alias for transport calls
pub type TransportResult<T> = Result<T, TransportError>;

/// A session as the provider lists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub spots_remaining: Option<u32>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub price_cents: Option<u64>,
}

/// Reservation submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub session_id: String,
    pub child_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub quantity: u32,
}

/// Provider's answer to a reservation submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReservationResponse {
    Confirmed { registration_id: String },
    Waitlisted,
    /// Human verification required; `challenge` names the system
    Challenge { challenge: String },
    Rejected { message: String },
}

/// Who collects the session price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMode {
    pub provider_collects_payment: bool,
}

/// Provider acknowledgement of a paid registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmResponse {
    pub confirmation_id: Option<String>,
    #[serde(default)]
    pub waitlisted: bool,
}

/// Network seam for one provider platform.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn list_sessions(&self, base: &Url) -> TransportResult<Vec<RemoteSession>>;

    /// Exchange credentials for an opaque auth token.
    async fn sign_in(&self, base: &Url, username: &str, secret: &str) -> TransportResult<String>;

    async fn submit_reservation(
        &self,
        base: &Url,
        request: &ReservationRequest,
    ) -> TransportResult<ReservationResponse>;

    async fn payment_mode(&self, base: &Url) -> TransportResult<PaymentMode>;

    /// Existing confirmation for a registration, if the provider has one.
    async fn lookup_confirmation(
        &self,
        base: &Url,
        registration_id: &str,
    ) -> TransportResult<Option<String>>;

    async fn confirm(
        &self,
        base: &Url,
        registration_id: &str,
        payment_reference: &str,
    ) -> TransportResult<ConfirmResponse>;
}

#[derive(Deserialize)]
struct TokenBody {
    token: String,
}

#[derive(Deserialize)]
struct ConfirmationBody {
    confirmation_id: Option<String>,
}

/// JSON-over-HTTP transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("signup-orchestration/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Resolve an API path against the provider origin.
    pub fn endpoint(base: &Url, path: &str) -> TransportResult<Url> {
        base.join(path)
            .map_err(|e| TransportError::Http(format!("bad endpoint {path}: {e}")))
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> TransportResult<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn list_sessions(&self, base: &Url) -> TransportResult<Vec<RemoteSession>> {
        let url = Self::endpoint(base, "/api/sessions")?;
        let resp = self.client.get(url).send().await?;
        Self::decode(resp).await
    }

    async fn sign_in(&self, base: &Url, username: &str, secret: &str) -> TransportResult<String> {
        let url = Self::endpoint(base, "/api/auth/session")?;
        let resp = self
            .client
            .post(url)
            .json(&serde_json::json!({ "username": username, "password": secret }))
            .send()
            .await?;
        let body: TokenBody = Self::decode(resp).await?;
        Ok(body.token)
    }

    async fn submit_reservation(
        &self,
        base: &Url,
        request: &ReservationRequest,
    ) -> TransportResult<ReservationResponse> {
        let url = Self::endpoint(base, "/api/registrations")?;
        let mut builder = self.client.post(url).json(request);
        if let Some(token) = &request.auth_token {
            builder = builder.bearer_auth(token);
        }
        Self::decode(builder.send().await?).await
    }

    async fn payment_mode(&self, base: &Url) -> TransportResult<PaymentMode> {
        let url = Self::endpoint(base, "/api/payment-mode")?;
        Self::decode(self.client.get(url).send().await?).await
    }

    async fn lookup_confirmation(
        &self,
        base: &Url,
        registration_id: &str,
    ) -> TransportResult<Option<String>> {
        let url = Self::endpoint(
            base,
            &format!("/api/registrations/{registration_id}/confirmation"),
        )?;
        let resp = self.client.get(url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: ConfirmationBody = Self::decode(resp).await?;
        Ok(body.confirmation_id)
    }

    async fn confirm(
        &self,
        base: &Url,
        registration_id: &str,
        payment_reference: &str,
    ) -> TransportResult<ConfirmResponse> {
        let url = Self::endpoint(base, &format!("/api/registrations/{registration_id}/confirm"))?;
        let resp = self
            .client
            .post(url)
            .json(&serde_json::json!({ "payment_reference": payment_reference }))
            .send()
            .await?;
        Self::decode(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_resolves_against_origin() {
        let base = Url::parse("https://register.campbrain.com/camp/summer?x=1").unwrap();
        let url = HttpTransport::endpoint(&base, "/api/sessions").unwrap();
        assert_eq!(url.as_str(), "https://register.campbrain.com/api/sessions");

        let url = HttpTransport::endpoint(&base, "/api/registrations/r-1/confirm").unwrap();
        assert_eq!(url.path(), "/api/registrations/r-1/confirm");
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(TransportError::Status {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!TransportError::Status {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!TransportError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn test_reservation_response_wire_format() {
        let resp: ReservationResponse =
            serde_json::from_str(r#"{"status":"challenge","challenge":"recaptcha"}"#).unwrap();
        assert_eq!(
            resp,
            ReservationResponse::Challenge {
                challenge: "recaptcha".into()
            }
        );

        let resp: ReservationResponse =
            serde_json::from_str(r#"{"status":"confirmed","registration_id":"R-9"}"#).unwrap();
        assert!(matches!(resp, ReservationResponse::Confirmed { .. }));
    }

    #[test]
    fn test_remote_session_tolerates_missing_fields() {
        let s: RemoteSession =
            serde_json::from_str(r#"{"id":"s1","title":"Week 1"}"#).unwrap();
        assert_eq!(s.starts_at, None);
        assert_eq!(s.spots_remaining, None);
    }

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new(Duration::from_secs(5)).is_ok());
    }
}
