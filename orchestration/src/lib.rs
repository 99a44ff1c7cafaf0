//! Camp registration orchestration core
//!
//! Takes a provider URL plus a parent's intent and drives the registration
//! lifecycle against whatever system the provider runs:
//!
//! - [`registry`]: hostname → provider profile routing
//! - [`provider`]: the four-stage adapter contract and the CampBrain adapter
//! - [`week`]: timezone-aware week matching and session ranking
//! - [`trust`]: per-host compliance, capabilities and adapter tuning
//! - [`lock`]: registration-level mutual exclusion
//! - [`workflow`]: human-in-the-loop assistance queue
//! - [`notify`]: notification delivery with durable escalation
//! - [`orchestrator`]: ties the above into one resumable run
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use orchestration::{
//!     clock::SystemClock, config::OrchestrationConfig, orchestrator::Orchestrator,
//!     provider::{AdapterRegistry, CampBrainAdapter, HttpTransport, ProviderContext, ProviderIntent},
//!     registry::{ProviderRegistry, TomlProfileSource},
//! };
//! # async fn demo(delivery: Arc<dyn orchestration::notify::NotificationDelivery>) -> anyhow::Result<()> {
//! let config = OrchestrationConfig::from_env()?;
//! let transport = Arc::new(HttpTransport::new(std::time::Duration::from_secs(30))?);
//! let orchestrator = Orchestrator::from_config(
//!     &config,
//!     Arc::new(ProviderRegistry::new(Arc::new(TomlProfileSource::new("profiles.toml")))),
//!     AdapterRegistry::new().with(Arc::new(CampBrainAdapter::new(transport))),
//!     delivery,
//!     SystemClock::shared(),
//! );
//! let ctx = ProviderContext::new("https://lakeside.campbrain.com", "parent-1", "run-1")
//!     .with_child_token("child-ref")
//!     .with_consent();
//! let outcome = orchestrator.run(ctx, Some(&ProviderIntent::for_week("2025-06-09"))).await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod clock;
pub mod config;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod store;
pub mod trust;
pub mod week;
pub mod workflow;

pub use config::{ConfigError, OrchestrationConfig};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorResult, RunOutcome};
