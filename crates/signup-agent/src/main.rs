use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orchestration::clock::SystemClock;
use orchestration::provider::{
    AdapterRegistry, CampBrainAdapter, CampBrainSettings, HttpTransport, LoginType, Platform,
    ProviderContext, ProviderIntent, ProviderProfile,
};
use orchestration::registry::{ProfileSource, ProviderRegistry, StaticProfileSource, TomlProfileSource};
use orchestration::trust::{AutomationType, InMemoryTrustStore, TrustGate};
use orchestration::{week, OrchestrationConfig};
use serde_json::json;
use tracing::{info, warn};

/// Inspect provider routing, trust and session discovery.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Orchestration config (TOML). Defaults plus SIGNUP_* overrides when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Provider profiles as `[[profiles]]` TOML tables. Built-in list when omitted.
    #[arg(long, global = true)]
    profiles: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the provider profile a URL routes to
    Detect { url: String },

    /// Show the trust verdict and automation permissions for a URL
    Trust { url: String },

    /// Check whether a session start falls in the week of a date
    MatchWeek {
        week_of: String,
        session_start: String,
        #[arg(long)]
        tz: Option<String>,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        offset_days: i64,
    },

    /// Print the Monday week key for a timestamp
    WeekKey {
        timestamp: String,
        #[arg(long)]
        tz: Option<String>,
    },

    /// Discover sessions on a provider site, ranked for an optional week
    Sessions {
        url: String,
        #[arg(long)]
        week: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        tz: Option<String>,
    },
}

fn default_profiles() -> Vec<ProviderProfile> {
    vec![
        ProviderProfile::new(Platform::CampBrain, vec!["*.campbrain.com", "campbrain.com"]),
        ProviderProfile::new(
            Platform::ActiveCommunities,
            vec!["*.activecommunities.com", "anc.apm.activecommunities.com"],
        )
        .with_login(LoginType::AccountRequired),
        ProviderProfile::new(Platform::Shopify, vec!["*.myshopify.com"]),
    ]
}

fn load_config(path: Option<&PathBuf>) -> Result<OrchestrationConfig> {
    match path {
        Some(path) => OrchestrationConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => OrchestrationConfig::from_env().context("reading SIGNUP_* environment"),
    }
}

/// Same gate the orchestrator applies before any adapter call.
async fn ensure_discovery_allowed(trust: &TrustGate, url: &str) -> Result<()> {
    let verdict = trust.classify(url);
    if !verdict.can_proceed {
        bail!("automation not authorized for {url}: {}", verdict.reason);
    }
    let decision = trust
        .is_automation_allowed(url, AutomationType::FormAutomation)
        .await?;
    if !decision.allowed {
        bail!("automation not authorized for {url}: {}", decision.reason);
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    let source: Arc<dyn ProfileSource> = match &args.profiles {
        Some(path) => Arc::new(TomlProfileSource::new(path.clone())),
        None => Arc::new(StaticProfileSource::new(default_profiles())),
    };
    let registry = ProviderRegistry::new(source);
    let trust = TrustGate::new(
        config.trust.clone(),
        SystemClock::shared(),
        Arc::new(InMemoryTrustStore::new()),
    );

    match args.command {
        Command::Detect { url } => {
            let profile = registry
                .detect_platform(&url)
                .await
                .context("loading provider profiles")?;
            match &profile {
                Some(p) => info!(%url, platform = %p.platform, "Platform detected"),
                None => warn!(%url, "No provider profile matched"),
            }
            print_json(&json!({ "url": url, "profile": profile }))?;
        }

        Command::Trust { url } => {
            let verdict = trust.classify(&url);
            let record = trust.analyze(&url).await?;
            let mut decisions = serde_json::Map::new();
            for kind in [
                AutomationType::FormAutomation,
                AutomationType::CaptchaPrevention,
                AutomationType::QueueManagement,
                AutomationType::PaymentProcessing,
            ] {
                let decision = trust.is_automation_allowed(&url, kind).await?;
                decisions.insert(kind.to_string(), serde_json::to_value(decision)?);
            }
            print_json(&json!({
                "verdict": verdict,
                "record": record,
                "automation": decisions,
            }))?;
        }

        Command::MatchWeek {
            week_of,
            session_start,
            tz,
            offset_days,
        } => {
            let tz = tz.unwrap_or_else(|| config.default_timezone.clone());
            let matched = week::match_week(&week_of, &session_start, &tz, offset_days);
            print_json(&json!({
                "week_of": week_of,
                "session_start": session_start,
                "timezone": tz,
                "offset_days": offset_days,
                "matches": matched,
            }))?;
        }

        Command::WeekKey { timestamp, tz } => {
            let tz = tz.unwrap_or_else(|| config.default_timezone.clone());
            let Some(key) = week::get_week_key(&timestamp, &tz) else {
                bail!("cannot read '{timestamp}' in timezone '{tz}'");
            };
            print_json(&json!({ "timestamp": timestamp, "timezone": tz, "week_key": key }))?;
        }

        Command::Sessions {
            url,
            week,
            title,
            tz,
        } => {
            let profile = registry
                .detect_platform(&url)
                .await
                .context("loading provider profiles")?
                .with_context(|| format!("no provider profile matches {url}"))?;

            ensure_discovery_allowed(&trust, &url).await?;

            let mut ctx = ProviderContext::new(&url, "cli", "cli-sessions");
            ctx.tuning = trust.tuning(&url).await?;

            let transport = HttpTransport::new(Duration::from_millis(ctx.tuning.timeout_ms))
                .context("building HTTP client")?;
            let settings = CampBrainSettings {
                service_fee_cents: config.service_fee_cents,
                default_timezone: config.timezone()?,
                ..CampBrainSettings::for_profile(&profile)
            };
            let adapters = AdapterRegistry::new()
                .with(Arc::new(CampBrainAdapter::new(Arc::new(transport)).with_settings(settings)));
            if !adapters.is_supported(profile.platform) {
                bail!("platform '{}' has no adapter yet", profile.platform);
            }

            let intent = ProviderIntent {
                date: week,
                title_contains: title,
                timezone: tz,
                ..Default::default()
            };
            let sessions = adapters
                .get(profile.platform)
                .find_sessions(&ctx, Some(&intent))
                .await
                .with_context(|| format!("discovering sessions on {url}"))?;
            info!(%url, count = sessions.len(), "Sessions discovered");
            print_json(&serde_json::to_value(&sessions)?)?;
        }
    }

    Ok(())
}
