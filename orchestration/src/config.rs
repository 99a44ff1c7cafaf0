//! Orchestration configuration.
//!
//! Loaded from TOML, every section optional, then overridden by
//! environment variables:
//!
//! | Variable                     | Field                         |
//! |------------------------------|-------------------------------|
//! | `SIGNUP_TIMEZONE`            | `default_timezone`            |
//! | `SIGNUP_ADVANCE_DELAY_MS`    | `workflow.advance_delay_ms`   |
//! | `SIGNUP_FALLBACK_DELAY_SECS` | `notify.fallback_delay_secs`  |

use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::LockConfig;
use crate::notify::NotifyConfig;
use crate::provider::campbrain::DEFAULT_SERVICE_FEE_CENTS;
use crate::trust::TrustConfig;
use crate::week;
use crate::workflow::WorkflowConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue { var: String, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// IANA zone for week matching when an intent names none
    pub default_timezone: String,
    pub service_fee_cents: u64,
    pub trust: TrustConfig,
    pub notify: NotifyConfig,
    pub workflow: WorkflowConfig,
    pub lock: LockConfig,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            default_timezone: "America/Chicago".to_string(),
            service_fee_cents: DEFAULT_SERVICE_FEE_CENTS,
            trust: TrustConfig::default(),
            notify: NotifyConfig::default(),
            workflow: WorkflowConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl OrchestrationConfig {
    /// Parse TOML text without consulting the environment.
    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` and apply environment overrides.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text)?;
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(tz) = lookup("SIGNUP_TIMEZONE") {
            self.default_timezone = tz;
        }
        if let Some(ms) = lookup("SIGNUP_ADVANCE_DELAY_MS") {
            self.workflow.advance_delay_ms = parse_var("SIGNUP_ADVANCE_DELAY_MS", &ms)?;
        }
        if let Some(secs) = lookup("SIGNUP_FALLBACK_DELAY_SECS") {
            self.notify.fallback_delay_secs = parse_var("SIGNUP_FALLBACK_DELAY_SECS", &secs)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.timezone()?;
        if !(0.0..=1.0).contains(&self.trust.ema_alpha) {
            return Err(ConfigError::InvalidValue {
                var: "trust.ema_alpha".into(),
                value: self.trust.ema_alpha.to_string(),
            });
        }
        Ok(())
    }

    pub fn timezone(&self) -> ConfigResult<Tz> {
        week::parse_timezone(&self.default_timezone)
            .ok_or_else(|| ConfigError::InvalidTimezone(self.default_timezone.clone()))
    }
}

fn parse_var<T: std::str::FromStr>(var: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OrchestrationConfig::from_toml(
            r#"
            default_timezone = "America/Denver"

            [trust]
            trusted_domains = ["campbrain.com", "activecommunities.com"]
            fail_open = false

            [notify]
            fallback_delay_secs = 45
            "#,
        )
        .unwrap();
        assert_eq!(config.timezone().unwrap(), chrono_tz::America::Denver);
        assert!(!config.trust.fail_open);
        assert_eq!(config.trust.cache_ttl_secs, 6 * 3600);
        assert_eq!(config.notify.fallback_delay_secs, 45);
        assert_eq!(config.notify.performance_window, 50);
        assert_eq!(config.workflow.advance_delay_ms, 1_500);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("SIGNUP_TIMEZONE", "America/New_York"),
            ("SIGNUP_ADVANCE_DELAY_MS", "250"),
        ]
        .into_iter()
        .collect();
        let mut config = OrchestrationConfig::default();
        config
            .apply_overrides(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.default_timezone, "America/New_York");
        assert_eq!(config.workflow.advance_delay_ms, 250);
        assert_eq!(config.notify.fallback_delay_secs, 30);

        let err = config
            .apply_overrides(|var| (var == "SIGNUP_FALLBACK_DELAY_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        assert!(matches!(
            OrchestrationConfig::from_toml(r#"default_timezone = "Mars/Olympus""#),
            Err(ConfigError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signup.toml");
        std::fs::write(&path, "[lock]\nttl_secs = 120\n").unwrap();
        let config = OrchestrationConfig::load(&path).unwrap();
        assert_eq!(config.lock.ttl_secs, 120);

        assert!(matches!(
            OrchestrationConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
