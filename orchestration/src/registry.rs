//! Provider Registry: hostname → platform profile routing
//!
//! Profiles are loaded once from a [`ProfileSource`] and cached for the
//! lifetime of the registry object. Each domain pattern is a hostname glob
//! compiled to an anchored, case-insensitive regex (`*` → `.*`, everything
//! else literal), so `*.example.com` matches `a.example.com` but not
//! `example.com`.
//!
//! # Precedence
//!
//! When several profiles match the same hostname the most specific pattern
//! wins: the pattern with the most literal characters, then the one with the
//! fewest wildcards, then the profile loaded first.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::provider::types::ProviderProfile;

/// Errors raised while loading or compiling provider profiles
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Profile source could not be read
    #[error("Failed to load provider profiles: {message}")]
    LoadFailed { message: String },

    /// A domain pattern could not be compiled
    #[error("Invalid domain pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl RegistryError {
    pub fn load_failed(message: impl Into<String>) -> Self {
        Self::LoadFailed {
            message: message.into(),
        }
    }
}

/// Result type alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Where provider profiles come from.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn load_profiles(&self) -> RegistryResult<Vec<ProviderProfile>>;
}

/// Fixed in-memory profile list.
pub struct StaticProfileSource {
    profiles: Vec<ProviderProfile>,
}

impl StaticProfileSource {
    pub fn new(profiles: Vec<ProviderProfile>) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl ProfileSource for StaticProfileSource {
    async fn load_profiles(&self) -> RegistryResult<Vec<ProviderProfile>> {
        Ok(self.profiles.clone())
    }
}

#[derive(Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: Vec<ProviderProfile>,
}

/// Profiles stored as `[[profiles]]` tables in a TOML file.
pub struct TomlProfileSource {
    path: PathBuf,
}

impl TomlProfileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse profile TOML text.
    pub fn parse(text: &str) -> RegistryResult<Vec<ProviderProfile>> {
        let file: ProfileFile =
            toml::from_str(text).map_err(|e| RegistryError::load_failed(e.to_string()))?;
        Ok(file.profiles)
    }
}

#[async_trait]
impl ProfileSource for TomlProfileSource {
    async fn load_profiles(&self) -> RegistryResult<Vec<ProviderProfile>> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RegistryError::load_failed(format!("{}: {}", self.path.display(), e))
        })?;
        Self::parse(&text)
    }
}

/// Compile a hostname glob into an anchored, case-insensitive regex.
pub fn glob_to_regex(pattern: &str) -> RegistryResult<Regex> {
    let escaped = regex::escape(pattern.trim()).replace(r"\*", ".*");
    RegexBuilder::new(&format!("^{escaped}$"))
        .case_insensitive(true)
        .build()
        .map_err(|e| RegistryError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

/// Lowercased hostname of a URL, if it parses and has one.
pub fn hostname(url: &str) -> Option<String> {
    url::Url::parse(url.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_end_matches('.').to_ascii_lowercase()))
        .filter(|h| !h.is_empty())
}

struct CompiledPattern {
    regex: Regex,
    literal_len: usize,
    wildcards: usize,
}

impl CompiledPattern {
    fn compile(pattern: &str) -> RegistryResult<Self> {
        Ok(Self {
            regex: glob_to_regex(pattern)?,
            literal_len: pattern.chars().filter(|c| *c != '*').count(),
            wildcards: pattern.matches('*').count(),
        })
    }

    /// Higher sorts first.
    fn specificity(&self) -> (usize, std::cmp::Reverse<usize>) {
        (self.literal_len, std::cmp::Reverse(self.wildcards))
    }
}

struct CompiledProfile {
    profile: ProviderProfile,
    patterns: Vec<CompiledPattern>,
}

/// Hostname-pattern router over a lazily loaded, cached profile list.
pub struct ProviderRegistry {
    source: Arc<dyn ProfileSource>,
    cache: OnceCell<Vec<CompiledProfile>>,
}

impl ProviderRegistry {
    pub fn new(source: Arc<dyn ProfileSource>) -> Self {
        Self {
            source,
            cache: OnceCell::new(),
        }
    }

    /// Registry over a fixed profile list.
    pub fn from_profiles(profiles: Vec<ProviderProfile>) -> Self {
        Self::new(Arc::new(StaticProfileSource::new(profiles)))
    }

    /// Load and compile profiles on first use.
    ///
    /// A failed load is not cached; the next call tries again.
    async fn compiled(&self) -> RegistryResult<&[CompiledProfile]> {
        let profiles = self
            .cache
            .get_or_try_init(|| async {
                let profiles = self.source.load_profiles().await?;
                let compiled = profiles
                    .into_iter()
                    .map(|profile| {
                        let patterns = profile
                            .domain_patterns
                            .iter()
                            .map(|p| CompiledPattern::compile(p))
                            .collect::<RegistryResult<Vec<_>>>()?;
                        Ok(CompiledProfile { profile, patterns })
                    })
                    .collect::<RegistryResult<Vec<_>>>()?;
                info!(count = compiled.len(), "Provider profiles loaded");
                Ok::<_, RegistryError>(compiled)
            })
            .await?;
        Ok(profiles.as_slice())
    }

    /// All loaded profiles, in load order.
    pub async fn profiles(&self) -> RegistryResult<Vec<ProviderProfile>> {
        Ok(self
            .compiled()
            .await?
            .iter()
            .map(|c| c.profile.clone())
            .collect())
    }

    /// Resolve a URL to its provider profile.
    ///
    /// Returns `Ok(None)` when the URL has no hostname or nothing matches.
    pub async fn detect_platform(&self, url: &str) -> RegistryResult<Option<ProviderProfile>> {
        let Some(host) = hostname(url) else {
            debug!(url, "No hostname in URL");
            return Ok(None);
        };
        Ok(self.match_host(&host).await?.cloned())
    }

    async fn match_host(&self, host: &str) -> RegistryResult<Option<&ProviderProfile>> {
        let profiles = self.compiled().await?;

        let mut best: Option<(&CompiledProfile, (usize, std::cmp::Reverse<usize>))> = None;
        for compiled in profiles {
            let Some(spec) = compiled
                .patterns
                .iter()
                .filter(|p| p.regex.is_match(host))
                .map(CompiledPattern::specificity)
                .max()
            else {
                continue;
            };
            // strict > keeps the earlier profile on ties
            if best.as_ref().map_or(true, |(_, b)| spec > *b) {
                best = Some((compiled, spec));
            }
        }

        if let Some((compiled, _)) = &best {
            debug!(host, platform = %compiled.profile.platform, "Platform detected");
        }
        Ok(best.map(|(c, _)| &c.profile))
    }
}
