//! Configuration management for Ebbtide

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::criteria::{parse_before_date, parse_max_age, ActionMode, CriteriaBuilder, DEFAULT_BATCH_SIZE};
use crate::error::{ConfigError, EbbtideError, PlatformError, Result};
use crate::types::{Platform, Timeline};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bluesky: Option<BlueskyConfig>,
    #[serde(default)]
    pub mastodon: Option<MastodonConfig>,
    /// Offline connector serving posts from a JSON fixture
    #[serde(default)]
    pub mock: Option<MockFixtureConfig>,
    #[serde(default)]
    pub prune: PruneConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueskyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub handle: String,
    pub app_password_file: String,
    /// PDS to log in against; defaults to bsky.social
    #[serde(default)]
    pub pds_url: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MastodonConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub instance: String,
    pub token_file: String,
    #[serde(default)]
    pub rate_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockFixtureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// JSON file holding an array of pages, each an array of posts
    pub fixture: String,
}

/// Defaults for pruning runs; command-line flags take precedence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    #[serde(default)]
    pub max_age: Option<String>,
    #[serde(default)]
    pub before_date: Option<String>,
    #[serde(default = "default_true")]
    pub preserve_pinned: bool,
    #[serde(default = "default_true")]
    pub preserve_self_like: bool,
    #[serde(default)]
    pub action: ActionMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_true")]
    pub continue_to_end: bool,
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Pause between passes, e.g. `6h`
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Address of the status server
    #[serde(default = "default_status_addr")]
    pub status_addr: String,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

fn default_interval() -> String {
    "6h".to_string()
}

fn default_status_addr() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            max_age: None,
            before_date: None,
            preserve_pinned: true,
            preserve_self_like: true,
            action: ActionMode::Auto,
            batch_size: DEFAULT_BATCH_SIZE,
            continue_to_end: true,
            timeline: Timeline::Posts,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            status_addr: default_status_addr(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load from `path` when given, otherwise from the default location
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Create a default configuration with no platforms enabled
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Check the fields that deserialization alone cannot
    pub fn validate(&self) -> Result<()> {
        if let Some(bluesky) = self.bluesky.as_ref().filter(|c| c.enabled) {
            if bluesky.handle.trim().is_empty() {
                return Err(ConfigError::MissingField("bluesky.handle".to_string()).into());
            }
            if let Some(rate_limit) = &bluesky.rate_limit {
                parse_interval("bluesky.rate_limit", rate_limit)?;
            }
        }

        if let Some(mastodon) = self.mastodon.as_ref().filter(|c| c.enabled) {
            if mastodon.instance.trim().is_empty() {
                return Err(ConfigError::MissingField("mastodon.instance".to_string()).into());
            }
            if let Some(rate_limit) = &mastodon.rate_limit {
                parse_interval("mastodon.rate_limit", rate_limit)?;
            }
        }

        if let Some(mock) = self.mock.as_ref().filter(|c| c.enabled) {
            if mock.fixture.trim().is_empty() {
                return Err(ConfigError::MissingField("mock.fixture".to_string()).into());
            }
        }

        self.service.interval()?;
        self.prune.to_criteria_builder()?.build()?;
        Ok(())
    }

    /// Platforms with an enabled section, in stable order
    pub fn enabled_platforms(&self) -> Vec<Platform> {
        let mut platforms = Vec::new();
        if self.bluesky.as_ref().is_some_and(|c| c.enabled) {
            platforms.push(Platform::Bluesky);
        }
        if self.mastodon.as_ref().is_some_and(|c| c.enabled) {
            platforms.push(Platform::Mastodon);
        }
        if self.mock.as_ref().is_some_and(|c| c.enabled) {
            platforms.push(Platform::Mock);
        }
        platforms
    }

    /// Resolve requested platform names against the enabled sections
    ///
    /// Names may be repeated or comma separated. An empty request selects
    /// every enabled platform.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an unknown or disabled platform, or when
    /// nothing is left to run.
    pub fn select_platforms(&self, requested: &[String]) -> Result<Vec<Platform>> {
        let enabled = self.enabled_platforms();

        let mut selected = Vec::new();
        for name in requested.iter().flat_map(|r| r.split(',')) {
            if name.trim().is_empty() {
                continue;
            }
            let platform: Platform = name.parse()?;
            if !enabled.contains(&platform) {
                return Err(EbbtideError::InvalidInput(format!(
                    "platform '{}' is not enabled in the configuration",
                    platform
                )));
            }
            if !selected.contains(&platform) {
                selected.push(platform);
            }
        }

        if selected.is_empty() {
            selected = enabled;
        }
        if selected.is_empty() {
            return Err(EbbtideError::InvalidInput(
                "no platforms are enabled in the configuration".to_string(),
            ));
        }

        Ok(selected)
    }

    /// Configured `rate_limit` overrides, keyed by platform
    pub fn rate_limit_overrides(&self) -> Result<HashMap<Platform, Duration>> {
        let mut overrides = HashMap::new();

        if let Some(rate_limit) = self.bluesky.as_ref().and_then(|c| c.rate_limit.as_deref()) {
            overrides.insert(
                Platform::Bluesky,
                parse_interval("bluesky.rate_limit", rate_limit)?,
            );
        }
        if let Some(rate_limit) = self.mastodon.as_ref().and_then(|c| c.rate_limit.as_deref()) {
            overrides.insert(
                Platform::Mastodon,
                parse_interval("mastodon.rate_limit", rate_limit)?,
            );
        }

        Ok(overrides)
    }
}

impl PruneConfig {
    /// A criteria builder seeded from this section
    ///
    /// Thresholds are parsed here so a bad value is reported as a config
    /// error before anything runs.
    pub fn to_criteria_builder(&self) -> Result<CriteriaBuilder> {
        let mut builder = CriteriaBuilder::default()
            .preserve_pinned(self.preserve_pinned)
            .preserve_self_like(self.preserve_self_like)
            .action(self.action)
            .batch_size(self.batch_size)
            .continue_to_end(self.continue_to_end)
            .timeline(self.timeline);

        if let Some(max_age) = &self.max_age {
            builder = builder.max_age(parse_max_age(max_age)?);
        }
        if let Some(before_date) = &self.before_date {
            builder = builder.before_date(parse_before_date(before_date, chrono::Utc::now())?);
        }

        Ok(builder)
    }
}

impl ServiceConfig {
    pub fn interval(&self) -> Result<Duration> {
        parse_interval("service.interval", &self.interval)
    }
}

pub(crate) fn parse_interval(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| ConfigError::invalid(field, format!("'{}': {}", value, e)).into())
}

/// Read a credential file, expanding `~` and environment variables
///
/// Surrounding whitespace is trimmed. An empty file is an error.
pub fn read_secret_file(path: &str, what: &str) -> Result<SecretString> {
    let expanded = shellexpand::full(path).map_err(|e| {
        PlatformError::Authentication(format!("Failed to expand {} file path: {}", what, e))
    })?;

    let secret = std::fs::read_to_string(expanded.as_ref())
        .map_err(|e| {
            PlatformError::Authentication(format!(
                "Failed to read {} file {}: {}",
                what, expanded, e
            ))
        })?
        .trim()
        .to_string();

    if secret.is_empty() {
        return Err(PlatformError::Authentication(format!("{} file is empty", what)).into());
    }

    Ok(SecretString::from(secret))
}

/// Resolve the configuration file path (`EBBTIDE_CONFIG`, else the XDG config dir)
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("EBBTIDE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("ebbtide").join("config.toml"))
}
