//! Configuration surface.
//!
//! Settings are loaded from `tagpurge.toml` (optional, checked in the working
//! directory) layered with `TAGPURGE__`-prefixed environment variables, e.g.
//! `TAGPURGE__INVALIDATION__MODE=batch`.

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

const CONFIG_BASENAME: &str = "tagpurge";
const ENV_PREFIX: &str = "TAGPURGE";
const ENV_SEPARATOR: &str = "__";

const DEFAULT_TAG_FORMAT: &str = "app-%environment%-%sha1%";
const DEFAULT_MAX_BATCH_TAGS: usize = 2500;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl LoadError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Whether explicit tag invalidations dispatch now or accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationMode {
    Immediate,
    Batch,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default tracing directive, overridable via `RUST_LOG`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvalidationSettings {
    pub mode: InvalidationMode,
    /// Obsolete-tag count above which a flush escalates to a full purge.
    pub max_batch_tags: usize,
    /// Paths dispatched for the full-purge fallback.
    pub site_roots: Vec<String>,
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            mode: InvalidationMode::Immediate,
            max_batch_tags: DEFAULT_MAX_BATCH_TAGS,
            site_roots: vec!["/".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TagSettings {
    /// Template for the derived response tag. `%environment%` and `%sha1%`
    /// are replaced; `%hash%` is accepted as an alias for `%sha1%`.
    pub format: String,
    /// Glob-like patterns (`*` wildcard) for tags that never leave the
    /// registry.
    pub excluded: Vec<String>,
}

impl Default for TagSettings {
    fn default() -> Self {
        Self {
            format: DEFAULT_TAG_FORMAT.to_string(),
            excluded: Vec::new(),
        }
    }
}

/// What the HTTP purge provider sends for each item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidateBy {
    /// Send the tag strings themselves (tag-aware CDNs).
    Tags,
    /// Send URL paths extracted from the stored URLs.
    Paths,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Purge endpoint for the generic HTTP provider.
    pub endpoint: String,
    pub invalidate_by: InvalidateBy,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
    /// Providers that treat any deep purge request as "purge everything"
    /// set this so reconciliation clears the whole tag store.
    pub purges_entire_cache: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            invalidate_by: InvalidateBy::Tags,
            auth_token: None,
            timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
            purges_entire_cache: false,
        }
    }
}

/// Root settings for the crate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Process-wide gate. When false the registry collects nothing and the
    /// coordinator generates no invalidation traffic.
    pub enabled: bool,
    /// Environment name substituted into the tag format.
    pub environment: String,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub invalidation: InvalidationSettings,
    pub tags: TagSettings,
    pub provider: ProviderSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            environment: "production".to_string(),
            logging: LoggingSettings::default(),
            database: DatabaseSettings::default(),
            invalidation: InvalidationSettings::default(),
            tags: TagSettings::default(),
            provider: ProviderSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `tagpurge.toml` and the environment.
    pub fn load() -> Result<Self, LoadError> {
        let source = Config::builder()
            .add_source(File::with_name(CONFIG_BASENAME).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?;

        let settings: Settings = source.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), LoadError> {
        if self.invalidation.max_batch_tags == 0 {
            return Err(LoadError::invalid(
                "invalidation.max_batch_tags must be at least 1",
            ));
        }
        if !self.tags.format.contains("%sha1%") && !self.tags.format.contains("%hash%") {
            return Err(LoadError::invalid(
                "tags.format must contain a %sha1% or %hash% placeholder",
            ));
        }
        Ok(())
    }

    /// True when `tag` matches any configured exclusion pattern.
    pub fn tag_is_excluded(&self, tag: &str) -> bool {
        self.tags
            .excluded
            .iter()
            .any(|pattern| pattern_matches(pattern, tag))
    }
}

/// Glob-like matching with `*` as the only wildcard (any run of characters).
pub(crate) fn pattern_matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;

    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if index == 0 {
            match rest.strip_prefix(segment) {
                Some(after) => rest = after,
                None => return false,
            }
        } else if index == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(at) => rest = &rest[at + segment.len()..],
                None => return false,
            }
        }
    }

    // Pattern ends with `*` (or consumed everything with a trailing match).
    segments.last().map(|s| s.is_empty()).unwrap_or(false) || rest.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let settings = Settings::default();
        assert!(settings.enabled);
        assert_eq!(settings.invalidation.mode, InvalidationMode::Immediate);
        assert_eq!(settings.invalidation.max_batch_tags, 2500);
        assert_eq!(settings.tags.format, "app-%environment%-%sha1%");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let mut settings = Settings::default();
        settings.invalidation.max_batch_tags = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_format_without_hash_placeholder() {
        let mut settings = Settings::default();
        settings.tags.format = "app-%environment%".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn exact_pattern_matches_exactly() {
        assert!(pattern_matches("app-tag", "app-tag"));
        assert!(!pattern_matches("app-tag", "app-tag-2"));
    }

    #[test]
    fn wildcard_patterns() {
        assert!(pattern_matches("telescope*", "telescope-entry-1"));
        assert!(pattern_matches("*-draft", "post-17-draft"));
        assert!(pattern_matches("app-*-preview", "app-42-preview"));
        assert!(pattern_matches("*", "anything"));
        assert!(!pattern_matches("telescope*", "horizon-1"));
        assert!(!pattern_matches("app-*-preview", "app-42-live"));
    }

    #[test]
    fn excluded_tags_match_any_pattern() {
        let mut settings = Settings::default();
        settings.tags.excluded = vec!["telescope*".to_string(), "nova-*".to_string()];
        assert!(settings.tag_is_excluded("telescope-entries"));
        assert!(settings.tag_is_excluded("nova-9"));
        assert!(!settings.tag_is_excluded("post-9"));
    }
}
