//! Configuration consumed by the engine.
//!
//! Two layers:
//!
//! - [`RepositoryConfig`]: the per-repository options a maintainer can set in
//!   `.github/wip.yml`. Every field is optional; absent fields take defaults.
//! - [`EngineSettings`]: process-wide settings chosen by whoever hosts the
//!   engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::StatusContext;

/// Status context used when a repository does not configure one.
pub const DEFAULT_STATUS_CONTEXT: &str = "WIP";

/// How long a status record is trusted before the engine rewrites the status.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(60 * 60);

/// Where in the title a pattern may match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleMatchMode {
    /// Match at any position in the title.
    #[default]
    Anywhere,
    /// Match only at the start of the title (leading whitespace ignored).
    Prefix,
}

/// Per-repository options, as read from the repository's config file.
///
/// Keys are camelCase on the wire:
///
/// ```yaml
/// titlePatterns: ["wip", "[wip]", "/^draft:/"]
/// wipLabels: ["wip", "do not merge"]
/// statusContext: "WIP"
/// titleMatch: prefix
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// Title markers. `None` means the defaults; an empty list disables the
    /// title signal.
    #[serde(default)]
    pub title_patterns: Option<Vec<String>>,

    /// WIP label names. `None` means the defaults; an empty list disables the
    /// label signal.
    #[serde(default)]
    pub wip_labels: Option<Vec<String>>,

    /// Commit status context to write.
    #[serde(default)]
    pub status_context: Option<String>,

    /// Restricts title matching to the prefix.
    #[serde(default)]
    pub title_match: Option<TitleMatchMode>,
}

impl RepositoryConfig {
    /// The configured status context, or `fallback` when unset or blank.
    pub fn status_context_or(&self, fallback: &StatusContext) -> StatusContext {
        self.status_context
            .as_deref()
            .map(str::trim)
            .and_then(StatusContext::new)
            .unwrap_or_else(|| fallback.clone())
    }
}

/// What to do with an installation the entitlement gate has never heard of.
///
/// GitHub only sends marketplace events for accounts that went through the
/// marketplace listing, so whether an unknown installation may use the bot is
/// a hosting policy, not something the event stream can answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownInstallationPolicy {
    /// Unknown installations are not entitled until a purchase arrives.
    #[default]
    Deny,
    /// Unknown installations are entitled for public repositories only.
    Public,
    /// Unknown installations are entitled everywhere.
    All,
}

impl std::str::FromStr for UnknownInstallationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" => Ok(Self::Deny),
            "public" => Ok(Self::Public),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown installation policy '{other}' (expected deny, public or all)"
            )),
        }
    }
}

/// Process-wide engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Age after which a status record no longer suppresses writes.
    pub status_ttl: Duration,

    /// Entitlement policy for installations without a record.
    pub unknown_installations: UnknownInstallationPolicy,

    /// Status context used when the repository sets none.
    pub default_status_context: StatusContext,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            status_ttl: DEFAULT_STATUS_TTL,
            unknown_installations: UnknownInstallationPolicy::default(),
            default_status_context: StatusContext::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_config_deserialises_camel_case() {
        let json = serde_json::json!({
            "titlePatterns": ["draft"],
            "wipLabels": [],
            "statusContext": "ci/wip",
            "titleMatch": "prefix"
        });
        let config: RepositoryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.title_patterns, Some(vec!["draft".to_string()]));
        assert_eq!(config.wip_labels, Some(vec![]));
        assert_eq!(config.status_context.as_deref(), Some("ci/wip"));
        assert_eq!(config.title_match, Some(TitleMatchMode::Prefix));
    }

    #[test]
    fn test_repository_config_missing_fields_default() {
        let config: RepositoryConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config, RepositoryConfig::default());
    }

    #[test]
    fn test_blank_status_context_falls_back() {
        let fallback = StatusContext::new("WIP").unwrap();
        let config = RepositoryConfig {
            status_context: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(config.status_context_or(&fallback), fallback);
    }

    #[test]
    fn test_unknown_policy_parses() {
        assert_eq!(
            "Public".parse::<UnknownInstallationPolicy>(),
            Ok(UnknownInstallationPolicy::Public)
        );
        assert!("sometimes".parse::<UnknownInstallationPolicy>().is_err());
    }
}
