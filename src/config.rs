use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::models::{ActionKind, UNLIMITED};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Default tier '{0}' has no limits configured")]
    MissingDefaultTier(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_prod(&self) -> bool {
        *self == Environment::Production
    }
}

/// Caps for one subscription tier. `-1` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TierLimits {
    /// Monthly caps per action kind. Missing kinds are unlimited.
    #[serde(default)]
    pub monthly: BTreeMap<ActionKind, i64>,
    pub weekly_job_discovery: i64,
    pub daily_job_discovery: i64,
    pub requests_per_hour: u32,
    /// Tier suggested when a cap is hit.
    #[serde(default)]
    pub upgrade_to: Option<String>,
}

impl TierLimits {
    /// Cap for `kind` in the window that kind is counted in.
    pub fn limit_for(&self, kind: ActionKind) -> i64 {
        match kind {
            ActionKind::JobDiscovery => self.weekly_job_discovery,
            other => self.monthly.get(&other).copied().unwrap_or(UNLIMITED),
        }
    }
}

/// Resolves a tier name to its limits.
pub trait TierLimitsProvider: Send + Sync {
    fn limits_for(&self, tier: &str) -> TierLimits;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    pub tiers: HashMap<String, TierLimits>,
    pub default_tier: String,
    /// Percent of a finite limit at which decisions start warning.
    pub warning_threshold_percent: u8,
    /// Fraction of rate-limit calls that also sweep stale buckets.
    pub rate_limit_cleanup_probability: f64,
    pub rate_limit_retention_hours: i64,
    #[serde(skip, default = "default_environment")]
    pub environment: Environment,
}

fn default_environment() -> Environment {
    Environment::Development
}

fn tier(
    monthly: &[(ActionKind, i64)],
    weekly: i64,
    daily: i64,
    per_hour: u32,
    upgrade_to: Option<&str>,
) -> TierLimits {
    TierLimits {
        monthly: monthly.iter().copied().collect(),
        weekly_job_discovery: weekly,
        daily_job_discovery: daily,
        requests_per_hour: per_hour,
        upgrade_to: upgrade_to.map(|s| s.to_string()),
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        use ActionKind::*;

        let mut tiers = HashMap::new();
        tiers.insert(
            "free".to_string(),
            tier(
                &[
                    (ResumeUploads, 3),
                    (JobImports, 10),
                    (AiConversations, 20),
                    (CoverLetters, 5),
                    (ResumeTailoring, 5),
                ],
                50,
                10,
                100,
                Some("pro"),
            ),
        );
        tiers.insert(
            "pro".to_string(),
            tier(
                &[
                    (ResumeUploads, 25),
                    (JobImports, 200),
                    (AiConversations, 500),
                    (CoverLetters, 100),
                    (ResumeTailoring, 100),
                ],
                300,
                60,
                1000,
                Some("premium"),
            ),
        );
        tiers.insert(
            "premium".to_string(),
            tier(
                &[
                    (ResumeUploads, UNLIMITED),
                    (JobImports, UNLIMITED),
                    (AiConversations, UNLIMITED),
                    (CoverLetters, UNLIMITED),
                    (ResumeTailoring, UNLIMITED),
                ],
                1000,
                200,
                5000,
                None,
            ),
        );

        Self {
            tiers,
            default_tier: "free".to_string(),
            warning_threshold_percent: 80,
            rate_limit_cleanup_probability: 0.01,
            rate_limit_retention_hours: 24,
            environment: Environment::Development,
        }
    }
}

impl QuotaConfig {
    /// Loads tier limits from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let display = path.as_ref().display().to_string();
        let raw = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config: QuotaConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: display,
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the config from `QUOTA_CONFIG_PATH`, `QUOTA_DEFAULT_TIER` and
    /// `QUOTA_ENVIRONMENT`, falling back to the built-in tiers.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("QUOTA_CONFIG_PATH") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };

        if let Ok(default_tier) = env::var("QUOTA_DEFAULT_TIER") {
            config.default_tier = default_tier.trim().to_string();
        }
        let env_name = env::var("QUOTA_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        config.environment = Environment::from_str(&env_name);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.tiers.contains_key(&self.default_tier) {
            return Err(ConfigError::MissingDefaultTier(self.default_tier.clone()));
        }
        Ok(())
    }
}

impl TierLimitsProvider for QuotaConfig {
    fn limits_for(&self, tier: &str) -> TierLimits {
        self.tiers
            .get(tier)
            .or_else(|| {
                log::debug!("Unknown tier '{}', using '{}' limits", tier, self.default_tier);
                self.tiers.get(&self.default_tier)
            })
            .cloned()
            .unwrap_or_else(|| QuotaConfig::default().limits_for("free"))
    }
}

/// Process-wide configuration. Falls back to the built-in tiers when the
/// environment points at an unreadable file.
pub static CONFIG: Lazy<QuotaConfig> = Lazy::new(|| {
    QuotaConfig::from_env().unwrap_or_else(|e| {
        log::error!("{}; using built-in quota configuration", e);
        QuotaConfig::default()
    })
});

pub fn init() {
    Lazy::force(&CONFIG);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_limit_for_routes_weekly_kind() {
        let config = QuotaConfig::default();
        let free = config.limits_for("free");
        assert_eq!(free.limit_for(ActionKind::JobDiscovery), 50);
        assert_eq!(free.limit_for(ActionKind::AiConversations), 20);
    }

    #[test]
    fn test_unknown_tier_uses_default() {
        let config = QuotaConfig::default();
        assert_eq!(config.limits_for("enterprise-legacy"), config.limits_for("free"));
    }

    #[test]
    fn test_missing_monthly_kind_is_unlimited() {
        let limits = TierLimits {
            monthly: BTreeMap::new(),
            weekly_job_discovery: 5,
            daily_job_discovery: 5,
            requests_per_hour: 5,
            upgrade_to: None,
        };
        assert_eq!(limits.limit_for(ActionKind::CoverLetters), UNLIMITED);
    }

    #[test]
    fn test_from_file_roundtrip_and_validation() {
        let mut config = QuotaConfig::default();
        config.default_tier = "pro".to_string();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&config).unwrap()).unwrap();
        let loaded = QuotaConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.default_tier, "pro");
        assert_eq!(loaded.limits_for("premium").weekly_job_discovery, 1000);

        config.default_tier = "missing".to_string();
        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, "{}", serde_json::to_string(&config).unwrap()).unwrap();
        assert!(matches!(
            QuotaConfig::from_file(bad.path()),
            Err(ConfigError::MissingDefaultTier(_))
        ));
    }
}
