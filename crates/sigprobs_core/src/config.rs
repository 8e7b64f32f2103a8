use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::suite::CheckLimits;

pub const DEFAULT_USER_AGENT: &str = "sigprobs/0.2 (signature audit tool)";
pub const DEFAULT_CONFIG_PATH: &str = ".sigprobs/config.toml";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRY_ATTEMPTS: usize = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_LINT_BATCH_SIZE: usize = 5;
pub const DEFAULT_ACTIVE_DAYS: u32 = 30;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SigprobsConfig {
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub checks: ChecksSection,
    /// Per-hostname overrides of `[checks]`.
    #[serde(default)]
    pub sites: BTreeMap<String, ChecksSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_base_delay_ms: Option<u64>,
    pub scheme: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PathsSection {
    pub data_dir: Option<PathBuf>,
    pub replica_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ChecksSection {
    pub max_length: Option<usize>,
    pub max_subst_rounds: Option<usize>,
    pub nested_tilde_threshold: Option<usize>,
    pub lint_batch_size: Option<usize>,
    pub days: Option<u32>,
}

impl ChecksSection {
    fn overlay(&self, over: &ChecksSection) -> ChecksSection {
        ChecksSection {
            max_length: over.max_length.or(self.max_length),
            max_subst_rounds: over.max_subst_rounds.or(self.max_subst_rounds),
            nested_tilde_threshold: over.nested_tilde_threshold.or(self.nested_tilde_threshold),
            lint_batch_size: over.lint_batch_size.or(self.lint_batch_size),
            days: over.days.or(self.days),
        }
    }
}

/// Check tuning for one site after applying its overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteSettings {
    pub limits: CheckLimits,
    pub lint_batch_size: usize,
    pub days: u32,
}

impl SigprobsConfig {
    /// Resolve user agent: env SIGPROBS_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_string("SIGPROBS_USER_AGENT")
            .or_else(|| self.http.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        env_parsed("SIGPROBS_HTTP_TIMEOUT_MS")
            .or(self.http.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn retry_attempts(&self) -> usize {
        env_parsed("SIGPROBS_HTTP_RETRIES")
            .or(self.http.retries)
            .unwrap_or(DEFAULT_RETRY_ATTEMPTS)
            .max(1)
    }

    pub fn retry_base_delay_ms(&self) -> u64 {
        env_parsed("SIGPROBS_HTTP_RETRY_DELAY_MS")
            .or(self.http.retry_base_delay_ms)
            .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS)
    }

    pub fn scheme(&self) -> String {
        self.http
            .scheme
            .clone()
            .unwrap_or_else(|| "https".to_string())
    }

    /// Resolve the report directory: env SIGPROBS_DATA_DIR > config > `data`.
    pub fn data_dir(&self) -> PathBuf {
        env_string("SIGPROBS_DATA_DIR")
            .map(PathBuf::from)
            .or_else(|| self.paths.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn replica_dir(&self) -> Option<PathBuf> {
        env_string("SIGPROBS_REPLICA_DIR")
            .map(PathBuf::from)
            .or_else(|| self.paths.replica_dir.clone())
    }

    pub fn site_settings(&self, hostname: &str) -> SiteSettings {
        let merged = match self.sites.get(hostname) {
            Some(over) => self.checks.overlay(over),
            None => self.checks.clone(),
        };
        let defaults = CheckLimits::default();
        SiteSettings {
            limits: CheckLimits {
                max_length: merged.max_length.unwrap_or(defaults.max_length),
                max_subst_rounds: merged
                    .max_subst_rounds
                    .unwrap_or(defaults.max_subst_rounds),
                nested_tilde_threshold: merged
                    .nested_tilde_threshold
                    .unwrap_or(defaults.nested_tilde_threshold),
            },
            lint_batch_size: merged
                .lint_batch_size
                .unwrap_or(DEFAULT_LINT_BATCH_SIZE)
                .max(1),
            days: merged.days.unwrap_or(DEFAULT_ACTIVE_DAYS),
        }
    }
}

/// Load and parse a config file. Returns the default config if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<SigprobsConfig> {
    if !config_path.exists() {
        return Ok(SigprobsConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: SigprobsConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}
