use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WardenError};
use crate::types::{ApprovalRule, RiskLevel};

/// Top-level configuration for a Warden deployment.
///
/// Loaded from `~/.warden/config.toml` by default. Every section falls back
/// to its defaults when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl WardenConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WardenConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| WardenError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Full path of the SQLite database, with a leading `~` expanded.
    pub fn db_path(&self) -> PathBuf {
        resolve_data_dir(&self.general.data_dir).join(&self.storage.db_file)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let floor = self.policy.confidence_floor;
        if !(0.0..=1.0).contains(&floor) {
            return Err(WardenError::Config(format!(
                "policy.confidence_floor must be within [0, 1], got {}",
                floor
            )));
        }
        if self.governance.rate_limit_window_secs == 0 {
            return Err(WardenError::Config(
                "governance.rate_limit_window_secs must be greater than zero".to_string(),
            ));
        }
        for rule in &self.policy.rules {
            let pattern = rule.action_type_pattern.as_str();
            if pattern.is_empty() {
                return Err(WardenError::Config(
                    "policy rule pattern must not be empty".to_string(),
                ));
            }
            if pattern.strip_suffix('*').unwrap_or(pattern).contains('*') {
                return Err(WardenError::Config(format!(
                    "policy rule pattern '{}' may only use '*' as a trailing wildcard",
                    pattern
                )));
            }
        }
        Ok(())
    }
}

/// Expand `~` to the home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if let Some(rest) = data_dir
        .strip_prefix("~/")
        .or_else(|| data_dir.strip_prefix("~\\"))
    {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(data_dir)
    }
}

/// General process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the proposal database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.warden/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Proposal store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file name inside `general.data_dir`.
    pub db_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: "warden.db".to_string(),
        }
    }
}

/// Execution router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Limit applied to action types registered without their own limit.
    pub default_rate_limit_per_minute: u32,
    /// Length of the fixed rate-limit window.
    pub rate_limit_window_secs: u64,
    /// Upper bound on a single handler invocation.
    pub handler_timeout_secs: u64,
    /// Identity recorded as `approved_by` for policy auto-approvals.
    pub system_approver: String,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            default_rate_limit_per_minute: 60,
            rate_limit_window_secs: 60,
            handler_timeout_secs: 30,
            system_approver: "system_policy".to_string(),
        }
    }
}

/// Policy engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Proposals below this confidence always require human approval.
    pub confidence_floor: f64,
    /// Ordered rule list; the first match wins.
    pub rules: Vec<ApprovalRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
            rules: vec![
                ApprovalRule::new("task_create", RiskLevel::Low, true),
                ApprovalRule::new("notification_*", RiskLevel::Medium, true),
                ApprovalRule::new("task_delete", RiskLevel::Critical, false).with_two_approvals(),
                ApprovalRule::new("*", RiskLevel::Critical, false),
            ],
        }
    }
}
