//! Hub configuration: the static backend roster plus admission, restart and
//! health-tracking policies
//!
//! Loaded once at startup from a JSON file. Every section has defaults, so a
//! file that only lists backends is a complete configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use shared::PriorityRank;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// One backend as declared in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub address: String,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Reserved-capacity rule applied when a backend is nearly full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdmissionPolicy {
    /// Slots kept free for privileged ranks
    pub reserved_slots: u32,
    /// Lowest rank allowed into the reserved slots
    pub admin_threshold: PriorityRank,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            reserved_slots: 5,
            admin_threshold: PriorityRank::Admin,
        }
    }
}

/// Restart coordination timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Minimum time between two restarts of the same backend
    pub cooldown: Duration,
    /// Per-position backoff handed to queued backends
    pub backoff_interval: Duration,
    /// Queued requests not refreshed for this long are dropped
    pub queue_timeout: Duration,
    /// A restart running longer than this is assumed to have crashed
    pub max_restart_time: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartSettings::default().policy()
    }
}

/// On-disk form of [`RestartPolicy`], in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestartSettings {
    pub cooldown_secs: u64,
    pub backoff_secs: u64,
    pub queue_timeout_secs: u64,
    pub max_restart_secs: u64,
    /// How often the watchdog sweep runs
    pub sweep_interval_secs: u64,
    /// Deny restart requests from names that are not configured backends
    pub restrict_to_backends: bool,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            backoff_secs: 30,
            queue_timeout_secs: 600,
            max_restart_secs: 300,
            sweep_interval_secs: 10,
            restrict_to_backends: false,
        }
    }
}

impl RestartSettings {
    pub fn policy(&self) -> RestartPolicy {
        RestartPolicy {
            cooldown: Duration::from_secs(self.cooldown_secs),
            backoff_interval: Duration::from_secs(self.backoff_secs),
            queue_timeout: Duration::from_secs(self.queue_timeout_secs),
            max_restart_time: Duration::from_secs(self.max_restart_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// How backend status reports are turned into online/offline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthSettings {
    /// A backend silent for longer than this counts one missed report
    pub report_timeout_secs: u64,
    /// Consecutive missed reports before a backend is considered offline
    pub failure_threshold: u32,
    pub check_interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            report_timeout_secs: 15,
            failure_threshold: 3,
            check_interval_secs: 5,
        }
    }
}

impl HealthSettings {
    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubConfig {
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub admission: AdmissionPolicy,
    #[serde(default)]
    pub restart: RestartSettings,
    #[serde(default)]
    pub health: HealthSettings,
}

impl HubConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(ConfigError::Invalid("backend with empty id".to_string()));
            }
            if backend.address.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' has no address",
                    backend.id
                )));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' is declared twice",
                    backend.id
                )));
            }
        }

        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
