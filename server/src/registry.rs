//! Directory of backend servers and their last observed status
//!
//! Records are created once from configuration and never removed. Status is
//! replaced wholesale by whoever observes the backend (here: status reports
//! pushed by the backend agents, aged out by [`BackendRegistry::sweep_stale`]).

use crate::config::BackendConfig;
use log::{info, warn};
use shared::{duration_millis, BackendStatus};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRecord {
    pub id: String,
    pub display_name: String,
    /// Connection target handed to players on transfer
    pub address: String,
    /// Cosmetic only
    pub icon: Option<String>,
    pub status: BackendStatus,
    pub consecutive_failures: u32,
    /// Time (ms since epoch) of the last status report
    pub last_report: Option<u64>,
}

impl BackendRecord {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            id: config.id.clone(),
            display_name: config
                .display_name
                .clone()
                .unwrap_or_else(|| config.id.clone()),
            address: config.address.clone(),
            icon: config.icon.clone(),
            status: BackendStatus::offline(),
            consecutive_failures: 0,
            last_report: None,
        }
    }
}

pub struct BackendRegistry {
    backends: HashMap<String, BackendRecord>,
    /// Configuration order, kept for stable snapshots
    order: Vec<String>,
    failure_threshold: u32,
}

impl BackendRegistry {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            backends: HashMap::new(),
            order: Vec::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn from_config(backends: &[BackendConfig], failure_threshold: u32) -> Self {
        let mut registry = Self::new(failure_threshold);
        for backend in backends {
            registry.add(BackendRecord::from_config(backend));
        }
        registry
    }

    /// Registers a backend; a record with the same id is replaced
    pub fn add(&mut self, record: BackendRecord) {
        if !self.backends.contains_key(&record.id) {
            self.order.push(record.id.clone());
        }
        self.backends.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<&BackendRecord> {
        self.backends.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Copy of every record, in configuration order
    pub fn snapshot(&self) -> Vec<BackendRecord> {
        self.order
            .iter()
            .filter_map(|id| self.backends.get(id))
            .cloned()
            .collect()
    }

    /// Last-write-wins replacement of a backend's status
    pub fn set_status(&mut self, id: &str, status: BackendStatus) -> bool {
        match self.backends.get_mut(id) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    /// A backend reported in: it is online with the given occupancy
    pub fn record_report(&mut self, id: &str, current_count: u32, max_count: u32, now: u64) -> bool {
        let Some(record) = self.backends.get_mut(id) else {
            warn!("Status report from unknown backend '{}'", id);
            return false;
        };

        if !record.status.online {
            info!("Backend {} is online ({}/{})", id, current_count, max_count);
        }

        record.status = BackendStatus::online(current_count, max_count);
        record.consecutive_failures = 0;
        record.last_report = Some(now);
        true
    }

    /// Counts one missed report; past the threshold the backend is offline
    pub fn record_failure(&mut self, id: &str) -> bool {
        let threshold = self.failure_threshold;
        let Some(record) = self.backends.get_mut(id) else {
            return false;
        };

        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        if record.consecutive_failures >= threshold && record.status.online {
            warn!(
                "Backend {} missed {} status reports, marking offline",
                id, record.consecutive_failures
            );
            record.status = BackendStatus::offline();
        }
        true
    }

    /// Counts a failure for every backend that has not reported within
    /// `report_timeout`. Returns the ids that went offline during this sweep.
    pub fn sweep_stale(&mut self, now: u64, report_timeout: Duration) -> Vec<String> {
        let timeout_ms = duration_millis(report_timeout);
        let stale: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.backends.get(id.as_str()).is_some_and(|record| match record.last_report {
                    Some(at) => now.saturating_sub(at) > timeout_ms,
                    None => false,
                })
            })
            .cloned()
            .collect();

        let mut went_offline = Vec::new();
        for id in stale {
            let was_online = self.get(&id).is_some_and(|r| r.status.online);
            self.record_failure(&id);
            if was_online && self.get(&id).is_some_and(|r| !r.status.online) {
                went_offline.push(id);
            }
        }
        went_offline
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
