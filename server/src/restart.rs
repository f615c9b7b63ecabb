//! Restart coordination across backend servers
//!
//! Backends ask before restarting. At most one backend holds the restart slot
//! at any time; the rest wait in a FIFO backlog and are promoted in order when
//! the slot frees up. A cooldown keeps the same backend from restarting twice
//! in quick succession, and a periodic [`RestartCoordinator::sweep`] recovers
//! from requesters that went away and from restarts that never reported back.
//!
//! Every call returns immediately with a decision. Waiting and retrying is the
//! caller's job.

use crate::config::RestartPolicy;
use crate::error::RestartError;
use log::{debug, info, warn};
use shared::{
    duration_millis, RestartDecision, RestartEntryStatus, RestartQueueEntry, RestartState,
};
use std::collections::HashSet;

/// Unauthorized restarts remembered per backend, newest kept
pub const UNAUTHORIZED_AUDIT_LIMIT: usize = 32;

/// Where a single backend stands with the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPhase {
    Idle,
    Queued,
    Restarting,
}

/// What a watchdog sweep changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Backlog entries dropped for not being refreshed in time
    pub expired: Vec<String>,
    /// Backend whose restart was force-cleared
    pub recovered: Option<String>,
    /// Backend promoted into the freed slot
    pub promoted: Option<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.recovered.is_none() && self.promoted.is_none()
    }
}

pub struct RestartCoordinator {
    policy: RestartPolicy,
    /// When set, only these names may ask for a restart
    roster: Option<HashSet<String>>,
    state: RestartState,
}

impl RestartCoordinator {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            roster: None,
            state: RestartState::default(),
        }
    }

    /// Restricts restart requests to the given backend names
    pub fn with_roster<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roster = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    pub fn currently_restarting(&self) -> Option<&str> {
        self.state.currently_restarting.as_deref()
    }

    pub fn queue_len(&self) -> usize {
        self.state.queue.len()
    }

    pub fn phase(&self, server_name: &str) -> RestartPhase {
        if self.currently_restarting() == Some(server_name) {
            RestartPhase::Restarting
        } else if self.queue_index(server_name).is_some() {
            RestartPhase::Queued
        } else {
            RestartPhase::Idle
        }
    }

    /// Deep copy of the coordinator state for monitoring
    pub fn get_state(&self) -> RestartState {
        self.state.clone()
    }

    /// Decides whether `server_name` may restart now
    pub fn request_restart(&mut self, server_name: &str, now: u64) -> RestartDecision {
        if server_name.trim().is_empty() {
            return RestartDecision::Deny {
                reason: "server name is empty".to_string(),
            };
        }
        if let Some(roster) = &self.roster {
            if !roster.contains(server_name) {
                warn!("Restart request from unknown server '{}'", server_name);
                return RestartDecision::Deny {
                    reason: format!("{} is not a known server", server_name),
                };
            }
        }

        // Duplicate or retried request from the current holder
        if self.currently_restarting() == Some(server_name) {
            debug!("Re-allowing restart of {}", server_name);
            return RestartDecision::Allow;
        }

        if let Some(&last) = self.state.restart_history.get(server_name) {
            let ready_at = last.saturating_add(duration_millis(self.policy.cooldown));
            if now < ready_at {
                debug!("{} asked to restart during its cooldown", server_name);
                return RestartDecision::Wait {
                    retry_after: ready_at,
                    queue_position: None,
                    reason: format!(
                        "{} restarted {}s ago, cooldown is {}s",
                        server_name,
                        now.saturating_sub(last) / 1000,
                        self.policy.cooldown.as_secs()
                    ),
                };
            }
        }

        if self.state.currently_restarting.is_none() {
            self.grant(server_name, now);
            return RestartDecision::Allow;
        }

        let position = match self.queue_index(server_name) {
            Some(index) => {
                let entry = &mut self.state.queue[index];
                entry.retry_count = entry.retry_count.saturating_add(1);
                entry.last_retry_time = now;
                index + 1
            }
            None => {
                self.state
                    .queue
                    .push(RestartQueueEntry::new(server_name, now));
                info!(
                    "{} queued for restart at position {}",
                    server_name,
                    self.state.queue.len()
                );
                self.state.queue.len()
            }
        };

        let holder = self.currently_restarting().unwrap_or_default().to_string();
        RestartDecision::Wait {
            retry_after: now.saturating_add(
                duration_millis(self.policy.backoff_interval).saturating_mul(position as u64),
            ),
            queue_position: Some(position),
            reason: format!("{} is restarting, you are #{} in line", holder, position),
        }
    }

    /// The current holder finished restarting. Anyone else reporting
    /// completion is an error and changes nothing.
    pub fn notify_restart_complete(&mut self, server_name: &str, now: u64) -> Result<(), RestartError> {
        if self.currently_restarting() != Some(server_name) {
            let err = RestartError::UnexpectedCompletion {
                reported: server_name.to_string(),
                current: self.state.currently_restarting.clone(),
            };
            warn!("{}", err);
            return Err(err);
        }

        info!("{} finished restarting", server_name);
        self.state.currently_restarting = None;
        self.process_queue(now);
        Ok(())
    }

    /// A backend restarted without permission. The cooldown still applies to
    /// it, and if it held the slot the slot is handed on.
    pub fn notify_unauthorized_restart(&mut self, server_name: &str, now: u64) {
        warn!("{} restarted without permission", server_name);
        let audit = self
            .state
            .unauthorized_restarts
            .entry(server_name.to_string())
            .or_default();
        audit.push(now);
        if audit.len() > UNAUTHORIZED_AUDIT_LIMIT {
            let excess = audit.len() - UNAUTHORIZED_AUDIT_LIMIT;
            audit.drain(..excess);
        }
        self.state
            .restart_history
            .insert(server_name.to_string(), now);

        if let Some(index) = self.queue_index(server_name) {
            self.state.queue.remove(index);
        }

        if self.currently_restarting() == Some(server_name) {
            self.state.currently_restarting = None;
            self.process_queue(now);
        }
    }

    /// Periodic watchdog: expires stale backlog entries and force-clears a
    /// restart that has been running for longer than allowed
    pub fn sweep(&mut self, now: u64) -> SweepReport {
        let mut report = SweepReport::default();

        let queue_timeout = duration_millis(self.policy.queue_timeout);
        self.state.queue.retain(|entry| {
            let fresh = now.saturating_sub(entry.last_retry_time) <= queue_timeout;
            if !fresh {
                report.expired.push(entry.server_name.clone());
            }
            fresh
        });
        for name in &report.expired {
            info!("Restart request of {} expired", name);
        }

        if let Some(current) = self.state.currently_restarting.clone() {
            let stuck = match self.state.restart_history.get(&current) {
                Some(&started) => {
                    now.saturating_sub(started) > duration_millis(self.policy.max_restart_time)
                }
                None => {
                    warn!("{} holds the restart slot without a start time", current);
                    true
                }
            };

            if stuck {
                warn!(
                    "{} did not report a finished restart within {}s, releasing the slot",
                    current,
                    self.policy.max_restart_time.as_secs()
                );
                self.state.currently_restarting = None;
                report.recovered = Some(current);
                report.promoted = self.process_queue(now);
            }
        }

        report
    }

    /// Hands a free slot to the head of the backlog
    fn process_queue(&mut self, now: u64) -> Option<String> {
        if self.state.currently_restarting.is_some() || self.state.queue.is_empty() {
            return None;
        }

        let mut next = self.state.queue.remove(0);
        next.status = RestartEntryStatus::Allow;
        info!(
            "Promoting {} to restart after {} retries",
            next.server_name, next.retry_count
        );
        self.grant(&next.server_name, now);
        Some(next.server_name)
    }

    fn grant(&mut self, server_name: &str, now: u64) {
        if let Some(index) = self.queue_index(server_name) {
            self.state.queue.remove(index);
        }
        self.state.currently_restarting = Some(server_name.to_string());
        self.state
            .restart_history
            .insert(server_name.to_string(), now);
        info!("{} may restart now", server_name);
    }

    fn queue_index(&self, server_name: &str) -> Option<usize> {
        self.state
            .queue
            .iter()
            .position(|entry| entry.server_name == server_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    const SEC: u64 = 1_000;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            cooldown: Duration::from_secs(300),
            backoff_interval: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(600),
            max_restart_time: Duration::from_secs(120),
        }
    }

    fn coordinator() -> RestartCoordinator {
        RestartCoordinator::new(policy())
    }

    #[test]
    fn test_first_request_is_allowed() {
        let mut coordinator = coordinator();
        assert_eq!(coordinator.request_restart("BLACK", 0), RestartDecision::Allow);
        assert_eq!(coordinator.currently_restarting(), Some("BLACK"));
        assert_eq!(coordinator.phase("BLACK"), RestartPhase::Restarting);
        assert_eq!(coordinator.get_state().restart_history.get("BLACK"), Some(&0));
    }

    #[test]
    fn test_repeated_request_is_idempotent() {
        let mut coordinator = coordinator();
        assert_eq!(coordinator.request_restart("A", 0), RestartDecision::Allow);
        assert_eq!(coordinator.request_restart("A", 5 * SEC), RestartDecision::Allow);
        assert_eq!(coordinator.currently_restarting(), Some("A"));
        // The original grant time is kept
        assert_eq!(coordinator.get_state().restart_history.get("A"), Some(&0));
    }

    #[test]
    fn test_second_backend_waits_then_is_promoted() {
        let mut coordinator = coordinator();
        assert_eq!(coordinator.request_restart("BLACK", 0), RestartDecision::Allow);

        match coordinator.request_restart("RED", SEC) {
            RestartDecision::Wait {
                retry_after,
                queue_position,
                reason,
            } => {
                assert_eq!(queue_position, Some(1));
                assert_eq!(retry_after, SEC + 30 * SEC);
                assert!(reason.contains("BLACK"));
            }
            other => panic!("expected wait, got {:?}", other),
        }
        assert_eq!(coordinator.phase("RED"), RestartPhase::Queued);

        coordinator.notify_restart_complete("BLACK", 60 * SEC).unwrap();
        assert_eq!(coordinator.currently_restarting(), Some("RED"));
        assert_eq!(coordinator.queue_len(), 0);
        assert_eq!(coordinator.phase("BLACK"), RestartPhase::Idle);
        assert_eq!(
            coordinator.get_state().restart_history.get("RED"),
            Some(&(60 * SEC))
        );

        // RED's follow-up request is simply re-allowed
        assert_eq!(coordinator.request_restart("RED", 61 * SEC), RestartDecision::Allow);
    }

    #[test]
    fn test_retry_keeps_fifo_position() {
        let mut coordinator = coordinator();
        coordinator.request_restart("A", 0);
        coordinator.request_restart("B", SEC);
        coordinator.request_restart("C", 2 * SEC);

        match coordinator.request_restart("B", 10 * SEC) {
            RestartDecision::Wait {
                retry_after,
                queue_position,
                ..
            } => {
                assert_eq!(queue_position, Some(1));
                assert_eq!(retry_after, 10 * SEC + 30 * SEC);
            }
            other => panic!("expected wait, got {:?}", other),
        }
        match coordinator.request_restart("C", 10 * SEC) {
            RestartDecision::Wait {
                retry_after,
                queue_position,
                ..
            } => {
                assert_eq!(queue_position, Some(2));
                assert_eq!(retry_after, 10 * SEC + 60 * SEC);
            }
            other => panic!("expected wait, got {:?}", other),
        }

        let state = coordinator.get_state();
        assert_eq!(state.queue.len(), 2);
        assert_eq!(state.queue[0].server_name, "B");
        assert_eq!(state.queue[0].retry_count, 1);
        assert_eq!(state.queue[0].request_time, SEC);
        assert_eq!(state.queue[0].last_retry_time, 10 * SEC);
    }

    #[test]
    fn test_cooldown_after_completion() {
        let mut coordinator = coordinator();
        coordinator.request_restart("A", 0);
        coordinator.notify_restart_complete("A", 40 * SEC).unwrap();

        match coordinator.request_restart("A", 100 * SEC) {
            RestartDecision::Wait {
                retry_after,
                queue_position,
                ..
            } => {
                assert_eq!(retry_after, 300 * SEC);
                assert_eq!(queue_position, None);
            }
            other => panic!("expected cooldown wait, got {:?}", other),
        }
        assert_eq!(coordinator.currently_restarting(), None);

        assert_eq!(coordinator.request_restart("A", 300 * SEC), RestartDecision::Allow);
    }

    #[test]
    fn test_unexpected_completion_changes_nothing() {
        let mut coordinator = coordinator();
        coordinator.request_restart("A", 0);
        coordinator.request_restart("B", SEC);
        let before = coordinator.get_state();

        let err = coordinator.notify_restart_complete("B", 2 * SEC).unwrap_err();
        assert_eq!(
            err,
            RestartError::UnexpectedCompletion {
                reported: "B".to_string(),
                current: Some("A".to_string()),
            }
        );
        assert_eq!(coordinator.get_state(), before);

        let mut idle = self::coordinator();
        assert!(idle.notify_restart_complete("A", 0).is_err());
    }

    #[test]
    fn test_unauthorized_restart_of_holder_frees_slot() {
        let mut coordinator = coordinator();
        coordinator.request_restart("A", 0);
        coordinator.request_restart("B", SEC);

        coordinator.notify_unauthorized_restart("A", 5 * SEC);

        let state = coordinator.get_state();
        assert_eq!(state.currently_restarting.as_deref(), Some("B"));
        assert_eq!(state.unauthorized_restarts.get("A"), Some(&vec![5 * SEC]));
        assert_eq!(state.restart_history.get("A"), Some(&(5 * SEC)));
    }

    #[test]
    fn test_unauthorized_restart_starts_cooldown_and_leaves_queue() {
        let mut coordinator = coordinator();
        coordinator.request_restart("A", 0);
        coordinator.request_restart("B", SEC);

        coordinator.notify_unauthorized_restart("B", 10 * SEC);
        assert_eq!(coordinator.phase("B"), RestartPhase::Idle);
        assert_eq!(coordinator.currently_restarting(), Some("A"));

        coordinator.notify_restart_complete("A", 20 * SEC).unwrap();
        match coordinator.request_restart("B", 30 * SEC) {
            RestartDecision::Wait {
                retry_after,
                queue_position: None,
                ..
            } => assert_eq!(retry_after, 310 * SEC),
            other => panic!("expected cooldown wait, got {:?}", other),
        }
    }

    #[test]
    fn test_unauthorized_audit_keeps_newest_entries() {
        let mut coordinator = coordinator();
        for i in 0..600 {
            coordinator.notify_unauthorized_restart("survival", i * SEC);
        }

        let state = coordinator.get_state();
        let audit = &state.unauthorized_restarts["survival"];
        assert_eq!(audit.len(), UNAUTHORIZED_AUDIT_LIMIT);
        assert_eq!(audit.first(), Some(&((600 - UNAUTHORIZED_AUDIT_LIMIT as u64) * SEC)));
        assert_eq!(audit.last(), Some(&(599 * SEC)));
        assert_eq!(state.restart_history["survival"], 599 * SEC);

        let encoded = bincode::serialize(&shared::Packet::StateSnapshot { state }).unwrap();
        assert!(encoded.len() < 4096);
    }

    #[test]
    fn test_huge_backoff_saturates() {
        let mut coordinator = RestartCoordinator::new(RestartPolicy {
            backoff_interval: Duration::from_secs(u64::MAX / 1000),
            ..policy()
        });
        coordinator.request_restart("A", 0);
        coordinator.request_restart("B", SEC);

        match coordinator.request_restart("C", 2 * SEC) {
            RestartDecision::Wait {
                retry_after,
                queue_position,
                ..
            } => {
                assert_eq!(queue_position, Some(2));
                assert_eq!(retry_after, u64::MAX);
            }
            other => panic!("expected queued wait, got {:?}", other),
        }
    }

    #[test]
    fn test_sweep_expires_stale_requests() {
        let mut coordinator = coordinator();
        coordinator.request_restart("A", 0);
        coordinator.request_restart("B", SEC);
        coordinator.request_restart("C", 2 * SEC);
        coordinator.request_restart("C", 100 * SEC);

        // Same backlog with a watchdog that stays quiet
        let mut quiet = RestartCoordinator::new(RestartPolicy {
            max_restart_time: Duration::from_secs(10_000),
            ..policy()
        });
        quiet.request_restart("A", 0);
        quiet.request_restart("B", SEC);
        quiet.request_restart("C", 2 * SEC);
        quiet.request_restart("C", 100 * SEC);

        let report = quiet.sweep(650 * SEC);
        assert_eq!(report.expired, vec!["B".to_string()]);
        assert_eq!(report.recovered, None);
        assert_eq!(quiet.phase("C"), RestartPhase::Queued);

        // Expiry happens before promotion, so a stale head is never promoted
        let report = coordinator.sweep(650 * SEC);
        assert_eq!(report.expired, vec!["B".to_string()]);
        assert_eq!(report.recovered.as_deref(), Some("A"));
        assert_eq!(report.promoted.as_deref(), Some("C"));
    }

    #[test]
    fn test_watchdog_recovers_stuck_restart() {
        let mut coordinator = coordinator();
        coordinator.request_restart("A", 0);
        coordinator.request_restart("B", SEC);

        assert!(coordinator.sweep(120 * SEC).is_empty());
        assert_eq!(coordinator.currently_restarting(), Some("A"));

        let report = coordinator.sweep(121 * SEC);
        assert_eq!(report.recovered.as_deref(), Some("A"));
        assert_eq!(report.promoted.as_deref(), Some("B"));
        assert_eq!(coordinator.currently_restarting(), Some("B"));
        assert_eq!(
            coordinator.get_state().restart_history.get("B"),
            Some(&(121 * SEC))
        );
    }

    #[test]
    fn test_watchdog_with_empty_queue() {
        let mut coordinator = coordinator();
        coordinator.request_restart("A", 0);

        let report = coordinator.sweep(500 * SEC);
        assert_eq!(report.recovered.as_deref(), Some("A"));
        assert_eq!(report.promoted, None);
        assert_eq!(coordinator.currently_restarting(), None);
    }

    #[test]
    fn test_deny_blank_and_unknown_names() {
        let mut coordinator = coordinator().with_roster(["RED", "BLACK"]);
        assert!(matches!(
            coordinator.request_restart("  ", 0),
            RestartDecision::Deny { .. }
        ));
        assert!(matches!(
            coordinator.request_restart("GREEN", 0),
            RestartDecision::Deny { reason } if reason.contains("GREEN")
        ));
        assert_eq!(coordinator.currently_restarting(), None);
        assert_eq!(coordinator.request_restart("RED", 0), RestartDecision::Allow);
    }

    #[test]
    fn test_state_is_detached_copy() {
        let mut coordinator = coordinator();
        coordinator.request_restart("A", 0);
        let snapshot = coordinator.get_state();

        coordinator.request_restart("B", SEC);
        coordinator.notify_unauthorized_restart("C", 2 * SEC);

        assert!(snapshot.queue.is_empty());
        assert!(snapshot.unauthorized_restarts.is_empty());
        assert_eq!(coordinator.get_state().queue.len(), 1);
    }

    #[test]
    fn test_random_interleavings_keep_mutual_exclusion() {
        let mut rng = StdRng::seed_from_u64(42);
        let names = ["RED", "BLACK", "BLUE", "GREEN", "WHITE"];
        let mut coordinator = coordinator();
        let mut now = 0u64;

        for _ in 0..5_000 {
            now += rng.gen_range(0..20 * SEC);
            let name = names[rng.gen_range(0..names.len())];

            match rng.gen_range(0..10) {
                0..=5 => {
                    let decision = coordinator.request_restart(name, now);
                    if decision.is_allow() {
                        assert_eq!(coordinator.currently_restarting(), Some(name));
                    }
                }
                6..=7 => {
                    let _ = coordinator.notify_restart_complete(name, now);
                }
                8 => coordinator.notify_unauthorized_restart(name, now),
                _ => {
                    coordinator.sweep(now);
                }
            }

            let state = coordinator.get_state();
            let mut seen = HashSet::new();
            for entry in &state.queue {
                assert!(seen.insert(entry.server_name.clone()), "duplicate backlog entry");
                assert_ne!(state.currently_restarting.as_ref(), Some(&entry.server_name));
            }
        }
    }
}
