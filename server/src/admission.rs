//! Admission queue: players waiting for a slot on a capacity-limited backend
//!
//! The queue is re-evaluated once per server tick by [`AdmissionQueue::reconcile`],
//! which admits at most one player per call. Transfers are asynchronous and may
//! fail, so admitting several players in the same tick would race for the same
//! free slot. A failed transfer hands the entry back through
//! [`AdmissionQueue::requeue_failed`] with its original standing.
//!
//! Disconnected players are not removed eagerly. They are discovered through
//! the liveness check during reconciliation and position lookups.

use crate::config::AdmissionPolicy;
use crate::error::{AdmissionError, TransferError};
use crate::ledger::{PriorityLedger, QueueEntry, SubjectId};
use crate::notify::{self, LivenessCheck, NotificationSink};
use crate::registry::{BackendRecord, BackendRegistry};
use log::{debug, info, warn};
use shared::{BackendStatus, PriorityRank};
use std::collections::HashMap;

/// A player popped from the queue and the backend it should be sent to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDecision {
    pub entry: QueueEntry,
    pub backend_id: String,
    pub address: String,
}

impl TransferDecision {
    pub fn subject(&self) -> SubjectId {
        self.entry.subject
    }
}

/// Outcome of checking one entry against its backend's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capacity {
    Admit,
    Offline,
    Full,
    /// Only the reserved slots are left and the rank does not qualify
    Reserved,
}

pub struct AdmissionQueue<N: NotificationSink> {
    ledger: PriorityLedger,
    policy: AdmissionPolicy,
    sink: N,
}

impl<N: NotificationSink> AdmissionQueue<N> {
    pub fn new(policy: AdmissionPolicy, sink: N) -> Self {
        Self {
            ledger: PriorityLedger::new(),
            policy,
            sink,
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub fn sink(&self) -> &N {
        &self.sink
    }

    /// Puts `subject` in line for `target`, replacing any entry it already had
    pub fn enqueue(
        &mut self,
        subject: SubjectId,
        rank: PriorityRank,
        target: &str,
        now: u64,
        backends: &BackendRegistry,
    ) {
        if let Some(index) = self.ledger.find(subject) {
            if let Some(previous) = self.ledger.remove_at(index) {
                debug!(
                    "Subject {} re-queued, dropping previous entry for {}",
                    subject, previous.target
                );
            }
        }

        self.ledger.push(subject, rank, now, target);
        info!(
            "Subject {} ({}) queued for {}, {} waiting",
            subject,
            rank,
            target,
            self.ledger.len()
        );

        let status = backends.get(target).map(|record| &record.status);
        self.sink
            .notify(subject, &notify::availability_message(target, status));
    }

    /// Takes `subject` out of the queue. Returns false if it was not queued.
    pub fn remove(&mut self, subject: SubjectId) -> bool {
        let Some(index) = self.ledger.find(subject) else {
            return false;
        };

        let removed = self.ledger.remove_at(index).is_some();
        if removed {
            debug!("Subject {} left the queue", subject);
            self.sink.clear_progress(subject);
        }
        removed
    }

    /// 1-indexed place of `subject` among live queued entries, counted with the
    /// queue order rather than heap layout
    pub fn position(&self, subject: SubjectId, liveness: &impl LivenessCheck) -> Option<usize> {
        if !liveness.is_live(subject) {
            return None;
        }

        let index = self.ledger.find(subject)?;
        let entry = self.ledger.get(index)?;
        let ahead = self
            .ledger
            .iter()
            .filter(|other| other.subject != subject)
            .filter(|other| other.precedes(entry))
            .filter(|other| liveness.is_live(other.subject))
            .count();

        Some(ahead + 1)
    }

    pub fn is_queued(&self, subject: SubjectId) -> bool {
        self.ledger.find(subject).is_some()
    }

    pub fn size(&self) -> usize {
        self.ledger.len()
    }

    /// All entries in queue order, best first
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.ledger.sorted()
    }

    /// Re-evaluates the queue against a backend snapshot and admits at most
    /// one player. Never fails: anything that cannot be served is dropped or
    /// left waiting.
    pub fn reconcile(
        &mut self,
        now: u64,
        snapshot: &[BackendRecord],
        liveness: &impl LivenessCheck,
    ) -> Vec<TransferDecision> {
        if self.ledger.is_empty() {
            return Vec::new();
        }

        let backends: HashMap<&str, &BackendRecord> = snapshot
            .iter()
            .map(|record| (record.id.as_str(), record))
            .collect();

        let mut decisions = Vec::new();
        let mut changed = false;

        for entry in self.ledger.sorted() {
            if !liveness.is_live(entry.subject) {
                debug!("Dropping queue entry of disconnected subject {}", entry.subject);
                self.take(&entry);
                changed = true;
                continue;
            }

            let Some(backend) = backends.get(entry.target.as_str()) else {
                let err = AdmissionError::InvalidTarget {
                    subject: entry.subject,
                    target: entry.target.clone(),
                };
                warn!("Dropping queue entry: {}", err);
                self.take(&entry);
                self.sink
                    .notify(entry.subject, &notify::invalid_target_message(&entry.target));
                self.sink.clear_progress(entry.subject);
                changed = true;
                continue;
            };

            match self.capacity_for(entry.rank, &backend.status) {
                Capacity::Admit => {}
                skipped => {
                    debug!(
                        "Subject {} waits for {}: {:?}",
                        entry.subject, entry.target, skipped
                    );
                    continue;
                }
            }

            if let Some(taken) = self.take(&entry) {
                info!(
                    "Admitting subject {} ({}) to {} after {}ms",
                    taken.subject,
                    taken.rank,
                    backend.id,
                    now.saturating_sub(taken.join_time)
                );
                self.sink.clear_progress(taken.subject);
                decisions.push(TransferDecision {
                    entry: taken,
                    backend_id: backend.id.clone(),
                    address: backend.address.clone(),
                });
                changed = true;
            }
            break;
        }

        if changed {
            self.refresh_progress(liveness);
        }

        decisions
    }

    /// Restores a player whose transfer failed, keeping its rank, join time and
    /// sequence so it returns ahead of everyone of its rank who joined later.
    /// Returns false when the entry is not restored (player gone, or already
    /// queued again on its own).
    pub fn requeue_failed(
        &mut self,
        decision: TransferDecision,
        error: &TransferError,
        liveness: &impl LivenessCheck,
    ) -> bool {
        let subject = decision.subject();
        if !liveness.is_live(subject) {
            debug!("Not restoring subject {}: {}", subject, error);
            return false;
        }
        if self.is_queued(subject) {
            debug!("Not restoring subject {}: it queued again", subject);
            return false;
        }

        warn!(
            "Transfer of subject {} to {} failed ({}), restoring its place",
            subject, decision.backend_id, error
        );
        self.sink.notify(
            subject,
            &notify::transfer_failed_message(&decision.backend_id, &error.to_string()),
        );
        self.ledger.restore(decision.entry);
        self.refresh_progress(liveness);
        true
    }

    /// Pushes position and wait band to every live queued subject
    pub fn refresh_progress(&self, liveness: &impl LivenessCheck) {
        let live: Vec<QueueEntry> = self
            .ledger
            .sorted()
            .into_iter()
            .filter(|entry| liveness.is_live(entry.subject))
            .collect();

        let size = live.len();
        for (index, entry) in live.iter().enumerate() {
            self.sink.show_progress(
                entry.subject,
                &notify::progress_text(&entry.target, index + 1, size),
            );
        }
    }

    fn capacity_for(&self, rank: PriorityRank, status: &BackendStatus) -> Capacity {
        if !status.online {
            return Capacity::Offline;
        }
        if status.is_full() {
            return Capacity::Full;
        }

        let open_limit = status.max_count.saturating_sub(self.policy.reserved_slots);
        if status.current_count >= open_limit && rank < self.policy.admin_threshold {
            return Capacity::Reserved;
        }

        Capacity::Admit
    }

    /// Removes exactly this entry (same subject and sequence) if still present
    fn take(&mut self, entry: &QueueEntry) -> Option<QueueEntry> {
        let index = self
            .ledger
            .iter()
            .position(|e| e.subject == entry.subject && e.seq() == entry.seq())?;
        self.ledger.remove_at(index)
    }
}
