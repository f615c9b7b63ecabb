//! Priority ledger backing the admission queue
//!
//! A binary heap of waiting entries ordered by rank (highest first), then by
//! join time (earliest first), then by insertion sequence. Every entry carries
//! its own position in the heap array so that an entry can be deleted by
//! identity in O(log n) once it has been located.
//!
//! The heap array is only a partial order. Anything that needs a total order
//! (positions, progress bands, reconciliation scans) must use [`PriorityLedger::sorted`].

use shared::PriorityRank;
use std::cmp::Ordering;

/// Arena-style handle of a connected player. Never owns the player; the holder
/// must re-check liveness before acting on it.
pub type SubjectId = u32;

/// One waiting player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub subject: SubjectId,
    pub rank: PriorityRank,
    /// Milliseconds since the Unix epoch at which the player joined
    pub join_time: u64,
    /// Identifier of the backend the player wants to join
    pub target: String,
    seq: u64,
    heap_index: usize,
}

impl QueueEntry {
    /// Insertion sequence, the final tie-break between equal rank and join time
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn heap_index(&self) -> usize {
        self.heap_index
    }

    /// Total queue order: `Less` means `self` is served before `other`
    pub fn cmp_priority(&self, other: &QueueEntry) -> Ordering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| self.join_time.cmp(&other.join_time))
            .then_with(|| self.seq.cmp(&other.seq))
    }

    pub fn precedes(&self, other: &QueueEntry) -> bool {
        self.cmp_priority(other) == Ordering::Less
    }
}

/// Binary heap of [`QueueEntry`] values with identity-based removal
#[derive(Debug, Default)]
pub struct PriorityLedger {
    heap: Vec<QueueEntry>,
    next_seq: u64,
}

impl PriorityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new entry and returns its insertion sequence
    pub fn push(
        &mut self,
        subject: SubjectId,
        rank: PriorityRank,
        join_time: u64,
        target: &str,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.insert(QueueEntry {
            subject,
            rank,
            join_time,
            target: target.to_string(),
            seq,
            heap_index: 0,
        });

        seq
    }

    /// Re-inserts a previously removed entry, keeping its rank, join time and
    /// sequence so it regains the standing it had before removal
    pub fn restore(&mut self, entry: QueueEntry) {
        self.next_seq = self.next_seq.max(entry.seq + 1);
        self.insert(entry);
    }

    fn insert(&mut self, mut entry: QueueEntry) {
        let index = self.heap.len();
        entry.heap_index = index;
        self.heap.push(entry);
        self.sift_up(index);
    }

    /// Highest-priority entry without removing it
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.heap.first()
    }

    /// Removes and returns the highest-priority entry
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.remove_at(0)
    }

    /// Removes the entry stored at `heap_index`
    pub fn remove_at(&mut self, heap_index: usize) -> Option<QueueEntry> {
        if heap_index >= self.heap.len() {
            return None;
        }

        let mut removed = self.heap.swap_remove(heap_index);
        if heap_index < self.heap.len() {
            self.heap[heap_index].heap_index = heap_index;
            // The moved tail element may belong either above or below this slot
            self.sift_down(heap_index);
            self.sift_up(heap_index);
        }

        removed.heap_index = 0;
        Some(removed)
    }

    /// Heap index of the subject's entry, by linear scan
    pub fn find(&self, subject: SubjectId) -> Option<usize> {
        self.heap
            .iter()
            .position(|entry| entry.subject == subject)
    }

    pub fn get(&self, heap_index: usize) -> Option<&QueueEntry> {
        self.heap.get(heap_index)
    }

    /// Entries in heap-array order (not a total order)
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.heap.iter()
    }

    /// Snapshot of all entries in full queue order, best first
    pub fn sorted(&self) -> Vec<QueueEntry> {
        let mut entries = self.heap.clone();
        entries.sort_by(|a, b| a.cmp_priority(b));
        entries
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.heap[a].heap_index = a;
        self.heap[b].heap_index = b;
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].precedes(&self.heap[parent]) {
                self.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut best = index;

            if left < len && self.heap[left].precedes(&self.heap[best]) {
                best = left;
            }
            if right < len && self.heap[right].precedes(&self.heap[best]) {
                best = right;
            }
            if best == index {
                break;
            }

            self.swap(index, best);
            index = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assert_heap_valid(ledger: &PriorityLedger) {
        for (index, entry) in ledger.heap.iter().enumerate() {
            assert_eq!(entry.heap_index, index, "stale heap index");
            if index > 0 {
                let parent = &ledger.heap[(index - 1) / 2];
                assert!(
                    !entry.precedes(parent),
                    "child {} sorts before its parent {}",
                    entry.subject,
                    parent.subject
                );
            }
        }
    }

    fn drain(ledger: &mut PriorityLedger) -> Vec<QueueEntry> {
        let mut out = Vec::new();
        while let Some(entry) = ledger.pop() {
            assert_heap_valid(ledger);
            out.push(entry);
        }
        out
    }

    #[test]
    fn test_pop_orders_by_rank_then_join_time() {
        let mut ledger = PriorityLedger::new();
        ledger.push(1, PriorityRank::Player, 100, "lobby");
        ledger.push(2, PriorityRank::Admin, 300, "lobby");
        ledger.push(3, PriorityRank::Trainer, 50, "lobby");
        ledger.push(4, PriorityRank::Admin, 200, "lobby");
        ledger.push(5, PriorityRank::Player, 10, "lobby");

        let order: Vec<SubjectId> = drain(&mut ledger).iter().map(|e| e.subject).collect();
        assert_eq!(order, vec![4, 2, 3, 5, 1]);
    }

    #[test]
    fn test_equal_rank_and_time_keeps_insertion_order() {
        let mut ledger = PriorityLedger::new();
        for subject in 1..=6 {
            ledger.push(subject, PriorityRank::Supporter, 500, "lobby");
        }

        let order: Vec<SubjectId> = drain(&mut ledger).iter().map(|e| e.subject).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_remove_at_keeps_heap_valid() {
        let mut ledger = PriorityLedger::new();
        for subject in 0..20u32 {
            let rank = PriorityRank::ALL[(subject % 5) as usize];
            ledger.push(subject, rank, u64::from(subject) * 7 % 13, "lobby");
        }

        let index = ledger.find(7).unwrap();
        let removed = ledger.remove_at(index).unwrap();
        assert_eq!(removed.subject, 7);
        assert_eq!(ledger.len(), 19);
        assert!(ledger.find(7).is_none());
        assert_heap_valid(&ledger);

        let last = ledger.len() - 1;
        assert!(ledger.remove_at(last).is_some());
        assert_heap_valid(&ledger);

        assert!(ledger.remove_at(100).is_none());
    }

    #[test]
    fn test_restore_regains_standing() {
        let mut ledger = PriorityLedger::new();
        ledger.push(1, PriorityRank::Trainer, 100, "lobby");
        ledger.push(2, PriorityRank::Trainer, 200, "lobby");

        let first = ledger.pop().unwrap();
        assert_eq!(first.subject, 1);

        ledger.push(3, PriorityRank::Trainer, 300, "lobby");
        ledger.restore(first);

        let order: Vec<SubjectId> = drain(&mut ledger).iter().map(|e| e.subject).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_sorted_matches_pop_order() {
        let mut ledger = PriorityLedger::new();
        ledger.push(1, PriorityRank::Player, 5, "a");
        ledger.push(2, PriorityRank::Moderator, 9, "b");
        ledger.push(3, PriorityRank::Moderator, 1, "a");
        ledger.push(4, PriorityRank::Supporter, 3, "c");

        let sorted: Vec<SubjectId> = ledger.sorted().iter().map(|e| e.subject).collect();
        let popped: Vec<SubjectId> = drain(&mut ledger).iter().map(|e| e.subject).collect();
        assert_eq!(sorted, popped);
        assert_eq!(sorted, vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_peek_and_empty() {
        let mut ledger = PriorityLedger::new();
        assert!(ledger.is_empty());
        assert!(ledger.peek().is_none());
        assert!(ledger.pop().is_none());

        ledger.push(9, PriorityRank::Player, 1, "lobby");
        assert_eq!(ledger.peek().map(|e| e.subject), Some(9));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get(0).map(|e| e.target.as_str()), Some("lobby"));
    }

    #[test]
    fn test_random_interleavings_preserve_order() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _round in 0..50 {
            let mut ledger = PriorityLedger::new();
            let mut next_subject = 0u32;

            for _ in 0..200 {
                match rng.gen_range(0..10) {
                    0..=5 => {
                        let rank = PriorityRank::ALL[rng.gen_range(0..5)];
                        let join_time = rng.gen_range(0..1_000u64);
                        ledger.push(next_subject, rank, join_time, "lobby");
                        next_subject += 1;
                    }
                    6..=7 => {
                        if let Some(best) = ledger.pop() {
                            assert!(ledger.iter().all(|other| !other.precedes(&best)));
                        }
                    }
                    _ => {
                        if !ledger.is_empty() {
                            let index = rng.gen_range(0..ledger.len());
                            ledger.remove_at(index);
                        }
                    }
                }
                assert_heap_valid(&ledger);
            }

            // Whatever remains must come out in non-increasing rank, then
            // non-decreasing join time
            let rest = drain(&mut ledger);
            for pair in rest.windows(2) {
                assert!(pair[0].rank >= pair[1].rank);
                if pair[0].rank == pair[1].rank {
                    assert!(pair[0].join_time <= pair[1].join_time);
                }
            }
        }
    }
}
