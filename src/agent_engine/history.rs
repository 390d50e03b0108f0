use std::collections::VecDeque;

use tokio::time::Instant;

use crate::agent_engine::state::{Action, ActionRecord};
use crate::perception::types::Side;

/// Fixed-capacity FIFO: pushing onto a full ring evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Newest first.
    pub fn recent(&self) -> impl Iterator<Item = &T> {
        self.items.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Recent dispatched actions, the only cross-tick memory the policy reads.
#[derive(Debug, Clone)]
pub struct ActionHistory {
    records: Ring<ActionRecord>,
}

impl ActionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Ring::new(capacity),
        }
    }

    pub fn push(&mut self, record: ActionRecord) {
        self.records.push(record);
    }

    pub fn last(&self) -> Option<&ActionRecord> {
        self.records.last()
    }

    pub fn recent(&self) -> impl Iterator<Item = &ActionRecord> {
        self.records.recent()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of newest records satisfying `pred` before the first that doesn't.
    pub fn trailing(&self, pred: impl Fn(&ActionRecord) -> bool) -> usize {
        self.records.recent().take_while(|r| pred(r)).count()
    }

    /// True when the newest `n` records all satisfy `pred` (and there are `n`).
    pub fn last_n_all(&self, n: usize, pred: impl Fn(&ActionRecord) -> bool) -> bool {
        self.records.len() >= n && self.trailing(pred) >= n
    }

    /// Side chosen by the most recent ambiguous-turn tie-break.
    pub fn last_tie_break(&self) -> Option<Side> {
        self.records.recent().find_map(|r| r.tie_break)
    }

    /// When INTERACT last reached the game.
    pub fn last_interact_at(&self) -> Option<Instant> {
        self.records
            .recent()
            .find(|r| r.action.is_interact() && r.status.was_sent())
            .map(|r| r.at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_engine::state::{NavigationKind, OutcomeStatus};

    fn record(action: Action, state: NavigationKind, status: OutcomeStatus) -> ActionRecord {
        ActionRecord {
            action,
            state,
            tie_break: None,
            status,
            at: Instant::now(),
        }
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut ring = Ring::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.recent().next(), Some(&4));
        assert_eq!(ring.len(), ring.capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_counts_stop_at_first_mismatch() {
        let mut h = ActionHistory::new(10);
        h.push(record(Action::FORWARD, NavigationKind::InCorridor, OutcomeStatus::Delivered));
        h.push(record(Action::Wait, NavigationKind::Blocked, OutcomeStatus::Skipped));
        h.push(record(Action::Wait, NavigationKind::Blocked, OutcomeStatus::Skipped));
        assert_eq!(h.trailing(|r| r.state == NavigationKind::Blocked), 2);
        assert!(h.last_n_all(2, |r| r.action == Action::Wait));
        assert!(!h.last_n_all(3, |r| r.action == Action::Wait));
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_interact_does_not_count() {
        let mut h = ActionHistory::new(10);
        h.push(record(Action::INTERACT, NavigationKind::AtDoor, OutcomeStatus::FocusLost));
        assert_eq!(h.last_interact_at(), None);
        h.push(record(Action::INTERACT, NavigationKind::AtDoor, OutcomeStatus::DryRun));
        assert!(h.last_interact_at().is_some());
    }
}
