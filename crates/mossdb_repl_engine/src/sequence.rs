//! Out-of-order completion tracking for pulled revisions.

use std::collections::{BTreeMap, BTreeSet};

/// Maps opaque remote sequence tokens to local monotonic slots and computes
/// the highest token whose entire slot prefix has completed.
///
/// Each incoming token is assigned the next slot number (starting at 1).
/// Slots are removed in any order as their work completes, but the
/// checkpointable token only advances when no smaller slot remains
/// outstanding. This is what keeps a persisted checkpoint from skipping
/// over an in-flight revision.
///
/// Callers must serialize access; the tracker itself is not synchronized.
///
/// # Invariants
///
/// - `checkpointable_token()` is non-decreasing
/// - The returned token never has an outstanding predecessor slot
/// - Memory is bounded by the outstanding backlog: tokens behind the
///   completed prefix are pruned
#[derive(Debug, Default)]
pub struct SequenceTracker {
    /// Next slot to assign; slots start at 1.
    next_slot: u64,
    /// Slots whose work has not completed yet.
    pending: BTreeSet<u64>,
    /// Remote tokens for slots at or above the completed prefix.
    tokens: BTreeMap<u64, String>,
    /// Highest slot N with slots 1..=N all complete.
    completed_prefix: u64,
    /// Token for the completed prefix; the baseline until slots complete.
    checkpoint_token: Option<String>,
}

impl SequenceTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            next_slot: 1,
            pending: BTreeSet::new(),
            tokens: BTreeMap::new(),
            completed_prefix: 0,
            checkpoint_token: None,
        }
    }

    /// Sets the baseline token reported before any slot completes.
    pub fn set_baseline(&mut self, token: impl Into<String>) {
        if self.completed_prefix == 0 {
            self.checkpoint_token = Some(token.into());
        }
    }

    /// Assigns the next slot to an incoming remote token.
    pub fn add_token(&mut self, token: impl Into<String>) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.pending.insert(slot);
        self.tokens.insert(slot, token.into());
        slot
    }

    /// Marks a slot's work complete (success or terminal failure).
    ///
    /// Removing a slot twice is a no-op.
    pub fn remove_slot(&mut self, slot: u64) {
        if !self.pending.remove(&slot) {
            return;
        }
        let target = self
            .pending
            .iter()
            .next()
            .map(|&first| first - 1)
            .unwrap_or(self.next_slot - 1);
        if target > self.completed_prefix {
            self.completed_prefix = target;
            if let Some(token) = self.tokens.get(&target) {
                self.checkpoint_token = Some(token.clone());
            }
            self.tokens = self.tokens.split_off(&(target + 1));
        }
    }

    /// Returns the token of the highest slot whose prefix has fully
    /// completed, or the baseline if no slot has completed yet.
    pub fn checkpointable_token(&self) -> Option<String> {
        self.checkpoint_token.clone()
    }

    /// Number of slots still outstanding.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if no slot was ever assigned.
    pub fn is_empty(&self) -> bool {
        self.next_slot == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_monotonic() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.add_token("a"), 1);
        assert_eq!(tracker.add_token("b"), 2);
        assert_eq!(tracker.add_token("c"), 3);
        assert_eq!(tracker.pending_count(), 3);
    }

    #[test]
    fn baseline_before_any_completion() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.checkpointable_token(), None);

        tracker.set_baseline("100");
        assert_eq!(tracker.checkpointable_token(), Some("100".into()));

        tracker.add_token("101");
        assert_eq!(tracker.checkpointable_token(), Some("100".into()));
    }

    #[test]
    fn in_order_completion_advances() {
        let mut tracker = SequenceTracker::new();
        tracker.add_token("5");
        tracker.add_token("6");
        tracker.add_token("7");

        tracker.remove_slot(1);
        assert_eq!(tracker.checkpointable_token(), Some("5".into()));
        tracker.remove_slot(2);
        assert_eq!(tracker.checkpointable_token(), Some("6".into()));
        tracker.remove_slot(3);
        assert_eq!(tracker.checkpointable_token(), Some("7".into()));
    }

    #[test]
    fn out_of_order_completion_waits_for_prefix() {
        let mut tracker = SequenceTracker::new();
        tracker.set_baseline("0");
        tracker.add_token("5");
        tracker.add_token("6");
        tracker.add_token("7");

        tracker.remove_slot(3);
        assert_eq!(tracker.checkpointable_token(), Some("0".into()));
        tracker.remove_slot(1);
        assert_eq!(tracker.checkpointable_token(), Some("5".into()));
        // Removing slot 2 completes the prefix through slot 3.
        tracker.remove_slot(2);
        assert_eq!(tracker.checkpointable_token(), Some("7".into()));
    }

    #[test]
    fn double_remove_is_noop() {
        let mut tracker = SequenceTracker::new();
        tracker.add_token("5");
        tracker.add_token("6");

        tracker.remove_slot(1);
        tracker.remove_slot(1);
        assert_eq!(tracker.checkpointable_token(), Some("5".into()));
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn removing_unknown_slot_is_noop() {
        let mut tracker = SequenceTracker::new();
        tracker.add_token("5");
        tracker.remove_slot(99);
        assert_eq!(tracker.checkpointable_token(), None);
    }

    #[test]
    fn token_is_never_decreasing_under_interleaving() {
        let mut tracker = SequenceTracker::new();
        tracker.set_baseline("b");
        let removal_order = [4u64, 2, 7, 1, 3, 6, 5, 10, 8, 9];
        for i in 1..=10u64 {
            tracker.add_token(format!("t{i}"));
        }

        let mut last: Option<String> = Some("b".into());
        let mut completed = std::collections::BTreeSet::new();
        for slot in removal_order {
            tracker.remove_slot(slot);
            completed.insert(slot);
            let token = tracker.checkpointable_token();
            // Non-decreasing: once a token is reported, smaller ones never
            // come back.
            if token != last {
                let reported = token.clone().unwrap();
                let n: u64 = reported.trim_start_matches('t').parse().unwrap();
                // Every slot up to n must have completed.
                assert!((1..=n).all(|s| completed.contains(&s)));
                let prev: u64 = last
                    .as_deref()
                    .filter(|t| t.starts_with('t'))
                    .map(|t| t.trim_start_matches('t').parse().unwrap())
                    .unwrap_or(0);
                assert!(n > prev);
                last = token;
            }
        }
        assert_eq!(tracker.checkpointable_token(), Some("t10".into()));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn tokens_are_pruned_behind_the_prefix() {
        let mut tracker = SequenceTracker::new();
        for i in 1..=100u64 {
            tracker.add_token(format!("t{i}"));
        }
        for i in 1..=99u64 {
            tracker.remove_slot(i);
        }
        assert_eq!(tracker.tokens.len(), 1);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn is_empty_reflects_assignment() {
        let mut tracker = SequenceTracker::new();
        assert!(tracker.is_empty());
        tracker.add_token("1");
        assert!(!tracker.is_empty());
        tracker.remove_slot(1);
        assert!(!tracker.is_empty());
    }
}
