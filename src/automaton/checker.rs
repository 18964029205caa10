//! Determinism audit: cross-peer state-hash comparison.
//!
//! The leader records its own hash for sampled sequence numbers; followers
//! report theirs. Two different hashes for the same sequence number mean
//! the cell has diverged, which is unrecoverable.

use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct StateHashChecker {
  entries: Mutex<BTreeMap<i64, u64>>,
  max_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashReport {
  Match,
  Recorded,
  /// The reported hash disagrees with a previously recorded one.
  Divergence { recorded: u64, reported: u64 },
}

impl StateHashChecker {
  pub fn new(max_entries: usize) -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
      max_entries: max_entries.max(1),
    }
  }

  /// Records or cross-checks one `(sequence_number, state_hash)` sample.
  pub fn report(&self, sequence_number: i64, state_hash: u64) -> HashReport {
    let mut entries = self.entries.lock();
    if let Some(&recorded) = entries.get(&sequence_number) {
      if recorded == state_hash {
        return HashReport::Match;
      }
      return HashReport::Divergence {
        recorded,
        reported: state_hash,
      };
    }
    entries.insert(sequence_number, state_hash);
    while entries.len() > self.max_entries {
      let oldest = *entries.keys().next().expect("non-empty");
      entries.remove(&oldest);
    }
    HashReport::Recorded
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn matching_reports_agree() {
    let checker = StateHashChecker::new(8);
    assert_eq!(checker.report(1, 100), HashReport::Recorded);
    assert_eq!(checker.report(1, 100), HashReport::Match);
  }

  #[test]
  fn divergence_is_detected() {
    let checker = StateHashChecker::new(8);
    checker.report(5, 42);
    assert!(matches!(
      checker.report(5, 43),
      HashReport::Divergence {
        recorded: 42,
        reported: 43
      }
    ));
  }

  #[test]
  fn old_entries_are_evicted() {
    let checker = StateHashChecker::new(2);
    checker.report(1, 1);
    checker.report(2, 2);
    checker.report(3, 3);
    // Entry 1 evicted: a fresh report for it records anew.
    assert_eq!(checker.report(1, 999), HashReport::Recorded);
  }
}
