//! Execution-time mutation scratchpad.

use crate::types::{MutationRecord, Version};
use crate::util::checksum::combine_state_hash;
use crate::util::rng::DeterministicRng;
use std::cell::Cell;
use uuid::Uuid;

/// Read-only view of the in-flight mutation, reachable from anywhere on the
/// automaton thread while a mutation is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmbientMutationInfo {
  pub version: Version,
  pub sequence_number: i64,
  pub timestamp_micros: u64,
  pub random_seed: u64,
}

thread_local! {
  static AMBIENT: Cell<Option<AmbientMutationInfo>> = const { Cell::new(None) };
}

/// The ambient info of the mutation currently applying on this thread, if
/// any.
pub fn current_mutation_info() -> Option<AmbientMutationInfo> {
  AMBIENT.get()
}

pub(crate) struct AmbientGuard {
  previous: Option<AmbientMutationInfo>,
}

impl AmbientGuard {
  pub(crate) fn install(info: AmbientMutationInfo) -> Self {
    let previous = AMBIENT.replace(Some(info));
    Self { previous }
  }
}

impl Drop for AmbientGuard {
  fn drop(&mut self) {
    AMBIENT.set(self.previous);
  }
}

/// Mutable per-mutation state handed to the automaton's handler.
pub struct MutationContext {
  version: Version,
  mutation_type: String,
  data: Vec<u8>,
  mutation_id: Option<Uuid>,
  timestamp_micros: u64,
  random_seed: u64,
  prev_random_seed: u64,
  sequence_number: i64,
  state_hash: u64,
  rng: DeterministicRng,
  response: Option<Vec<u8>>,
  response_keeper_suppressed: bool,
}

impl MutationContext {
  pub(crate) fn for_record(record: &MutationRecord, state_hash_in: u64) -> Self {
    Self {
      version: record.version(),
      mutation_type: record.mutation_type.clone(),
      data: record.data.clone(),
      mutation_id: record.header.mutation_id,
      timestamp_micros: record.header.timestamp_micros,
      random_seed: record.header.random_seed,
      prev_random_seed: record.header.prev_random_seed,
      sequence_number: record.header.sequence_number,
      state_hash: state_hash_in,
      rng: DeterministicRng::from_seed(record.header.random_seed),
      response: None,
      response_keeper_suppressed: false,
    }
  }

  pub fn version(&self) -> Version {
    self.version
  }

  pub fn mutation_type(&self) -> &str {
    &self.mutation_type
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn mutation_id(&self) -> Option<Uuid> {
    self.mutation_id
  }

  /// Wall time of the mutation as observed by the leader; identical on
  /// every peer.
  pub fn timestamp_micros(&self) -> u64 {
    self.timestamp_micros
  }

  pub fn sequence_number(&self) -> i64 {
    self.sequence_number
  }

  pub fn random_seed(&self) -> u64 {
    self.random_seed
  }

  pub(crate) fn prev_random_seed(&self) -> u64 {
    self.prev_random_seed
  }

  /// The deterministic RNG; all peers observe the same draw sequence.
  pub fn rng(&mut self) -> &mut DeterministicRng {
    &mut self.rng
  }

  pub fn set_response(&mut self, bytes: Vec<u8>) {
    self.response = Some(bytes);
  }

  pub fn response(&self) -> Option<&Vec<u8>> {
    self.response.as_ref()
  }

  pub(crate) fn take_response(&mut self) -> Option<Vec<u8>> {
    self.response.take()
  }

  /// Prevents the response from being published for retry deduplication.
  pub fn suppress_response_keeper(&mut self) {
    self.response_keeper_suppressed = true;
  }

  pub(crate) fn response_keeper_suppressed(&self) -> bool {
    self.response_keeper_suppressed
  }

  /// Finishes the context: draws the emitted seed (a function of the
  /// handler's RNG consumption) and folds it into the state hash.
  pub(crate) fn finish(mut self) -> FinishedMutation {
    let emitted_seed = self.rng.emit_seed();
    let state_hash = combine_state_hash(self.state_hash, emitted_seed);
    FinishedMutation {
      emitted_seed,
      state_hash,
      response: self.response.take(),
      response_keeper_suppressed: self.response_keeper_suppressed,
    }
  }

  pub(crate) fn ambient_info(&self) -> AmbientMutationInfo {
    AmbientMutationInfo {
      version: self.version,
      sequence_number: self.sequence_number,
      timestamp_micros: self.timestamp_micros,
      random_seed: self.random_seed,
    }
  }
}

pub(crate) struct FinishedMutation {
  pub emitted_seed: u64,
  pub state_hash: u64,
  pub response: Option<Vec<u8>>,
  pub response_keeper_suppressed: bool,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::MutationRecordHeader;

  fn sample_record(seed: u64) -> MutationRecord {
    MutationRecord {
      header: MutationRecordHeader {
        reign: 0,
        mutation_id: None,
        timestamp_micros: 1,
        random_seed: seed,
        prev_random_seed: 0,
        sequence_number: 1,
        term: 1,
        segment_id: 0,
        record_id: 0,
      },
      mutation_type: "noop".to_string(),
      data: Vec::new(),
    }
  }

  #[test]
  fn identical_consumption_identical_finish() {
    let record = sample_record(1234);
    let mut a = MutationContext::for_record(&record, 10);
    let mut b = MutationContext::for_record(&record, 10);
    assert_eq!(a.rng().next_u64(), b.rng().next_u64());
    let fa = a.finish();
    let fb = b.finish();
    assert_eq!(fa.emitted_seed, fb.emitted_seed);
    assert_eq!(fa.state_hash, fb.state_hash);
  }

  #[test]
  fn extra_consumption_diverges_state_hash() {
    let record = sample_record(1234);
    let mut a = MutationContext::for_record(&record, 10);
    let mut b = MutationContext::for_record(&record, 10);
    a.rng().next_u64();
    assert_ne!(a.finish().state_hash, b.finish().state_hash);
  }

  #[test]
  fn ambient_guard_scopes_info() {
    let record = sample_record(5);
    let context = MutationContext::for_record(&record, 0);
    assert!(current_mutation_info().is_none());
    {
      let _guard = AmbientGuard::install(context.ambient_info());
      let info = current_mutation_info().expect("ambient");
      assert_eq!(info.random_seed, 5);
    }
    assert!(current_mutation_info().is_none());
  }
}
