//! The engine-side wrapper around the user automaton.
//!
//! Owns the observable counters (versions, sequence number, seed chain,
//! state hash), executes mutations with deterministic inputs, loads
//! snapshots, and fires the snapshot builder when the pending trigger is
//! reached. Purely synchronous; asynchronous orchestration lives in the
//! committer, checkpointer and recovery driver. Mutating entry points must
//! run on the automaton context under a user or system guard.

use crate::automaton::checker::{HashReport, StateHashChecker};
use crate::automaton::context::{AmbientGuard, MutationContext};
use crate::automaton::Automaton;
use crate::config::EngineConfig;
use crate::error::{KeelError, Result};
use crate::keeper::ResponseKeeper;
use crate::runtime::UserSystemLock;
use crate::snapshot::builder::{capture_no_fork, SwitchableOutput};
use crate::snapshot::store::{SnapshotParams, SnapshotStore};
use crate::snapshot::SnapshotMeta;
use crate::types::{MutationRecord, MutationRequest, Term, Version};
use crate::util::rng::draw_record_seed;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

/// How snapshot bodies are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotBuildMode {
  /// Process fork; unavailable on some platforms and under some
  /// instrumentations.
  #[cfg(unix)]
  Fork,
  /// In-memory capture followed by an asynchronous drain.
  NoFork,
}

struct SnapshotTarget {
  sequence_number: i64,
  snapshot_id: u32,
  done: oneshot::Sender<Result<SnapshotParams>>,
}

pub struct DecoratedAutomaton {
  automaton: Mutex<Box<dyn Automaton>>,
  lock: Arc<UserSystemLock>,
  config: Arc<EngineConfig>,
  snapshot_store: Arc<dyn SnapshotStore>,
  response_keeper: Arc<dyn ResponseKeeper>,
  state_hash_checker: Arc<StateHashChecker>,
  build_mode: SnapshotBuildMode,

  automaton_version: AtomicU64,
  logged_version: AtomicU64,
  committed_version: AtomicU64,
  sequence_number: AtomicI64,
  logged_sequence_number: AtomicI64,
  random_seed: AtomicU64,
  logged_random_seed: AtomicU64,
  state_hash: AtomicU64,
  timestamp_micros: AtomicU64,
  last_mutation_term: AtomicU32,

  snapshot_target: Mutex<Option<SnapshotTarget>>,
  building_snapshot: Arc<AtomicBool>,
  /// Sampled hashes awaiting shipment to the leader via ping replies.
  pending_samples: Mutex<Vec<(i64, u64)>>,
}

impl DecoratedAutomaton {
  pub fn new(
    automaton: Box<dyn Automaton>,
    config: Arc<EngineConfig>,
    snapshot_store: Arc<dyn SnapshotStore>,
    response_keeper: Arc<dyn ResponseKeeper>,
    build_mode: SnapshotBuildMode,
  ) -> Arc<Self> {
    let checker = Arc::new(StateHashChecker::new(
      config.max_state_hash_checker_entry_count,
    ));
    Arc::new(Self {
      automaton: Mutex::new(automaton),
      lock: UserSystemLock::new(),
      config,
      snapshot_store,
      response_keeper,
      state_hash_checker: checker,
      build_mode,
      automaton_version: AtomicU64::new(0),
      logged_version: AtomicU64::new(0),
      committed_version: AtomicU64::new(0),
      sequence_number: AtomicI64::new(0),
      logged_sequence_number: AtomicI64::new(0),
      random_seed: AtomicU64::new(0),
      logged_random_seed: AtomicU64::new(0),
      state_hash: AtomicU64::new(0),
      timestamp_micros: AtomicU64::new(0),
      last_mutation_term: AtomicU32::new(0),
      snapshot_target: Mutex::new(None),
      building_snapshot: Arc::new(AtomicBool::new(false)),
      pending_samples: Mutex::new(Vec::new()),
    })
  }

  pub fn guards(&self) -> &Arc<UserSystemLock> {
    &self.lock
  }

  pub fn state_hash_checker(&self) -> &Arc<StateHashChecker> {
    &self.state_hash_checker
  }

  pub fn automaton_version(&self) -> Version {
    Version::from_revision(self.automaton_version.load(Ordering::Acquire))
  }

  pub fn logged_version(&self) -> Version {
    Version::from_revision(self.logged_version.load(Ordering::Acquire))
  }

  pub fn committed_version(&self) -> Version {
    Version::from_revision(self.committed_version.load(Ordering::Acquire))
  }

  /// Monotonically advances the committed-version watermark.
  pub fn advance_committed_version(&self, version: Version) {
    self
      .committed_version
      .fetch_max(version.revision(), Ordering::AcqRel);
  }

  pub fn set_logged_version(&self, version: Version) {
    self.logged_version.store(version.revision(), Ordering::Release);
  }

  /// Rotates the logged version into the next segment.
  pub fn rotate_logged_version(&self) -> Version {
    let rotated = self.logged_version().rotate();
    self.set_logged_version(rotated);
    rotated
  }

  pub fn sequence_number(&self) -> i64 {
    self.sequence_number.load(Ordering::Acquire)
  }

  pub fn logged_sequence_number(&self) -> i64 {
    self.logged_sequence_number.load(Ordering::Acquire)
  }

  pub fn random_seed(&self) -> u64 {
    self.random_seed.load(Ordering::Acquire)
  }

  pub fn state_hash(&self) -> u64 {
    self.state_hash.load(Ordering::Acquire)
  }

  pub fn timestamp_micros(&self) -> u64 {
    self.timestamp_micros.load(Ordering::Acquire)
  }

  pub fn last_mutation_term(&self) -> Term {
    self.last_mutation_term.load(Ordering::Acquire)
  }

  pub fn current_reign(&self) -> u32 {
    self.automaton.lock().current_reign()
  }

  pub fn recovery_action_for_reign(&self, reign: u32) -> crate::types::RecoveryAction {
    self.automaton.lock().recovery_action_for_reign(reign)
  }

  /// Re-bases the logging chain on the applied state. Called when recovery
  /// completes, before any new mutation is logged.
  pub fn reset_logging_chain(&self) {
    self
      .logged_sequence_number
      .store(self.sequence_number(), Ordering::Release);
    self
      .logged_random_seed
      .store(self.random_seed(), Ordering::Release);
  }

  /// Assigns order, sequence number and seeds to a leader mutation,
  /// producing the record to log and replicate.
  pub fn build_leader_record(&self, request: &MutationRequest, term: Term) -> MutationRecord {
    let version = self.logged_version();
    // Sequence numbers are zero-based and contiguous across segments and
    // snapshots; the counter holds the next one to assign.
    let sequence_number = self.logged_sequence_number.load(Ordering::Acquire);
    let prev_random_seed = self.logged_random_seed.load(Ordering::Acquire);
    let random_seed = draw_record_seed();
    let timestamp_micros = now_micros();

    self.set_logged_version(version.advance());
    self
      .logged_sequence_number
      .store(sequence_number + 1, Ordering::Release);
    self.logged_random_seed.store(random_seed, Ordering::Release);

    MutationRecord {
      header: crate::types::MutationRecordHeader {
        reign: request.reign,
        mutation_id: request.mutation_id,
        timestamp_micros,
        random_seed,
        prev_random_seed,
        sequence_number,
        term,
        segment_id: version.segment_id,
        record_id: version.record_id,
      },
      mutation_type: request.mutation_type.clone(),
      data: request.data.clone(),
    }
  }

  /// Validates and accounts for a replicated record on a follower. The
  /// record is not applied until the leader's committed watermark covers
  /// it.
  pub fn accept_follower_record(&self, record: &MutationRecord) -> Result<()> {
    let logged = self.logged_version();
    if record.version() != logged {
      return Err(KeelError::OutOfOrderMutations {
        expected: logged.to_string(),
        actual: record.version().to_string(),
      });
    }
    self.set_logged_version(logged.advance());
    self
      .logged_sequence_number
      .store(record.header.sequence_number + 1, Ordering::Release);
    self
      .logged_random_seed
      .store(record.header.random_seed, Ordering::Release);
    Ok(())
  }

  /// Applies one committed mutation. Must run on the automaton context
  /// under a guard. Returns the handler's response bytes.
  pub fn apply_record(&self, record: &MutationRecord) -> Result<Option<Vec<u8>>> {
    let automaton_version = self.automaton_version();
    let mutation_version = record.version();
    let version_ok = if mutation_version.segment_id == automaton_version.segment_id {
      mutation_version.record_id == automaton_version.record_id
    } else {
      mutation_version.segment_id > automaton_version.segment_id
        && mutation_version.record_id == 0
    };
    if !version_ok {
      return Err(KeelError::InvalidVersion {
        expected: automaton_version.to_string(),
        actual: mutation_version.to_string(),
      });
    }

    let current_seed = self.random_seed();
    if record.header.prev_random_seed != 0
      && current_seed != 0
      && current_seed != record.header.prev_random_seed
    {
      // Divergence between the log and the applied state is unrecoverable.
      panic!(
        "mutation random seeds differ: automaton {current_seed:#018x}, \
         record {:#018x} at {mutation_version}",
        record.header.prev_random_seed
      );
    }

    let mut context = MutationContext::for_record(record, self.state_hash());
    // An empty mutation type is a heartbeat no-op: the counters advance,
    // the handler is not consulted.
    if !record.mutation_type.is_empty() {
      let _ambient = AmbientGuard::install(context.ambient_info());
      let mut automaton = self.automaton.lock();
      automaton.apply_mutation(&mut context);
    }
    let suppressed = context.response_keeper_suppressed();
    let finished = context.finish();

    let expected_sequence_number = self.sequence_number.load(Ordering::Acquire);
    if record.header.sequence_number != expected_sequence_number {
      panic!(
        "sequence numbers differ: automaton expects {expected_sequence_number}, \
         record carries {} at {mutation_version}",
        record.header.sequence_number
      );
    }
    let sequence_number = expected_sequence_number + 1;

    self.state_hash.store(finished.state_hash, Ordering::Release);
    self
      .random_seed
      .store(record.header.random_seed, Ordering::Release);
    self
      .sequence_number
      .store(sequence_number, Ordering::Release);
    self
      .timestamp_micros
      .store(record.header.timestamp_micros, Ordering::Release);
    self
      .last_mutation_term
      .store(record.header.term, Ordering::Release);
    self
      .automaton_version
      .store(mutation_version.advance().revision(), Ordering::Release);

    tracing::debug!(
      sequence_number,
      version = %mutation_version,
      mutation_type = %record.mutation_type,
      "applied mutation"
    );

    if let (Some(mutation_id), false, Some(response)) =
      (record.header.mutation_id, suppressed, finished.response.as_ref())
    {
      self.response_keeper.end_request(mutation_id, response.clone());
    }

    if self.config.enable_state_hash_checker
      && sequence_number
        % self
          .config
          .state_hash_checker_mutation_verification_sampling_rate
        == 0
    {
      self.record_own_state_hash(sequence_number, finished.state_hash);
      let mut samples = self.pending_samples.lock();
      samples.push((sequence_number, finished.state_hash));
      let overflow = samples
        .len()
        .saturating_sub(self.config.max_state_hash_checker_entry_count);
      if overflow > 0 {
        samples.drain(..overflow);
      }
    }

    self.maybe_start_snapshot();
    Ok(finished.response)
  }

  /// Drains the sampled hashes for the next ping reply.
  pub fn take_state_hash_samples(&self) -> Vec<(i64, u64)> {
    std::mem::take(&mut *self.pending_samples.lock())
  }

  fn record_own_state_hash(&self, sequence_number: i64, state_hash: u64) {
    match self.state_hash_checker.report(sequence_number, state_hash) {
      HashReport::Match | HashReport::Recorded => {}
      HashReport::Divergence { recorded, reported } => {
        panic!(
          "state hash divergence at sequence {sequence_number}: \
           {recorded:#018x} != {reported:#018x}"
        );
      }
    }
  }

  /// Arms the snapshot trigger; the builder starts when the automaton
  /// reaches `sequence_number` (or immediately if it already has).
  pub fn schedule_snapshot(
    &self,
    snapshot_id: u32,
    sequence_number: i64,
  ) -> oneshot::Receiver<Result<SnapshotParams>> {
    let (done_tx, done_rx) = oneshot::channel();
    {
      let mut target = self.snapshot_target.lock();
      if target.is_some() {
        let _ = done_tx.send(Err(KeelError::Snapshot(
          "a snapshot build is already scheduled".to_string(),
        )));
        return done_rx;
      }
      *target = Some(SnapshotTarget {
        sequence_number,
        snapshot_id,
        done: done_tx,
      });
    }
    self.maybe_start_snapshot();
    done_rx
  }

  fn maybe_start_snapshot(&self) {
    let target = {
      let mut slot = self.snapshot_target.lock();
      match slot.as_ref() {
        Some(target) if target.sequence_number <= self.sequence_number() => slot.take(),
        _ => None,
      }
    };
    let Some(target) = target else {
      return;
    };
    let result = self.start_snapshot_build(target.snapshot_id, target.done);
    if let Err(error) = result {
      tracing::error!(%error, "snapshot build failed to start");
    }
  }

  /// Runs the sync phase of a snapshot build on the current (automaton)
  /// context and schedules the asynchronous remainder.
  fn start_snapshot_build(
    &self,
    snapshot_id: u32,
    done: oneshot::Sender<Result<SnapshotParams>>,
  ) -> Result<()> {
    if self.building_snapshot.swap(true, Ordering::AcqRel) {
      let _ = done.send(Err(KeelError::Snapshot(
        "a snapshot build is already running".to_string(),
      )));
      return Ok(());
    }

    if !self.config.build_snapshot_delay.is_zero() {
      std::thread::sleep(self.config.build_snapshot_delay);
    }

    let meta = self.capture_snapshot_meta();
    let automaton_version = self.automaton_version();
    tracing::info!(
      snapshot_id,
      sequence_number = meta.sequence_number,
      version = %automaton_version,
      "building snapshot"
    );

    let writer = match self.snapshot_store.open_writer(snapshot_id, meta) {
      Ok(writer) => writer,
      Err(error) => {
        self.building_snapshot.store(false, Ordering::Release);
        let _ = done.send(Err(error.duplicate()));
        return Err(error);
      }
    };

    match self.build_mode {
      SnapshotBuildMode::NoFork => {
        let captured: Result<SwitchableOutput> = {
          let automaton = self.automaton.lock();
          capture_no_fork(|output| automaton.save_snapshot(output))
        };
        match captured {
          Ok(output) => {
            let building = Arc::clone(&self.building_snapshot);
            tokio::spawn(async move {
              let result = output.drain_into(writer).await;
              building.store(false, Ordering::Release);
              let _ = done.send(result);
            });
          }
          Err(error) => {
            self.building_snapshot.store(false, Ordering::Release);
            let _ = done.send(Err(error.duplicate()));
            return Err(error);
          }
        }
      }
      #[cfg(unix)]
      SnapshotBuildMode::Fork => {
        let forked = {
          let automaton = self.automaton.lock();
          crate::snapshot::builder::fork_save(|output| automaton.save_snapshot(output))
        };
        match forked {
          Ok(forked) => {
            let fork_timeout = self.config.snapshot_fork_timeout;
            let building = Arc::clone(&self.building_snapshot);
            tokio::task::spawn_blocking(move || {
              let result = forked.transfer_into(writer, fork_timeout);
              building.store(false, Ordering::Release);
              let _ = done.send(result);
            });
          }
          Err(error) => {
            self.building_snapshot.store(false, Ordering::Release);
            let _ = done.send(Err(error.duplicate()));
            return Err(error);
          }
        }
      }
    }
    Ok(())
  }

  fn capture_snapshot_meta(&self) -> SnapshotMeta {
    let applied = self.automaton_version();
    SnapshotMeta {
      sequence_number: self.sequence_number(),
      random_seed: self.random_seed(),
      state_hash: self.state_hash(),
      timestamp_micros: self.timestamp_micros(),
      last_segment_id: applied.segment_id,
      last_record_id: applied.record_id,
      last_mutation_term: self.last_mutation_term(),
      term: self.last_mutation_term(),
    }
  }

  /// Atomically clears and reseeds the automaton from a snapshot. Must run
  /// under the system guard.
  pub fn load_snapshot(
    &self,
    snapshot_id: u32,
    reader: &mut dyn crate::snapshot::SnapshotReader,
  ) -> Result<()> {
    let meta = reader.meta().clone();
    tracing::info!(
      snapshot_id,
      sequence_number = meta.sequence_number,
      "loading snapshot"
    );

    {
      let mut automaton = self.automaton.lock();
      automaton.clear();
      if let Err(error) = automaton.load_snapshot(reader) {
        // A partial load leaves undefined state behind.
        automaton.clear();
        self.reset_counters_to_zero();
        return Err(error);
      }
    }

    self
      .sequence_number
      .store(meta.sequence_number, Ordering::Release);
    self.random_seed.store(meta.random_seed, Ordering::Release);
    self.state_hash.store(meta.state_hash, Ordering::Release);
    self
      .timestamp_micros
      .store(meta.timestamp_micros, Ordering::Release);
    self
      .last_mutation_term
      .store(meta.last_mutation_term, Ordering::Release);
    self
      .automaton_version
      .store(Version::new(snapshot_id, 0).revision(), Ordering::Release);
    self.reset_logging_chain();
    Ok(())
  }

  /// Resets the automaton to the canonical zero state. Must run under the
  /// system guard.
  pub fn set_zero_state(&self) {
    self.automaton.lock().set_zero_state();
    self.reset_counters_to_zero();
  }

  fn reset_counters_to_zero(&self) {
    self.automaton_version.store(0, Ordering::Release);
    self.sequence_number.store(0, Ordering::Release);
    self.random_seed.store(0, Ordering::Release);
    self.state_hash.store(0, Ordering::Release);
    self.timestamp_micros.store(0, Ordering::Release);
    self.last_mutation_term.store(0, Ordering::Release);
    self.reset_logging_chain();
  }
}

fn now_micros() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_micros() as u64
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::automaton::context::MutationContext;
  use crate::keeper::LocalResponseKeeper;
  use crate::snapshot::store::FileSnapshotStore;
  use byteorder::{LittleEndian, WriteBytesExt};
  use std::io::{Read, Write};
  use tempfile::tempdir;

  /// Append-only log automaton: "push" appends the payload, the response
  /// is the new entry count.
  #[derive(Default)]
  struct LogAutomaton {
    entries: Vec<Vec<u8>>,
  }

  impl Automaton for LogAutomaton {
    fn apply_mutation(&mut self, context: &mut MutationContext) {
      match context.mutation_type() {
        "push" => {
          self.entries.push(context.data().to_vec());
          context.set_response((self.entries.len() as u64).to_le_bytes().to_vec());
        }
        "draw" => {
          let value = context.rng().next_u64();
          context.set_response(value.to_le_bytes().to_vec());
        }
        other => panic!("unknown mutation type {other}"),
      }
    }

    fn save_snapshot(&self, output: &mut dyn Write) -> Result<()> {
      output.write_u32::<LittleEndian>(self.entries.len() as u32)?;
      for entry in &self.entries {
        output.write_u32::<LittleEndian>(entry.len() as u32)?;
        output.write_all(entry)?;
      }
      Ok(())
    }

    fn load_snapshot(&mut self, input: &mut dyn Read) -> Result<()> {
      use byteorder::ReadBytesExt;
      self.entries.clear();
      let count = input.read_u32::<LittleEndian>()?;
      for _ in 0..count {
        let len = input.read_u32::<LittleEndian>()? as usize;
        let mut entry = vec![0u8; len];
        input.read_exact(&mut entry)?;
        self.entries.push(entry);
      }
      Ok(())
    }

    fn clear(&mut self) {
      self.entries.clear();
    }

    fn set_zero_state(&mut self) {
      self.entries.clear();
    }
  }

  fn new_decorated(dir: &std::path::Path) -> Arc<DecoratedAutomaton> {
    let config = Arc::new(EngineConfig::for_tests());
    let store = FileSnapshotStore::open_store(dir, config.snapshot.clone()).expect("store");
    DecoratedAutomaton::new(
      Box::new(LogAutomaton::default()),
      config,
      store,
      LocalResponseKeeper::new(),
      SnapshotBuildMode::NoFork,
    )
  }

  fn push_request(payload: &[u8]) -> MutationRequest {
    MutationRequest::new("push", payload.to_vec())
  }

  #[test]
  fn leader_records_chain_and_apply() {
    let dir = tempdir().expect("tempdir");
    let decorated = new_decorated(dir.path());

    let first = decorated.build_leader_record(&push_request(b"a"), 1);
    let second = decorated.build_leader_record(&push_request(b"b"), 1);
    assert_eq!(first.version(), Version::new(0, 0));
    assert_eq!(second.version(), Version::new(0, 1));
    assert_eq!(second.header.prev_random_seed, first.header.random_seed);
    assert_eq!(decorated.logged_version(), Version::new(0, 2));

    let response = decorated.apply_record(&first).expect("apply").expect("response");
    assert_eq!(response, 1u64.to_le_bytes().to_vec());
    decorated.apply_record(&second).expect("apply");
    assert_eq!(decorated.sequence_number(), 2);
    assert_eq!(decorated.automaton_version(), Version::new(0, 2));
    assert_eq!(decorated.random_seed(), second.header.random_seed);
  }

  #[test]
  fn out_of_order_apply_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let decorated = new_decorated(dir.path());

    let first = decorated.build_leader_record(&push_request(b"a"), 1);
    let second = decorated.build_leader_record(&push_request(b"b"), 1);
    drop(first);
    assert!(matches!(
      decorated.apply_record(&second),
      Err(KeelError::InvalidVersion { .. })
    ));
  }

  #[test]
  fn follower_accepts_in_order_only() {
    let dir = tempdir().expect("tempdir");
    let leader = new_decorated(dir.path().join("leader").as_path());
    let follower = new_decorated(dir.path().join("follower").as_path());

    let first = leader.build_leader_record(&push_request(b"a"), 1);
    let second = leader.build_leader_record(&push_request(b"b"), 1);

    assert!(matches!(
      follower.accept_follower_record(&second),
      Err(KeelError::OutOfOrderMutations { .. })
    ));
    follower.accept_follower_record(&first).expect("in order");
    follower.accept_follower_record(&second).expect("in order");
    assert_eq!(follower.logged_version(), Version::new(0, 2));
  }

  #[test]
  fn identical_records_produce_identical_state() {
    let dir = tempdir().expect("tempdir");
    let a = new_decorated(dir.path().join("a").as_path());
    let b = new_decorated(dir.path().join("b").as_path());

    let records: Vec<_> = (0..10)
      .map(|index| a.build_leader_record(&push_request(format!("entry-{index}").as_bytes()), 1))
      .collect();
    let mut draws_a = Vec::new();
    let mut draws_b = Vec::new();
    for record in &records {
      draws_a.push(a.apply_record(record).expect("apply a"));
      draws_b.push(b.apply_record(record).expect("apply b"));
    }
    assert_eq!(draws_a, draws_b);
    assert_eq!(a.state_hash(), b.state_hash());
    assert_eq!(a.sequence_number(), b.sequence_number());
  }

  #[test]
  fn rng_draws_match_across_peers() {
    let dir = tempdir().expect("tempdir");
    let a = new_decorated(dir.path().join("a").as_path());
    let b = new_decorated(dir.path().join("b").as_path());

    let record = a.build_leader_record(&MutationRequest::new("draw", Vec::new()), 1);
    let draw_a = a.apply_record(&record).expect("apply").expect("response");
    let draw_b = b.apply_record(&record).expect("apply").expect("response");
    assert_eq!(draw_a, draw_b);
  }

  #[tokio::test]
  async fn snapshot_roundtrip_preserves_state() {
    let dir = tempdir().expect("tempdir");
    let decorated = new_decorated(dir.path());

    for index in 0..5u8 {
      let record = decorated.build_leader_record(&push_request(&[index]), 1);
      decorated.apply_record(&record).expect("apply");
    }
    let hash_before = decorated.state_hash();
    let sequence_before = decorated.sequence_number();

    let done = decorated.schedule_snapshot(1, sequence_before);
    let params = done.await.expect("recv").expect("build");
    assert!(params.compressed_length > 0);

    // Load into a fresh peer.
    let other = new_decorated(dir.path());
    let mut reader = other.snapshot_store.open_reader(1).expect("reader");
    other.load_snapshot(1, reader.as_mut()).expect("load");
    assert_eq!(other.state_hash(), hash_before);
    assert_eq!(other.sequence_number(), sequence_before);
    assert_eq!(other.automaton_version(), Version::new(1, 0));
  }
}
