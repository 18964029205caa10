//! End-to-end engine scenarios on a single-peer cell: commit, restart from
//! disk, torn-write recovery, snapshot-bounded recovery.

use keel::automaton::decorated::SnapshotBuildMode;
use keel::automaton::{Automaton, MutationContext};
use keel::cell::StaticCellManager;
use keel::election::ManualElector;
use keel::engine::{Engine, EngineOptions};
use keel::error::Result;
use keel::keeper::LocalResponseKeeper;
use keel::types::MutationRequest;
use keel::EngineConfig;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counter automaton: "add" accumulates the first payload byte, response is
/// the running total.
#[derive(Default)]
struct CounterAutomaton {
  total: u64,
}

impl Automaton for CounterAutomaton {
  fn apply_mutation(&mut self, context: &mut MutationContext) {
    match context.mutation_type() {
      "add" => {
        self.total += u64::from(context.data().first().copied().unwrap_or(0));
        context.set_response(self.total.to_le_bytes().to_vec());
      }
      other => panic!("unknown mutation type {other}"),
    }
  }

  fn save_snapshot(&self, output: &mut dyn Write) -> Result<()> {
    output.write_all(&self.total.to_le_bytes())?;
    Ok(())
  }

  fn load_snapshot(&mut self, input: &mut dyn Read) -> Result<()> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    self.total = u64::from_le_bytes(bytes);
    Ok(())
  }

  fn clear(&mut self) {
    self.total = 0;
  }

  fn set_zero_state(&mut self) {
    self.total = 0;
  }
}

fn new_engine(dir: &Path, elector: &Arc<ManualElector>) -> Arc<Engine> {
  let engine = Engine::new(
    EngineOptions {
      config: EngineConfig::for_tests(),
      data_dir: dir.to_path_buf(),
      cell: StaticCellManager::uniform(0, 1),
      elector: Arc::clone(elector) as Arc<dyn keel::election::Elector>,
      response_keeper: LocalResponseKeeper::new(),
      snapshot_build_mode: SnapshotBuildMode::NoFork,
    },
    Box::new(CounterAutomaton::default()),
  )
  .expect("engine");
  engine.initialize();
  engine
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(10);
  while !check() {
    assert!(Instant::now() < deadline, "timed out waiting for {what}");
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

fn add(value: u8) -> MutationRequest {
  MutationRequest::new("add", vec![value])
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_applies_and_responds() {
  let dir = tempfile::tempdir().expect("tempdir");
  let elector = ManualElector::new();
  let engine = new_engine(dir.path(), &elector);

  elector.elect(0, 1);
  wait_until("leader active", || engine.is_active_leader()).await;

  let response = engine.commit_mutation(add(5)).await.expect("commit");
  assert_eq!(response, 5u64.to_le_bytes().to_vec());
  let response = engine.commit_mutation(add(7)).await.expect("commit");
  assert_eq!(response, 12u64.to_le_bytes().to_vec());
  assert_eq!(engine.decorated().sequence_number(), 2);

  elector.step_down();
  engine.finalize().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn identified_retry_is_deduplicated() {
  let dir = tempfile::tempdir().expect("tempdir");
  let elector = ManualElector::new();
  let engine = new_engine(dir.path(), &elector);

  elector.elect(0, 1);
  wait_until("leader active", || engine.is_active_leader()).await;

  let id = uuid::Uuid::new_v4();
  let first = engine
    .commit_mutation(add(3).with_id(id))
    .await
    .expect("commit");
  // The retry returns the original response without re-executing.
  let retried = engine
    .commit_mutation(add(3).with_id(id).with_retry(true))
    .await
    .expect("retry");
  assert_eq!(first, retried);
  assert_eq!(engine.decorated().sequence_number(), 1);

  elector.step_down();
  engine.finalize().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_from_disk_reaches_identical_state() {
  let dir = tempfile::tempdir().expect("tempdir");
  let elector = ManualElector::new();

  let (hash_before, sequence_before) = {
    let engine = new_engine(dir.path(), &elector);
    elector.elect(0, 1);
    wait_until("leader active", || engine.is_active_leader()).await;
    for value in 0..20u8 {
      engine.commit_mutation(add(value)).await.expect("commit");
    }
    let result = (
      engine.decorated().state_hash(),
      engine.decorated().sequence_number(),
    );
    elector.step_down();
    engine.finalize().await;
    result
  };

  let elector = ManualElector::new();
  let engine = new_engine(dir.path(), &elector);
  elector.elect(0, 2);
  wait_until("leader active", || engine.is_active_leader()).await;

  assert_eq!(engine.decorated().sequence_number(), sequence_before);
  assert_eq!(engine.decorated().state_hash(), hash_before);

  elector.step_down();
  engine.finalize().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn torn_tail_record_is_dropped_on_restart() {
  let dir = tempfile::tempdir().expect("tempdir");
  let elector = ManualElector::new();
  {
    let engine = new_engine(dir.path(), &elector);
    elector.elect(0, 1);
    wait_until("leader active", || engine.is_active_leader()).await;
    for value in 0..50u8 {
      engine.commit_mutation(add(value)).await.expect("commit");
    }
    elector.step_down();
    engine.finalize().await;
  }

  // Corrupt a payload byte of the final record.
  let segment_path = dir.path().join("changelogs").join("000000000.log");
  let mut bytes = std::fs::read(&segment_path).expect("read segment");
  let len = bytes.len();
  assert_eq!(len % 4096, 0);
  bytes[len - 4096 + 48] ^= 0xFF;
  std::fs::write(&segment_path, &bytes).expect("write corrupted");

  let elector = ManualElector::new();
  let engine = new_engine(dir.path(), &elector);
  elector.elect(0, 2);
  wait_until("leader active", || engine.is_active_leader()).await;

  // The torn record is gone; the intact prefix survived.
  assert_eq!(engine.decorated().sequence_number(), 49);

  // The cell resumes: new commits land after the trimmed tail.
  engine.commit_mutation(add(1)).await.expect("commit");
  assert_eq!(engine.decorated().sequence_number(), 50);

  elector.step_down();
  engine.finalize().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_bounds_recovery() {
  let dir = tempfile::tempdir().expect("tempdir");
  let elector = ManualElector::new();

  let hash_before = {
    let engine = new_engine(dir.path(), &elector);
    elector.elect(0, 1);
    wait_until("leader active", || engine.is_active_leader()).await;

    for value in 0..5u8 {
      engine.commit_mutation(add(value)).await.expect("commit");
    }
    let snapshot_id = engine.build_snapshot().await.expect("snapshot");
    assert_eq!(snapshot_id, 1);
    assert_eq!(
      engine.snapshot_store().latest_id(u32::MAX).expect("latest"),
      Some(1)
    );

    for value in 5..10u8 {
      engine.commit_mutation(add(value)).await.expect("commit");
    }
    let hash = engine.decorated().state_hash();
    elector.step_down();
    engine.finalize().await;
    hash
  };

  let elector = ManualElector::new();
  let engine = new_engine(dir.path(), &elector);
  elector.elect(0, 2);
  wait_until("leader active", || engine.is_active_leader()).await;

  assert_eq!(engine.decorated().sequence_number(), 10);
  assert_eq!(engine.decorated().state_hash(), hash_before);
  // Recovery went through the snapshot, not through segment 0.
  assert!(engine.decorated().automaton_version().segment_id >= 1);

  elector.step_down();
  engine.finalize().await;
}
