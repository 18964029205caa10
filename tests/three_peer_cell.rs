//! Three-peer cell scenarios: replicated commit, deterministic RNG,
//! follower catch-up, distributed rotation, leader forwarding.

use keel::automaton::decorated::SnapshotBuildMode;
use keel::automaton::{Automaton, MutationContext};
use keel::cell::StaticCellManager;
use keel::election::ManualElector;
use keel::engine::{Engine, EngineOptions};
use keel::error::Result;
use keel::keeper::LocalResponseKeeper;
use keel::rpc::ReadChangelogRequest;
use keel::types::{MutationRecord, MutationRequest, PeerId};
use keel::EngineConfig;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Journal automaton: "set" stores the payload, "roll" stores two RNG
/// draws. The response is the entry count (or the draws for "roll").
#[derive(Default)]
struct JournalAutomaton {
  entries: Vec<Vec<u8>>,
}

impl Automaton for JournalAutomaton {
  fn apply_mutation(&mut self, context: &mut MutationContext) {
    match context.mutation_type() {
      "set" => {
        self.entries.push(context.data().to_vec());
        context.set_response((self.entries.len() as u64).to_le_bytes().to_vec());
      }
      "roll" => {
        let first = context.rng().next_u64();
        let second = context.rng().next_u64();
        let mut response = first.to_le_bytes().to_vec();
        response.extend_from_slice(&second.to_le_bytes());
        self.entries.push(response.clone());
        context.set_response(response);
      }
      other => panic!("unknown mutation type {other}"),
    }
  }

  fn save_snapshot(&self, output: &mut dyn Write) -> Result<()> {
    output.write_all(&(self.entries.len() as u32).to_le_bytes())?;
    for entry in &self.entries {
      output.write_all(&(entry.len() as u32).to_le_bytes())?;
      output.write_all(entry)?;
    }
    Ok(())
  }

  fn load_snapshot(&mut self, input: &mut dyn Read) -> Result<()> {
    let mut word = [0u8; 4];
    input.read_exact(&mut word)?;
    let count = u32::from_le_bytes(word);
    self.entries.clear();
    for _ in 0..count {
      input.read_exact(&mut word)?;
      let mut entry = vec![0u8; u32::from_le_bytes(word) as usize];
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

struct Cell {
  engines: Vec<Arc<Engine>>,
  elector: Arc<ManualElector>,
  _dirs: Vec<tempfile::TempDir>,
}

impl Cell {
  /// Builds `count` engines wired through in-process channels. Engines are
  /// constructed but only `initialized_peers` of them subscribe to the
  /// elector.
  fn new(count: usize, initialized_peers: usize, config: EngineConfig) -> Cell {
    let elector = ManualElector::new();
    let mut dirs = Vec::new();
    let mut engines = Vec::new();
    let mut cells = Vec::new();

    for peer_id in 0..count {
      let dir = tempfile::tempdir().expect("tempdir");
      let cell = StaticCellManager::uniform(peer_id as PeerId, count);
      let engine = Engine::new(
        EngineOptions {
          config: config.clone(),
          data_dir: dir.path().to_path_buf(),
          cell: Arc::clone(&cell) as Arc<dyn keel::cell::CellManager>,
          elector: Arc::clone(&elector) as Arc<dyn keel::election::Elector>,
          response_keeper: LocalResponseKeeper::new(),
          snapshot_build_mode: SnapshotBuildMode::NoFork,
        },
        Box::new(JournalAutomaton::default()),
      )
      .expect("engine");
      dirs.push(dir);
      cells.push(cell);
      engines.push(engine);
    }

    for cell in &cells {
      for (peer_id, engine) in engines.iter().enumerate() {
        cell.set_peer_channel(peer_id as PeerId, engine.local_channel());
      }
    }
    for engine in engines.iter().take(initialized_peers) {
      engine.initialize();
    }

    Cell {
      engines,
      elector,
      _dirs: dirs,
    }
  }

  async fn shutdown(self) {
    self.elector.step_down();
    for engine in &self.engines {
      engine.finalize().await;
    }
  }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(15);
  while !check() {
    assert!(Instant::now() < deadline, "timed out waiting for {what}");
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

async fn wait_for_quorum(cell: &Cell, leader: usize, followers: &[usize]) {
  wait_until("leader active", || cell.engines[leader].is_active_leader()).await;
  for follower in followers {
    wait_until("follower active", || {
      cell.engines[*follower].is_active_follower()
    })
    .await;
  }
}

async fn read_first_record(engine: &Arc<Engine>, changelog_id: u32) -> MutationRecord {
  let response = engine
    .handle_read_changelog(ReadChangelogRequest {
      changelog_id,
      first_record_id: 0,
      max_records: 1,
      max_bytes: u64::MAX,
    })
    .await
    .expect("read changelog");
  assert_eq!(response.records.len(), 1);
  MutationRecord::deserialize(&response.records[0]).expect("deserialize")
}

#[tokio::test(flavor = "multi_thread")]
async fn three_peer_commit_replicates_everywhere() {
  let cell = Cell::new(3, 3, EngineConfig::for_tests());
  cell.elector.elect(0, 1);
  wait_for_quorum(&cell, 0, &[1, 2]).await;

  let id = uuid::Uuid::new_v4();
  let response = cell.engines[0]
    .commit_mutation(MutationRequest::new("set", vec![1, 2, 3]).with_id(id))
    .await
    .expect("commit");
  assert_eq!(response, 1u64.to_le_bytes().to_vec());

  // Every peer ends up with the same single record in segment 0.
  for engine in &cell.engines {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
      let count = engine
        .handle_lookup_changelog(0)
        .await
        .map(|reply| reply.record_count)
        .unwrap_or(0);
      if count == 1 {
        break;
      }
      assert!(Instant::now() < deadline, "record was not replicated");
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  }

  let leader_record = read_first_record(&cell.engines[0], 0).await;
  assert_eq!(leader_record.data, vec![1, 2, 3]);
  for follower in [1, 2] {
    let record = read_first_record(&cell.engines[follower], 0).await;
    assert_eq!(record, leader_record);
    assert_eq!(record.header.random_seed, leader_record.header.random_seed);
  }

  // After a sync barrier, applied state agrees everywhere.
  for follower in [1, 2] {
    cell.engines[follower]
      .sync_with_leader()
      .await
      .expect("sync");
    assert_eq!(
      cell.engines[follower].decorated().state_hash(),
      cell.engines[0].decorated().state_hash()
    );
  }

  cell.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deterministic_rng_draws_agree_across_peers() {
  let cell = Cell::new(3, 3, EngineConfig::for_tests());
  cell.elector.elect(0, 1);
  wait_for_quorum(&cell, 0, &[1, 2]).await;

  let response = cell.engines[0]
    .commit_mutation(MutationRequest::new("roll", Vec::new()))
    .await
    .expect("commit");
  assert_eq!(response.len(), 16);

  // The followers executed the same draws: their state (which embeds the
  // drawn values) hashes identically.
  for follower in [1, 2] {
    cell.engines[follower]
      .sync_with_leader()
      .await
      .expect("sync");
    assert_eq!(
      cell.engines[follower].decorated().state_hash(),
      cell.engines[0].decorated().state_hash()
    );
    assert_eq!(
      cell.engines[follower].decorated().sequence_number(),
      cell.engines[0].decorated().sequence_number()
    );
  }

  cell.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cold_follower_catches_up() {
  let cell = Cell::new(3, 2, EngineConfig::for_tests());
  cell.elector.elect(0, 1);
  wait_for_quorum(&cell, 0, &[1]).await;

  for index in 0..100u32 {
    cell.engines[0]
      .commit_mutation(MutationRequest::new("set", index.to_le_bytes().to_vec()))
      .await
      .expect("commit");
  }
  assert_eq!(cell.engines[0].decorated().sequence_number(), 100);

  // Bring the cold peer in and start a fresh epoch.
  cell.engines[2].initialize();
  cell.elector.elect(0, 2);
  wait_for_quorum(&cell, 0, &[1, 2]).await;

  wait_until("cold follower caught up", || {
    cell.engines[2].decorated().sequence_number() == 100
  })
  .await;
  assert_eq!(
    cell.engines[2].decorated().state_hash(),
    cell.engines[0].decorated().state_hash()
  );

  cell.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rotation_starts_a_new_segment() {
  let mut config = EngineConfig::for_tests();
  config.max_changelog_record_count = 10;
  let cell = Cell::new(3, 3, config);
  cell.elector.elect(0, 1);
  wait_for_quorum(&cell, 0, &[1, 2]).await;

  for index in 0..10u8 {
    cell.engines[0]
      .commit_mutation(MutationRequest::new("set", vec![index]))
      .await
      .expect("commit");
  }

  // The distributed rotation kicks in; segment 1 appears on the leader.
  wait_until("rotation", || {
    cell.engines[0].decorated().logged_version().segment_id == 1
  })
  .await;

  let response = cell.engines[0]
    .commit_mutation(MutationRequest::new("set", vec![10]))
    .await
    .expect("commit");
  assert_eq!(response, 11u64.to_le_bytes().to_vec());

  // The post-rotation mutation is the first record of segment 1.
  let record = read_first_record(&cell.engines[0], 1).await;
  assert_eq!(record.header.segment_id, 1);
  assert_eq!(record.header.record_id, 0);
  assert_eq!(record.data, vec![10]);

  // Segment 1 carries the rotation point in its metadata.
  let segment = cell.engines[0]
    .changelog_store()
    .try_open(1)
    .await
    .expect("open segment 1")
    .expect("segment 1 exists");
  assert_eq!(segment.meta().prev_record_count, 10);

  // The rotation point was snapshotted.
  wait_until("snapshot", || {
    cell.engines[0]
      .snapshot_store()
      .latest_id(u32::MAX)
      .ok()
      .flatten()
      == Some(1)
  })
  .await;

  cell.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn followers_forward_when_permitted() {
  let cell = Cell::new(3, 3, EngineConfig::for_tests());
  cell.elector.elect(0, 1);
  wait_for_quorum(&cell, 0, &[1, 2]).await;

  // Without forwarding, a follower refuses.
  let refused = cell.engines[1]
    .commit_mutation(MutationRequest::new("set", vec![1]))
    .await;
  assert!(refused.is_err());

  let response = cell.engines[1]
    .commit_mutation(MutationRequest::new("set", vec![9]).with_forwarding())
    .await
    .expect("forwarded commit");
  assert_eq!(response, 1u64.to_le_bytes().to_vec());

  cell.shutdown().await;
}
