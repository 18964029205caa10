//! Leader-side commit pipeline.
//!
//! Requests become versioned, sequenced records appended to the local
//! changelog and gathered into batches. A batch resolves when a quorum of
//! voting peers (self included) has durably logged it; only then do its
//! mutations apply and its clients hear back. Batches complete strictly in
//! submission order through a shared chain future.

use crate::automaton::DecoratedAutomaton;
use crate::cell::CellManager;
use crate::changelog::{Changelog, ChangelogStore};
use crate::config::EngineConfig;
use crate::election::EpochInfo;
use crate::error::{KeelError, Result};
use crate::keeper::ResponseKeeper;
use crate::lease::LeaderLease;
use crate::rpc::AcceptMutationsRequest;
use crate::runtime::CancelableInvoker;
use crate::types::{MutationRecord, MutationRequest, PeerState};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

type BatchChain = Shared<BoxFuture<'static, std::result::Result<(), ()>>>;

fn ready_chain() -> BatchChain {
  async { Ok(()) }.boxed().shared()
}

struct PendingMutation {
  record: MutationRecord,
  serialized: Vec<u8>,
  local_flush: BoxFuture<'static, Result<()>>,
  response_tx: oneshot::Sender<Result<Vec<u8>>>,
}

struct CommitterState {
  batch: Vec<PendingMutation>,
  batch_index: u64,
  chain: BatchChain,
  logging_suspended: bool,
  suspended_since: Option<Instant>,
  /// Requests received while logging was suspended, replayed on resume.
  pending_requests: Vec<(MutationRequest, oneshot::Sender<Result<Vec<u8>>>)>,
}

/// Why a checkpoint should start now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReason {
  RecordCount,
  DataSize,
  Periodic,
}

pub struct LeaderCommitter {
  config: Arc<EngineConfig>,
  cell: Arc<dyn CellManager>,
  decorated: Arc<DecoratedAutomaton>,
  keeper: Arc<dyn ResponseKeeper>,
  epoch: EpochInfo,
  lease: Arc<LeaderLease>,
  changelog: Mutex<Arc<dyn Changelog>>,
  control: CancelableInvoker,
  automaton: CancelableInvoker,
  failure_tx: mpsc::UnboundedSender<KeelError>,
  read_only: Arc<AtomicBool>,
  state: Mutex<CommitterState>,
  /// Revision-encoded deadline for the next periodic snapshot.
  snapshot_deadline: Mutex<Instant>,
  commits_since_start: AtomicU64,
}

impl LeaderCommitter {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    config: Arc<EngineConfig>,
    cell: Arc<dyn CellManager>,
    decorated: Arc<DecoratedAutomaton>,
    keeper: Arc<dyn ResponseKeeper>,
    epoch: EpochInfo,
    lease: Arc<LeaderLease>,
    changelog: Arc<dyn Changelog>,
    control: CancelableInvoker,
    automaton: CancelableInvoker,
    failure_tx: mpsc::UnboundedSender<KeelError>,
    read_only: Arc<AtomicBool>,
  ) -> Arc<Self> {
    let snapshot_deadline = next_snapshot_deadline(&config);
    Arc::new(Self {
      config,
      cell,
      decorated,
      keeper,
      epoch,
      lease,
      changelog: Mutex::new(changelog),
      control,
      automaton,
      failure_tx,
      read_only,
      state: Mutex::new(CommitterState {
        batch: Vec::new(),
        batch_index: 0,
        chain: ready_chain(),
        logging_suspended: false,
        suspended_since: None,
        pending_requests: Vec::new(),
      }),
      snapshot_deadline: Mutex::new(snapshot_deadline),
      commits_since_start: AtomicU64::new(0),
    })
  }

  pub fn epoch(&self) -> EpochInfo {
    self.epoch
  }

  pub fn current_changelog(&self) -> Arc<dyn Changelog> {
    Arc::clone(&self.changelog.lock())
  }

  /// Orders, logs, replicates and applies one mutation; resolves with the
  /// handler's response bytes once the commit is quorum-durable and
  /// applied.
  pub async fn commit(self: &Arc<Self>, request: MutationRequest) -> Result<Vec<u8>> {
    if self.read_only.load(Ordering::Acquire) {
      return Err(KeelError::ReadOnly("peer is in read-only mode".to_string()));
    }
    if !self.lease.is_valid() {
      return Err(KeelError::Unavailable("leader lease is not valid".to_string()));
    }

    if let Some(mutation_id) = request.mutation_id {
      if let Some(kept) = self.keeper.try_begin_request(mutation_id, request.retry)? {
        tracing::debug!(%mutation_id, "commit served from response keeper");
        return kept.await;
      }
    }

    let (response_tx, response_rx) = oneshot::channel();
    self.submit(request, response_tx);
    match response_rx.await {
      Ok(result) => result,
      Err(_) => Err(KeelError::MaybeCommitted("peer stopped".to_string())),
    }
  }

  fn submit(self: &Arc<Self>, request: MutationRequest, response_tx: oneshot::Sender<Result<Vec<u8>>>) {
    let mut state = self.state.lock();
    if state.logging_suspended {
      if let Some(suspended_since) = state.suspended_since {
        if suspended_since.elapsed() > self.config.mutation_logging_suspension_timeout {
          drop(state);
          let _ = response_tx.send(Err(KeelError::Unavailable(
            "mutation logging suspended for too long".to_string(),
          )));
          let _ = self.failure_tx.send(KeelError::Unavailable(
            "mutation logging suspension timeout".to_string(),
          ));
          return;
        }
      }
      state.pending_requests.push((request, response_tx));
      return;
    }
    self.log_mutation_locked(&mut state, request, response_tx);
  }

  /// Assigns order and appends to the local changelog; adds the mutation
  /// to the current batch.
  fn log_mutation_locked(
    self: &Arc<Self>,
    state: &mut CommitterState,
    request: MutationRequest,
    response_tx: oneshot::Sender<Result<Vec<u8>>>,
  ) {
    let record = self.decorated.build_leader_record(&request, self.epoch.term);
    let serialized = record.serialize();
    let local_flush = self.changelog.lock().append(vec![serialized.clone()]);

    let starting_batch = state.batch.is_empty();
    state.batch.push(PendingMutation {
      record,
      serialized,
      local_flush,
      response_tx,
    });

    if state.batch.len() >= self.config.max_commit_batch_record_count {
      self.seal_batch_locked(state);
    } else if starting_batch {
      // Arm the batch age timer.
      let committer = Arc::clone(self);
      let batch_index = state.batch_index;
      let delay = self.config.max_commit_batch_delay;
      self.control.spawn(async move {
        tokio::time::sleep(delay).await;
        let mut state = committer.state.lock();
        if state.batch_index == batch_index && !state.batch.is_empty() {
          committer.seal_batch_locked(&mut state);
        }
      });
    }
  }

  /// Flushes whatever is batched right now.
  pub fn flush_batch(self: &Arc<Self>) {
    let mut state = self.state.lock();
    if !state.batch.is_empty() {
      self.seal_batch_locked(&mut state);
    }
  }

  fn seal_batch_locked(self: &Arc<Self>, state: &mut CommitterState) {
    let batch = std::mem::take(&mut state.batch);
    state.batch_index += 1;
    let prev_chain = state.chain.clone();
    let (done_tx, done_rx) = oneshot::channel::<std::result::Result<(), ()>>();
    state.chain = async move {
      match done_rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(()),
      }
    }
    .boxed()
    .shared();

    let committer = Arc::clone(self);
    self.control.spawn(async move {
      committer.run_batch(batch, prev_chain, done_tx).await;
    });
  }

  /// Replicates one sealed batch and resolves it at quorum durability.
  async fn run_batch(
    self: Arc<Self>,
    mut batch: Vec<PendingMutation>,
    prev_chain: BatchChain,
    done_tx: oneshot::Sender<std::result::Result<(), ()>>,
  ) {
    if batch.is_empty() {
      let _ = done_tx.send(Ok(()));
      return;
    }

    // Batches complete strictly in order.
    if prev_chain.await.is_err() {
      self.fail_batch(batch, "previous batch failed");
      let _ = done_tx.send(Err(()));
      return;
    }

    let start_version = batch[0].record.version();
    let end_version = batch[batch.len() - 1].record.version().advance();
    let records: Vec<Vec<u8>> = batch
      .iter()
      .map(|mutation| mutation.serialized.clone())
      .collect();

    tracing::debug!(
      start_version = %start_version,
      record_count = records.len(),
      "flushing commit batch"
    );

    // Force the local flush so the batch does not wait out the flush
    // period.
    self.current_changelog().flush().await.ok();

    let local_flush = batch
      .last_mut()
      .map(|mutation| std::mem::replace(&mut mutation.local_flush, async { Ok(()) }.boxed()))
      .expect("non-empty batch");

    let self_id = self.cell.self_peer_id();
    let quorum = self.cell.quorum_peer_count();
    let timeout = self.config.commit_flush_rpc_timeout;

    enum Vote {
      SelfFlush(Result<()>),
      Follower(crate::types::PeerId, bool, Result<bool>),
    }

    let mut votes = futures::stream::FuturesUnordered::new();
    votes.push(async move { Vote::SelfFlush(local_flush.await) }.boxed());
    for peer_id in self.cell.peer_ids() {
      if peer_id == self_id {
        continue;
      }
      let Some(channel) = self.cell.peer_channel(peer_id) else {
        continue;
      };
      let voting = self
        .cell
        .peer_config(peer_id)
        .map(|peer| peer.voting)
        .unwrap_or(false);
      let request = AcceptMutationsRequest {
        epoch_id: self.epoch.epoch_id,
        term: self.epoch.term,
        start_revision: start_version.revision(),
        committed_revision: self.decorated.committed_version().revision(),
        alive_peers: Vec::new(),
        records: records.clone(),
      };
      votes.push(
        async move {
          let outcome = tokio::time::timeout(timeout, channel.accept_mutations(request)).await;
          let logged = match outcome {
            Ok(Ok(response)) => Ok(response.logged && response.state == PeerState::Following),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(KeelError::Unavailable("accept_mutations timed out".to_string())),
          };
          Vote::Follower(peer_id, voting, logged)
        }
        .boxed(),
      );
    }

    use futures::StreamExt;
    let mut success_count = 0usize;
    while let Some(vote) = votes.next().await {
      match vote {
        Vote::SelfFlush(Ok(())) => success_count += 1,
        Vote::SelfFlush(Err(error)) => {
          tracing::error!(%error, "local changelog flush failed");
          self.fail_batch(batch, "local flush failed");
          let _ = done_tx.send(Err(()));
          let _ = self.failure_tx.send(error);
          return;
        }
        Vote::Follower(peer_id, voting, Ok(true)) if voting => {
          tracing::debug!(peer_id, "follower acknowledged batch");
          success_count += 1;
        }
        Vote::Follower(peer_id, _, Ok(_)) => {
          tracing::debug!(peer_id, "follower accepted batch without durable ack");
        }
        Vote::Follower(peer_id, _, Err(error)) => {
          tracing::debug!(peer_id, %error, "follower rejected batch");
        }
      }
      if success_count >= quorum {
        break;
      }
    }

    if success_count < quorum {
      self.fail_batch(batch, "commit quorum not reached");
      let _ = done_tx.send(Err(()));
      let _ = self.failure_tx.send(KeelError::Unavailable(
        "commit quorum not reached".to_string(),
      ));
      return;
    }

    self.decorated.advance_committed_version(end_version);
    self
      .commits_since_start
      .fetch_add(batch.len() as u64, Ordering::Relaxed);
    let _ = done_tx.send(Ok(()));

    // Apply in order on the automaton context and answer the clients.
    let decorated = Arc::clone(&self.decorated);
    let keeper_records: Vec<(MutationRecord, oneshot::Sender<Result<Vec<u8>>>)> = batch
      .into_iter()
      .map(|mutation| (mutation.record, mutation.response_tx))
      .collect();
    let guards = Arc::clone(decorated.guards());
    self.automaton.invoke(async move {
      for (record, response_tx) in keeper_records {
        let Some(_guard) = guards.try_acquire_user() else {
          let _ = response_tx.send(Err(KeelError::Unavailable(
            "automaton is busy with system work".to_string(),
          )));
          continue;
        };
        match decorated.apply_record(&record) {
          Ok(response) => {
            let _ = response_tx.send(Ok(response.unwrap_or_default()));
          }
          Err(error) => {
            let _ = response_tx.send(Err(error));
          }
        }
      }
    });
  }

  fn fail_batch(&self, batch: Vec<PendingMutation>, reason: &str) {
    tracing::warn!(reason, record_count = batch.len(), "commit batch failed");
    for mutation in batch {
      if let Some(mutation_id) = mutation.record.header.mutation_id {
        self.keeper.cancel_request(
          mutation_id,
          &KeelError::Unavailable(reason.to_string()),
        );
      }
      let _ = mutation
        .response_tx
        .send(Err(KeelError::Unavailable(reason.to_string())));
    }
  }

  /// Completes when every batch sealed so far is quorum-durable.
  pub async fn wait_for_quorum_flush(&self) -> Result<()> {
    let chain = self.state.lock().chain.clone();
    chain
      .await
      .map_err(|_| KeelError::Unavailable("a commit batch failed".to_string()))
  }

  /// Stops assigning versions while a changelog rotation is coordinated.
  pub fn suspend_logging(&self) {
    let mut state = self.state.lock();
    if !state.logging_suspended {
      tracing::debug!("mutation logging suspended");
      state.logging_suspended = true;
      state.suspended_since = Some(Instant::now());
    }
  }

  /// Resumes logging after rotation; replays requests pended meanwhile.
  pub fn resume_logging(self: &Arc<Self>) {
    let mut state = self.state.lock();
    if !state.logging_suspended {
      return;
    }
    state.logging_suspended = false;
    state.suspended_since = None;
    tracing::debug!(
      pending = state.pending_requests.len(),
      "mutation logging resumed"
    );
    let pending = std::mem::take(&mut state.pending_requests);
    for (request, response_tx) in pending {
      self.log_mutation_locked(&mut state, request, response_tx);
    }
  }

  pub fn is_logging_suspended(&self) -> bool {
    self.state.lock().logging_suspended
  }

  /// Swaps the tail changelog during a coordinated rotation. Logging must
  /// be suspended.
  pub fn rotate_changelog(&self, changelog: Arc<dyn Changelog>) {
    debug_assert!(self.is_logging_suspended());
    *self.changelog.lock() = changelog;
    let rotated = self.decorated.rotate_logged_version();
    tracing::info!(version = %rotated, "leader changelog rotated");
  }

  /// Evaluates the checkpoint triggers.
  pub fn checkpoint_due(&self) -> Option<CheckpointReason> {
    let changelog = self.current_changelog();
    if changelog.record_count() >= self.config.max_changelog_record_count {
      return Some(CheckpointReason::RecordCount);
    }
    if changelog.data_size() >= self.config.max_changelog_data_size {
      return Some(CheckpointReason::DataSize);
    }
    if Instant::now() >= *self.snapshot_deadline.lock() {
      return Some(CheckpointReason::Periodic);
    }
    None
  }

  /// Re-arms the periodic snapshot deadline after a checkpoint.
  pub fn reset_snapshot_deadline(&self) {
    *self.snapshot_deadline.lock() = next_snapshot_deadline(&self.config);
  }

  /// Creates the next tail segment through the store; helper for the
  /// checkpointer.
  pub async fn create_next_changelog(
    &self,
    store: &Arc<dyn ChangelogStore>,
  ) -> Result<Arc<dyn Changelog>> {
    let current = self.current_changelog();
    let meta = crate::changelog::ChangelogMeta {
      prev_record_count: current.record_count(),
    };
    store.create(current.id() + 1, meta).await
  }
}

fn next_snapshot_deadline(config: &EngineConfig) -> Instant {
  let splay_micros = config.snapshot_build_splay.as_micros() as u64;
  let splay = if splay_micros == 0 {
    std::time::Duration::ZERO
  } else {
    // Control-side randomness; never reaches mutation handlers.
    std::time::Duration::from_micros(rand::Rng::gen_range(
      &mut rand::thread_rng(),
      0..splay_micros,
    ))
  };
  Instant::now() + config.snapshot_build_period + splay
}
