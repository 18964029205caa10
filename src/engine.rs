//! The peer engine: state machine, epoch lifecycle, RPC handler surface.
//!
//! Glues the committers, lease tracker, checkpointer and recovery driver
//! to the election module and the transport. Every epoch-scoped object is
//! created on a leadership transition and torn down by canceling the
//! epoch's context; in-flight commit promises then resolve with
//! `MaybeCommitted`.

use crate::automaton::decorated::SnapshotBuildMode;
use crate::automaton::{Automaton, DecoratedAutomaton};
use crate::cell::CellManager;
use crate::changelog::{ChangelogDispatcher, ChangelogMeta, ChangelogStore, LocalChangelogStore};
use crate::checkpointer::Checkpointer;
use crate::committer::{FollowerCommitter, LeaderCommitter};
use crate::config::EngineConfig;
use crate::election::{ElectionCallbacks, Elector, EpochInfo};
use crate::error::{KeelError, Result};
use crate::keeper::ResponseKeeper;
use crate::lease::{LeaderLease, LeaseTracker};
use crate::recovery::RecoveryDriver;
use crate::rpc::{
  AcceptMutationsRequest, AcceptMutationsResponse, BuildSnapshotRequest, BuildSnapshotResponse,
  LookupChangelogResponse, PeerChannel, PingFollowerRequest, PingFollowerResponse,
  ReadChangelogRequest, ReadChangelogResponse, RotateChangelogRequest, SyncWithLeaderResponse,
};
use crate::runtime::{CancelableInvoker, Canceler, Invoker};
use crate::snapshot::store::SnapshotStore;
use crate::snapshot::FileSnapshotStore;
use crate::types::{EpochId, MutationRequest, PeerState, Version};
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Observer signals, delivered in the documented order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
  StartLeading,
  LeaderRecoveryComplete,
  LeaderActive,
  StopLeading,
  StartFollowing,
  FollowerRecoveryComplete,
  StopFollowing,
  LeaderLeaseCheck,
}

pub struct EngineOptions {
  pub config: EngineConfig,
  pub data_dir: PathBuf,
  pub cell: Arc<dyn CellManager>,
  pub elector: Arc<dyn Elector>,
  pub response_keeper: Arc<dyn ResponseKeeper>,
  pub snapshot_build_mode: SnapshotBuildMode,
}

struct EpochContext {
  info: EpochInfo,
  canceler: Arc<Canceler>,
  control: CancelableInvoker,
  automaton: CancelableInvoker,
  failure_tx: mpsc::UnboundedSender<KeelError>,
  lease: Arc<LeaderLease>,
  leader_committer: Mutex<Option<Arc<LeaderCommitter>>>,
  follower_committer: Mutex<Option<Arc<FollowerCommitter>>>,
  lease_tracker: Mutex<Option<Arc<LeaseTracker>>>,
  checkpointer: Mutex<Option<Arc<Checkpointer>>>,
  /// Fired by the first leader contact on a recovering follower.
  recovery_trigger: Mutex<Option<oneshot::Sender<Version>>>,
  active: AtomicBool,
}

impl EpochContext {
  fn leader_committer(&self) -> Result<Arc<LeaderCommitter>> {
    self
      .leader_committer
      .lock()
      .clone()
      .ok_or_else(|| KeelError::Unavailable("leader is still recovering".to_string()))
  }

  fn follower_committer(&self) -> Result<Arc<FollowerCommitter>> {
    self
      .follower_committer
      .lock()
      .clone()
      .ok_or_else(|| KeelError::Unavailable("follower is not initialized".to_string()))
  }
}

type SyncFuture = Shared<BoxFuture<'static, std::result::Result<(), String>>>;

#[derive(Default)]
struct LeaderSyncState {
  inflight: Option<SyncFuture>,
}

pub struct Engine {
  config: Arc<EngineConfig>,
  cell: Arc<dyn CellManager>,
  elector: Arc<dyn Elector>,
  response_keeper: Arc<dyn ResponseKeeper>,
  decorated: Arc<DecoratedAutomaton>,
  changelog_store: Arc<dyn ChangelogStore>,
  snapshot_store: Arc<dyn SnapshotStore>,
  dispatcher: Arc<ChangelogDispatcher>,
  control: Invoker,
  automaton_invoker: Invoker,
  state: Mutex<PeerState>,
  epoch: RwLock<Option<Arc<EpochContext>>>,
  events: broadcast::Sender<EngineEvent>,
  read_only: Arc<AtomicBool>,
  leader_sync: Mutex<LeaderSyncState>,
  finalized: AtomicBool,
}

impl Engine {
  /// Builds the engine and opens its stores. Must run inside a tokio
  /// runtime. Call [`Engine::initialize`] to hook into the elector.
  pub fn new(options: EngineOptions, automaton: Box<dyn Automaton>) -> Result<Arc<Self>> {
    options.config.validate()?;
    let config = Arc::new(options.config);

    let dispatcher = ChangelogDispatcher::new(config.changelog.flush_quantum);
    let changelog_store: Arc<dyn ChangelogStore> = LocalChangelogStore::open_store(
      options.data_dir.join("changelogs"),
      config.changelog.clone(),
      Arc::clone(&dispatcher),
    )?;
    let snapshot_store: Arc<dyn SnapshotStore> = FileSnapshotStore::open_store(
      options.data_dir.join("snapshots"),
      config.snapshot.clone(),
    )?;

    let decorated = DecoratedAutomaton::new(
      automaton,
      Arc::clone(&config),
      Arc::clone(&snapshot_store),
      Arc::clone(&options.response_keeper),
      options.snapshot_build_mode,
    );

    let (events, _) = broadcast::channel(256);
    Ok(Arc::new(Self {
      config,
      cell: options.cell,
      elector: options.elector,
      response_keeper: options.response_keeper,
      decorated,
      changelog_store,
      snapshot_store,
      dispatcher,
      control: Invoker::new("control"),
      automaton_invoker: Invoker::new("automaton"),
      state: Mutex::new(PeerState::Stopped),
      epoch: RwLock::new(None),
      events,
      read_only: Arc::new(AtomicBool::new(false)),
      leader_sync: Mutex::new(LeaderSyncState::default()),
      finalized: AtomicBool::new(false),
    }))
  }

  /// Subscribes to the election module; leadership changes drive the peer
  /// from here on.
  pub fn initialize(self: &Arc<Self>) {
    self.response_keeper.start();
    let callbacks: Arc<dyn ElectionCallbacks> = Arc::new(EngineElectionCallbacks {
      engine: Arc::downgrade(self),
    });
    self.elector.subscribe(self.cell.self_peer_id(), callbacks);
    tracing::info!(peer_id = self.cell.self_peer_id(), "engine initialized");
  }

  /// Cancels the current epoch and shuts the stores down.
  pub async fn finalize(self: &Arc<Self>) {
    if self.finalized.swap(true, Ordering::AcqRel) {
      return;
    }
    self.teardown_epoch(None).await;
    self.response_keeper.stop();
    let _ = self.dispatcher.flush_all().await;
    self.dispatcher.shutdown();
    tracing::info!(peer_id = self.cell.self_peer_id(), "engine finalized");
  }

  pub fn get_state(&self) -> PeerState {
    *self.state.lock()
  }

  pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
    self.events.subscribe()
  }

  pub fn decorated(&self) -> &Arc<DecoratedAutomaton> {
    &self.decorated
  }

  pub fn changelog_store(&self) -> &Arc<dyn ChangelogStore> {
    &self.changelog_store
  }

  pub fn snapshot_store(&self) -> &Arc<dyn SnapshotStore> {
    &self.snapshot_store
  }

  pub fn is_active_leader(&self) -> bool {
    if self.get_state() != PeerState::Leading {
      return false;
    }
    let Some(epoch) = self.current_epoch() else {
      return false;
    };
    epoch.active.load(Ordering::Acquire) && epoch.lease.is_valid()
  }

  pub fn is_active_follower(&self) -> bool {
    if self.get_state() != PeerState::Following {
      return false;
    }
    self
      .current_epoch()
      .map(|epoch| epoch.active.load(Ordering::Acquire))
      .unwrap_or(false)
  }

  pub fn set_read_only(&self, read_only: bool) {
    self.read_only.store(read_only, Ordering::Release);
    tracing::info!(read_only, "read-only mode changed");
  }

  /// Election priority: the peer's reachable version revision.
  pub fn get_priority(&self) -> u64 {
    let logged = self.decorated.logged_version();
    let on_disk = self
      .changelog_store
      .latest_id()
      .ok()
      .flatten()
      .map(|segment_id| Version::new(segment_id, 0))
      .unwrap_or_default();
    logged.max(on_disk).revision()
  }

  /// Commits one mutation: directly when leading, by forwarding when
  /// following and the request permits it.
  pub async fn commit_mutation(self: &Arc<Self>, request: MutationRequest) -> Result<Vec<u8>> {
    match self.get_state() {
      PeerState::Leading => {
        let committer = self.require_epoch()?.leader_committer()?;
        if !self.is_active_leader() {
          return Err(KeelError::Unavailable("leader is not active".to_string()));
        }
        committer.commit(request).await
      }
      PeerState::Following if request.allow_leader_forwarding => {
        let epoch = self.require_epoch()?;
        let leader = self
          .cell
          .peer_channel(epoch.info.leader_id)
          .ok_or_else(|| KeelError::Unavailable("no channel to the leader".to_string()))?;
        tokio::time::timeout(
          self.config.commit_forwarding_rpc_timeout,
          leader.commit_mutation(request),
        )
        .await
        .map_err(|_| KeelError::Unavailable("commit forwarding timed out".to_string()))?
      }
      state => Err(KeelError::Unavailable(format!(
        "peer cannot commit in state {state}"
      ))),
    }
  }

  /// Follower-side read barrier: resolves once the local automaton has
  /// caught up with the leader's committed version. Concurrent callers
  /// coalesce onto one in-flight sync.
  pub async fn sync_with_leader(self: &Arc<Self>) -> Result<()> {
    if self.get_state() == PeerState::Leading {
      return Ok(());
    }
    let sync = {
      let mut state = self.leader_sync.lock();
      match &state.inflight {
        Some(sync) => sync.clone(),
        None => {
          let engine = Arc::clone(self);
          let sync: SyncFuture = async move {
            let outcome = engine.run_leader_sync().await.map_err(|error| error.to_string());
            engine.leader_sync.lock().inflight = None;
            outcome
          }
          .boxed()
          .shared();
          state.inflight = Some(sync.clone());
          sync
        }
      }
    };
    sync.await.map_err(KeelError::Unavailable)
  }

  async fn run_leader_sync(self: &Arc<Self>) -> Result<()> {
    tokio::time::sleep(self.config.leader_sync_delay).await;
    let epoch = self.require_epoch()?;
    let leader = self
      .cell
      .peer_channel(epoch.info.leader_id)
      .ok_or_else(|| KeelError::Unavailable("no channel to the leader".to_string()))?;
    let response = tokio::time::timeout(
      self.config.control_rpc_timeout,
      leader.sync_with_leader(epoch.info.epoch_id),
    )
    .await
    .map_err(|_| KeelError::Unavailable("sync_with_leader timed out".to_string()))??;

    let target = response.committed_revision;
    let deadline = std::time::Instant::now() + self.config.commit_forwarding_rpc_timeout;
    loop {
      if self.decorated.automaton_version().revision() >= target {
        return Ok(());
      }
      if std::time::Instant::now() > deadline {
        return Err(KeelError::Unavailable(
          "leader sync did not converge".to_string(),
        ));
      }
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
  }

  /// Out-of-band snapshot; on a leader this runs a full distributed
  /// rotation + snapshot. Returns the new snapshot id.
  pub async fn build_snapshot(self: &Arc<Self>) -> Result<u32> {
    let epoch = self.require_epoch()?;
    let checkpointer = epoch
      .checkpointer
      .lock()
      .clone()
      .ok_or_else(|| KeelError::Unavailable("peer is not an active leader".to_string()))?;
    match checkpointer.rotate(true).await? {
      Some(snapshot_id) => Ok(snapshot_id),
      None => Err(KeelError::Snapshot(
        "rotation succeeded but the snapshot build failed".to_string(),
      )),
    }
  }

  /// An in-process channel to this engine, for transports and tests.
  pub fn local_channel(self: &Arc<Self>) -> Arc<dyn PeerChannel> {
    Arc::new(EngineChannel {
      engine: Arc::downgrade(self),
    })
  }

  // ------------------------------------------------------------------
  // Epoch lifecycle
  // ------------------------------------------------------------------

  fn current_epoch(&self) -> Option<Arc<EpochContext>> {
    self.epoch.read().clone()
  }

  fn require_epoch(&self) -> Result<Arc<EpochContext>> {
    self
      .current_epoch()
      .ok_or_else(|| KeelError::Unavailable("no active epoch".to_string()))
  }

  fn check_epoch(&self, epoch_id: EpochId) -> Result<Arc<EpochContext>> {
    let epoch = self.require_epoch()?;
    if epoch.info.epoch_id != epoch_id {
      return Err(KeelError::InvalidEpoch {
        expected: epoch.info.epoch_id,
        actual: epoch_id,
      });
    }
    Ok(epoch)
  }

  fn set_state(&self, state: PeerState) {
    *self.state.lock() = state;
    tracing::info!(state = %state, "peer state changed");
  }

  fn emit(&self, event: EngineEvent) {
    let _ = self.events.send(event);
  }

  fn make_epoch(self: &Arc<Self>, info: EpochInfo) -> Arc<EpochContext> {
    let canceler = Canceler::new();
    let (failure_tx, failure_rx) = mpsc::unbounded_channel();
    let epoch = Arc::new(EpochContext {
      info,
      canceler: Arc::clone(&canceler),
      control: CancelableInvoker::new(self.control.clone(), Arc::clone(&canceler)),
      automaton: CancelableInvoker::new(self.automaton_invoker.clone(), Arc::clone(&canceler)),
      failure_tx,
      lease: LeaderLease::new(),
      leader_committer: Mutex::new(None),
      follower_committer: Mutex::new(None),
      lease_tracker: Mutex::new(None),
      checkpointer: Mutex::new(None),
      recovery_trigger: Mutex::new(None),
      active: AtomicBool::new(false),
    });
    {
      let mut slot = self.epoch.write();
      if let Some(previous) = slot.take() {
        // A leftover epoch means the elector skipped the stop callback.
        previous.canceler.cancel();
      }
      *slot = Some(Arc::clone(&epoch));
    }

    // Failure watcher: the first epoch failure triggers a restart.
    let engine = Arc::downgrade(self);
    let epoch_id = info.epoch_id;
    let mut failure_rx = failure_rx;
    tokio::spawn(async move {
      if let Some(error) = failure_rx.recv().await {
        if let Some(engine) = engine.upgrade() {
          tracing::warn!(%error, "epoch failed");
          engine.restart(epoch_id).await;
        }
      }
    });
    epoch
  }

  /// Detaches and cancels the epoch (any epoch when `epoch_id` is None),
  /// resets the peer state and emits the stop signal. The tail changelog
  /// stays open in the store cache so the next epoch picks it up without
  /// a close/reopen race; it is closed on rotation or finalize.
  fn detach_epoch(&self, epoch_id: Option<EpochId>) {
    let epoch = {
      let mut slot = self.epoch.write();
      match (&*slot, epoch_id) {
        (Some(current), Some(wanted)) if current.info.epoch_id != wanted => return,
        _ => slot.take(),
      }
    };
    let Some(epoch) = epoch else {
      return;
    };

    epoch.canceler.cancel();
    epoch.lease.restart();
    let was_leader = epoch.info.leader_id == self.cell.self_peer_id();

    self.set_state(PeerState::Stopped);
    self.emit(if was_leader {
      EngineEvent::StopLeading
    } else {
      EngineEvent::StopFollowing
    });
  }

  async fn teardown_epoch(self: &Arc<Self>, epoch_id: Option<EpochId>) {
    self.detach_epoch(epoch_id);
  }

  /// Restart: cancel the epoch, back off, re-enter election.
  async fn restart(self: &Arc<Self>, epoch_id: EpochId) {
    self.detach_epoch(Some(epoch_id));
    tokio::time::sleep(self.config.restart_backoff_time).await;
    self.elector.request_restart(self.cell.self_peer_id());
  }

  fn fail_epoch(&self, epoch: &EpochContext, error: KeelError) {
    let _ = epoch.failure_tx.send(error);
  }

  // ------------------------------------------------------------------
  // Leading
  // ------------------------------------------------------------------

  fn start_leading(self: &Arc<Self>, info: EpochInfo) {
    self.set_state(PeerState::LeaderRecovery);
    self.emit(EngineEvent::StartLeading);
    let epoch = self.make_epoch(info);
    let engine = Arc::clone(self);
    let epoch_clone = Arc::clone(&epoch);
    epoch.control.spawn(async move {
      if let Err(error) = engine.do_start_leading(info, epoch_clone).await {
        tracing::error!(%error, "leader startup failed");
        // Restart must survive the cancellation of this epoch task.
        tokio::spawn(async move { engine.restart(info.epoch_id).await });
      }
    });
  }

  async fn do_start_leading(self: &Arc<Self>, info: EpochInfo, epoch: Arc<EpochContext>) -> Result<()> {
    // Local recovery to the end of the durable log.
    let target_segment = self.reachable_segment()?;
    let driver = RecoveryDriver::new(
      Arc::clone(&self.config),
      Arc::clone(&self.cell),
      Arc::clone(&self.decorated),
      Arc::clone(&self.changelog_store),
      Arc::clone(&self.snapshot_store),
      Arc::clone(&self.response_keeper),
      info,
      epoch.automaton.clone(),
      false,
    );
    let outcome = driver.run(Version::new(target_segment, u32::MAX)).await?;
    self.set_state(PeerState::Leading);
    self.emit(EngineEvent::LeaderRecoveryComplete);

    let committer = LeaderCommitter::new(
      Arc::clone(&self.config),
      Arc::clone(&self.cell),
      Arc::clone(&self.decorated),
      Arc::clone(&self.response_keeper),
      info,
      Arc::clone(&epoch.lease),
      Arc::clone(&outcome.tail),
      epoch.control.clone(),
      epoch.automaton.clone(),
      epoch.failure_tx.clone(),
      Arc::clone(&self.read_only),
    );
    *epoch.leader_committer.lock() = Some(Arc::clone(&committer));

    let lease_tracker = LeaseTracker::new(
      Arc::clone(&self.config),
      Arc::clone(&self.cell),
      Arc::clone(&self.decorated),
      info,
      Arc::clone(&epoch.lease),
      epoch.failure_tx.clone(),
    );
    lease_tracker.start(&epoch.control);
    *epoch.lease_tracker.lock() = Some(Arc::clone(&lease_tracker));

    let checkpointer = Checkpointer::new(
      Arc::clone(&self.config),
      Arc::clone(&self.cell),
      Arc::clone(&self.decorated),
      Arc::clone(&committer),
      Arc::clone(&self.changelog_store),
      Arc::clone(&self.snapshot_store),
      info,
      epoch.failure_tx.clone(),
    );
    checkpointer.start_auto_checks(&epoch.control);
    *epoch.checkpointer.lock() = Some(Arc::clone(&checkpointer));

    self.response_keeper.start();

    // A new leader must outwait any prior leader's lease before serving.
    lease_tracker.wait_for_lease().await;
    self.emit(EngineEvent::LeaderLeaseCheck);
    if !self.config.disable_leader_lease_grace_delay {
      tokio::time::sleep(self.config.leader_lease_grace_delay).await;
    }
    if epoch.canceler.is_canceled() {
      return Err(KeelError::Canceled("epoch ended during grace delay".to_string()));
    }
    epoch.active.store(true, Ordering::Release);
    self.emit(EngineEvent::LeaderActive);
    tracing::info!(term = info.term, "leader active");

    if outcome.build_snapshot_after {
      let _ = checkpointer.rotate(true).await;
    }
    self.start_heartbeats(&epoch);
    Ok(())
  }

  /// The target segment for leader recovery: everything durable locally.
  fn reachable_segment(&self) -> Result<u32> {
    let latest_changelog = self.changelog_store.latest_id()?.unwrap_or(0);
    let latest_snapshot = self.snapshot_store.latest_id(u32::MAX)?.unwrap_or(0);
    Ok(latest_changelog.max(latest_snapshot))
  }

  fn start_heartbeats(self: &Arc<Self>, epoch: &Arc<EpochContext>) {
    if self.config.heartbeat_mutation_period.is_zero() {
      return;
    }
    let engine = Arc::clone(self);
    let epoch_clone = Arc::clone(epoch);
    let period = self.config.heartbeat_mutation_period;
    let timeout = self.config.heartbeat_mutation_timeout;
    epoch.control.spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      ticker.tick().await; // immediate first tick is not a heartbeat
      loop {
        ticker.tick().await;
        let Ok(committer) = epoch_clone.leader_committer() else {
          return;
        };
        let heartbeat = MutationRequest::new("", Vec::new());
        match tokio::time::timeout(timeout, committer.commit(heartbeat)).await {
          Ok(Ok(_)) => {}
          Ok(Err(error)) => {
            tracing::warn!(%error, "heartbeat mutation failed");
          }
          Err(_) => {
            engine.fail_epoch(
              &epoch_clone,
              KeelError::Unavailable("heartbeat mutation timed out".to_string()),
            );
            return;
          }
        }
      }
    });
  }

  // ------------------------------------------------------------------
  // Following
  // ------------------------------------------------------------------

  fn start_following(self: &Arc<Self>, info: EpochInfo) {
    self.set_state(PeerState::FollowerRecovery);
    self.emit(EngineEvent::StartFollowing);
    let epoch = self.make_epoch(info);
    let engine = Arc::clone(self);
    let epoch_clone = Arc::clone(&epoch);
    epoch.control.spawn(async move {
      if let Err(error) = engine.do_start_following(info, epoch_clone).await {
        tracing::error!(%error, "follower startup failed");
        tokio::spawn(async move { engine.restart(info.epoch_id).await });
      }
    });
  }

  async fn do_start_following(
    self: &Arc<Self>,
    info: EpochInfo,
    epoch: Arc<EpochContext>,
  ) -> Result<()> {
    let committer = FollowerCommitter::new(
      Arc::clone(&self.config),
      Arc::clone(&self.decorated),
      info,
      epoch.automaton.clone(),
      epoch.failure_tx.clone(),
    );
    *epoch.follower_committer.lock() = Some(Arc::clone(&committer));

    // Recovery starts at the first leader contact, which names the target.
    let (trigger_tx, trigger_rx) = oneshot::channel();
    *epoch.recovery_trigger.lock() = Some(trigger_tx);
    let target = trigger_rx
      .await
      .map_err(|_| KeelError::Canceled("epoch ended before leader contact".to_string()))?;

    let driver = RecoveryDriver::new(
      Arc::clone(&self.config),
      Arc::clone(&self.cell),
      Arc::clone(&self.decorated),
      Arc::clone(&self.changelog_store),
      Arc::clone(&self.snapshot_store),
      Arc::clone(&self.response_keeper),
      info,
      epoch.automaton.clone(),
      true,
    );
    let outcome = driver.run(target).await?;
    committer.set_changelog(outcome.tail);

    // Catch up with whatever the accept/rotate handlers postponed.
    driver.drain_postponed(&committer).await?;

    self.set_state(PeerState::Following);
    epoch.active.store(true, Ordering::Release);
    self.emit(EngineEvent::FollowerRecoveryComplete);
    tracing::info!(term = info.term, "follower active");
    Ok(())
  }

  // ------------------------------------------------------------------
  // RPC handlers (invoked by the transport)
  // ------------------------------------------------------------------

  pub async fn handle_ping_follower(
    self: &Arc<Self>,
    request: PingFollowerRequest,
  ) -> Result<PingFollowerResponse> {
    let epoch = self.check_epoch(request.epoch_id)?;

    let state = self.get_state();
    match state {
      PeerState::FollowerRecovery => {
        if let Some(trigger) = epoch.recovery_trigger.lock().take() {
          let _ = trigger.send(Version::from_revision(request.ping_revision));
        }
      }
      PeerState::Following => {
        if let Ok(committer) = epoch.follower_committer() {
          committer.advance_committed(request.committed_revision);
        }
      }
      _ => {}
    }

    Ok(PingFollowerResponse {
      state,
      state_hash_samples: self.decorated.take_state_hash_samples(),
    })
  }

  pub async fn handle_accept_mutations(
    self: &Arc<Self>,
    request: AcceptMutationsRequest,
  ) -> Result<AcceptMutationsResponse> {
    let epoch = self.check_epoch(request.epoch_id)?;
    let committer = epoch.follower_committer()?;

    let start_version = Version::from_revision(request.start_revision);
    match committer.accept_mutations(start_version, request.records, request.committed_revision) {
      Ok(Some(flush)) => {
        flush.await?;
        Ok(AcceptMutationsResponse {
          logged: true,
          state: self.get_state(),
        })
      }
      Ok(None) => {
        // Postponed during recovery: accepted into the log path but not
        // durable yet.
        if let Some(trigger) = epoch.recovery_trigger.lock().take() {
          let _ = trigger.send(start_version);
        }
        Ok(AcceptMutationsResponse {
          logged: false,
          state: self.get_state(),
        })
      }
      Err(error) => Err(error),
    }
  }

  pub async fn handle_lookup_changelog(
    self: &Arc<Self>,
    changelog_id: u32,
  ) -> Result<LookupChangelogResponse> {
    match self.changelog_store.try_open(changelog_id).await? {
      Some(changelog) => Ok(LookupChangelogResponse {
        record_count: changelog.record_count(),
      }),
      None => Err(KeelError::NoSuchChangelog(changelog_id)),
    }
  }

  pub async fn handle_read_changelog(
    self: &Arc<Self>,
    request: ReadChangelogRequest,
  ) -> Result<ReadChangelogResponse> {
    let changelog = self
      .changelog_store
      .try_open(request.changelog_id)
      .await?
      .ok_or(KeelError::NoSuchChangelog(request.changelog_id))?;
    let records = changelog
      .read(
        request.first_record_id,
        request.max_records as usize,
        request.max_bytes,
      )
      .await?;
    Ok(ReadChangelogResponse { records })
  }

  pub async fn handle_build_snapshot(
    self: &Arc<Self>,
    request: BuildSnapshotRequest,
  ) -> Result<BuildSnapshotResponse> {
    self.check_epoch(request.epoch_id)?;
    let done = self
      .decorated
      .schedule_snapshot(request.snapshot_id, request.sequence_number);
    let params = tokio::time::timeout(self.config.snapshot_build_timeout, done)
      .await
      .map_err(|_| KeelError::Snapshot("snapshot build timed out".to_string()))?
      .map_err(|_| KeelError::Snapshot("snapshot build was dropped".to_string()))??;
    Ok(BuildSnapshotResponse {
      checksum: params.checksum,
    })
  }

  pub async fn handle_rotate_changelog(
    self: &Arc<Self>,
    request: RotateChangelogRequest,
  ) -> Result<()> {
    let epoch = self.check_epoch(request.epoch_id)?;
    let committer = epoch.follower_committer()?;
    let version = Version::from_revision(request.revision);
    committer
      .rotate_changelog(&self.changelog_store, version)
      .await?;
    Ok(())
  }

  pub async fn handle_sync_with_leader(
    self: &Arc<Self>,
    epoch_id: EpochId,
  ) -> Result<SyncWithLeaderResponse> {
    self.check_epoch(epoch_id)?;
    if self.get_state() != PeerState::Leading {
      return Err(KeelError::Unavailable("peer is not leading".to_string()));
    }
    Ok(SyncWithLeaderResponse {
      committed_revision: self.decorated.committed_version().revision(),
    })
  }

  /// Bootstraps segment zero on a brand-new cell. Idempotent.
  pub async fn ensure_bootstrap(self: &Arc<Self>) -> Result<()> {
    if self.changelog_store.latest_id()?.is_none() {
      let changelog = self
        .changelog_store
        .create(0, ChangelogMeta::default())
        .await?;
      changelog.close().await?;
      tracing::info!("bootstrapped empty changelog 0");
    }
    Ok(())
  }
}

struct EngineElectionCallbacks {
  engine: Weak<Engine>,
}

impl ElectionCallbacks for EngineElectionCallbacks {
  fn on_start_leading(&self, epoch: EpochInfo) {
    if let Some(engine) = self.engine.upgrade() {
      engine.start_leading(epoch);
    }
  }

  fn on_stop_leading(&self) {
    if let Some(engine) = self.engine.upgrade() {
      engine.detach_epoch(None);
    }
  }

  fn on_start_following(&self, epoch: EpochInfo) {
    if let Some(engine) = self.engine.upgrade() {
      engine.start_following(epoch);
    }
  }

  fn on_stop_following(&self) {
    if let Some(engine) = self.engine.upgrade() {
      engine.detach_epoch(None);
    }
  }

  fn get_priority(&self) -> u64 {
    self
      .engine
      .upgrade()
      .map(|engine| engine.get_priority())
      .unwrap_or(0)
  }
}

/// In-process loopback transport.
struct EngineChannel {
  engine: Weak<Engine>,
}

impl EngineChannel {
  fn engine(&self) -> Result<Arc<Engine>> {
    self
      .engine
      .upgrade()
      .ok_or_else(|| KeelError::Unavailable("peer is gone".to_string()))
  }
}

#[async_trait]
impl PeerChannel for EngineChannel {
  async fn ping_follower(&self, request: PingFollowerRequest) -> Result<PingFollowerResponse> {
    self.engine()?.handle_ping_follower(request).await
  }

  async fn accept_mutations(
    &self,
    request: AcceptMutationsRequest,
  ) -> Result<AcceptMutationsResponse> {
    self.engine()?.handle_accept_mutations(request).await
  }

  async fn lookup_changelog(&self, changelog_id: u32) -> Result<LookupChangelogResponse> {
    self.engine()?.handle_lookup_changelog(changelog_id).await
  }

  async fn read_changelog(&self, request: ReadChangelogRequest) -> Result<ReadChangelogResponse> {
    self.engine()?.handle_read_changelog(request).await
  }

  async fn build_snapshot(&self, request: BuildSnapshotRequest) -> Result<BuildSnapshotResponse> {
    self.engine()?.handle_build_snapshot(request).await
  }

  async fn rotate_changelog(&self, request: RotateChangelogRequest) -> Result<()> {
    self.engine()?.handle_rotate_changelog(request).await
  }

  async fn sync_with_leader(&self, epoch_id: EpochId) -> Result<SyncWithLeaderResponse> {
    self.engine()?.handle_sync_with_leader(epoch_id).await
  }

  async fn commit_mutation(&self, request: MutationRequest) -> Result<Vec<u8>> {
    self.engine()?.commit_mutation(request).await
  }
}
