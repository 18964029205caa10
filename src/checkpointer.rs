//! Distributed changelog rotation, optionally paired with a snapshot.

use crate::automaton::DecoratedAutomaton;
use crate::cell::CellManager;
use crate::changelog::ChangelogStore;
use crate::committer::LeaderCommitter;
use crate::config::EngineConfig;
use crate::election::EpochInfo;
use crate::error::{KeelError, Result};
use crate::rpc::{BuildSnapshotRequest, RotateChangelogRequest};
use crate::runtime::CancelableInvoker;
use crate::snapshot::store::SnapshotStore;
use crate::types::PeerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Checkpointer {
  config: Arc<EngineConfig>,
  cell: Arc<dyn CellManager>,
  decorated: Arc<DecoratedAutomaton>,
  committer: Arc<LeaderCommitter>,
  changelog_store: Arc<dyn ChangelogStore>,
  snapshot_store: Arc<dyn SnapshotStore>,
  epoch: EpochInfo,
  failure_tx: mpsc::UnboundedSender<KeelError>,
  rotating: AtomicBool,
}

impl Checkpointer {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    config: Arc<EngineConfig>,
    cell: Arc<dyn CellManager>,
    decorated: Arc<DecoratedAutomaton>,
    committer: Arc<LeaderCommitter>,
    changelog_store: Arc<dyn ChangelogStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    epoch: EpochInfo,
    failure_tx: mpsc::UnboundedSender<KeelError>,
  ) -> Arc<Self> {
    Arc::new(Self {
      config,
      cell,
      decorated,
      committer,
      changelog_store,
      snapshot_store,
      epoch,
      failure_tx,
      rotating: AtomicBool::new(false),
    })
  }

  /// Periodic trigger evaluation; runs on the epoch's control context.
  pub fn start_auto_checks(self: &Arc<Self>, control: &CancelableInvoker) {
    let checkpointer = Arc::clone(self);
    let period = self.config.leader_lease_check_period;
    control.spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        checkpointer.check_triggers().await;
      }
    });
  }

  /// Runs a rotation when any checkpoint trigger fires.
  pub async fn check_triggers(self: &Arc<Self>) {
    let Some(reason) = self.committer.checkpoint_due() else {
      return;
    };
    tracing::info!(?reason, "checkpoint triggered");
    if let Err(error) = self.rotate(true).await {
      tracing::error!(%error, "checkpoint failed");
    }
  }

  /// Coordinates a distributed changelog rotation; with `build_snapshot`,
  /// a snapshot of the rotation point is built too. Returns the snapshot
  /// id when one was scheduled.
  pub async fn rotate(self: &Arc<Self>, build_snapshot: bool) -> Result<Option<u32>> {
    if self.rotating.swap(true, Ordering::AcqRel) {
      return Err(KeelError::Unavailable(
        "a changelog rotation is already in progress".to_string(),
      ));
    }
    let outcome = self.do_rotate(build_snapshot).await;
    self.rotating.store(false, Ordering::Release);
    if outcome.is_err() {
      let _ = self.failure_tx.send(KeelError::Unavailable(
        "changelog rotation failed".to_string(),
      ));
    }
    outcome
  }

  async fn do_rotate(self: &Arc<Self>, build_snapshot: bool) -> Result<Option<u32>> {
    // 1-3: freeze the version axis and drain everything batched so far.
    self.committer.suspend_logging();
    self.committer.flush_batch();
    self.committer.wait_for_quorum_flush().await?;

    let version = self.decorated.logged_version();
    let snapshot_id = version.segment_id + 1;
    let target_sequence = self.decorated.logged_sequence_number();
    tracing::info!(version = %version, build_snapshot, "rotating changelog");

    // 4: remote rotations in parallel with the local one.
    let self_id = self.cell.self_peer_id();
    let timeout = self.config.control_rpc_timeout;
    let mut remote_rotations = Vec::new();
    for peer_id in self.cell.peer_ids() {
      if peer_id == self_id {
        continue;
      }
      let Some(channel) = self.cell.peer_channel(peer_id) else {
        continue;
      };
      let request = RotateChangelogRequest {
        epoch_id: self.epoch.epoch_id,
        revision: version.revision(),
      };
      remote_rotations.push(async move {
        let outcome = tokio::time::timeout(timeout, channel.rotate_changelog(request)).await;
        (
          peer_id,
          match outcome {
            Ok(result) => result,
            Err(_) => Err(KeelError::Unavailable("rotate_changelog timed out".to_string())),
          },
        )
      });
    }
    let remote_results = futures::future::join_all(remote_rotations);

    let local_rotation = async {
      let previous = self.committer.current_changelog();
      let next = self
        .committer
        .create_next_changelog(&self.changelog_store)
        .await?;
      self.committer.rotate_changelog(next);
      previous.close().await?;
      Ok::<_, KeelError>(())
    };

    let (remote_results, local_result) = tokio::join!(remote_results, local_rotation);
    local_result?;

    let mut rotation_successes = 1usize; // self
    for (peer_id, result) in remote_results {
      match result {
        Ok(()) => rotation_successes += 1,
        Err(error) => {
          tracing::warn!(peer_id, %error, "remote rotation failed");
        }
      }
    }

    // 5: snapshot builds, local plus optional remote.
    let snapshot_result = if build_snapshot {
      Some(self.build_snapshots(snapshot_id, target_sequence).await)
    } else {
      None
    };

    // 6: enough rotations to keep committing?
    let quorum = self.cell.quorum_peer_count();
    if rotation_successes < quorum {
      return Err(KeelError::Unavailable(format!(
        "only {rotation_successes} of {quorum} rotations succeeded"
      )));
    }
    self.committer.resume_logging();
    self.committer.reset_snapshot_deadline();

    if let Some(result) = snapshot_result {
      match result {
        Ok(()) => {
          self.run_janitor().await;
          return Ok(Some(snapshot_id));
        }
        Err(error) => {
          // A failed snapshot does not abort the rotation.
          tracing::error!(%error, "snapshot build failed after rotation");
          return Ok(None);
        }
      }
    }
    Ok(None)
  }

  async fn build_snapshots(self: &Arc<Self>, snapshot_id: u32, target_sequence: i64) -> Result<()> {
    let self_id = self.cell.self_peer_id();
    let mut remote_builds = Vec::new();
    if self.config.build_snapshots_at_followers {
      let timeout = self.config.snapshot_build_timeout;
      for peer_id in self.cell.peer_ids() {
        if peer_id == self_id {
          continue;
        }
        let Some(channel) = self.cell.peer_channel(peer_id) else {
          continue;
        };
        let request = BuildSnapshotRequest {
          epoch_id: self.epoch.epoch_id,
          snapshot_id,
          sequence_number: target_sequence,
        };
        remote_builds.push(async move {
          let outcome = tokio::time::timeout(timeout, channel.build_snapshot(request)).await;
          (
            peer_id,
            match outcome {
              Ok(result) => result.map(|response| response.checksum),
              Err(_) => Err(KeelError::Unavailable("build_snapshot timed out".to_string())),
            },
          )
        });
      }
    }

    let local_build = self.decorated.schedule_snapshot(snapshot_id, target_sequence);
    let (remote_checksums, local_outcome) = tokio::join!(
      futures::future::join_all(remote_builds),
      tokio::time::timeout(self.config.snapshot_build_timeout, local_build)
    );

    let local_checksum = match local_outcome {
      Ok(Ok(Ok(params))) => params.checksum,
      Ok(Ok(Err(error))) => return Err(error),
      Ok(Err(_)) => {
        return Err(KeelError::Snapshot(
          "local snapshot build was dropped".to_string(),
        ))
      }
      Err(_) => {
        return Err(KeelError::Snapshot(
          "local snapshot build timed out".to_string(),
        ))
      }
    };

    for (peer_id, result) in remote_checksums {
      match result {
        Ok(checksum) if checksum == local_checksum => {}
        Ok(checksum) => {
          report_checksum_discrepancy(peer_id, local_checksum, checksum);
        }
        Err(error) => {
          tracing::warn!(peer_id, %error, "remote snapshot build failed");
        }
      }
    }
    tracing::info!(snapshot_id, checksum = local_checksum, "snapshot built");
    Ok(())
  }

  /// Bounded retention: keeps the most recent snapshots and drops the
  /// changelogs they obsolete.
  async fn run_janitor(&self) {
    let keep = self.config.snapshot.max_snapshot_count_to_keep;
    let snapshot_ids = match self.snapshot_store.snapshot_ids() {
      Ok(ids) => ids,
      Err(error) => {
        tracing::warn!(%error, "janitor could not list snapshots");
        return;
      }
    };
    if snapshot_ids.len() <= keep {
      return;
    }
    let cutoff = snapshot_ids[snapshot_ids.len() - keep];
    for snapshot_id in snapshot_ids.iter().filter(|id| **id < cutoff) {
      if let Err(error) = self.snapshot_store.remove(*snapshot_id) {
        tracing::warn!(snapshot_id, %error, "janitor failed to remove snapshot");
      }
    }
    // Changelogs strictly below the cutoff snapshot are superseded by it.
    match self.changelog_store.changelog_ids() {
      Ok(ids) => {
        for changelog_id in ids.into_iter().filter(|id| *id < cutoff) {
          if let Err(error) = self.changelog_store.remove(changelog_id).await {
            tracing::warn!(changelog_id, %error, "janitor failed to remove changelog");
          }
        }
      }
      Err(error) => tracing::warn!(%error, "janitor could not list changelogs"),
    }
  }
}

fn report_checksum_discrepancy(peer_id: PeerId, local: u64, remote: u64) {
  tracing::error!(
    peer_id,
    local_checksum = local,
    remote_checksum = remote,
    "snapshot checksum discrepancy"
  );
}

