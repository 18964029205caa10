//! Recovery driver: brings a cold automaton to a target version.
//!
//! The latest applicable snapshot seeds the automaton; the contiguous
//! changelog suffix is then replayed. Follower recovery additionally syncs
//! each local segment against the leader (truncate overhang, download
//! gaps) and finishes by draining the queues that the accept/rotate
//! handlers fed while recovery was in flight.

use crate::automaton::DecoratedAutomaton;
use crate::cell::CellManager;
use crate::changelog::{Changelog, ChangelogMeta, ChangelogStore};
use crate::committer::follower::PostponedItem;
use crate::committer::FollowerCommitter;
use crate::config::EngineConfig;
use crate::election::EpochInfo;
use crate::error::{KeelError, Result};
use crate::keeper::ResponseKeeper;
use crate::rpc::ReadChangelogRequest;
use crate::runtime::CancelableInvoker;
use crate::types::{MutationRecord, PeerId, RecoveryAction, Version};
use std::sync::Arc;
use std::time::Duration;

pub struct RecoveryOutcome {
  /// The open tail segment at the target version.
  pub tail: Arc<dyn Changelog>,
  /// The automaton asked for a fresh snapshot because old-reign mutations
  /// were replayed.
  pub build_snapshot_after: bool,
}

pub struct RecoveryDriver {
  config: Arc<EngineConfig>,
  cell: Arc<dyn CellManager>,
  decorated: Arc<DecoratedAutomaton>,
  changelog_store: Arc<dyn ChangelogStore>,
  snapshot_store: Arc<dyn crate::snapshot::SnapshotStore>,
  response_keeper: Arc<dyn ResponseKeeper>,
  epoch: EpochInfo,
  automaton: CancelableInvoker,
  /// Follower recovery syncs against the leader; leader recovery is
  /// local-only.
  is_follower: bool,
}

impl RecoveryDriver {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    config: Arc<EngineConfig>,
    cell: Arc<dyn CellManager>,
    decorated: Arc<DecoratedAutomaton>,
    changelog_store: Arc<dyn ChangelogStore>,
    snapshot_store: Arc<dyn crate::snapshot::SnapshotStore>,
    response_keeper: Arc<dyn ResponseKeeper>,
    epoch: EpochInfo,
    automaton: CancelableInvoker,
    is_follower: bool,
  ) -> Self {
    Self {
      config,
      cell,
      decorated,
      changelog_store,
      snapshot_store,
      response_keeper,
      epoch,
      automaton,
      is_follower,
    }
  }

  /// Runs recovery to `target`. On return the automaton sits at the target
  /// version and the tail segment is open.
  pub async fn run(&self, target: Version) -> Result<RecoveryOutcome> {
    tracing::info!(target = %target, is_follower = self.is_follower, "recovery started");

    let automaton_version = self.decorated.automaton_version();
    if automaton_version > target {
      return Err(KeelError::InvalidVersion {
        expected: target.to_string(),
        actual: automaton_version.to_string(),
      });
    }

    // 1-2: snapshot phase.
    let latest_snapshot = self.snapshot_store.latest_id(target.segment_id)?;
    if let Some(snapshot_id) = latest_snapshot {
      if snapshot_id > self.decorated.automaton_version().segment_id {
        self.load_snapshot(snapshot_id).await?;
      }
    }

    // 3-4: replay the changelog suffix.
    let initial_id = latest_snapshot
      .unwrap_or(0)
      .max(self.decorated.automaton_version().segment_id);
    let mut build_snapshot_after = false;
    let mut tail = None;
    for changelog_id in initial_id..=target.segment_id {
      let changelog = self.prepare_segment(changelog_id).await?;
      let is_target_segment = changelog_id == target.segment_id;

      let changelog = if self.is_follower {
        let sync_target = if is_target_segment {
          target.record_id
        } else {
          u32::MAX
        };
        self.sync_segment(changelog, sync_target).await?
      } else {
        changelog
      };
      changelog.flush().await?;

      let record_count = changelog.record_count();
      self
        .decorated
        .set_logged_version(Version::new(changelog_id, record_count));

      let replay_end = if is_target_segment {
        target.record_id.min(record_count)
      } else {
        record_count
      };
      if self.replay_segment(&changelog, replay_end).await? {
        build_snapshot_after = true;
      }

      if is_target_segment {
        tail = Some(changelog);
      } else {
        changelog.close().await?;
      }
    }

    let tail = tail.expect("loop visits the target segment");
    self
      .decorated
      .set_logged_version(Version::new(target.segment_id, tail.record_count()));
    self.decorated.reset_logging_chain();
    self
      .decorated
      .advance_committed_version(self.decorated.automaton_version());

    tracing::info!(
      automaton_version = %self.decorated.automaton_version(),
      logged_version = %self.decorated.logged_version(),
      sequence_number = self.decorated.sequence_number(),
      "recovery complete"
    );
    Ok(RecoveryOutcome {
      tail,
      build_snapshot_after,
    })
  }

  async fn load_snapshot(&self, snapshot_id: u32) -> Result<()> {
    // The keeper's cache describes pre-snapshot state; drop it.
    self.response_keeper.stop();

    let snapshot_store = Arc::clone(&self.snapshot_store);
    let decorated = Arc::clone(&self.decorated);
    let guards = Arc::clone(self.decorated.guards());
    self
      .automaton
      .submit(async move {
        tokio::task::spawn_blocking(move || {
          let mut reader = snapshot_store.open_reader(snapshot_id)?;
          let _system = guards.acquire_system();
          decorated.load_snapshot(snapshot_id, reader.as_mut())
        })
        .await
        .map_err(|error| KeelError::Snapshot(format!("snapshot load task failed: {error}")))?
      })
      .await??;
    Ok(())
  }

  /// Opens segment `id`, creating it (with the proper rotation meta) when
  /// missing.
  async fn prepare_segment(&self, changelog_id: u32) -> Result<Arc<dyn Changelog>> {
    if let Some(changelog) = self.changelog_store.try_open(changelog_id).await? {
      return Ok(changelog);
    }
    let meta = ChangelogMeta {
      prev_record_count: self.decorated.logged_version().record_id,
    };
    self.changelog_store.create(changelog_id, meta).await
  }

  /// Follower-only: reconcile one local segment with the leader's copy.
  /// May replace the segment when overhanging records must go.
  async fn sync_segment(
    &self,
    changelog: Arc<dyn Changelog>,
    sync_target: u32,
  ) -> Result<Arc<dyn Changelog>> {
    let leader = self
      .cell
      .peer_channel(self.epoch.leader_id)
      .ok_or_else(|| KeelError::Unavailable("no channel to the leader".to_string()))?;

    let lookup = tokio::time::timeout(
      self.config.control_rpc_timeout,
      leader.lookup_changelog(changelog.id()),
    )
    .await
    .map_err(|_| KeelError::Unavailable("lookup_changelog timed out".to_string()))?;
    let leader_record_count = match lookup {
      Ok(response) => response.record_count,
      Err(KeelError::NoSuchChangelog(_)) => return Ok(changelog),
      Err(error) => return Err(error),
    };

    let local = changelog.record_count();
    let changelog = if local > leader_record_count {
      tracing::info!(
        changelog_id = changelog.id(),
        local,
        leader_record_count,
        "dropping overhanging records"
      );
      self
        .rebuild_segment(changelog, leader_record_count)
        .await?
    } else {
      changelog
    };

    let wanted = sync_target.min(leader_record_count);
    if changelog.record_count() < wanted {
      self.download_records(&changelog, wanted).await?;
    }
    Ok(changelog)
  }

  /// Recreates a segment holding only its first `keep` records. The
  /// replacement stays appendable, unlike a header-truncated segment.
  async fn rebuild_segment(
    &self,
    changelog: Arc<dyn Changelog>,
    keep: u32,
  ) -> Result<Arc<dyn Changelog>> {
    let changelog_id = changelog.id();
    let meta = changelog.meta();
    let records = changelog.read(0, keep as usize, u64::MAX).await?;
    if records.len() != keep as usize {
      return Err(KeelError::BrokenChangelog(format!(
        "changelog {changelog_id} holds {} of {keep} records to keep",
        records.len()
      )));
    }
    changelog.close().await?;
    drop(changelog);
    self.changelog_store.remove(changelog_id).await?;
    let rebuilt = self.changelog_store.create(changelog_id, meta).await?;
    if !records.is_empty() {
      rebuilt.append(records).await?;
    }
    rebuilt.flush().await?;
    Ok(rebuilt)
  }

  /// Downloads records `[local, wanted)` from the leader, falling back to
  /// any other peer that has them.
  async fn download_records(&self, changelog: &Arc<dyn Changelog>, wanted: u32) -> Result<()> {
    let mut sources: Vec<PeerId> = Vec::new();
    sources.push(self.epoch.leader_id);
    for peer_id in self.cell.peer_ids() {
      if peer_id != self.epoch.leader_id && peer_id != self.cell.self_peer_id() {
        sources.push(peer_id);
      }
    }

    'chunk: while changelog.record_count() < wanted {
      let first_record_id = changelog.record_count();
      let max_records = (wanted - first_record_id).min(self.config.max_changelog_records_per_request);
      for peer_id in &sources {
        let Some(channel) = self.cell.peer_channel(*peer_id) else {
          continue;
        };
        let request = ReadChangelogRequest {
          changelog_id: changelog.id(),
          first_record_id,
          max_records,
          max_bytes: self.config.max_changelog_bytes_per_request,
        };
        let outcome = tokio::time::timeout(
          self.config.changelog_download_rpc_timeout,
          channel.read_changelog(request),
        )
        .await;
        match outcome {
          Ok(Ok(response)) if !response.records.is_empty() => {
            tracing::debug!(
              changelog_id = changelog.id(),
              first_record_id,
              count = response.records.len(),
              peer_id,
              "downloaded changelog records"
            );
            changelog.append(response.records).await?;
            continue 'chunk;
          }
          Ok(Ok(_)) => {
            tracing::debug!(peer_id, first_record_id, "peer had no records for range");
          }
          Ok(Err(error)) => {
            tracing::debug!(peer_id, %error, "changelog download failed");
          }
          Err(_) => {
            tracing::debug!(peer_id, "changelog download timed out");
          }
        }
      }
      return Err(KeelError::Unavailable(format!(
        "no peer could serve records {first_record_id}..{wanted} of changelog {}",
        changelog.id()
      )));
    }
    Ok(())
  }

  /// Replays records `[automaton_version.record, replay_end)` of one
  /// segment into the automaton. Returns true when an old-reign mutation
  /// requires a snapshot afterwards.
  async fn replay_segment(&self, changelog: &Arc<dyn Changelog>, replay_end: u32) -> Result<bool> {
    let mut build_snapshot_after = false;
    loop {
      let automaton_version = self.decorated.automaton_version();
      let first = if automaton_version.segment_id < changelog.id() {
        0
      } else {
        automaton_version.record_id
      };
      if first >= replay_end {
        break;
      }
      let batch = changelog
        .read(
          first,
          (replay_end - first).min(self.config.max_changelog_records_per_request) as usize,
          self.config.max_changelog_bytes_per_request,
        )
        .await?;
      if batch.is_empty() {
        return Err(KeelError::BrokenChangelog(format!(
          "changelog {} ends at {first}, target {replay_end}",
          changelog.id()
        )));
      }

      let mut records = Vec::with_capacity(batch.len());
      for bytes in &batch {
        let record = MutationRecord::deserialize(bytes)?;
        if self.decorated.recovery_action_for_reign(record.header.reign)
          == RecoveryAction::BuildSnapshotAndRestart
        {
          build_snapshot_after = true;
        }
        records.push(record);
      }

      let decorated = Arc::clone(&self.decorated);
      let guards = Arc::clone(self.decorated.guards());
      self
        .automaton
        .submit(async move {
          let _system = guards.acquire_system();
          for record in &records {
            decorated.apply_record(record)?;
          }
          Ok::<_, KeelError>(())
        })
        .await??;
    }
    Ok(build_snapshot_after)
  }

  /// Follower catch-up: drains the postponed queues fed during recovery,
  /// then waits for the automaton to reach the committed watermark.
  pub async fn drain_postponed(&self, committer: &Arc<FollowerCommitter>) -> Result<()> {
    loop {
      match committer.take_postponed() {
        Some(PostponedItem::Mutations(start_version, mut records)) => {
          // A batch may overlap the suffix the sync phase already
          // downloaded; drop the already-logged prefix. Batches never
          // straddle a segment boundary, so a lower segment id means the
          // whole batch is covered.
          let mut start_version = start_version;
          let logged = self.decorated.logged_version();
          if start_version.segment_id < logged.segment_id {
            continue;
          }
          if start_version.segment_id == logged.segment_id
            && start_version.record_id < logged.record_id
          {
            let skip = (logged.record_id - start_version.record_id) as usize;
            if skip >= records.len() {
              continue;
            }
            records.drain(..skip);
            start_version = logged;
          }
          let flush = committer.log_records(start_version, records)?;
          flush.await?;
        }
        Some(PostponedItem::Rotation(version)) => {
          committer.do_rotate(&self.changelog_store, version).await?;
        }
        None => {
          if committer.try_finish_recovery() {
            break;
          }
        }
      }
    }

    // Kick the apply path and wait for it to reach the watermark.
    committer.advance_committed(self.decorated.committed_version().revision());
    let deadline = std::time::Instant::now() + self.config.commit_flush_rpc_timeout;
    loop {
      let committed = self.decorated.committed_version();
      if self.decorated.automaton_version() >= committed {
        break;
      }
      if std::time::Instant::now() > deadline {
        return Err(KeelError::Unavailable(
          "follower did not catch up to the committed watermark".to_string(),
        ));
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
  }
}
