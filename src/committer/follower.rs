//! Follower-side commit path.
//!
//! Replicated batches are logged to the local changelog immediately but
//! applied only once the leader's committed-version watermark covers them.
//! While recovery is still in flight, incoming batches and rotations are
//! postponed and replayed by the recovery driver.

use crate::automaton::DecoratedAutomaton;
use crate::changelog::{Changelog, ChangelogMeta, ChangelogStore};
use crate::config::EngineConfig;
use crate::election::EpochInfo;
use crate::error::{KeelError, Result};
use crate::runtime::CancelableInvoker;
use crate::types::{MutationRecord, Version};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

pub enum PostponedItem {
  /// Serialized mutation records with their expected start version.
  Mutations(Version, Vec<Vec<u8>>),
  Rotation(Version),
}

struct FollowerState {
  recovery_active: bool,
  postponed: VecDeque<PostponedItem>,
  /// Logged but not yet applied records, in version order.
  pending_apply: VecDeque<MutationRecord>,
}

pub struct FollowerCommitter {
  config: Arc<EngineConfig>,
  decorated: Arc<DecoratedAutomaton>,
  epoch: EpochInfo,
  /// Absent until recovery has opened the tail segment.
  changelog: Mutex<Option<Arc<dyn Changelog>>>,
  automaton: CancelableInvoker,
  failure_tx: mpsc::UnboundedSender<KeelError>,
  state: Mutex<FollowerState>,
}

impl FollowerCommitter {
  pub fn new(
    config: Arc<EngineConfig>,
    decorated: Arc<DecoratedAutomaton>,
    epoch: EpochInfo,
    automaton: CancelableInvoker,
    failure_tx: mpsc::UnboundedSender<KeelError>,
  ) -> Arc<Self> {
    Arc::new(Self {
      config,
      decorated,
      epoch,
      changelog: Mutex::new(None),
      automaton,
      failure_tx,
      state: Mutex::new(FollowerState {
        recovery_active: true,
        postponed: VecDeque::new(),
        pending_apply: VecDeque::new(),
      }),
    })
  }

  pub fn epoch(&self) -> EpochInfo {
    self.epoch
  }

  pub fn current_changelog(&self) -> Result<Arc<dyn Changelog>> {
    self
      .changelog
      .lock()
      .clone()
      .ok_or_else(|| KeelError::Unavailable("follower has no open changelog yet".to_string()))
  }

  pub fn set_changelog(&self, changelog: Arc<dyn Changelog>) {
    *self.changelog.lock() = Some(changelog);
  }

  /// Accepts a replicated batch. Returns a future that completes when the
  /// last record is durably flushed locally, or `None` when the batch was
  /// postponed for recovery.
  pub fn accept_mutations(
    &self,
    start_version: Version,
    records: Vec<Vec<u8>>,
    committed_revision: u64,
  ) -> Result<Option<BoxFuture<'static, Result<()>>>> {
    {
      let mut state = self.state.lock();
      if state.recovery_active {
        tracing::debug!(
          start_version = %start_version,
          record_count = records.len(),
          "postponing mutations during recovery"
        );
        state
          .postponed
          .push_back(PostponedItem::Mutations(start_version, records));
        return Ok(None);
      }
    }

    let flush = self.log_records(start_version, records)?;
    self.advance_committed(committed_revision);
    Ok(Some(flush))
  }

  /// Logs records at `start_version`; the caller has already decided they
  /// are not postponed.
  pub fn log_records(
    &self,
    start_version: Version,
    records: Vec<Vec<u8>>,
  ) -> Result<BoxFuture<'static, Result<()>>> {
    let logged_version = self.decorated.logged_version();
    if start_version != logged_version {
      return Err(KeelError::OutOfOrderMutations {
        expected: logged_version.to_string(),
        actual: start_version.to_string(),
      });
    }

    let mut decoded = Vec::with_capacity(records.len());
    for bytes in &records {
      decoded.push(MutationRecord::deserialize(bytes)?);
    }
    for record in &decoded {
      self.decorated.accept_follower_record(record)?;
    }

    let flush = self.current_changelog()?.append(records);
    let mut state = self.state.lock();
    state.pending_apply.extend(decoded);
    Ok(flush)
  }

  /// Raises the committed watermark (bounded by what is locally logged)
  /// and schedules application of newly covered records.
  pub fn advance_committed(&self, committed_revision: u64) {
    let logged_revision = self.decorated.logged_version().revision();
    let covered = Version::from_revision(committed_revision.min(logged_revision));
    self.decorated.advance_committed_version(covered);

    let ready: Vec<MutationRecord> = {
      let mut state = self.state.lock();
      if state.recovery_active {
        return;
      }
      let committed = self.decorated.committed_version();
      let mut ready = Vec::new();
      while let Some(front) = state.pending_apply.front() {
        if front.version() < committed {
          ready.push(state.pending_apply.pop_front().expect("front exists"));
        } else {
          break;
        }
      }
      ready
    };
    if ready.is_empty() {
      return;
    }

    let decorated = Arc::clone(&self.decorated);
    let guards = Arc::clone(decorated.guards());
    let failure_tx = self.failure_tx.clone();
    self.automaton.invoke(async move {
      for record in ready {
        let Some(_guard) = guards.try_acquire_user() else {
          return;
        };
        if let Err(error) = decorated.apply_record(&record) {
          tracing::error!(%error, "follower failed to apply mutation");
          let _ = failure_tx.send(error);
          return;
        }
      }
    });
  }

  /// Executes a changelog rotation at `version`, or postpones it while
  /// recovery is in flight. Returns false when postponed.
  pub async fn rotate_changelog(
    &self,
    store: &Arc<dyn ChangelogStore>,
    version: Version,
  ) -> Result<bool> {
    {
      let mut state = self.state.lock();
      if state.recovery_active {
        tracing::debug!(version = %version, "postponing rotation during recovery");
        state.postponed.push_back(PostponedItem::Rotation(version));
        return Ok(false);
      }
    }
    self.do_rotate(store, version).await?;
    Ok(true)
  }

  pub async fn do_rotate(&self, store: &Arc<dyn ChangelogStore>, version: Version) -> Result<()> {
    let logged_version = self.decorated.logged_version();
    if version != logged_version {
      return Err(KeelError::InvalidVersion {
        expected: logged_version.to_string(),
        actual: version.to_string(),
      });
    }

    let current = self.current_changelog()?;
    current.flush().await?;
    let meta = ChangelogMeta {
      prev_record_count: current.record_count(),
    };
    current.close().await?;
    let next = store.create(version.segment_id + 1, meta).await?;
    self.set_changelog(next);
    let rotated = self.decorated.rotate_logged_version();
    tracing::info!(version = %rotated, "follower changelog rotated");
    Ok(())
  }

  pub fn is_recovery_active(&self) -> bool {
    self.state.lock().recovery_active
  }

  /// Atomically ends the postponement phase iff nothing is left queued.
  /// Returns false when another postponed item slipped in meanwhile.
  pub fn try_finish_recovery(&self) -> bool {
    let mut state = self.state.lock();
    if !state.postponed.is_empty() {
      return false;
    }
    state.recovery_active = false;
    true
  }

  /// Pops one postponed item, if any.
  pub fn take_postponed(&self) -> Option<PostponedItem> {
    self.state.lock().postponed.pop_front()
  }

  pub fn postponed_len(&self) -> usize {
    self.state.lock().postponed.len()
  }

  /// The suspension timeout guards against a rotation that never resumes.
  pub fn logging_suspension_timeout(&self) -> std::time::Duration {
    self.config.mutation_logging_suspension_timeout
  }
}
