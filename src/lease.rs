//! Leader lease: the time-bounded, quorum-granted right to serve.

use crate::automaton::checker::HashReport;
use crate::automaton::DecoratedAutomaton;
use crate::cell::CellManager;
use crate::config::EngineConfig;
use crate::election::EpochInfo;
use crate::error::KeelError;
use crate::rpc::PingFollowerRequest;
use crate::runtime::CancelableInvoker;
use crate::types::{PeerId, PeerState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

const NOT_ACQUIRED: u64 = 0;
const ABANDONED: u64 = 1;

/// Cheap atomic lease deadline; `is_valid` is a single load plus a clock
/// read.
pub struct LeaderLease {
  base: Instant,
  /// Deadline in microseconds since `base`; sentinels above.
  deadline: AtomicU64,
}

impl LeaderLease {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      base: Instant::now(),
      deadline: AtomicU64::new(NOT_ACQUIRED),
    })
  }

  fn now_micros(&self) -> u64 {
    self.base.elapsed().as_micros() as u64
  }

  pub fn is_valid(&self) -> bool {
    let deadline = self.deadline.load(Ordering::Acquire);
    deadline > ABANDONED && self.now_micros() < deadline
  }

  pub fn restart(&self) {
    self.deadline.store(NOT_ACQUIRED, Ordering::Release);
  }

  fn extend(&self, deadline_micros: u64) {
    let current = self.deadline.load(Ordering::Acquire);
    if current == ABANDONED {
      return;
    }
    self.deadline.fetch_max(deadline_micros, Ordering::AcqRel);
  }

  /// Voluntarily gives the lease up (leader switch); fails when already
  /// expired.
  pub fn try_abandon(&self) -> bool {
    if !self.is_valid() {
      return false;
    }
    self.deadline.store(ABANDONED, Ordering::Release);
    true
  }
}

/// Periodically pings followers and extends the leader's lease while a
/// quorum of voting peers keeps following.
pub struct LeaseTracker {
  config: Arc<EngineConfig>,
  cell: Arc<dyn CellManager>,
  decorated: Arc<DecoratedAutomaton>,
  epoch: EpochInfo,
  lease: Arc<LeaderLease>,
  alive_peers: Mutex<Vec<PeerId>>,
  acquired_tx: watch::Sender<bool>,
  acquired_rx: watch::Receiver<bool>,
  failure_tx: mpsc::UnboundedSender<KeelError>,
}

impl LeaseTracker {
  pub fn new(
    config: Arc<EngineConfig>,
    cell: Arc<dyn CellManager>,
    decorated: Arc<DecoratedAutomaton>,
    epoch: EpochInfo,
    lease: Arc<LeaderLease>,
    failure_tx: mpsc::UnboundedSender<KeelError>,
  ) -> Arc<Self> {
    let (acquired_tx, acquired_rx) = watch::channel(false);
    Arc::new(Self {
      config,
      cell,
      decorated,
      epoch,
      lease,
      alive_peers: Mutex::new(Vec::new()),
      acquired_tx,
      acquired_rx,
      failure_tx,
    })
  }

  pub fn lease(&self) -> &Arc<LeaderLease> {
    &self.lease
  }

  /// Resolves once the first quorum of pings has succeeded.
  pub async fn wait_for_lease(&self) {
    let mut acquired = self.acquired_rx.clone();
    while !*acquired.borrow() {
      if acquired.changed().await.is_err() {
        return;
      }
    }
  }

  /// Spawns the periodic ping loop under the epoch's control context.
  pub fn start(self: &Arc<Self>, control: &CancelableInvoker) {
    let tracker = Arc::clone(self);
    let check_period = self.config.leader_lease_check_period;
    control.spawn(async move {
      let mut ticker = tokio::time::interval(check_period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        if !tracker.tick().await {
          return;
        }
      }
    });
  }

  /// One lease check round. Returns false when the lease was lost.
  async fn tick(self: &Arc<Self>) -> bool {
    let wall_start = self.lease.now_micros();
    let ping_revision = self.decorated.logged_version().revision();
    let committed_revision = self.decorated.committed_version().revision();
    let alive_peers = self.alive_peers.lock().clone();
    let timeout = self.config.leader_lease_timeout;
    let self_id = self.cell.self_peer_id();

    let mut pings = Vec::new();
    for peer_id in self.cell.peer_ids() {
      if peer_id == self_id {
        continue;
      }
      let Some(channel) = self.cell.peer_channel(peer_id) else {
        continue;
      };
      let request = PingFollowerRequest {
        epoch_id: self.epoch.epoch_id,
        term: self.epoch.term,
        ping_revision,
        committed_revision,
        alive_peers: alive_peers.clone(),
      };
      pings.push(async move {
        let response = tokio::time::timeout(timeout, channel.ping_follower(request)).await;
        (peer_id, response)
      });
    }

    // Count self as one success; voting followers that answer `following`
    // count too. Non-voting peers are pinged but never counted.
    let mut success_count = 1usize;
    let mut alive = vec![self_id];
    for (peer_id, response) in futures::future::join_all(pings).await {
      let voting = self
        .cell
        .peer_config(peer_id)
        .map(|peer| peer.voting)
        .unwrap_or(false);
      match response {
        Ok(Ok(reply)) => {
          alive.push(peer_id);
          for (sequence_number, state_hash) in reply.state_hash_samples {
            self.audit_follower_hash(peer_id, sequence_number, state_hash);
          }
          if voting && reply.state == PeerState::Following {
            success_count += 1;
          } else {
            tracing::debug!(peer_id, state = %reply.state, "follower not counted for lease");
          }
        }
        Ok(Err(error)) => {
          tracing::debug!(peer_id, %error, "follower ping failed");
        }
        Err(_) => {
          tracing::debug!(peer_id, "follower ping timed out");
        }
      }
    }
    *self.alive_peers.lock() = alive;

    if success_count >= self.cell.quorum_peer_count() {
      self
        .lease
        .extend(wall_start + timeout.as_micros() as u64);
      let _ = self.acquired_tx.send(true);
      true
    } else {
      tracing::warn!(
        success_count,
        quorum = self.cell.quorum_peer_count(),
        "leader lease lost"
      );
      let _ = self.failure_tx.send(KeelError::Unavailable(
        "leader lease lost: ping quorum failed".to_string(),
      ));
      false
    }
  }

  fn audit_follower_hash(&self, peer_id: PeerId, sequence_number: i64, state_hash: u64) {
    match self
      .decorated
      .state_hash_checker()
      .report(sequence_number, state_hash)
    {
      HashReport::Match | HashReport::Recorded => {}
      HashReport::Divergence { recorded, reported } => {
        panic!(
          "state hash divergence against follower {peer_id} at sequence \
           {sequence_number}: {recorded:#018x} != {reported:#018x}"
        );
      }
    }
  }

  pub fn alive_peers(&self) -> Vec<PeerId> {
    self.alive_peers.lock().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn lease_validity_follows_deadline() {
    let lease = LeaderLease::new();
    assert!(!lease.is_valid());
    lease.extend(lease.now_micros() + Duration::from_secs(60).as_micros() as u64);
    assert!(lease.is_valid());
    lease.restart();
    assert!(!lease.is_valid());
  }

  #[test]
  fn abandoned_lease_stays_invalid() {
    let lease = LeaderLease::new();
    lease.extend(lease.now_micros() + 1_000_000_000);
    assert!(lease.try_abandon());
    assert!(!lease.is_valid());
    // Extensions after abandonment are ignored.
    lease.extend(lease.now_micros() + 1_000_000_000);
    assert!(!lease.is_valid());
  }

  #[test]
  fn expired_lease_cannot_be_abandoned() {
    let lease = LeaderLease::new();
    assert!(!lease.try_abandon());
  }
}
