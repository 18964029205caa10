//! The consumed election-module contract, plus a manual in-process elector
//! for tests and demos.

use crate::types::{EpochId, PeerId, Term};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Leadership period descriptor handed out by the election module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochInfo {
  pub epoch_id: EpochId,
  pub leader_id: PeerId,
  pub term: Term,
}

/// Implemented by the engine; invoked by the election module.
pub trait ElectionCallbacks: Send + Sync {
  fn on_start_leading(&self, epoch: EpochInfo);
  fn on_stop_leading(&self);
  fn on_start_following(&self, epoch: EpochInfo);
  fn on_stop_following(&self);
  /// Election priority: the peer's reachable version revision.
  fn get_priority(&self) -> u64;
}

/// The engine's view of the election module.
pub trait Elector: Send + Sync {
  fn subscribe(&self, peer_id: PeerId, callbacks: Arc<dyn ElectionCallbacks>);
  fn current_epoch(&self) -> Option<EpochInfo>;
  /// Called by a peer that must leave the current epoch (restart path).
  /// The elector is expected to eventually start a new epoch.
  fn request_restart(&self, peer_id: PeerId);
}

/// Test/demo elector: leadership changes are driven explicitly.
#[derive(Default)]
pub struct ManualElector {
  state: Mutex<ManualElectorState>,
}

#[derive(Default)]
struct ManualElectorState {
  subscribers: HashMap<PeerId, Arc<dyn ElectionCallbacks>>,
  current: Option<EpochInfo>,
  restart_requests: Vec<PeerId>,
}

impl ManualElector {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Starts a new epoch with the given leader, stopping the previous one.
  pub fn elect(&self, leader_id: PeerId, term: Term) -> EpochInfo {
    self.step_down();
    let epoch = EpochInfo {
      epoch_id: Uuid::new_v4(),
      leader_id,
      term,
    };
    let subscribers = {
      let mut state = self.state.lock();
      state.current = Some(epoch);
      self.subscribers_locked(&state)
    };
    for (peer_id, callbacks) in subscribers {
      if peer_id == leader_id {
        callbacks.on_start_leading(epoch);
      } else {
        callbacks.on_start_following(epoch);
      }
    }
    epoch
  }

  /// Ends the current epoch without electing a successor.
  pub fn step_down(&self) {
    let (current, subscribers) = {
      let mut state = self.state.lock();
      let current = state.current.take();
      (current, self.subscribers_locked(&state))
    };
    let Some(current) = current else {
      return;
    };
    for (peer_id, callbacks) in subscribers {
      if peer_id == current.leader_id {
        callbacks.on_stop_leading();
      } else {
        callbacks.on_stop_following();
      }
    }
  }

  pub fn take_restart_requests(&self) -> Vec<PeerId> {
    std::mem::take(&mut self.state.lock().restart_requests)
  }

  fn subscribers_locked(
    &self,
    state: &ManualElectorState,
  ) -> Vec<(PeerId, Arc<dyn ElectionCallbacks>)> {
    state
      .subscribers
      .iter()
      .map(|(peer_id, callbacks)| (*peer_id, Arc::clone(callbacks)))
      .collect()
  }
}

impl Elector for ManualElector {
  fn subscribe(&self, peer_id: PeerId, callbacks: Arc<dyn ElectionCallbacks>) {
    self.state.lock().subscribers.insert(peer_id, callbacks);
  }

  fn current_epoch(&self) -> Option<EpochInfo> {
    self.state.lock().current
  }

  fn request_restart(&self, peer_id: PeerId) {
    let mut state = self.state.lock();
    tracing::debug!(peer_id, "peer requested restart");
    state.restart_requests.push(peer_id);
  }
}
