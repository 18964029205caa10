//! Cell manager: the peer roster and quorum arithmetic.

use crate::rpc::PeerChannel;
use crate::types::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PeerConfig {
  pub peer_id: PeerId,
  pub voting: bool,
}

pub trait CellManager: Send + Sync {
  fn self_peer_id(&self) -> PeerId;
  fn total_peer_count(&self) -> usize;
  fn voting_peer_count(&self) -> usize;
  /// Majority of voting peers.
  fn quorum_peer_count(&self) -> usize;
  fn peer_config(&self, peer_id: PeerId) -> Option<PeerConfig>;
  fn peer_channel(&self, peer_id: PeerId) -> Option<Arc<dyn PeerChannel>>;
  fn peer_ids(&self) -> Vec<PeerId>;
}

/// Fixed-roster cell manager; channels are wired in after construction
/// (the transport outlives no peer).
pub struct StaticCellManager {
  self_peer_id: PeerId,
  peers: Vec<PeerConfig>,
  channels: RwLock<HashMap<PeerId, Arc<dyn PeerChannel>>>,
}

impl StaticCellManager {
  pub fn new(self_peer_id: PeerId, peers: Vec<PeerConfig>) -> Arc<Self> {
    debug_assert!(peers.iter().any(|peer| peer.peer_id == self_peer_id));
    Arc::new(Self {
      self_peer_id,
      peers,
      channels: RwLock::new(HashMap::new()),
    })
  }

  /// Convenience roster of `count` voting peers with ids `0..count`.
  pub fn uniform(self_peer_id: PeerId, count: usize) -> Arc<Self> {
    let peers = (0..count as PeerId)
      .map(|peer_id| PeerConfig {
        peer_id,
        voting: true,
      })
      .collect();
    Self::new(self_peer_id, peers)
  }

  pub fn set_peer_channel(&self, peer_id: PeerId, channel: Arc<dyn PeerChannel>) {
    self.channels.write().insert(peer_id, channel);
  }
}

impl CellManager for StaticCellManager {
  fn self_peer_id(&self) -> PeerId {
    self.self_peer_id
  }

  fn total_peer_count(&self) -> usize {
    self.peers.len()
  }

  fn voting_peer_count(&self) -> usize {
    self.peers.iter().filter(|peer| peer.voting).count()
  }

  fn quorum_peer_count(&self) -> usize {
    self.voting_peer_count() / 2 + 1
  }

  fn peer_config(&self, peer_id: PeerId) -> Option<PeerConfig> {
    self.peers.iter().find(|peer| peer.peer_id == peer_id).cloned()
  }

  fn peer_channel(&self, peer_id: PeerId) -> Option<Arc<dyn PeerChannel>> {
    self.channels.read().get(&peer_id).cloned()
  }

  fn peer_ids(&self) -> Vec<PeerId> {
    self.peers.iter().map(|peer| peer.peer_id).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn quorum_is_majority_of_voting() {
    let cell = StaticCellManager::uniform(0, 3);
    assert_eq!(cell.quorum_peer_count(), 2);

    let mixed = StaticCellManager::new(
      0,
      vec![
        PeerConfig {
          peer_id: 0,
          voting: true,
        },
        PeerConfig {
          peer_id: 1,
          voting: true,
        },
        PeerConfig {
          peer_id: 2,
          voting: true,
        },
        PeerConfig {
          peer_id: 3,
          voting: false,
        },
      ],
    );
    assert_eq!(mixed.total_peer_count(), 4);
    assert_eq!(mixed.voting_peer_count(), 3);
    assert_eq!(mixed.quorum_peer_count(), 2);
  }
}
