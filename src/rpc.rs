//! Logical RPC surface between peers.
//!
//! The wire transport is an external collaborator; the engine only sees
//! this service trait. Requests carry the epoch id so a recipient can
//! reject traffic from a stale leadership period.

use crate::error::Result;
use crate::types::{EpochId, MutationRequest, PeerId, PeerState, Term};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct PingFollowerRequest {
  pub epoch_id: EpochId,
  pub term: Term,
  /// The leader's logged version, as a revision.
  pub ping_revision: u64,
  pub committed_revision: u64,
  pub alive_peers: Vec<PeerId>,
}

#[derive(Debug, Clone)]
pub struct PingFollowerResponse {
  pub state: PeerState,
  /// Sampled `(sequence_number, state_hash)` pairs for the determinism
  /// audit.
  pub state_hash_samples: Vec<(i64, u64)>,
}

#[derive(Debug, Clone)]
pub struct AcceptMutationsRequest {
  pub epoch_id: EpochId,
  pub term: Term,
  /// Version of the first record in the batch, as a revision.
  pub start_revision: u64,
  pub committed_revision: u64,
  pub alive_peers: Vec<PeerId>,
  /// Serialized mutation records.
  pub records: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct AcceptMutationsResponse {
  /// True only when the records are durably flushed at the follower.
  pub logged: bool,
  pub state: PeerState,
}

#[derive(Debug, Clone)]
pub struct LookupChangelogResponse {
  pub record_count: u32,
}

#[derive(Debug, Clone)]
pub struct ReadChangelogRequest {
  pub changelog_id: u32,
  pub first_record_id: u32,
  pub max_records: u32,
  pub max_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ReadChangelogResponse {
  pub records: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct BuildSnapshotRequest {
  pub epoch_id: EpochId,
  pub snapshot_id: u32,
  /// Sequence number the snapshot must capture.
  pub sequence_number: i64,
}

#[derive(Debug, Clone)]
pub struct BuildSnapshotResponse {
  pub checksum: u64,
}

#[derive(Debug, Clone)]
pub struct RotateChangelogRequest {
  pub epoch_id: EpochId,
  /// The logged version at which logging was suspended, as a revision.
  pub revision: u64,
}

#[derive(Debug, Clone)]
pub struct SyncWithLeaderResponse {
  pub committed_revision: u64,
}

/// One peer as seen from another: the consumed half of the RPC contract.
#[async_trait]
pub trait PeerChannel: Send + Sync {
  async fn ping_follower(&self, request: PingFollowerRequest) -> Result<PingFollowerResponse>;
  async fn accept_mutations(
    &self,
    request: AcceptMutationsRequest,
  ) -> Result<AcceptMutationsResponse>;
  async fn lookup_changelog(&self, changelog_id: u32) -> Result<LookupChangelogResponse>;
  async fn read_changelog(&self, request: ReadChangelogRequest) -> Result<ReadChangelogResponse>;
  async fn build_snapshot(&self, request: BuildSnapshotRequest) -> Result<BuildSnapshotResponse>;
  async fn rotate_changelog(&self, request: RotateChangelogRequest) -> Result<()>;
  async fn sync_with_leader(&self, epoch_id: EpochId) -> Result<SyncWithLeaderResponse>;
  async fn commit_mutation(&self, request: MutationRequest) -> Result<Vec<u8>>;
}
