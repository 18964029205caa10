//! Error types for the engine.

use std::io;

pub type Result<T> = std::result::Result<T, KeelError>;

/// Errors are tagged by kind; callers dispatch on the variant, not on the
/// message. Transient kinds (`Unavailable`, `MaybeCommitted`) are retryable,
/// the rest are not.
#[derive(Debug, thiserror::Error)]
pub enum KeelError {
  /// Transient: not leader, read-only, lease lost, peer restarting.
  /// The caller should retry, possibly on another peer.
  #[error("unavailable: {0}")]
  Unavailable(String),

  /// The RPC's epoch id no longer matches the peer's current epoch.
  #[error("invalid epoch: expected {expected}, got {actual}")]
  InvalidEpoch {
    expected: uuid::Uuid,
    actual: uuid::Uuid,
  },

  /// The version implied by the RPC disagrees with the recipient's
  /// logged version.
  #[error("invalid version: expected {expected}, got {actual}")]
  InvalidVersion { expected: String, actual: String },

  /// Follower received a mutation batch with a gap.
  #[error("out-of-order mutations: expected version {expected}, got {actual}")]
  OutOfOrderMutations { expected: String, actual: String },

  /// A non-tail record failed verification. Fatal.
  #[error("broken changelog: {0}")]
  BrokenChangelog(String),

  /// A commit whose durability cannot be determined because the epoch
  /// ended mid-flight.
  #[error("commit outcome unknown: {0}")]
  MaybeCommitted(String),

  #[error("no such changelog: {0}")]
  NoSuchChangelog(u32),

  #[error("no such snapshot: {0}")]
  NoSuchSnapshot(u32),

  /// File-level I/O failure; latches the offending changelog.
  #[error("changelog I/O error: {0}")]
  ChangelogIo(String),

  /// A snapshot is older than the automaton supports.
  #[error("invalid snapshot version: snapshot {snapshot_id}, automaton segment {automaton_segment}")]
  InvalidSnapshotVersion {
    snapshot_id: u32,
    automaton_segment: u32,
  },

  #[error("read-only: {0}")]
  ReadOnly(String),

  #[error("checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
  ChecksumMismatch { stored: u64, computed: u64 },

  #[error("snapshot error: {0}")]
  Snapshot(String),

  #[error("lock failed: {0}")]
  LockFailed(String),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("serialization error: {0}")]
  Serialization(String),

  /// The owning epoch was canceled while the operation was in flight.
  #[error("canceled: {0}")]
  Canceled(String),

  #[error(transparent)]
  Io(#[from] io::Error),
}

impl KeelError {
  /// Whether the caller may safely retry the operation, possibly against
  /// another peer.
  pub fn is_retriable(&self) -> bool {
    matches!(
      self,
      KeelError::Unavailable(_) | KeelError::MaybeCommitted(_) | KeelError::InvalidEpoch { .. }
    )
  }

  /// Clones the error for fan-out to multiple waiters. I/O errors carry
  /// non-clonable sources and degrade to `ChangelogIo`.
  pub fn duplicate(&self) -> KeelError {
    match self {
      KeelError::Unavailable(message) => KeelError::Unavailable(message.clone()),
      KeelError::InvalidEpoch { expected, actual } => KeelError::InvalidEpoch {
        expected: *expected,
        actual: *actual,
      },
      KeelError::InvalidVersion { expected, actual } => KeelError::InvalidVersion {
        expected: expected.clone(),
        actual: actual.clone(),
      },
      KeelError::OutOfOrderMutations { expected, actual } => KeelError::OutOfOrderMutations {
        expected: expected.clone(),
        actual: actual.clone(),
      },
      KeelError::BrokenChangelog(message) => KeelError::BrokenChangelog(message.clone()),
      KeelError::MaybeCommitted(message) => KeelError::MaybeCommitted(message.clone()),
      KeelError::NoSuchChangelog(id) => KeelError::NoSuchChangelog(*id),
      KeelError::NoSuchSnapshot(id) => KeelError::NoSuchSnapshot(*id),
      KeelError::ChangelogIo(message) => KeelError::ChangelogIo(message.clone()),
      KeelError::InvalidSnapshotVersion {
        snapshot_id,
        automaton_segment,
      } => KeelError::InvalidSnapshotVersion {
        snapshot_id: *snapshot_id,
        automaton_segment: *automaton_segment,
      },
      KeelError::ReadOnly(message) => KeelError::ReadOnly(message.clone()),
      KeelError::ChecksumMismatch { stored, computed } => KeelError::ChecksumMismatch {
        stored: *stored,
        computed: *computed,
      },
      KeelError::Snapshot(message) => KeelError::Snapshot(message.clone()),
      KeelError::LockFailed(message) => KeelError::LockFailed(message.clone()),
      KeelError::Config(message) => KeelError::Config(message.clone()),
      KeelError::Serialization(message) => KeelError::Serialization(message.clone()),
      KeelError::Canceled(message) => KeelError::Canceled(message.clone()),
      KeelError::Io(error) => KeelError::ChangelogIo(error.to_string()),
    }
  }
}
