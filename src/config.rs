//! Engine configuration.

use crate::error::{KeelError, Result};
use serde::Deserialize;
use std::time::Duration;

fn duration_ms(ms: u64) -> Duration {
  Duration::from_millis(ms)
}

fn duration_s(s: u64) -> Duration {
  Duration::from_secs(s)
}

/// Changelog file I/O tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChangelogConfig {
  /// Minimum data bytes between consecutive sparse index entries.
  pub index_block_size: u64,
  /// When unflushed data exceeds this value, an automatic flush is
  /// performed.
  pub data_flush_size: u64,
  /// Interval between consequent automatic flushes. Zero means every
  /// append flushes synchronously.
  #[serde(with = "millis")]
  pub flush_period: Duration,
  /// When false, no fdatasync calls are made. Tests and local mode only.
  pub enable_sync: bool,
  /// If set, grows the data file ahead of the write cursor in increments
  /// of this size.
  pub preallocate_size: Option<u64>,
  pub io_class: i32,
  pub io_priority: i32,
  /// Dispatcher wake-up period.
  #[serde(with = "millis")]
  pub flush_quantum: Duration,
}

impl Default for ChangelogConfig {
  fn default() -> Self {
    Self {
      index_block_size: 1024 * 1024,
      data_flush_size: 16 * 1024 * 1024,
      flush_period: duration_ms(10),
      enable_sync: true,
      preallocate_size: None,
      io_class: 1,
      io_priority: 3,
      flush_quantum: duration_ms(10),
    }
  }
}

/// Snapshot store tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
  /// Codec used to compress snapshot bodies.
  pub codec: SnapshotCodec,
  /// How many old snapshots (and the changelogs they obsolete) the janitor
  /// retains.
  pub max_snapshot_count_to_keep: usize,
}

impl Default for SnapshotConfig {
  fn default() -> Self {
    Self {
      codec: SnapshotCodec::Zstd,
      max_snapshot_count_to_keep: 3,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotCodec {
  None,
  Zstd,
  Deflate,
}

impl SnapshotCodec {
  pub fn id(self) -> u32 {
    match self {
      SnapshotCodec::None => 0,
      SnapshotCodec::Zstd => 1,
      SnapshotCodec::Deflate => 2,
    }
  }

  pub fn from_id(id: u32) -> Result<SnapshotCodec> {
    match id {
      0 => Ok(SnapshotCodec::None),
      1 => Ok(SnapshotCodec::Zstd),
      2 => Ok(SnapshotCodec::Deflate),
      other => Err(KeelError::Snapshot(format!("unknown codec id {other}"))),
    }
  }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub changelog: ChangelogConfig,
  pub snapshot: SnapshotConfig,

  /// Timeout for various control RPC requests.
  #[serde(with = "millis")]
  pub control_rpc_timeout: Duration,

  // Leader lease.
  #[serde(with = "millis")]
  pub leader_lease_check_period: Duration,
  #[serde(with = "millis")]
  pub leader_lease_timeout: Duration,
  #[serde(with = "millis")]
  pub leader_lease_grace_delay: Duration,
  /// For tests only.
  pub disable_leader_lease_grace_delay: bool,

  // Commit batching.
  #[serde(with = "millis")]
  pub max_commit_batch_duration: Duration,
  #[serde(with = "millis", alias = "max_commmit_batch_delay")]
  pub max_commit_batch_delay: Duration,
  pub max_commit_batch_record_count: usize,
  pub max_in_flight_accept_mutations_request_count: usize,

  #[serde(with = "millis")]
  pub commit_flush_rpc_timeout: Duration,
  #[serde(with = "millis")]
  pub commit_forwarding_rpc_timeout: Duration,

  // Checkpointing.
  #[serde(with = "millis")]
  pub snapshot_build_timeout: Duration,
  #[serde(with = "millis")]
  pub snapshot_fork_timeout: Duration,
  #[serde(with = "millis")]
  pub snapshot_build_period: Duration,
  #[serde(with = "millis")]
  pub snapshot_build_splay: Duration,
  pub max_changelog_record_count: u32,
  pub max_changelog_data_size: u64,
  /// Whether the leader asks followers to build snapshots at rotation.
  pub build_snapshots_at_followers: bool,

  // Recovery.
  #[serde(with = "millis")]
  pub changelog_download_rpc_timeout: Duration,
  pub max_changelog_bytes_per_request: u64,
  pub max_changelog_records_per_request: u32,
  #[serde(with = "millis")]
  pub snapshot_download_rpc_timeout: Duration,
  pub snapshot_download_block_size: u64,

  // Determinism audit.
  pub enable_state_hash_checker: bool,
  pub max_state_hash_checker_entry_count: usize,
  pub state_hash_checker_mutation_verification_sampling_rate: i64,

  // Heartbeats.
  #[serde(with = "millis")]
  pub heartbeat_mutation_period: Duration,
  #[serde(with = "millis")]
  pub heartbeat_mutation_timeout: Duration,

  #[serde(with = "millis")]
  pub leader_sync_delay: Duration,
  #[serde(with = "millis")]
  pub restart_backoff_time: Duration,
  #[serde(with = "millis")]
  pub mutation_logging_suspension_timeout: Duration,
  /// Time to sleep before building a snapshot. For tests only.
  #[serde(with = "millis")]
  pub build_snapshot_delay: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      changelog: ChangelogConfig::default(),
      snapshot: SnapshotConfig::default(),
      control_rpc_timeout: duration_ms(1000),
      leader_lease_check_period: duration_s(2),
      leader_lease_timeout: duration_s(5),
      leader_lease_grace_delay: duration_s(6),
      disable_leader_lease_grace_delay: false,
      max_commit_batch_duration: duration_ms(100),
      max_commit_batch_delay: duration_ms(10),
      max_commit_batch_record_count: 10_000,
      max_in_flight_accept_mutations_request_count: 16,
      commit_flush_rpc_timeout: duration_s(15),
      commit_forwarding_rpc_timeout: duration_s(30),
      snapshot_build_timeout: duration_s(300),
      snapshot_fork_timeout: duration_s(120),
      snapshot_build_period: duration_s(3600),
      snapshot_build_splay: duration_s(0),
      max_changelog_record_count: 1_000_000,
      max_changelog_data_size: 1024 * 1024 * 1024,
      build_snapshots_at_followers: true,
      changelog_download_rpc_timeout: duration_s(10),
      max_changelog_bytes_per_request: 128 * 1024 * 1024,
      max_changelog_records_per_request: 64 * 1024,
      snapshot_download_rpc_timeout: duration_s(10),
      snapshot_download_block_size: 32 * 1024 * 1024,
      enable_state_hash_checker: true,
      max_state_hash_checker_entry_count: 1000,
      state_hash_checker_mutation_verification_sampling_rate: 100,
      heartbeat_mutation_period: duration_s(60),
      heartbeat_mutation_timeout: duration_s(60),
      leader_sync_delay: duration_ms(10),
      restart_backoff_time: duration_s(5),
      mutation_logging_suspension_timeout: duration_s(60),
      build_snapshot_delay: duration_ms(0),
    }
  }
}

impl EngineConfig {
  pub fn validate(&self) -> Result<()> {
    if !self.disable_leader_lease_grace_delay
      && self.leader_lease_grace_delay <= self.leader_lease_timeout
    {
      return Err(KeelError::Config(
        "leader_lease_grace_delay must be larger than leader_lease_timeout".to_string(),
      ));
    }
    if self.max_changelog_record_count == 0 {
      return Err(KeelError::Config(
        "max_changelog_record_count must be positive".to_string(),
      ));
    }
    if self.max_changelog_data_size == 0 {
      return Err(KeelError::Config(
        "max_changelog_data_size must be positive".to_string(),
      ));
    }
    if self.max_changelog_records_per_request == 0 {
      return Err(KeelError::Config(
        "max_changelog_records_per_request must be positive".to_string(),
      ));
    }
    if self.changelog.index_block_size == 0 {
      return Err(KeelError::Config(
        "index_block_size must be positive".to_string(),
      ));
    }
    Ok(())
  }

  /// A configuration suitable for fast in-process tests: sync disabled,
  /// tiny timeouts, no grace delay.
  pub fn for_tests() -> Self {
    let mut config = Self::default();
    config.changelog.enable_sync = false;
    config.changelog.flush_period = Duration::ZERO;
    config.leader_lease_check_period = duration_ms(50);
    config.leader_lease_timeout = duration_ms(500);
    config.disable_leader_lease_grace_delay = true;
    config.max_commit_batch_delay = duration_ms(1);
    config.restart_backoff_time = duration_ms(10);
    config.heartbeat_mutation_period = duration_s(3600);
    config
  }
}

mod millis {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_is_valid() {
    EngineConfig::default().validate().expect("valid");
  }

  #[test]
  fn grace_delay_must_exceed_lease_timeout() {
    let mut config = EngineConfig::default();
    config.leader_lease_grace_delay = config.leader_lease_timeout;
    assert!(config.validate().is_err());

    config.disable_leader_lease_grace_delay = true;
    config.validate().expect("valid with grace disabled");
  }

  #[test]
  fn legacy_misspelled_batch_delay_key_is_accepted() {
    let config: EngineConfig =
      serde_json::from_str(r#"{"max_commmit_batch_delay": 77}"#).expect("parse");
    assert_eq!(config.max_commit_batch_delay, Duration::from_millis(77));
  }
}
