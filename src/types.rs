//! Core identifiers and the mutation data model.

use crate::error::{KeelError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Read;
use uuid::Uuid;

pub type PeerId = u32;
pub type EpochId = Uuid;
pub type Term = u32;

/// Code-level compatibility tag carried by every mutation; gates recovery
/// action selection.
pub type Reign = u32;

/// Position of a mutation in the changelog: `(segment, record)`, totally
/// ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
  pub segment_id: u32,
  pub record_id: u32,
}

impl Version {
  pub fn new(segment_id: u32, record_id: u32) -> Self {
    Self {
      segment_id,
      record_id,
    }
  }

  /// Next record in the same segment.
  pub fn advance(self) -> Version {
    Version {
      segment_id: self.segment_id,
      record_id: self.record_id + 1,
    }
  }

  /// First record of the next segment.
  pub fn rotate(self) -> Version {
    Version {
      segment_id: self.segment_id + 1,
      record_id: 0,
    }
  }

  /// Single 64-bit wire encoding: `segment * 2^32 + record`.
  pub fn revision(self) -> u64 {
    (u64::from(self.segment_id) << 32) | u64::from(self.record_id)
  }

  pub fn from_revision(revision: u64) -> Version {
    Version {
      segment_id: (revision >> 32) as u32,
      record_id: revision as u32,
    }
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.segment_id, self.record_id)
  }
}

/// Lifecycle state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
  Stopped,
  LeaderRecovery,
  Leading,
  FollowerRecovery,
  Following,
}

impl PeerState {
  pub fn is_active(self) -> bool {
    matches!(self, PeerState::Leading | PeerState::Following)
  }
}

impl fmt::Display for PeerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      PeerState::Stopped => "stopped",
      PeerState::LeaderRecovery => "leader_recovery",
      PeerState::Leading => "leading",
      PeerState::FollowerRecovery => "follower_recovery",
      PeerState::Following => "following",
    };
    f.write_str(name)
  }
}

/// A client request to execute one deterministic step against the automaton.
#[derive(Debug, Clone)]
pub struct MutationRequest {
  pub reign: Reign,
  pub mutation_type: String,
  pub data: Vec<u8>,
  /// Identity for response-keeper deduplication; anonymous when absent.
  pub mutation_id: Option<Uuid>,
  pub retry: bool,
  pub allow_leader_forwarding: bool,
}

impl MutationRequest {
  pub fn new(mutation_type: impl Into<String>, data: Vec<u8>) -> Self {
    Self {
      reign: 0,
      mutation_type: mutation_type.into(),
      data,
      mutation_id: None,
      retry: false,
      allow_leader_forwarding: false,
    }
  }

  pub fn with_id(mut self, mutation_id: Uuid) -> Self {
    self.mutation_id = Some(mutation_id);
    self
  }

  pub fn with_reign(mut self, reign: Reign) -> Self {
    self.reign = reign;
    self
  }

  pub fn with_retry(mut self, retry: bool) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_forwarding(mut self) -> Self {
    self.allow_leader_forwarding = true;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResponse {
  pub data: Vec<u8>,
}

/// On-log representation of one ordered mutation: a fixed header, the
/// mutation type string, then the request payload. The changelog adds its
/// own framing around the serialized whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecordHeader {
  pub reign: Reign,
  pub mutation_id: Option<Uuid>,
  pub timestamp_micros: u64,
  pub random_seed: u64,
  pub prev_random_seed: u64,
  pub sequence_number: i64,
  pub term: Term,
  pub segment_id: u32,
  pub record_id: u32,
}

impl MutationRecordHeader {
  pub fn version(&self) -> Version {
    Version::new(self.segment_id, self.record_id)
  }
}

/// A fully serialized, versioned mutation as shipped between peers and
/// stored in the changelog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
  pub header: MutationRecordHeader,
  pub mutation_type: String,
  pub data: Vec<u8>,
}

const RECORD_NIL_UUID: [u8; 16] = [0u8; 16];

impl MutationRecord {
  pub fn version(&self) -> Version {
    self.header.version()
  }

  pub fn serialize(&self) -> Vec<u8> {
    let type_bytes = self.mutation_type.as_bytes();
    let mut out = Vec::with_capacity(64 + type_bytes.len() + self.data.len());
    out.write_u32::<LittleEndian>(self.header.reign).unwrap();
    match self.header.mutation_id {
      Some(id) => out.extend_from_slice(id.as_bytes()),
      None => out.extend_from_slice(&RECORD_NIL_UUID),
    }
    out
      .write_u64::<LittleEndian>(self.header.timestamp_micros)
      .unwrap();
    out
      .write_u64::<LittleEndian>(self.header.random_seed)
      .unwrap();
    out
      .write_u64::<LittleEndian>(self.header.prev_random_seed)
      .unwrap();
    out
      .write_i64::<LittleEndian>(self.header.sequence_number)
      .unwrap();
    out.write_u32::<LittleEndian>(self.header.term).unwrap();
    out
      .write_u32::<LittleEndian>(self.header.segment_id)
      .unwrap();
    out
      .write_u32::<LittleEndian>(self.header.record_id)
      .unwrap();
    out
      .write_u32::<LittleEndian>(type_bytes.len() as u32)
      .unwrap();
    out
      .write_u32::<LittleEndian>(self.data.len() as u32)
      .unwrap();
    out.extend_from_slice(type_bytes);
    out.extend_from_slice(&self.data);
    out
  }

  pub fn deserialize(bytes: &[u8]) -> Result<MutationRecord> {
    let mut input = bytes;
    let reign = read_u32(&mut input)?;
    let mut id_bytes = [0u8; 16];
    input
      .read_exact(&mut id_bytes)
      .map_err(|_| truncated("mutation_id"))?;
    let mutation_id = if id_bytes == RECORD_NIL_UUID {
      None
    } else {
      Some(Uuid::from_bytes(id_bytes))
    };
    let timestamp_micros = read_u64(&mut input)?;
    let random_seed = read_u64(&mut input)?;
    let prev_random_seed = read_u64(&mut input)?;
    let sequence_number = input
      .read_i64::<LittleEndian>()
      .map_err(|_| truncated("sequence_number"))?;
    let term = read_u32(&mut input)?;
    let segment_id = read_u32(&mut input)?;
    let record_id = read_u32(&mut input)?;
    let type_len = read_u32(&mut input)? as usize;
    let data_len = read_u32(&mut input)? as usize;
    if input.len() != type_len + data_len {
      return Err(KeelError::Serialization(format!(
        "mutation record length mismatch: {} trailing bytes, expected {}",
        input.len(),
        type_len + data_len
      )));
    }
    let mutation_type = String::from_utf8(input[..type_len].to_vec())
      .map_err(|_| KeelError::Serialization("mutation type is not UTF-8".to_string()))?;
    let data = input[type_len..].to_vec();

    Ok(MutationRecord {
      header: MutationRecordHeader {
        reign,
        mutation_id,
        timestamp_micros,
        random_seed,
        prev_random_seed,
        sequence_number,
        term,
        segment_id,
        record_id,
      },
      mutation_type,
      data,
    })
  }
}

/// What the user automaton wants done when it encounters mutations logged
/// under an older reign during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
  None,
  BuildSnapshotAndRestart,
}

fn read_u32(input: &mut &[u8]) -> Result<u32> {
  input
    .read_u32::<LittleEndian>()
    .map_err(|_| truncated("u32 field"))
}

fn read_u64(input: &mut &[u8]) -> Result<u64> {
  input
    .read_u64::<LittleEndian>()
    .map_err(|_| truncated("u64 field"))
}

fn truncated(field: &str) -> KeelError {
  KeelError::Serialization(format!("truncated mutation record while reading {field}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn version_order_and_revision_roundtrip() {
    let a = Version::new(1, 7);
    let b = Version::new(2, 0);
    assert!(a < b);
    assert!(a.advance() < b);
    assert_eq!(a.rotate(), Version::new(2, 0));
    assert_eq!(Version::from_revision(a.revision()), a);
    assert_eq!(a.revision(), (1u64 << 32) | 7);
  }

  #[test]
  fn mutation_record_roundtrip() {
    let record = MutationRecord {
      header: MutationRecordHeader {
        reign: 3,
        mutation_id: Some(Uuid::new_v4()),
        timestamp_micros: 1_700_000_000_000_000,
        random_seed: 0xDEAD_BEEF_CAFE_F00D,
        prev_random_seed: 42,
        sequence_number: 99,
        term: 5,
        segment_id: 2,
        record_id: 17,
      },
      mutation_type: "set".to_string(),
      data: vec![1, 2, 3],
    };

    let bytes = record.serialize();
    let decoded = MutationRecord::deserialize(&bytes).expect("deserialize");
    assert_eq!(decoded, record);
  }

  #[test]
  fn mutation_record_rejects_trailing_garbage() {
    let record = MutationRecord {
      header: MutationRecordHeader {
        reign: 0,
        mutation_id: None,
        timestamp_micros: 0,
        random_seed: 0,
        prev_random_seed: 0,
        sequence_number: 0,
        term: 0,
        segment_id: 0,
        record_id: 0,
      },
      mutation_type: "noop".to_string(),
      data: vec![],
    };

    let mut bytes = record.serialize();
    bytes.push(0xFF);
    assert!(MutationRecord::deserialize(&bytes).is_err());
  }
}
