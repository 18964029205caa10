//! Snapshot file layout.
//!
//! `{header, padded meta, codec-compressed body}`. The header carries the
//! compressed/uncompressed lengths and a checksum of the compressed body;
//! both are back-patched when the writer finishes, before the tmp file is
//! renamed into place.

use crate::config::SnapshotCodec;
use crate::error::{KeelError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use prost::Message;

pub const SNAPSHOT_SIGNATURE: u64 = u64::from_le_bytes(*b"KEELSN01");
pub const SNAPSHOT_HEADER_SIZE: u64 = 44;
pub const SNAPSHOT_META_ALIGNMENT: u64 = 8;

/// Automaton state captured alongside the snapshot body; recovery seeds the
/// automaton from these fields.
#[derive(Clone, PartialEq, Message)]
pub struct SnapshotMeta {
  #[prost(int64, tag = "1")]
  pub sequence_number: i64,
  #[prost(uint64, tag = "2")]
  pub random_seed: u64,
  #[prost(uint64, tag = "3")]
  pub state_hash: u64,
  #[prost(uint64, tag = "4")]
  pub timestamp_micros: u64,
  #[prost(uint32, tag = "5")]
  pub last_segment_id: u32,
  #[prost(uint32, tag = "6")]
  pub last_record_id: u32,
  #[prost(uint32, tag = "7")]
  pub last_mutation_term: u32,
  #[prost(uint32, tag = "8")]
  pub term: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
  pub snapshot_id: u32,
  pub codec: SnapshotCodec,
  pub compressed_length: u64,
  pub uncompressed_length: u64,
  pub checksum: u64,
  pub meta_size: u32,
}

impl SnapshotHeader {
  pub fn encode(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(SNAPSHOT_HEADER_SIZE as usize);
    out.write_u64::<LittleEndian>(SNAPSHOT_SIGNATURE).unwrap();
    out.write_u32::<LittleEndian>(self.snapshot_id).unwrap();
    out.write_u32::<LittleEndian>(self.codec.id()).unwrap();
    out
      .write_u64::<LittleEndian>(self.compressed_length)
      .unwrap();
    out
      .write_u64::<LittleEndian>(self.uncompressed_length)
      .unwrap();
    out.write_u64::<LittleEndian>(self.checksum).unwrap();
    out.write_u32::<LittleEndian>(self.meta_size).unwrap();
    debug_assert_eq!(out.len() as u64, SNAPSHOT_HEADER_SIZE);
    out
  }

  pub fn decode(mut input: &[u8]) -> Result<SnapshotHeader> {
    let signature = input
      .read_u64::<LittleEndian>()
      .map_err(|_| bad("signature"))?;
    if signature != SNAPSHOT_SIGNATURE {
      return Err(KeelError::Snapshot(format!(
        "invalid snapshot signature {signature:#018x}"
      )));
    }
    let snapshot_id = input.read_u32::<LittleEndian>().map_err(|_| bad("id"))?;
    let codec_id = input.read_u32::<LittleEndian>().map_err(|_| bad("codec"))?;
    let compressed_length = input
      .read_u64::<LittleEndian>()
      .map_err(|_| bad("compressed_length"))?;
    let uncompressed_length = input
      .read_u64::<LittleEndian>()
      .map_err(|_| bad("uncompressed_length"))?;
    let checksum = input
      .read_u64::<LittleEndian>()
      .map_err(|_| bad("checksum"))?;
    let meta_size = input
      .read_u32::<LittleEndian>()
      .map_err(|_| bad("meta_size"))?;
    Ok(SnapshotHeader {
      snapshot_id,
      codec: SnapshotCodec::from_id(codec_id)?,
      compressed_length,
      uncompressed_length,
      checksum,
      meta_size,
    })
  }

  /// Offset of the compressed body within the file.
  pub fn body_offset(&self) -> u64 {
    SNAPSHOT_HEADER_SIZE
      + crate::changelog::format::align_up(u64::from(self.meta_size), SNAPSHOT_META_ALIGNMENT)
  }
}

pub fn encode_snapshot_meta(meta: &SnapshotMeta) -> Vec<u8> {
  meta.encode_to_vec()
}

pub fn decode_snapshot_meta(bytes: &[u8]) -> Result<SnapshotMeta> {
  SnapshotMeta::decode(bytes)
    .map_err(|error| KeelError::Serialization(format!("bad snapshot meta: {error}")))
}

fn bad(what: &str) -> KeelError {
  KeelError::Snapshot(format!("truncated snapshot header at {what}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_roundtrip() {
    let header = SnapshotHeader {
      snapshot_id: 12,
      codec: SnapshotCodec::Zstd,
      compressed_length: 1000,
      uncompressed_length: 4000,
      checksum: 0x1122_3344_5566_7788,
      meta_size: 33,
    };
    let decoded = SnapshotHeader::decode(&header.encode()).expect("decode");
    assert_eq!(decoded, header);
    assert_eq!(decoded.body_offset(), SNAPSHOT_HEADER_SIZE + 40);
  }

  #[test]
  fn meta_roundtrip() {
    let meta = SnapshotMeta {
      sequence_number: 99,
      random_seed: 7,
      state_hash: 8,
      timestamp_micros: 123,
      last_segment_id: 2,
      last_record_id: 50,
      last_mutation_term: 3,
      term: 4,
    };
    let decoded = decode_snapshot_meta(&encode_snapshot_meta(&meta)).expect("meta");
    assert_eq!(decoded, meta);
  }
}
