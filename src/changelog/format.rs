//! On-disk layout of changelog segment files.
//!
//! A segment is a fixed header, an opaque metadata blob, zero padding up to
//! an aligned first-record offset, then a run of records. Each record is a
//! fixed record header, the payload padded to the serialization alignment,
//! and `padding_size` extra zero bytes; the final record of an appended
//! batch carries enough extra padding to land the batch end on a
//! `CHANGELOG_ALIGNMENT` boundary.
//!
//! Two layout generations exist. The v5 layout adds a per-segment uuid to
//! both headers so records torn from another incarnation of the same file
//! are detected. Readers accept both; writers emit v5.

use crate::error::{KeelError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use prost::Message;
use uuid::Uuid;

pub const CHANGELOG_ALIGNMENT: u64 = 4096;
pub const SERIALIZATION_ALIGNMENT: u64 = 8;

pub const SEGMENT_SIGNATURE_V4: u64 = u64::from_le_bytes(*b"KEELOG04");
pub const SEGMENT_SIGNATURE_V5: u64 = u64::from_le_bytes(*b"KEELOG05");

/// Sentinel stored in the header while the segment has never been
/// truncated.
pub const NOT_TRUNCATED: i32 = -1;

pub const FILE_HEADER_SIZE_V4: u64 = 28;
pub const FILE_HEADER_SIZE_V5: u64 = FILE_HEADER_SIZE_V4 + 16;

pub const RECORD_HEADER_SIZE_V4: u64 = 18;
pub const RECORD_HEADER_SIZE_V5: u64 = RECORD_HEADER_SIZE_V4 + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFormat {
  V4,
  V5,
}

impl SegmentFormat {
  pub fn file_header_size(self) -> u64 {
    match self {
      SegmentFormat::V4 => FILE_HEADER_SIZE_V4,
      SegmentFormat::V5 => FILE_HEADER_SIZE_V5,
    }
  }

  pub fn record_header_size(self) -> u64 {
    match self {
      SegmentFormat::V4 => RECORD_HEADER_SIZE_V4,
      SegmentFormat::V5 => RECORD_HEADER_SIZE_V5,
    }
  }

  /// Record header size as written, padded to the serialization alignment.
  pub fn padded_record_header_size(self) -> u64 {
    align_up(self.record_header_size(), SERIALIZATION_ALIGNMENT)
  }

  pub fn signature(self) -> u64 {
    match self {
      SegmentFormat::V4 => SEGMENT_SIGNATURE_V4,
      SegmentFormat::V5 => SEGMENT_SIGNATURE_V5,
    }
  }

  pub fn from_signature(signature: u64) -> Result<SegmentFormat> {
    match signature {
      SEGMENT_SIGNATURE_V4 => Ok(SegmentFormat::V4),
      SEGMENT_SIGNATURE_V5 => Ok(SegmentFormat::V5),
      other => Err(KeelError::BrokenChangelog(format!(
        "invalid segment signature {other:#018x}"
      ))),
    }
  }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
  (value + alignment - 1) / alignment * alignment
}

/// Opaque per-segment metadata persisted in the file header.
#[derive(Clone, PartialEq, Message)]
pub struct ChangelogMeta {
  /// Record count of the previous segment at rotation time; zero for the
  /// first segment.
  #[prost(uint32, tag = "1")]
  pub prev_record_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
  pub format: SegmentFormat,
  pub meta_size: u32,
  pub first_record_offset: u64,
  pub truncated_record_count: Option<u32>,
  pub padding_size: u32,
  pub uuid: Option<Uuid>,
}

impl SegmentHeader {
  /// Lays out a fresh header for the given metadata blob.
  pub fn new(format: SegmentFormat, meta_size: u32, uuid: Option<Uuid>) -> SegmentHeader {
    let header_size = format.file_header_size();
    let first_record_offset = align_up(header_size + u64::from(meta_size), CHANGELOG_ALIGNMENT);
    let padding_size = (first_record_offset - header_size - u64::from(meta_size)) as u32;
    SegmentHeader {
      format,
      meta_size,
      first_record_offset,
      truncated_record_count: None,
      padding_size,
      uuid,
    }
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(self.format.file_header_size() as usize);
    out.write_u64::<LittleEndian>(self.format.signature()).unwrap();
    out.write_u32::<LittleEndian>(self.meta_size).unwrap();
    out
      .write_u64::<LittleEndian>(self.first_record_offset)
      .unwrap();
    let truncated = match self.truncated_record_count {
      Some(count) => count as i32,
      None => NOT_TRUNCATED,
    };
    out.write_i32::<LittleEndian>(truncated).unwrap();
    out.write_u32::<LittleEndian>(self.padding_size).unwrap();
    if self.format == SegmentFormat::V5 {
      out.extend_from_slice(self.uuid.expect("v5 header carries a uuid").as_bytes());
    }
    debug_assert_eq!(out.len() as u64, self.format.file_header_size());
    out
  }

  pub fn decode(mut input: &[u8]) -> Result<SegmentHeader> {
    let signature = input
      .read_u64::<LittleEndian>()
      .map_err(|_| broken("segment header signature"))?;
    let format = SegmentFormat::from_signature(signature)?;
    let meta_size = input
      .read_u32::<LittleEndian>()
      .map_err(|_| broken("segment header meta_size"))?;
    let first_record_offset = input
      .read_u64::<LittleEndian>()
      .map_err(|_| broken("segment header first_record_offset"))?;
    let truncated = input
      .read_i32::<LittleEndian>()
      .map_err(|_| broken("segment header truncated_record_count"))?;
    let padding_size = input
      .read_u32::<LittleEndian>()
      .map_err(|_| broken("segment header padding_size"))?;
    let uuid = match format {
      SegmentFormat::V4 => None,
      SegmentFormat::V5 => {
        let mut bytes = [0u8; 16];
        if input.len() < 16 {
          return Err(broken("segment header uuid"));
        }
        bytes.copy_from_slice(&input[..16]);
        Some(Uuid::from_bytes(bytes))
      }
    };
    let truncated_record_count = if truncated == NOT_TRUNCATED {
      None
    } else if truncated >= 0 {
      Some(truncated as u32)
    } else {
      return Err(KeelError::BrokenChangelog(format!(
        "negative truncated_record_count {truncated}"
      )));
    };
    Ok(SegmentHeader {
      format,
      meta_size,
      first_record_offset,
      truncated_record_count,
      padding_size,
      uuid,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
  pub record_id: u32,
  pub data_size: u32,
  pub checksum: u64,
  pub padding_size: u16,
  pub changelog_uuid: Option<Uuid>,
}

impl RecordHeader {
  /// Writes the header padded to the serialization alignment.
  pub fn encode_into(&self, format: SegmentFormat, out: &mut Vec<u8>) {
    let start = out.len();
    out.write_u32::<LittleEndian>(self.record_id).unwrap();
    out.write_u32::<LittleEndian>(self.data_size).unwrap();
    out.write_u64::<LittleEndian>(self.checksum).unwrap();
    out.write_u16::<LittleEndian>(self.padding_size).unwrap();
    if format == SegmentFormat::V5 {
      out.extend_from_slice(
        self
          .changelog_uuid
          .expect("v5 record header carries a uuid")
          .as_bytes(),
      );
    }
    let written = (out.len() - start) as u64;
    debug_assert_eq!(written, format.record_header_size());
    let padded = align_up(written, SERIALIZATION_ALIGNMENT);
    out.resize(start + padded as usize, 0);
  }

  pub fn decode(format: SegmentFormat, mut input: &[u8]) -> Result<RecordHeader> {
    let record_id = input
      .read_u32::<LittleEndian>()
      .map_err(|_| broken("record header record_id"))?;
    let data_size = input
      .read_u32::<LittleEndian>()
      .map_err(|_| broken("record header data_size"))?;
    let checksum = input
      .read_u64::<LittleEndian>()
      .map_err(|_| broken("record header checksum"))?;
    let padding_size = input
      .read_u16::<LittleEndian>()
      .map_err(|_| broken("record header padding_size"))?;
    let changelog_uuid = match format {
      SegmentFormat::V4 => None,
      SegmentFormat::V5 => {
        if input.len() < 16 {
          return Err(broken("record header uuid"));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&input[..16]);
        Some(Uuid::from_bytes(bytes))
      }
    };
    Ok(RecordHeader {
      record_id,
      data_size,
      checksum,
      padding_size,
      changelog_uuid,
    })
  }
}

/// Total on-disk footprint of a record before batch-final padding.
pub fn record_disk_size(format: SegmentFormat, data_size: u64, padding_size: u64) -> u64 {
  format.padded_record_header_size() + align_up(data_size, SERIALIZATION_ALIGNMENT) + padding_size
}

pub fn encode_meta(meta: &ChangelogMeta) -> Vec<u8> {
  meta.encode_to_vec()
}

pub fn decode_meta(bytes: &[u8]) -> Result<ChangelogMeta> {
  ChangelogMeta::decode(bytes)
    .map_err(|error| KeelError::Serialization(format!("bad changelog meta: {error}")))
}

fn broken(what: &str) -> KeelError {
  KeelError::BrokenChangelog(format!("truncated {what}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn segment_header_roundtrip_both_formats() {
    let v4 = SegmentHeader::new(SegmentFormat::V4, 10, None);
    let decoded = SegmentHeader::decode(&v4.encode()).expect("v4");
    assert_eq!(decoded, v4);
    assert_eq!(decoded.first_record_offset % CHANGELOG_ALIGNMENT, 0);

    let mut v5 = SegmentHeader::new(SegmentFormat::V5, 3, Some(Uuid::new_v4()));
    v5.truncated_record_count = Some(17);
    let decoded = SegmentHeader::decode(&v5.encode()).expect("v5");
    assert_eq!(decoded, v5);
  }

  #[test]
  fn record_header_roundtrip() {
    let header = RecordHeader {
      record_id: 7,
      data_size: 100,
      checksum: 0xABCD_EF01_2345_6789,
      padding_size: 96,
      changelog_uuid: Some(Uuid::new_v4()),
    };
    let mut bytes = Vec::new();
    header.encode_into(SegmentFormat::V5, &mut bytes);
    assert_eq!(bytes.len() as u64 % SERIALIZATION_ALIGNMENT, 0);
    let decoded = RecordHeader::decode(SegmentFormat::V5, &bytes).expect("decode");
    assert_eq!(decoded, header);
  }

  #[test]
  fn meta_roundtrip() {
    let meta = ChangelogMeta {
      prev_record_count: 42,
    };
    let decoded = decode_meta(&encode_meta(&meta)).expect("meta");
    assert_eq!(decoded, meta);
  }

  #[test]
  fn alignment_helpers() {
    assert_eq!(align_up(0, 4096), 0);
    assert_eq!(align_up(1, 4096), 4096);
    assert_eq!(align_up(4096, 4096), 4096);
    assert_eq!(align_up(4097, 4096), 8192);
  }
}
