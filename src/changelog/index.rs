//! Sparse changelog index.
//!
//! A sibling file (`<segment>.index`) holding one fixed-size entry per
//! indexing interval of record data. Entries are append-only and carry a
//! CRC so a torn index tail is detected and dropped on open; the data file
//! remains the source of truth and the missing suffix is rebuilt by the
//! open-time scan.

use crate::error::{KeelError, Result};
use crate::util::checksum::index_crc;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const INDEX_SIGNATURE: u64 = u64::from_le_bytes(*b"KEELIX01");
const INDEX_HEADER_SIZE: u64 = 8;
const INDEX_ENTRY_SIZE: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
  pub record_id: u32,
  pub size: u32,
  pub file_position: u64,
}

impl IndexEntry {
  fn encode(&self) -> [u8; INDEX_ENTRY_SIZE as usize] {
    let mut out = [0u8; INDEX_ENTRY_SIZE as usize];
    {
      let mut cursor = &mut out[..];
      cursor.write_u32::<LittleEndian>(self.record_id).unwrap();
      cursor.write_u32::<LittleEndian>(self.size).unwrap();
      cursor.write_u64::<LittleEndian>(self.file_position).unwrap();
    }
    let crc = index_crc(&out[..16]);
    (&mut out[16..]).write_u32::<LittleEndian>(crc).unwrap();
    out
  }

  fn decode(bytes: &[u8]) -> Result<IndexEntry> {
    let mut input = bytes;
    let record_id = input.read_u32::<LittleEndian>()?;
    let size = input.read_u32::<LittleEndian>()?;
    let file_position = input.read_u64::<LittleEndian>()?;
    let stored_crc = input.read_u32::<LittleEndian>()?;
    let computed_crc = index_crc(&bytes[..16]);
    if stored_crc != computed_crc {
      return Err(KeelError::ChecksumMismatch {
        stored: u64::from(stored_crc),
        computed: u64::from(computed_crc),
      });
    }
    Ok(IndexEntry {
      record_id,
      size,
      file_position,
    })
  }
}

#[derive(Debug)]
pub struct ChangelogIndex {
  path: PathBuf,
  file: Option<File>,
  entries: Vec<IndexEntry>,
  /// Entries appended but not yet written to the file.
  dirty_from: usize,
  /// Data bytes accumulated since the last entry was emitted.
  unindexed_bytes: u64,
  index_block_size: u64,
  enable_sync: bool,
}

impl ChangelogIndex {
  pub fn new(path: PathBuf, index_block_size: u64, enable_sync: bool) -> Self {
    Self {
      path,
      file: None,
      entries: Vec::new(),
      dirty_from: 0,
      unindexed_bytes: 0,
      index_block_size,
      enable_sync,
    }
  }

  pub fn index_path(segment_path: &Path) -> PathBuf {
    let mut name = segment_path.as_os_str().to_os_string();
    name.push(".index");
    PathBuf::from(name)
  }

  pub fn create(&mut self) -> Result<()> {
    let mut file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .read(true)
      .write(true)
      .open(&self.path)?;
    file.write_all(&INDEX_SIGNATURE.to_le_bytes())?;
    if self.enable_sync {
      file.sync_data()?;
    }
    self.file = Some(file);
    self.entries.clear();
    self.dirty_from = 0;
    self.unindexed_bytes = 0;
    Ok(())
  }

  /// Loads all structurally valid entries; a torn or corrupt tail is
  /// discarded. Cross-validation against the data file is the segment's
  /// job.
  pub fn open(&mut self) -> Result<()> {
    let mut file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(&self.path)?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    self.entries.clear();
    if bytes.len() as u64 >= INDEX_HEADER_SIZE {
      let signature = u64::from_le_bytes(bytes[..8].try_into().unwrap());
      if signature != INDEX_SIGNATURE {
        return Err(KeelError::BrokenChangelog(format!(
          "invalid index signature {signature:#018x} in {}",
          self.path.display()
        )));
      }
      let mut offset = INDEX_HEADER_SIZE as usize;
      while offset + INDEX_ENTRY_SIZE as usize <= bytes.len() {
        match IndexEntry::decode(&bytes[offset..offset + INDEX_ENTRY_SIZE as usize]) {
          Ok(entry) => self.entries.push(entry),
          Err(_) => {
            tracing::warn!(
              path = %self.path.display(),
              entry = self.entries.len(),
              "discarding corrupt index tail"
            );
            break;
          }
        }
        offset += INDEX_ENTRY_SIZE as usize;
      }
    } else {
      // Missing or empty index: recreate the header in place.
      file.set_len(0)?;
      file.write_all(&INDEX_SIGNATURE.to_le_bytes())?;
    }

    // Persisted length reflects only the entries kept.
    file.set_len(INDEX_HEADER_SIZE + self.entries.len() as u64 * INDEX_ENTRY_SIZE)?;
    self.file = Some(file);
    self.dirty_from = self.entries.len();
    self.unindexed_bytes = 0;
    Ok(())
  }

  pub fn entries(&self) -> &[IndexEntry] {
    &self.entries
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn last_entry(&self) -> Option<&IndexEntry> {
    self.entries.last()
  }

  /// Registers one appended record; emits an index entry for the first
  /// record and whenever the unindexed span exceeds the block size.
  pub fn track_append(&mut self, record_id: u32, file_position: u64, size: u64) {
    if self.entries.is_empty() || self.unindexed_bytes + size > self.index_block_size {
      self.entries.push(IndexEntry {
        record_id,
        size: size as u32,
        file_position,
      });
      self.unindexed_bytes = 0;
    } else {
      self.unindexed_bytes += size;
    }
  }

  /// Drops entries failing `keep`, and everything after the first drop.
  pub fn truncate_invalid_prefix(&mut self, valid_len: usize) -> Result<()> {
    if valid_len >= self.entries.len() {
      return Ok(());
    }
    self.entries.truncate(valid_len);
    self.dirty_from = self.dirty_from.min(valid_len);
    if let Some(file) = self.file.as_mut() {
      file.set_len(INDEX_HEADER_SIZE + valid_len as u64 * INDEX_ENTRY_SIZE)?;
    }
    Ok(())
  }

  /// Drops all entries at or beyond `record_count`.
  pub fn truncate_to_record_count(&mut self, record_count: u32) -> Result<()> {
    let keep = self
      .entries
      .iter()
      .take_while(|entry| entry.record_id < record_count)
      .count();
    self.truncate_invalid_prefix(keep)
  }

  /// Writes out dirty entries; fdatasyncs when sync is enabled.
  pub fn flush(&mut self) -> Result<()> {
    let file = match self.file.as_mut() {
      Some(file) => file,
      None => return Ok(()),
    };
    if self.dirty_from < self.entries.len() {
      use std::io::{Seek, SeekFrom};
      file.seek(SeekFrom::Start(
        INDEX_HEADER_SIZE + self.dirty_from as u64 * INDEX_ENTRY_SIZE,
      ))?;
      for entry in &self.entries[self.dirty_from..] {
        file.write_all(&entry.encode())?;
      }
      self.dirty_from = self.entries.len();
    }
    if self.enable_sync {
      file.sync_data()?;
    }
    Ok(())
  }

  pub fn close(&mut self) -> Result<()> {
    self.flush()?;
    self.file = None;
    Ok(())
  }

  /// Greatest indexed position at or below `record_id`; `fallback` when the
  /// index has no entry yet (start of the record region).
  pub fn lower_bound(&self, record_id: u32, fallback: u64) -> (u32, u64) {
    let partition = self
      .entries
      .partition_point(|entry| entry.record_id <= record_id);
    if partition == 0 {
      return (0, fallback);
    }
    let entry = &self.entries[partition - 1];
    (entry.record_id, entry.file_position)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn sample_index(dir: &Path) -> ChangelogIndex {
    ChangelogIndex::new(dir.join("000000001.log.index"), 256, false)
  }

  #[test]
  fn entries_survive_reopen() {
    let dir = tempdir().expect("tempdir");
    let mut index = sample_index(dir.path());
    index.create().expect("create");
    index.track_append(0, 4096, 100);
    index.track_append(1, 4196, 100);
    index.track_append(2, 4296, 100);
    index.track_append(3, 4396, 100);
    index.flush().expect("flush");
    index.close().expect("close");

    let mut reopened = sample_index(dir.path());
    reopened.open().expect("open");
    // Record 0 is always indexed; 1 and 2 fit inside the block, 3 spills.
    assert_eq!(reopened.entries().len(), 2);
    assert_eq!(reopened.entries()[0].record_id, 0);
    assert_eq!(reopened.entries()[1].record_id, 3);
  }

  #[test]
  fn corrupt_tail_is_discarded() {
    let dir = tempdir().expect("tempdir");
    let mut index = sample_index(dir.path());
    index.create().expect("create");
    index.track_append(0, 4096, 100);
    index.track_append(1, 4196, 300);
    index.flush().expect("flush");
    index.close().expect("close");

    let path = dir.path().join("000000001.log.index");
    let mut bytes = std::fs::read(&path).expect("read");
    let len = bytes.len();
    bytes[len - 1] ^= 0xFF;
    std::fs::write(&path, &bytes).expect("write");

    let mut reopened = sample_index(dir.path());
    reopened.open().expect("open");
    assert_eq!(reopened.entries().len(), 1);
  }

  #[test]
  fn lower_bound_search() {
    let dir = tempdir().expect("tempdir");
    let mut index = sample_index(dir.path());
    index.create().expect("create");
    index.track_append(0, 4096, 100);
    index.track_append(10, 8192, 300);
    assert_eq!(index.lower_bound(5, 4096), (0, 4096));
    assert_eq!(index.lower_bound(10, 4096), (10, 8192));
    assert_eq!(index.lower_bound(999, 4096), (10, 8192));
  }
}
