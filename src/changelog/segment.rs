//! Single-writer changelog segment file.
//!
//! Synchronous create/open/append/read/truncate over one on-disk segment
//! plus its sparse index sibling. Not thread safe; the owning queue
//! serializes access. Any I/O failure latches the instance and every
//! subsequent call surfaces the same error.

use crate::changelog::format::{
  align_up, decode_meta, encode_meta, record_disk_size, ChangelogMeta, RecordHeader, SegmentFormat,
  SegmentHeader, CHANGELOG_ALIGNMENT, SERIALIZATION_ALIGNMENT,
};
use crate::changelog::index::ChangelogIndex;
use crate::config::ChangelogConfig;
use crate::error::{KeelError, Result};
use crate::util::checksum::checksum;
use crate::util::fs::replace_file_atomically;
use fs2::FileExt;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

const LOCK_BACKOFF: Duration = Duration::from_millis(100);
const MAX_LOCK_RETRIES: usize = 100;

#[derive(Debug)]
pub struct SyncSegment {
  path: PathBuf,
  config: ChangelogConfig,
  file: Option<File>,
  format: SegmentFormat,
  uuid: Option<Uuid>,
  meta: ChangelogMeta,
  serialized_meta: Vec<u8>,
  first_record_offset: u64,
  record_count: u32,
  truncated_record_count: Option<u32>,
  /// Logical end of record data; always `CHANGELOG_ALIGNMENT`-aligned.
  data_position: u64,
  /// Physical file size; exceeds `data_position` under preallocation.
  file_size: u64,
  index: ChangelogIndex,
  latched: Option<KeelError>,
  open: bool,
}

struct ParsedRecord<'a> {
  header: RecordHeader,
  payload: &'a [u8],
  total_size: u64,
}

impl SyncSegment {
  pub fn new(path: PathBuf, config: ChangelogConfig) -> Self {
    let index = ChangelogIndex::new(
      ChangelogIndex::index_path(&path),
      config.index_block_size,
      config.enable_sync,
    );
    Self {
      path,
      config,
      file: None,
      format: SegmentFormat::V5,
      uuid: None,
      meta: ChangelogMeta::default(),
      serialized_meta: Vec::new(),
      first_record_offset: 0,
      record_count: 0,
      truncated_record_count: None,
      data_position: 0,
      file_size: 0,
      index,
      latched: None,
      open: false,
    }
  }

  pub fn path(&self) -> &PathBuf {
    &self.path
  }

  pub fn meta(&self) -> &ChangelogMeta {
    &self.meta
  }

  pub fn uuid(&self) -> Option<Uuid> {
    self.uuid
  }

  pub fn record_count(&self) -> u32 {
    self.record_count
  }

  pub fn data_size(&self) -> u64 {
    self.data_position
  }

  pub fn is_open(&self) -> bool {
    self.open
  }

  pub fn truncated_record_count(&self) -> Option<u32> {
    self.truncated_record_count
  }

  fn check(&self) -> Result<()> {
    match &self.latched {
      Some(error) => Err(error.duplicate()),
      None => Ok(()),
    }
  }

  fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
    if let Err(error) = &result {
      tracing::error!(path = %self.path.display(), %error, "changelog segment latched");
      self.latched = Some(error.duplicate());
    }
    result
  }

  /// Initializes a fresh segment. Fails if the file already exists.
  pub fn create(&mut self, meta: ChangelogMeta) -> Result<()> {
    self.check()?;
    if self.open {
      return Err(KeelError::ChangelogIo(format!(
        "segment {} is already open",
        self.path.display()
      )));
    }
    if self.path.exists() {
      return Err(KeelError::ChangelogIo(format!(
        "segment {} already exists",
        self.path.display()
      )));
    }
    let result = self.do_create(meta);
    self.latch(result)
  }

  fn do_create(&mut self, meta: ChangelogMeta) -> Result<()> {
    self.format = SegmentFormat::V5;
    self.uuid = Some(Uuid::new_v4());
    self.serialized_meta = encode_meta(&meta);
    self.meta = meta;

    let header = SegmentHeader::new(
      self.format,
      self.serialized_meta.len() as u32,
      self.uuid,
    );
    let mut bytes = header.encode();
    bytes.extend_from_slice(&self.serialized_meta);
    bytes.resize(header.first_record_offset as usize, 0);
    replace_file_atomically(&self.path, &bytes, self.config.enable_sync)?;

    let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
    lock_data_file(&file, &self.path)?;
    self.first_record_offset = header.first_record_offset;
    self.record_count = 0;
    self.truncated_record_count = None;
    self.data_position = header.first_record_offset;
    self.file_size = header.first_record_offset;
    self.file = Some(file);
    self.index.create()?;
    self.open = true;

    tracing::debug!(path = %self.path.display(), "changelog segment created");
    Ok(())
  }

  /// Opens an existing segment: validates the header, replays the index,
  /// scans the unindexed suffix and repairs a torn tail.
  pub fn open(&mut self) -> Result<()> {
    self.check()?;
    if self.open {
      return Err(KeelError::ChangelogIo(format!(
        "segment {} is already open",
        self.path.display()
      )));
    }
    let result = self.do_open();
    if result.is_err() {
      self.file = None;
      self.open = false;
    }
    self.latch(result)
  }

  fn do_open(&mut self) -> Result<()> {
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .open(&self.path)
      .map_err(|error| match error.kind() {
        std::io::ErrorKind::NotFound => KeelError::ChangelogIo(format!(
          "segment {} does not exist",
          self.path.display()
        )),
        _ => KeelError::Io(error),
      })?;
    lock_data_file(&file, &self.path)?;

    let map = unsafe { Mmap::map(&file)? };
    if map.len() < 8 {
      return Err(KeelError::BrokenChangelog(format!(
        "segment {} is shorter than a signature",
        self.path.display()
      )));
    }
    let header = SegmentHeader::decode(&map)?;
    self.format = header.format;
    self.uuid = header.uuid;
    self.truncated_record_count = header.truncated_record_count;
    self.first_record_offset = header.first_record_offset;

    let meta_start = header.format.file_header_size() as usize;
    let meta_end = meta_start + header.meta_size as usize;
    if map.len() < meta_end {
      return Err(KeelError::BrokenChangelog(format!(
        "segment {} header overruns the file",
        self.path.display()
      )));
    }
    self.serialized_meta = map[meta_start..meta_end].to_vec();
    self.meta = decode_meta(&self.serialized_meta)?;

    self.index.open()?;
    let valid_index_len = self.compute_valid_index_prefix(&map);
    self.index.truncate_invalid_prefix(valid_index_len)?;

    self.file_size = map.len() as u64;
    self.scan_records(&map)?;
    drop(map);

    self.file = Some(file);
    self.repair_tail()?;
    self.index.flush()?;
    self.open = true;

    tracing::debug!(
      path = %self.path.display(),
      record_count = self.record_count,
      truncated_record_count = ?self.truncated_record_count,
      format = ?self.format,
      "changelog segment opened"
    );
    Ok(())
  }

  /// Length of the maximal index prefix that is consistent with the data
  /// file.
  fn compute_valid_index_prefix(&self, map: &Mmap) -> usize {
    let entries = self.index.entries();
    let mut valid = 0;
    for (position, entry) in entries.iter().enumerate() {
      let ok = if position == 0 {
        entry.file_position == self.first_record_offset && entry.record_id == 0
      } else {
        let prev = &entries[position - 1];
        entry.file_position > prev.file_position && entry.record_id > prev.record_id
      };
      if !ok {
        break;
      }
      valid += 1;
    }

    let file_len = map.len() as u64;
    while valid > 0 && entries[valid - 1].file_position >= file_len {
      valid -= 1;
    }

    // The record the last entry points at must itself parse.
    while valid > 0 {
      let entry = &entries[valid - 1];
      match self.parse_record_at(map, entry.file_position as usize, entry.record_id) {
        Ok(_) => break,
        Err(_) => valid -= 1,
      }
    }

    valid
  }

  /// Walks records from the last indexed position to the end of data,
  /// rebuilding index entries and detecting a torn tail.
  fn scan_records(&mut self, map: &Mmap) -> Result<()> {
    let file_len = map.len() as u64;
    let (mut next_id, mut position) = match self.index.last_entry() {
      Some(entry) => (entry.record_id, entry.file_position),
      None => (0, self.first_record_offset),
    };
    self.record_count = next_id;
    self.data_position = position;

    while position < file_len {
      if let Some(truncated) = self.truncated_record_count {
        if self.record_count == truncated {
          break;
        }
      }
      match self.parse_record_at(map, position as usize, next_id) {
        Ok(record) => {
          let total = record.total_size;
          self.index.track_append(next_id, position, total);
          self.record_count = next_id + 1;
          position += total;
          self.data_position = position;
          next_id += 1;
        }
        Err(error) => {
          if let Some(truncated) = self.truncated_record_count {
            if self.record_count < truncated {
              return Err(KeelError::BrokenChangelog(format!(
                "broken record {next_id} inside truncated segment {}: {error}",
                self.path.display()
              )));
            }
          }
          tracing::warn!(
            path = %self.path.display(),
            record_id = next_id,
            offset = position,
            %error,
            "torn record at changelog tail, trimming"
          );
          break;
        }
      }
    }

    if let Some(truncated) = self.truncated_record_count {
      if self.record_count > truncated {
        self.record_count = truncated;
      }
    }
    Ok(())
  }

  /// Rewrites the final valid record's padding and physically shrinks the
  /// file to an aligned boundary after a torn tail was trimmed.
  fn repair_tail(&mut self) -> Result<()> {
    if self.truncated_record_count.is_some() {
      return Ok(());
    }
    let valid_size = align_up(self.data_position, CHANGELOG_ALIGNMENT);

    if valid_size > self.data_position {
      // The tail record must absorb the bytes up to the new aligned end.
      // Re-walk from the last indexed record to locate it.
      let (mut next_id, mut position) = match self.index.last_entry() {
        Some(entry) => (entry.record_id, entry.file_position),
        None => {
          return Err(KeelError::BrokenChangelog(format!(
            "unaligned empty segment {}",
            self.path.display()
          )))
        }
      };
      let (record_start, mut header) = {
        let file = self.file.as_ref().expect("open segment has a file");
        let map = unsafe { Mmap::map(file)? };
        let mut record_start = position;
        let mut header = None;
        while position < self.data_position {
          let record = self.parse_record_at(&map, position as usize, next_id)?;
          record_start = position;
          position += record.total_size;
          header = Some(record.header);
          next_id += 1;
        }
        let header = header.ok_or_else(|| {
          KeelError::BrokenChangelog(format!("no tail record in {}", self.path.display()))
        })?;
        (record_start, header)
      };

      let extra = valid_size - self.data_position;
      header.padding_size = header
        .padding_size
        .checked_add(extra as u16)
        .ok_or_else(|| {
          KeelError::BrokenChangelog(format!(
            "tail padding overflow in {}",
            self.path.display()
          ))
        })?;

      let mut bytes = Vec::new();
      header.encode_into(self.format, &mut bytes);
      let file = self.file.as_mut().expect("open segment has a file");
      file.seek(SeekFrom::Start(record_start))?;
      file.write_all(&bytes)?;
      self.data_position = valid_size;
    }

    if self.file_size != self.data_position {
      let file = self.file.as_mut().expect("open segment has a file");
      file.set_len(self.data_position)?;
      self.file_size = self.data_position;
      if self.config.enable_sync {
        file.sync_data()?;
      }
    }
    Ok(())
  }

  fn parse_record_at<'a>(
    &self,
    map: &'a Mmap,
    offset: usize,
    expected_id: u32,
  ) -> Result<ParsedRecord<'a>> {
    let header_size = self.format.padded_record_header_size() as usize;
    let bytes = &map[..];
    if offset + header_size > bytes.len() {
      return Err(KeelError::BrokenChangelog(
        "record header overruns the file".to_string(),
      ));
    }
    let header = RecordHeader::decode(self.format, &bytes[offset..offset + header_size])?;
    if header.data_size == 0 {
      return Err(KeelError::BrokenChangelog(
        "record data_size is zero".to_string(),
      ));
    }
    if header.record_id != expected_id {
      return Err(KeelError::BrokenChangelog(format!(
        "record id mismatch: expected {expected_id}, got {}",
        header.record_id
      )));
    }
    if self.format == SegmentFormat::V5 {
      if let (Some(expected), Some(actual)) = (self.uuid, header.changelog_uuid) {
        if expected != actual {
          return Err(KeelError::BrokenChangelog(format!(
            "record {expected_id} uuid mismatch: {actual} != {expected}"
          )));
        }
      }
    }
    let payload_start = offset + header_size;
    let payload_end = payload_start + header.data_size as usize;
    let padded_payload_end =
      payload_start + align_up(u64::from(header.data_size), SERIALIZATION_ALIGNMENT) as usize;
    let record_end = padded_payload_end + header.padding_size as usize;
    if record_end > bytes.len() {
      return Err(KeelError::BrokenChangelog(
        "record payload overruns the file".to_string(),
      ));
    }
    let payload = &bytes[payload_start..payload_end];
    let computed = checksum(payload);
    if computed != header.checksum {
      return Err(KeelError::ChecksumMismatch {
        stored: header.checksum,
        computed,
      });
    }
    Ok(ParsedRecord {
      header,
      payload,
      total_size: (record_end - offset) as u64,
    })
  }

  /// Atomically appends a contiguous block of records. The batch end is
  /// padded to the changelog alignment.
  pub fn append(&mut self, first_record_id: u32, records: &[Vec<u8>]) -> Result<()> {
    self.check()?;
    self.ensure_open()?;
    if self.truncated_record_count.is_some() {
      return Err(KeelError::ChangelogIo(format!(
        "cannot append to truncated segment {}",
        self.path.display()
      )));
    }
    if first_record_id != self.record_count {
      return Err(KeelError::ChangelogIo(format!(
        "append id mismatch in {}: expected {}, got {first_record_id}",
        self.path.display(),
        self.record_count
      )));
    }
    if records.is_empty() {
      return Ok(());
    }
    let result = self.do_append(first_record_id, records);
    self.latch(result)
  }

  fn do_append(&mut self, first_record_id: u32, records: &[Vec<u8>]) -> Result<()> {
    debug_assert_eq!(self.data_position % CHANGELOG_ALIGNMENT, 0);

    let mut blob = Vec::new();
    let mut sizes = Vec::with_capacity(records.len());
    for (offset, record) in records.iter().enumerate() {
      debug_assert!(!record.is_empty());
      let is_last = offset + 1 == records.len();
      let padding_size = if is_last {
        let block_size = blob.len() as u64
          + record_disk_size(self.format, record.len() as u64, 0);
        align_up(block_size, CHANGELOG_ALIGNMENT) - block_size
      } else {
        0
      };
      debug_assert!(padding_size <= u64::from(u16::MAX));

      let header = RecordHeader {
        record_id: first_record_id + offset as u32,
        data_size: record.len() as u32,
        checksum: checksum(record),
        padding_size: padding_size as u16,
        changelog_uuid: self.uuid,
      };
      let start = blob.len();
      header.encode_into(self.format, &mut blob);
      blob.extend_from_slice(record);
      let padded = align_up(blob.len() as u64 - start as u64, SERIALIZATION_ALIGNMENT);
      blob.resize(start + padded as usize + padding_size as usize, 0);
      sizes.push((blob.len() - start) as u64);
    }
    debug_assert_eq!(blob.len() as u64 % CHANGELOG_ALIGNMENT, 0);

    let append_size = blob.len() as u64;
    let new_position = self.data_position + append_size;
    let file = self.file.as_mut().expect("open segment has a file");

    if let Some(preallocate_size) = self.config.preallocate_size {
      if new_position > self.file_size {
        let new_file_size = (self.file_size + preallocate_size).max(new_position);
        file.set_len(new_file_size)?;
        self.file_size = new_file_size;
      }
    }

    file.seek(SeekFrom::Start(self.data_position))?;
    file.write_all(&blob)?;

    let mut position = self.data_position;
    for (offset, size) in sizes.iter().enumerate() {
      self
        .index
        .track_append(first_record_id + offset as u32, position, *size);
      position += size;
    }

    self.record_count += records.len() as u32;
    self.data_position = new_position;
    self.file_size = self.file_size.max(new_position);

    tracing::debug!(
      path = %self.path.display(),
      first_record_id,
      record_count = records.len(),
      bytes = append_size,
      "appended to changelog segment"
    );
    Ok(())
  }

  /// Forces data and index durability unless sync is disabled.
  pub fn flush(&mut self) -> Result<()> {
    self.check()?;
    self.ensure_open()?;
    let result = (|| {
      if self.config.enable_sync {
        self
          .file
          .as_mut()
          .expect("open segment has a file")
          .sync_data()?;
      }
      self.index.flush()?;
      Ok(())
    })();
    self.latch(result)
  }

  /// Reads up to `max_records`/`max_bytes` payloads starting at
  /// `first_record_id`. At least one record is returned when any is
  /// available.
  pub fn read(
    &mut self,
    first_record_id: u32,
    max_records: usize,
    max_bytes: u64,
  ) -> Result<Vec<Vec<u8>>> {
    self.check()?;
    self.ensure_open()?;
    if first_record_id >= self.record_count || max_records == 0 {
      return Ok(Vec::new());
    }
    let result = self.do_read(first_record_id, max_records, max_bytes);
    self.latch(result)
  }

  fn do_read(
    &mut self,
    first_record_id: u32,
    max_records: usize,
    max_bytes: u64,
  ) -> Result<Vec<Vec<u8>>> {
    let wanted = max_records.min((self.record_count - first_record_id) as usize);
    let (mut next_id, mut position) = self
      .index
      .lower_bound(first_record_id, self.first_record_offset);

    let file = self.file.as_ref().expect("open segment has a file");
    let map = unsafe { Mmap::map(file)? };

    let mut records = Vec::with_capacity(wanted);
    let mut read_bytes = 0u64;
    while next_id < self.record_count && records.len() < wanted {
      let record = self.parse_record_at(&map, position as usize, next_id)?;
      if next_id >= first_record_id {
        if !records.is_empty() && read_bytes + record.payload.len() as u64 > max_bytes {
          break;
        }
        read_bytes += record.payload.len() as u64;
        records.push(record.payload.to_vec());
      }
      position += record.total_size;
      next_id += 1;
    }
    Ok(records)
  }

  /// Shortens the logical length to `record_count` and persists the
  /// truncation in the header.
  pub fn truncate(&mut self, record_count: u32) -> Result<()> {
    self.check()?;
    self.ensure_open()?;
    if let Some(existing) = self.truncated_record_count {
      if record_count > existing {
        return Err(KeelError::ChangelogIo(format!(
          "truncation may not grow: {existing} -> {record_count} in {}",
          self.path.display()
        )));
      }
    }
    if record_count > self.record_count {
      return Err(KeelError::ChangelogIo(format!(
        "cannot truncate {} to {record_count}: only {} records",
        self.path.display(),
        self.record_count
      )));
    }
    let result = (|| {
      self.record_count = record_count;
      self.truncated_record_count = Some(record_count);
      self.index.truncate_to_record_count(record_count)?;
      self.rewrite_header()?;
      Ok(())
    })();
    let result = self.latch(result);
    if result.is_ok() {
      tracing::debug!(
        path = %self.path.display(),
        record_count,
        "changelog segment truncated"
      );
    }
    result
  }

  fn rewrite_header(&mut self) -> Result<()> {
    let file = self.file.as_mut().expect("open segment has a file");
    if self.config.enable_sync {
      file.sync_data()?;
    }
    let mut header = SegmentHeader::new(
      self.format,
      self.serialized_meta.len() as u32,
      self.uuid,
    );
    header.truncated_record_count = self.truncated_record_count;
    let mut bytes = header.encode();
    bytes.extend_from_slice(&self.serialized_meta);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    if self.config.enable_sync {
      file.sync_data()?;
    }
    Ok(())
  }

  /// Final flush and release; the post-close size is the logical size.
  pub fn close(&mut self) -> Result<()> {
    if !self.open {
      return Ok(());
    }
    let result = (|| {
      if let Some(file) = self.file.as_mut() {
        if self.file_size > self.data_position {
          file.set_len(self.data_position)?;
          self.file_size = self.data_position;
        }
        if self.config.enable_sync {
          file.sync_data()?;
        }
        let _ = file.unlock();
      }
      self.index.close()?;
      Ok(())
    })();
    self.file = None;
    self.open = false;
    let result = self.latch(result);
    if result.is_ok() {
      tracing::debug!(path = %self.path.display(), "changelog segment closed");
    }
    result
  }

  fn ensure_open(&self) -> Result<()> {
    if !self.open {
      return Err(KeelError::ChangelogIo(format!(
        "segment {} is not open",
        self.path.display()
      )));
    }
    Ok(())
  }
}

impl Drop for SyncSegment {
  fn drop(&mut self) {
    let _ = self.close();
  }
}

fn lock_data_file(file: &File, path: &PathBuf) -> Result<()> {
  for attempt in 0.. {
    match file.try_lock_exclusive() {
      Ok(()) => return Ok(()),
      Err(error) => {
        if attempt + 1 >= MAX_LOCK_RETRIES {
          return Err(KeelError::LockFailed(format!(
            "cannot lock {}: {error}",
            path.display()
          )));
        }
        tracing::warn!(path = %path.display(), %error, "segment lock busy, retrying");
        std::thread::sleep(LOCK_BACKOFF);
      }
    }
  }
  unreachable!()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn test_config() -> ChangelogConfig {
    let mut config = ChangelogConfig::default();
    config.enable_sync = false;
    config.index_block_size = 4096;
    config
  }

  fn payloads(count: usize, size: usize) -> Vec<Vec<u8>> {
    (0..count)
      .map(|index| vec![(index % 251) as u8 + 1; size])
      .collect()
  }

  #[test]
  fn append_flush_read_roundtrip() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("000000001.log");
    let mut segment = SyncSegment::new(path.clone(), test_config());
    segment
      .create(ChangelogMeta {
        prev_record_count: 0,
      })
      .expect("create");

    let records = payloads(10, 100);
    segment.append(0, &records).expect("append");
    segment.flush().expect("flush");
    assert_eq!(segment.record_count(), 10);
    assert_eq!(segment.data_size() % CHANGELOG_ALIGNMENT, 0);

    let back = segment.read(0, usize::MAX, u64::MAX).expect("read");
    assert_eq!(back, records);

    // Suffix read with byte bound returns at least one record.
    let bounded = segment.read(3, 100, 1).expect("read bounded");
    assert_eq!(bounded.len(), 1);
    assert_eq!(bounded[0], records[3]);
  }

  #[test]
  fn reopen_recovers_records_and_meta() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("000000002.log");
    let records = payloads(5, 64);
    {
      let mut segment = SyncSegment::new(path.clone(), test_config());
      segment
        .create(ChangelogMeta {
          prev_record_count: 17,
        })
        .expect("create");
      segment.append(0, &records).expect("append");
      segment.flush().expect("flush");
      segment.close().expect("close");
    }

    let mut segment = SyncSegment::new(path, test_config());
    segment.open().expect("open");
    assert_eq!(segment.record_count(), 5);
    assert_eq!(segment.meta().prev_record_count, 17);
    assert_eq!(segment.read(0, usize::MAX, u64::MAX).expect("read"), records);
  }

  #[test]
  fn corrupted_tail_record_is_trimmed() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("000000003.log");
    let records = payloads(50, 200);
    let before_last_append;
    {
      let mut segment = SyncSegment::new(path.clone(), test_config());
      segment.create(ChangelogMeta::default()).expect("create");
      segment.append(0, &records[..49]).expect("append");
      before_last_append = segment.data_size();
      segment.append(49, &records[49..]).expect("append");
      segment.flush().expect("flush");
      segment.close().expect("close");
    }

    // Corrupt one payload byte of the last record.
    let mut bytes = std::fs::read(&path).expect("read file");
    let offset = before_last_append as usize + 40; // inside record 49's payload
    bytes[offset] ^= 0xFF;
    std::fs::write(&path, &bytes).expect("write corrupted");

    let mut segment = SyncSegment::new(path.clone(), test_config());
    segment.open().expect("open");
    assert_eq!(segment.record_count(), 49);
    let back = segment.read(0, usize::MAX, u64::MAX).expect("read");
    assert_eq!(back, records[..49].to_vec());
    // The file was shrunk to an aligned boundary.
    let len = std::fs::metadata(&path).expect("metadata").len();
    assert_eq!(len % CHANGELOG_ALIGNMENT, 0);
  }

  #[test]
  fn corrupted_mid_file_record_is_fatal() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("000000004.log");
    {
      let mut segment = SyncSegment::new(path.clone(), test_config());
      segment.create(ChangelogMeta::default()).expect("create");
      segment.append(0, &payloads(20, 300)).expect("append");
      segment.truncate(20).expect("truncate marker");
      segment.close().expect("close");
    }

    // Corrupt a record near the start; the truncation marker makes the scan
    // treat every record below the marker as mandatory.
    let mut bytes = std::fs::read(&path).expect("read file");
    let offset = CHANGELOG_ALIGNMENT as usize + 64;
    bytes[offset] ^= 0xFF;
    std::fs::write(&path, &bytes).expect("write corrupted");
    let index_path = ChangelogIndex::index_path(&path);
    std::fs::remove_file(&index_path).expect("drop index");

    let mut segment = SyncSegment::new(path, test_config());
    let error = segment.open().expect_err("broken");
    assert!(matches!(error, KeelError::BrokenChangelog(_)));
  }

  #[test]
  fn truncate_bounds_reads_and_survives_reopen() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("000000005.log");
    let records = payloads(10, 100);
    {
      let mut segment = SyncSegment::new(path.clone(), test_config());
      segment.create(ChangelogMeta::default()).expect("create");
      segment.append(0, &records).expect("append");
      segment.truncate(4).expect("truncate");
      assert_eq!(
        segment.read(0, usize::MAX, u64::MAX).expect("read"),
        records[..4].to_vec()
      );
      segment.close().expect("close");
    }

    let mut segment = SyncSegment::new(path, test_config());
    segment.open().expect("open");
    assert_eq!(segment.record_count(), 4);
    assert_eq!(segment.truncated_record_count(), Some(4));
    assert_eq!(
      segment.read(0, usize::MAX, u64::MAX).expect("read"),
      records[..4].to_vec()
    );
  }

  #[test]
  fn write_failure_latches_the_segment() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("000000006.log");
    let mut segment = SyncSegment::new(path, test_config());
    segment.create(ChangelogMeta::default()).expect("create");
    // Id mismatch is not an I/O fault and must not latch.
    assert!(segment.append(5, &payloads(1, 10)).is_err());
    assert!(segment.append(0, &payloads(1, 10)).is_ok());
  }

  #[test]
  fn preallocation_grows_then_close_shrinks() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("000000007.log");
    let mut config = test_config();
    config.preallocate_size = Some(1024 * 1024);
    let mut segment = SyncSegment::new(path.clone(), config.clone());
    segment.create(ChangelogMeta::default()).expect("create");
    segment.append(0, &payloads(3, 100)).expect("append");
    let logical = segment.data_size();
    let physical = std::fs::metadata(&path).expect("metadata").len();
    assert!(physical >= 1024 * 1024);
    segment.close().expect("close");
    assert_eq!(std::fs::metadata(&path).expect("metadata").len(), logical);
  }
}
