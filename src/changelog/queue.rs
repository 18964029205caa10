//! Concurrent producer buffering over one segment.
//!
//! Producers append into in-memory lists and receive a future completed by
//! the owning flush. The dispatcher's I/O thread drains the lists into the
//! segment. Reads below `flushed_record_count` come from disk; everything
//! above is served from the in-memory queues without I/O.

use crate::changelog::format::ChangelogMeta;
use crate::changelog::segment::SyncSegment;
use crate::config::ChangelogConfig;
use crate::error::{KeelError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

#[derive(Debug)]
struct QueueState {
  /// Newly appended records, not yet handed to the I/O worker.
  append_queue: Vec<Arc<Vec<u8>>>,
  append_waiters: Vec<oneshot::Sender<Result<()>>>,
  /// Records handed to the I/O worker and not yet on disk.
  flush_queue: Vec<Arc<Vec<u8>>>,
  unflushed_bytes: u64,
  last_flush: Instant,
  flush_forced: bool,
  errored: Option<KeelError>,
  closed: bool,
}

#[derive(Debug)]
pub struct ChangelogQueue {
  id: u32,
  segment: Mutex<SyncSegment>,
  state: Mutex<QueueState>,
  flushed_record_count: AtomicU32,
  queued_record_count: AtomicU32,
  queued_data_size: AtomicU64,
  config: ChangelogConfig,
  meta: ChangelogMeta,
}

impl ChangelogQueue {
  /// Wraps an already created/opened segment.
  pub fn new(id: u32, segment: SyncSegment, config: ChangelogConfig) -> Self {
    let flushed = segment.record_count();
    let data_size = segment.data_size();
    let meta = segment.meta().clone();
    Self {
      id,
      segment: Mutex::new(segment),
      state: Mutex::new(QueueState {
        append_queue: Vec::new(),
        append_waiters: Vec::new(),
        flush_queue: Vec::new(),
        unflushed_bytes: 0,
        last_flush: Instant::now(),
        flush_forced: false,
        errored: None,
        closed: false,
      }),
      flushed_record_count: AtomicU32::new(flushed),
      queued_record_count: AtomicU32::new(flushed),
      queued_data_size: AtomicU64::new(data_size),
      config,
      meta,
    }
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn meta(&self) -> &ChangelogMeta {
    &self.meta
  }

  /// Records accepted into the log path (flushed or pending).
  pub fn record_count(&self) -> u32 {
    self.queued_record_count.load(Ordering::Acquire)
  }

  pub fn flushed_record_count(&self) -> u32 {
    self.flushed_record_count.load(Ordering::Acquire)
  }

  pub fn data_size(&self) -> u64 {
    self.queued_data_size.load(Ordering::Acquire)
  }

  /// Enqueues records; the returned future completes when the owning flush
  /// has made them durable.
  pub fn append(&self, records: Vec<Vec<u8>>) -> oneshot::Receiver<Result<()>> {
    let (done_tx, done_rx) = oneshot::channel();
    let mut state = self.state.lock();
    if let Some(error) = &state.errored {
      let _ = done_tx.send(Err(error.duplicate()));
      return done_rx;
    }
    if state.closed {
      let _ = done_tx.send(Err(KeelError::ChangelogIo(format!(
        "changelog {} is closed",
        self.id
      ))));
      return done_rx;
    }
    let mut bytes = 0u64;
    for record in records {
      bytes += record.len() as u64;
      state.append_queue.push(Arc::new(record));
    }
    state.unflushed_bytes += bytes;
    state.append_waiters.push(done_tx);
    self
      .queued_record_count
      .store(
        self.flushed_record_count.load(Ordering::Acquire)
          + (state.flush_queue.len() + state.append_queue.len()) as u32,
        Ordering::Release,
      );
    self.queued_data_size.fetch_add(bytes, Ordering::AcqRel);
    done_rx
  }

  pub fn force_flush(&self) {
    self.state.lock().flush_forced = true;
  }

  /// Whether the I/O worker should flush this queue now.
  pub fn needs_flush(&self) -> bool {
    let state = self.state.lock();
    if state.append_queue.is_empty() {
      return false;
    }
    state.flush_forced
      || self.config.flush_period.is_zero()
      || state.unflushed_bytes >= self.config.data_flush_size
      || state.last_flush.elapsed() >= self.config.flush_period
  }

  pub fn has_pending(&self) -> bool {
    let state = self.state.lock();
    !state.append_queue.is_empty() || !state.flush_queue.is_empty()
  }

  /// Runs one flush cycle. Must only be called from the I/O worker.
  pub fn run_flush(&self) -> Result<()> {
    let (records, waiters, first_record_id) = {
      let mut state = self.state.lock();
      if let Some(error) = &state.errored {
        return Err(error.duplicate());
      }
      debug_assert!(state.flush_queue.is_empty());
      if state.append_queue.is_empty() {
        state.last_flush = Instant::now();
        state.flush_forced = false;
        return Ok(());
      }
      state.flush_queue = std::mem::take(&mut state.append_queue);
      let waiters = std::mem::take(&mut state.append_waiters);
      state.unflushed_bytes = 0;
      state.flush_forced = false;
      (
        state.flush_queue.clone(),
        waiters,
        self.flushed_record_count.load(Ordering::Acquire),
      )
    };

    let io_result = {
      let mut segment = self.segment.lock();
      let owned: Vec<Vec<u8>> = records.iter().map(|record| (**record).clone()).collect();
      segment
        .append(first_record_id, &owned)
        .and_then(|_| segment.flush())
    };

    let mut state = self.state.lock();
    match &io_result {
      Ok(()) => {
        self
          .flushed_record_count
          .fetch_add(records.len() as u32, Ordering::AcqRel);
        state.flush_queue.clear();
        state.last_flush = Instant::now();
        for waiter in waiters {
          let _ = waiter.send(Ok(()));
        }
      }
      Err(error) => {
        state.errored = Some(error.duplicate());
        for waiter in waiters {
          let _ = waiter.send(Err(error.duplicate()));
        }
        // Later appends fail fast; pending ones are poisoned too.
        for waiter in state.append_waiters.drain(..) {
          let _ = waiter.send(Err(error.duplicate()));
        }
      }
    }
    io_result
  }

  /// Suffix-merging read: disk below the flushed boundary, memory above.
  pub fn read(&self, first_record_id: u32, max_records: usize, max_bytes: u64) -> Result<Vec<Vec<u8>>> {
    if max_records == 0 {
      return Ok(Vec::new());
    }

    // Snapshot the memory suffix first; records only move memory -> disk,
    // so ids below the snapshot boundary stay readable from disk.
    let (flushed, memory) = {
      let state = self.state.lock();
      if let Some(error) = &state.errored {
        return Err(error.duplicate());
      }
      let flushed = self.flushed_record_count.load(Ordering::Acquire);
      let mut memory: Vec<Arc<Vec<u8>>> =
        Vec::with_capacity(state.flush_queue.len() + state.append_queue.len());
      memory.extend(state.flush_queue.iter().cloned());
      memory.extend(state.append_queue.iter().cloned());
      (flushed, memory)
    };

    let mut records = Vec::new();
    let mut read_bytes = 0u64;

    if first_record_id < flushed {
      let mut segment = self.segment.lock();
      records = segment.read(first_record_id, max_records, max_bytes)?;
      read_bytes = records.iter().map(|record| record.len() as u64).sum();
    }

    let mut next_id = first_record_id.max(flushed);
    while records.len() < max_records {
      let memory_offset = (next_id - flushed) as usize;
      let Some(record) = memory.get(memory_offset) else {
        break;
      };
      if !records.is_empty() && read_bytes + record.len() as u64 > max_bytes {
        break;
      }
      read_bytes += record.len() as u64;
      records.push((**record).clone());
      next_id += 1;
    }

    Ok(records)
  }

  /// Truncates the underlying segment. Only legal with no pending appends.
  pub fn truncate(&self, record_count: u32) -> Result<()> {
    {
      let state = self.state.lock();
      if !state.append_queue.is_empty() || !state.flush_queue.is_empty() {
        return Err(KeelError::ChangelogIo(format!(
          "cannot truncate changelog {} with pending appends",
          self.id
        )));
      }
    }
    let mut segment = self.segment.lock();
    segment.truncate(record_count)?;
    self
      .flushed_record_count
      .store(record_count, Ordering::Release);
    self.queued_record_count.store(record_count, Ordering::Release);
    self
      .queued_data_size
      .store(segment.data_size(), Ordering::Release);
    Ok(())
  }

  pub fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  pub fn close(&self) -> Result<()> {
    {
      let mut state = self.state.lock();
      state.closed = true;
    }
    self.run_flush()?;
    self.segment.lock().close()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::changelog::format::ChangelogMeta;
  use tempfile::tempdir;

  fn test_config() -> ChangelogConfig {
    let mut config = ChangelogConfig::default();
    config.enable_sync = false;
    config
  }

  fn new_queue(dir: &std::path::Path) -> ChangelogQueue {
    let path = dir.join("000000001.log");
    let mut segment = SyncSegment::new(path, test_config());
    segment.create(ChangelogMeta::default()).expect("create");
    ChangelogQueue::new(1, segment, test_config())
  }

  #[tokio::test]
  async fn unflushed_records_are_readable() {
    let dir = tempdir().expect("tempdir");
    let queue = new_queue(dir.path());

    let _pending = queue.append(vec![vec![1u8; 10], vec![2u8; 10]]);
    assert_eq!(queue.record_count(), 2);
    assert_eq!(queue.flushed_record_count(), 0);

    let records = queue.read(0, usize::MAX, u64::MAX).expect("read");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0], vec![1u8; 10]);
  }

  #[tokio::test]
  async fn flush_completes_append_future() {
    let dir = tempdir().expect("tempdir");
    let queue = new_queue(dir.path());

    let pending = queue.append(vec![vec![7u8; 32]]);
    queue.run_flush().expect("flush");
    pending.await.expect("recv").expect("flush result");
    assert_eq!(queue.flushed_record_count(), 1);

    // Reads now come from disk.
    let records = queue.read(0, usize::MAX, u64::MAX).expect("read");
    assert_eq!(records, vec![vec![7u8; 32]]);
  }

  #[tokio::test]
  async fn read_merges_disk_and_memory() {
    let dir = tempdir().expect("tempdir");
    let queue = new_queue(dir.path());

    let first = queue.append(vec![vec![1u8; 8]]);
    queue.run_flush().expect("flush");
    first.await.expect("recv").expect("flush");
    let _second = queue.append(vec![vec![2u8; 8], vec![3u8; 8]]);

    let records = queue.read(0, usize::MAX, u64::MAX).expect("read");
    assert_eq!(records.len(), 3);
    assert_eq!(records[2], vec![3u8; 8]);
  }
}
