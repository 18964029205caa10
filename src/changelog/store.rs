//! Changelog store: a directory of numbered segment files.
//!
//! Files are `%09d.log` plus `%09d.log.index`; transient `*.tmp` files from
//! interrupted creates are removed on store open. Exactly one writable
//! (tail) segment exists at a time; the store itself is guarded by an
//! advisory lock so two processes cannot share it.

use crate::changelog::dispatcher::ChangelogDispatcher;
use crate::changelog::format::ChangelogMeta;
use crate::changelog::queue::ChangelogQueue;
use crate::changelog::segment::SyncSegment;
use crate::config::ChangelogConfig;
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use fs2::FileExt;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

const STORE_LOCK_FILE_NAME: &str = "changelogs.lock";
const SEGMENT_EXTENSION: &str = "log";

/// One open changelog segment, asynchronous view.
#[async_trait]
pub trait Changelog: Send + Sync {
  fn id(&self) -> u32;
  /// Records accepted into the log path (including unflushed).
  fn record_count(&self) -> u32;
  fn flushed_record_count(&self) -> u32;
  fn data_size(&self) -> u64;
  fn meta(&self) -> ChangelogMeta;

  /// Enqueues an append; the returned future completes when the records
  /// are durably flushed.
  fn append(&self, records: Vec<Vec<u8>>) -> BoxFuture<'static, Result<()>>;
  async fn flush(&self) -> Result<()>;
  async fn read(&self, first_record_id: u32, max_records: usize, max_bytes: u64)
    -> Result<Vec<Vec<u8>>>;
  async fn truncate(&self, record_count: u32) -> Result<()>;
  async fn close(&self) -> Result<()>;
}

/// Capability set of a changelog store backend.
#[async_trait]
pub trait ChangelogStore: Send + Sync {
  fn latest_id(&self) -> Result<Option<u32>>;
  /// All segment ids present, ascending.
  fn changelog_ids(&self) -> Result<Vec<u32>>;
  async fn create(&self, id: u32, meta: ChangelogMeta) -> Result<Arc<dyn Changelog>>;
  async fn open(&self, id: u32) -> Result<Arc<dyn Changelog>>;
  /// `Ok(None)` when the segment does not exist.
  async fn try_open(&self, id: u32) -> Result<Option<Arc<dyn Changelog>>>;
  async fn remove(&self, id: u32) -> Result<()>;
}

pub struct FileChangelog {
  id: u32,
  queue: Arc<ChangelogQueue>,
  dispatcher: Arc<ChangelogDispatcher>,
}

#[async_trait]
impl Changelog for FileChangelog {
  fn id(&self) -> u32 {
    self.id
  }

  fn record_count(&self) -> u32 {
    self.queue.record_count()
  }

  fn flushed_record_count(&self) -> u32 {
    self.queue.flushed_record_count()
  }

  fn data_size(&self) -> u64 {
    self.queue.data_size()
  }

  fn meta(&self) -> ChangelogMeta {
    self.queue.meta().clone()
  }

  fn append(&self, records: Vec<Vec<u8>>) -> BoxFuture<'static, Result<()>> {
    let receiver = self.queue.append(records);
    if self.queue.needs_flush() {
      self.dispatcher.nudge_flush(self.id, None);
    }
    async move {
      receiver
        .await
        .map_err(|_| KeelError::Canceled("changelog append dropped".to_string()))?
    }
    .boxed()
  }

  async fn flush(&self) -> Result<()> {
    self.queue.force_flush();
    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
    self.dispatcher.nudge_flush(self.id, Some(ack_tx));
    ack_rx
      .await
      .map_err(|_| KeelError::Canceled("changelog flush dropped".to_string()))?
  }

  async fn read(
    &self,
    first_record_id: u32,
    max_records: usize,
    max_bytes: u64,
  ) -> Result<Vec<Vec<u8>>> {
    let queue = Arc::clone(&self.queue);
    self
      .dispatcher
      .run_io(move || queue.read(first_record_id, max_records, max_bytes))
      .await
  }

  async fn truncate(&self, record_count: u32) -> Result<()> {
    let queue = Arc::clone(&self.queue);
    self
      .dispatcher
      .run_io(move || queue.truncate(record_count))
      .await
  }

  async fn close(&self) -> Result<()> {
    self.dispatcher.unregister_queue(self.id);
    let queue = Arc::clone(&self.queue);
    self.dispatcher.run_io(move || queue.close()).await
  }
}

/// The local file-backed changelog store.
pub struct LocalChangelogStore {
  dir: PathBuf,
  config: ChangelogConfig,
  dispatcher: Arc<ChangelogDispatcher>,
  open_changelogs: Mutex<HashMap<u32, Weak<FileChangelog>>>,
  _lock_file: File,
}

impl LocalChangelogStore {
  /// Opens (creating if needed) the store directory, removes stale tmp
  /// files and takes the store lock.
  pub fn open_store(
    dir: impl AsRef<Path>,
    config: ChangelogConfig,
    dispatcher: Arc<ChangelogDispatcher>,
  ) -> Result<Arc<Self>> {
    let dir = dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir)?;
    crate::util::fs::cleanup_tmp_files(&dir)?;

    let lock_path = dir.join(STORE_LOCK_FILE_NAME);
    let lock_file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(&lock_path)?;
    let mut attempts = 0;
    loop {
      match lock_file.try_lock_exclusive() {
        Ok(()) => break,
        Err(error) => {
          attempts += 1;
          if attempts >= 50 {
            return Err(KeelError::LockFailed(format!(
              "changelog store {} is locked by another process: {error}",
              dir.display()
            )));
          }
          // A predecessor may still be letting go of the lock.
          std::thread::sleep(std::time::Duration::from_millis(100));
        }
      }
    }

    tracing::debug!(dir = %dir.display(), "changelog store opened");
    Ok(Arc::new(Self {
      dir,
      config,
      dispatcher,
      open_changelogs: Mutex::new(HashMap::new()),
      _lock_file: lock_file,
    }))
  }

  pub fn segment_path(&self, id: u32) -> PathBuf {
    self.dir.join(format!("{id:09}.{SEGMENT_EXTENSION}"))
  }

  /// All segment ids present on disk, ascending.
  pub fn segment_ids(&self) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(&self.dir)? {
      let entry = entry?;
      let path = entry.path();
      if path.extension().is_some_and(|extension| extension == SEGMENT_EXTENSION) {
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
          if let Ok(id) = stem.parse::<u32>() {
            ids.push(id);
          }
        }
      }
    }
    ids.sort_unstable();
    Ok(ids)
  }

  fn wrap(&self, id: u32, queue: Arc<ChangelogQueue>) -> Arc<FileChangelog> {
    self.dispatcher.register_queue(Arc::clone(&queue));
    let changelog = Arc::new(FileChangelog {
      id,
      queue,
      dispatcher: Arc::clone(&self.dispatcher),
    });
    self
      .open_changelogs
      .lock()
      .insert(id, Arc::downgrade(&changelog));
    changelog
  }

  fn cached(&self, id: u32) -> Option<Arc<FileChangelog>> {
    self
      .open_changelogs
      .lock()
      .get(&id)
      .and_then(Weak::upgrade)
      .filter(|changelog| !changelog.queue.is_closed())
  }
}

#[async_trait]
impl ChangelogStore for LocalChangelogStore {
  fn latest_id(&self) -> Result<Option<u32>> {
    Ok(self.segment_ids()?.last().copied())
  }

  fn changelog_ids(&self) -> Result<Vec<u32>> {
    self.segment_ids()
  }

  async fn create(&self, id: u32, meta: ChangelogMeta) -> Result<Arc<dyn Changelog>> {
    let path = self.segment_path(id);
    let config = self.config.clone();
    let queue = self
      .dispatcher
      .run_io(move || {
        let mut segment = SyncSegment::new(path, config.clone());
        segment.create(meta)?;
        Ok(Arc::new(ChangelogQueue::new(id, segment, config)))
      })
      .await?;
    tracing::debug!(changelog_id = id, "changelog created");
    Ok(self.wrap(id, queue))
  }

  async fn open(&self, id: u32) -> Result<Arc<dyn Changelog>> {
    match self.try_open(id).await? {
      Some(changelog) => Ok(changelog),
      None => Err(KeelError::NoSuchChangelog(id)),
    }
  }

  async fn try_open(&self, id: u32) -> Result<Option<Arc<dyn Changelog>>> {
    if let Some(changelog) = self.cached(id) {
      return Ok(Some(changelog));
    }
    let path = self.segment_path(id);
    if !path.exists() {
      return Ok(None);
    }
    let config = self.config.clone();
    let queue = self
      .dispatcher
      .run_io(move || {
        let mut segment = SyncSegment::new(path, config.clone());
        segment.open()?;
        Ok(Arc::new(ChangelogQueue::new(id, segment, config)))
      })
      .await?;
    Ok(Some(self.wrap(id, queue)))
  }

  async fn remove(&self, id: u32) -> Result<()> {
    if self.cached(id).is_some() {
      return Err(KeelError::ChangelogIo(format!(
        "changelog {id} is still open"
      )));
    }
    let path = self.segment_path(id);
    let index_path = crate::changelog::index::ChangelogIndex::index_path(&path);
    let dir = self.dir.clone();
    self
      .dispatcher
      .run_io(move || {
        if path.exists() {
          std::fs::remove_file(&path)?;
        }
        if index_path.exists() {
          std::fs::remove_file(&index_path)?;
        }
        crate::util::fs::sync_parent_dir(Some(&dir))?;
        Ok(())
      })
      .await?;
    tracing::debug!(changelog_id = id, "changelog removed");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn test_config() -> ChangelogConfig {
    let mut config = ChangelogConfig::default();
    config.enable_sync = false;
    config.flush_period = std::time::Duration::ZERO;
    config
  }

  #[tokio::test]
  async fn create_append_reopen() {
    let dir = tempdir().expect("tempdir");
    let config = test_config();
    let dispatcher = ChangelogDispatcher::new(config.flush_quantum);
    let store =
      LocalChangelogStore::open_store(dir.path(), config.clone(), Arc::clone(&dispatcher))
        .expect("open store");

    let changelog = store
      .create(0, ChangelogMeta::default())
      .await
      .expect("create");
    changelog
      .append(vec![b"alpha".to_vec(), b"beta".to_vec()])
      .await
      .expect("append");
    assert_eq!(changelog.record_count(), 2);
    changelog.close().await.expect("close");
    drop(changelog);

    assert_eq!(store.latest_id().expect("latest"), Some(0));
    let reopened = store.open(0).await.expect("open");
    let records = reopened.read(0, usize::MAX, u64::MAX).await.expect("read");
    assert_eq!(records, vec![b"alpha".to_vec(), b"beta".to_vec()]);
    dispatcher.shutdown();
  }

  #[tokio::test]
  async fn missing_changelog_is_reported() {
    let dir = tempdir().expect("tempdir");
    let config = test_config();
    let dispatcher = ChangelogDispatcher::new(config.flush_quantum);
    let store = LocalChangelogStore::open_store(dir.path(), config, Arc::clone(&dispatcher))
      .expect("open store");

    assert!(store.try_open(7).await.expect("try_open").is_none());
    assert!(matches!(
      store.open(7).await,
      Err(KeelError::NoSuchChangelog(7))
    ));
    dispatcher.shutdown();
  }

  #[tokio::test]
  async fn tmp_files_are_cleaned_on_open() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("000000003.log.tmp"), b"junk").expect("write tmp");
    let config = test_config();
    let dispatcher = ChangelogDispatcher::new(config.flush_quantum);
    let _store = LocalChangelogStore::open_store(dir.path(), config, Arc::clone(&dispatcher))
      .expect("open store");
    assert!(!dir.path().join("000000003.log.tmp").exists());
    dispatcher.shutdown();
  }
}
