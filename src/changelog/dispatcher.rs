//! The changelog I/O worker.
//!
//! One dedicated OS thread owns all segment I/O: flush cycles driven by a
//! periodic `flush_quantum` wake-up, plus arbitrary blocking jobs (open,
//! create, read, truncate, close) submitted by async callers.

use crate::changelog::queue::ChangelogQueue;
use crate::error::{KeelError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

enum DispatcherMessage {
  Register(Arc<ChangelogQueue>),
  Unregister(u32),
  FlushQueue(u32, Option<oneshot::Sender<Result<()>>>),
  FlushAll(oneshot::Sender<Result<()>>),
  Run(Box<dyn FnOnce() + Send>),
  Shutdown,
}

pub struct ChangelogDispatcher {
  sender: crossbeam_channel::Sender<DispatcherMessage>,
  worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ChangelogDispatcher {
  pub fn new(flush_quantum: Duration) -> Arc<Self> {
    let (sender, receiver) = crossbeam_channel::unbounded::<DispatcherMessage>();
    let quantum = if flush_quantum.is_zero() {
      Duration::from_millis(10)
    } else {
      flush_quantum
    };
    let worker = std::thread::Builder::new()
      .name("changelog-io".to_string())
      .spawn(move || worker_loop(receiver, quantum))
      .expect("spawn changelog I/O thread");
    Arc::new(Self {
      sender,
      worker: parking_lot::Mutex::new(Some(worker)),
    })
  }

  pub fn register_queue(&self, queue: Arc<ChangelogQueue>) {
    let _ = self.sender.send(DispatcherMessage::Register(queue));
  }

  pub fn unregister_queue(&self, id: u32) {
    let _ = self.sender.send(DispatcherMessage::Unregister(id));
  }

  /// Asks the worker to flush one queue soon. With an ack sender, the ack
  /// fires after that flush cycle completes.
  pub fn nudge_flush(&self, id: u32, ack: Option<oneshot::Sender<Result<()>>>) {
    let _ = self.sender.send(DispatcherMessage::FlushQueue(id, ack));
  }

  /// Completes once every registered queue has gone through a flush cycle.
  pub async fn flush_all(&self) -> Result<()> {
    let (ack_tx, ack_rx) = oneshot::channel();
    self
      .sender
      .send(DispatcherMessage::FlushAll(ack_tx))
      .map_err(|_| KeelError::Canceled("changelog dispatcher is gone".to_string()))?;
    ack_rx
      .await
      .map_err(|_| KeelError::Canceled("changelog dispatcher dropped flush ack".to_string()))?
  }

  /// Runs a blocking I/O job on the worker thread and returns its result.
  pub async fn run_io<T, F>(&self, job: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
  {
    let (done_tx, done_rx) = oneshot::channel();
    self
      .sender
      .send(DispatcherMessage::Run(Box::new(move || {
        let _ = done_tx.send(job());
      })))
      .map_err(|_| KeelError::Canceled("changelog dispatcher is gone".to_string()))?;
    done_rx
      .await
      .map_err(|_| KeelError::Canceled("changelog dispatcher dropped job".to_string()))?
  }

  pub fn shutdown(&self) {
    let _ = self.sender.send(DispatcherMessage::Shutdown);
    if let Some(worker) = self.worker.lock().take() {
      let _ = worker.join();
    }
  }
}

impl Drop for ChangelogDispatcher {
  fn drop(&mut self) {
    let _ = self.sender.send(DispatcherMessage::Shutdown);
    if let Some(worker) = self.worker.lock().take() {
      let _ = worker.join();
    }
  }
}

fn worker_loop(receiver: crossbeam_channel::Receiver<DispatcherMessage>, quantum: Duration) {
  let mut queues: HashMap<u32, Arc<ChangelogQueue>> = HashMap::new();
  loop {
    match receiver.recv_timeout(quantum) {
      Ok(DispatcherMessage::Register(queue)) => {
        queues.insert(queue.id(), queue);
      }
      Ok(DispatcherMessage::Unregister(id)) => {
        queues.remove(&id);
      }
      Ok(DispatcherMessage::FlushQueue(id, ack)) => {
        let result = match queues.get(&id) {
          Some(queue) => queue.run_flush(),
          None => Err(KeelError::NoSuchChangelog(id)),
        };
        if let Err(error) = &result {
          tracing::error!(changelog_id = id, %error, "changelog flush failed");
        }
        if let Some(ack) = ack {
          let _ = ack.send(result);
        }
      }
      Ok(DispatcherMessage::FlushAll(ack)) => {
        let mut outcome = Ok(());
        for queue in queues.values() {
          if let Err(error) = queue.run_flush() {
            tracing::error!(changelog_id = queue.id(), %error, "changelog flush failed");
            if outcome.is_ok() {
              outcome = Err(error);
            }
          }
        }
        let _ = ack.send(outcome);
      }
      Ok(DispatcherMessage::Run(job)) => job(),
      Ok(DispatcherMessage::Shutdown) => break,
      Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
        for queue in queues.values() {
          if queue.needs_flush() {
            if let Err(error) = queue.run_flush() {
              tracing::error!(changelog_id = queue.id(), %error, "periodic flush failed");
            }
          }
        }
      }
      Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::changelog::format::ChangelogMeta;
  use crate::changelog::segment::SyncSegment;
  use crate::config::ChangelogConfig;
  use tempfile::tempdir;

  fn test_config(flush_period_ms: u64) -> ChangelogConfig {
    let mut config = ChangelogConfig::default();
    config.enable_sync = false;
    config.flush_period = Duration::from_millis(flush_period_ms);
    config.flush_quantum = Duration::from_millis(1);
    config
  }

  #[tokio::test]
  async fn periodic_flush_completes_appends() {
    let dir = tempdir().expect("tempdir");
    let config = test_config(1);
    let dispatcher = ChangelogDispatcher::new(config.flush_quantum);

    let path = dir.path().join("000000001.log");
    let mut segment = SyncSegment::new(path, config.clone());
    segment.create(ChangelogMeta::default()).expect("create");
    let queue = Arc::new(ChangelogQueue::new(1, segment, config));
    dispatcher.register_queue(Arc::clone(&queue));

    let pending = queue.append(vec![vec![9u8; 16]]);
    pending.await.expect("recv").expect("flushed");
    assert_eq!(queue.flushed_record_count(), 1);
    dispatcher.shutdown();
  }

  #[tokio::test]
  async fn flush_all_acks_after_flush() {
    let dir = tempdir().expect("tempdir");
    // Long flush period: only flush_all may flush.
    let config = test_config(60_000);
    let dispatcher = ChangelogDispatcher::new(Duration::from_millis(500));

    let path = dir.path().join("000000002.log");
    let mut segment = SyncSegment::new(path, config.clone());
    segment.create(ChangelogMeta::default()).expect("create");
    let queue = Arc::new(ChangelogQueue::new(2, segment, config));
    dispatcher.register_queue(Arc::clone(&queue));

    let pending = queue.append(vec![vec![1u8; 8]]);
    dispatcher.flush_all().await.expect("flush all");
    pending.await.expect("recv").expect("flushed");
    dispatcher.shutdown();
  }
}
