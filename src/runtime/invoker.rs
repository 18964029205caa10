//! Serialized task queues over tokio.
//!
//! An invoker is one named logical thread: tasks submitted to it run one at
//! a time, in submission order. Epoch-scoped work goes through a cancelable
//! wrapper that refuses new tasks once the epoch ends and interrupts
//! in-flight tasks at their next suspension point.

use crate::error::{KeelError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};

/// A serialized executor context. Cheap to clone; all clones feed the same
/// queue.
#[derive(Clone)]
pub struct Invoker {
  name: &'static str,
  sender: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl Invoker {
  /// Spawns the driver task on the current tokio runtime.
  pub fn new(name: &'static str) -> Self {
    let (sender, mut receiver) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
    tokio::spawn(async move {
      while let Some(task) = receiver.recv().await {
        task.await;
      }
    });
    Self { name, sender }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  /// Enqueues a task; the result is discarded.
  pub fn invoke<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    // A send failure means the runtime is shutting down; the task is
    // dropped, matching invoker semantics on teardown.
    let _ = self.sender.send(task.boxed());
  }

  /// Enqueues a task and returns a future for its output.
  pub fn submit<F, T>(&self, task: F) -> impl Future<Output = Result<T>> + Send + 'static
  where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
  {
    let (done_tx, done_rx) = oneshot::channel();
    let queued = self
      .sender
      .send(
        async move {
          let value = task.await;
          let _ = done_tx.send(value);
        }
        .boxed(),
      )
      .is_ok();
    let name = self.name;
    async move {
      if !queued {
        return Err(KeelError::Canceled(format!("invoker {name} is gone")));
      }
      done_rx
        .await
        .map_err(|_| KeelError::Canceled(format!("task dropped by invoker {name}")))
    }
  }
}

/// Cooperative cancellation primitive shared by everything an epoch spawns.
#[derive(Debug, Default)]
pub struct Canceler {
  canceled: AtomicBool,
  notify: Notify,
}

impl Canceler {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn cancel(&self) {
    self.canceled.store(true, Ordering::SeqCst);
    self.notify.notify_waiters();
  }

  pub fn is_canceled(&self) -> bool {
    self.canceled.load(Ordering::SeqCst)
  }

  /// Completes once `cancel` has been called.
  pub async fn canceled(&self) {
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      // Register before the flag check so a concurrent cancel is not
      // missed.
      notified.as_mut().enable();
      if self.is_canceled() {
        return;
      }
      notified.await;
    }
  }
}

/// An invoker view that stops accepting work when its epoch ends and
/// interrupts in-flight tasks at their next await.
#[derive(Clone)]
pub struct CancelableInvoker {
  inner: Invoker,
  canceler: Arc<Canceler>,
}

impl CancelableInvoker {
  pub fn new(inner: Invoker, canceler: Arc<Canceler>) -> Self {
    Self { inner, canceler }
  }

  pub fn canceler(&self) -> &Arc<Canceler> {
    &self.canceler
  }

  pub fn is_canceled(&self) -> bool {
    self.canceler.is_canceled()
  }

  pub fn invoke<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    if self.is_canceled() {
      return;
    }
    let canceler = Arc::clone(&self.canceler);
    self.inner.invoke(async move {
      tokio::select! {
        _ = canceler.canceled() => {}
        _ = task => {}
      }
    });
  }

  /// Runs a long-lived task concurrently with the queue, still bounded by
  /// the epoch: it is interrupted at its next suspension point once the
  /// epoch ends. Use for loops and multi-step orchestrations that await
  /// work running on this same context.
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    if self.is_canceled() {
      return;
    }
    let canceler = Arc::clone(&self.canceler);
    tokio::spawn(async move {
      tokio::select! {
        _ = canceler.canceled() => {}
        _ = task => {}
      }
    });
  }

  pub fn submit<F, T>(&self, task: F) -> impl Future<Output = Result<T>> + Send + 'static
  where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
  {
    let name = self.inner.name();
    let canceler = Arc::clone(&self.canceler);
    let rejected = self.is_canceled();
    let submitted = self.inner.submit(async move {
      tokio::select! {
        _ = canceler.canceled() => None,
        value = task => Some(value),
      }
    });
    async move {
      if rejected {
        return Err(KeelError::Canceled(format!(
          "epoch ended; invoker {name} refuses new tasks"
        )));
      }
      match submitted.await? {
        Some(value) => Ok(value),
        None => Err(KeelError::Canceled(format!(
          "epoch ended while running on invoker {name}"
        ))),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[tokio::test]
  async fn invoker_serializes_tasks_in_order() {
    let invoker = Invoker::new("test");
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for index in 0..16 {
      let log = Arc::clone(&log);
      handles.push(invoker.submit(async move {
        // Yield to give later tasks a chance to overtake if the queue
        // were not serialized.
        tokio::task::yield_now().await;
        log.lock().push(index);
      }));
    }
    for handle in handles {
      handle.await.expect("task");
    }

    assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
  }

  #[tokio::test]
  async fn canceled_invoker_refuses_and_interrupts() {
    let invoker = Invoker::new("test");
    let canceler = Canceler::new();
    let cancelable = CancelableInvoker::new(invoker, Arc::clone(&canceler));

    let started = Arc::new(AtomicUsize::new(0));
    let started_clone = Arc::clone(&started);
    let blocked = cancelable.submit(async move {
      started_clone.fetch_add(1, Ordering::SeqCst);
      futures::future::pending::<()>().await;
    });

    // Let the task start, then cancel the epoch.
    tokio::task::yield_now().await;
    canceler.cancel();

    assert!(matches!(blocked.await, Err(KeelError::Canceled(_))));
    let refused = cancelable.submit(async { 1 });
    assert!(matches!(refused.await, Err(KeelError::Canceled(_))));
  }
}
