//! Response keeper: retry idempotence for identified mutations.
//!
//! Maps mutation ids to response bytes so a client retry returns the
//! original response instead of re-executing the mutation.

use crate::error::{KeelError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

pub trait ResponseKeeper: Send + Sync {
  fn start(&self);
  fn stop(&self);

  /// Consults the keeper before ordering a mutation.
  ///
  /// - `Ok(None)`: unknown id, now registered as pending; proceed to
  ///   commit.
  /// - `Ok(Some(future))`: the id is known; the future yields the original
  ///   response (immediately if already finished, else when it lands).
  /// - `Err`: duplicate non-retry submission of an in-flight id.
  fn try_begin_request(
    &self,
    id: Uuid,
    retry: bool,
  ) -> Result<Option<BoxFuture<'static, Result<Vec<u8>>>>>;

  /// Publishes the response for a pending id.
  fn end_request(&self, id: Uuid, response: Vec<u8>);

  /// Drops a pending id without a response (commit failed); waiters get an
  /// error.
  fn cancel_request(&self, id: Uuid, error: &KeelError);
}

enum KeptResponse {
  Pending(Vec<oneshot::Sender<Result<Vec<u8>>>>),
  Finished(Vec<u8>),
}

/// In-memory keeper used by the local engine.
#[derive(Default)]
pub struct LocalResponseKeeper {
  state: Mutex<KeeperState>,
}

#[derive(Default)]
struct KeeperState {
  running: bool,
  responses: HashMap<Uuid, KeptResponse>,
}

impl LocalResponseKeeper {
  pub fn new() -> std::sync::Arc<Self> {
    std::sync::Arc::new(Self::default())
  }
}

impl ResponseKeeper for LocalResponseKeeper {
  fn start(&self) {
    let mut state = self.state.lock();
    state.running = true;
  }

  fn stop(&self) {
    let mut state = self.state.lock();
    state.running = false;
    for (_, kept) in state.responses.drain() {
      if let KeptResponse::Pending(waiters) = kept {
        for waiter in waiters {
          let _ = waiter.send(Err(KeelError::Unavailable(
            "response keeper stopped".to_string(),
          )));
        }
      }
    }
  }

  fn try_begin_request(
    &self,
    id: Uuid,
    retry: bool,
  ) -> Result<Option<BoxFuture<'static, Result<Vec<u8>>>>> {
    let mut state = self.state.lock();
    if !state.running {
      return Ok(None);
    }
    match state.responses.get_mut(&id) {
      Some(KeptResponse::Finished(bytes)) => {
        let bytes = bytes.clone();
        Ok(Some(async move { Ok(bytes) }.boxed()))
      }
      Some(KeptResponse::Pending(waiters)) => {
        if !retry {
          return Err(KeelError::Unavailable(format!(
            "duplicate mutation {id} is already in flight"
          )));
        }
        let (sender, receiver) = oneshot::channel();
        waiters.push(sender);
        Ok(Some(
          async move {
            receiver
              .await
              .map_err(|_| KeelError::Unavailable("response keeper dropped".to_string()))?
          }
          .boxed(),
        ))
      }
      None => {
        state.responses.insert(id, KeptResponse::Pending(Vec::new()));
        Ok(None)
      }
    }
  }

  fn end_request(&self, id: Uuid, response: Vec<u8>) {
    let mut state = self.state.lock();
    if !state.running {
      return;
    }
    match state
      .responses
      .insert(id, KeptResponse::Finished(response.clone()))
    {
      Some(KeptResponse::Pending(waiters)) => {
        for waiter in waiters {
          let _ = waiter.send(Ok(response.clone()));
        }
      }
      Some(KeptResponse::Finished(_)) | None => {}
    }
  }

  fn cancel_request(&self, id: Uuid, error: &KeelError) {
    let mut state = self.state.lock();
    if let Some(KeptResponse::Pending(waiters)) = state.responses.remove(&id) {
      for waiter in waiters {
        let _ = waiter.send(Err(error.duplicate()));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn retry_returns_original_response() {
    let keeper = LocalResponseKeeper::new();
    keeper.start();
    let id = Uuid::new_v4();

    assert!(keeper.try_begin_request(id, false).expect("begin").is_none());
    keeper.end_request(id, b"answer".to_vec());

    let cached = keeper
      .try_begin_request(id, true)
      .expect("begin retry")
      .expect("cached");
    assert_eq!(cached.await.expect("bytes"), b"answer".to_vec());
  }

  #[tokio::test]
  async fn concurrent_retry_waits_for_first() {
    let keeper = LocalResponseKeeper::new();
    keeper.start();
    let id = Uuid::new_v4();

    assert!(keeper.try_begin_request(id, false).expect("begin").is_none());
    let waiting = keeper
      .try_begin_request(id, true)
      .expect("begin retry")
      .expect("pending");
    keeper.end_request(id, vec![9]);
    assert_eq!(waiting.await.expect("bytes"), vec![9]);
  }

  #[test]
  fn duplicate_non_retry_is_rejected() {
    let keeper = LocalResponseKeeper::new();
    keeper.start();
    let id = Uuid::new_v4();
    assert!(keeper.try_begin_request(id, false).expect("begin").is_none());
    assert!(keeper.try_begin_request(id, false).is_err());
  }

  #[test]
  fn stopped_keeper_passes_through() {
    let keeper = LocalResponseKeeper::new();
    let id = Uuid::new_v4();
    assert!(keeper.try_begin_request(id, false).expect("begin").is_none());
    assert!(keeper.try_begin_request(id, false).expect("begin").is_none());
  }
}
