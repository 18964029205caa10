//! The user/system automaton admission lock.
//!
//! Two counters guard the decorated automaton. User work is admitted only
//! while no system work is pending; system work waits out any user work
//! already admitted. This admits concurrent user tasks while letting
//! recovery, snapshot attach and automaton clear obtain exclusivity on
//! demand.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct UserSystemLock {
  user_count: AtomicI32,
  system_count: AtomicI32,
}

impl UserSystemLock {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Admits a user task iff no system task holds or awaits the lock.
  pub fn try_acquire_user(self: &Arc<Self>) -> Option<UserGuard> {
    if self.system_count.load(Ordering::Acquire) > 0 {
      return None;
    }
    self.user_count.fetch_add(1, Ordering::AcqRel);
    if self.system_count.load(Ordering::Acquire) > 0 {
      self.user_count.fetch_sub(1, Ordering::AcqRel);
      return None;
    }
    Some(UserGuard {
      lock: Arc::clone(self),
    })
  }

  /// Blocks out new user tasks, then waits for admitted ones to drain.
  pub fn acquire_system(self: &Arc<Self>) -> SystemGuard {
    self.system_count.fetch_add(1, Ordering::AcqRel);
    while self.user_count.load(Ordering::Acquire) != 0 {
      std::hint::spin_loop();
      std::thread::yield_now();
    }
    SystemGuard {
      lock: Arc::clone(self),
    }
  }

  pub fn user_count(&self) -> i32 {
    self.user_count.load(Ordering::Acquire)
  }

  pub fn system_count(&self) -> i32 {
    self.system_count.load(Ordering::Acquire)
  }
}

#[derive(Debug)]
pub struct UserGuard {
  lock: Arc<UserSystemLock>,
}

impl Drop for UserGuard {
  fn drop(&mut self) {
    self.lock.user_count.fetch_sub(1, Ordering::AcqRel);
  }
}

#[derive(Debug)]
pub struct SystemGuard {
  lock: Arc<UserSystemLock>,
}

impl Drop for SystemGuard {
  fn drop(&mut self) {
    self.lock.system_count.fetch_sub(1, Ordering::AcqRel);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn user_denied_while_system_held() {
    let lock = UserSystemLock::new();
    let system = lock.acquire_system();
    assert!(lock.try_acquire_user().is_none());
    drop(system);
    assert!(lock.try_acquire_user().is_some());
  }

  #[test]
  fn concurrent_user_guards_are_admitted() {
    let lock = UserSystemLock::new();
    let first = lock.try_acquire_user().expect("first");
    let second = lock.try_acquire_user().expect("second");
    assert_eq!(lock.user_count(), 2);
    drop(first);
    drop(second);
    assert_eq!(lock.user_count(), 0);
  }

  #[test]
  fn system_waits_for_user_drain() {
    let lock = UserSystemLock::new();
    let user = lock.try_acquire_user().expect("user");

    let lock_clone = Arc::clone(&lock);
    let handle = std::thread::spawn(move || {
      let _system = lock_clone.acquire_system();
      lock_clone.user_count()
    });

    // The system acquirer must be spinning on the user guard.
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert_eq!(lock.system_count(), 1);
    drop(user);

    assert_eq!(handle.join().expect("join"), 0);
  }
}
