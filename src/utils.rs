use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::Backoff;

#[cfg(feature = "tracing")]
macro_rules! trace {
  ($($arg:tt)*) => {
    log::trace!($($arg)*)
  };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace {
  ($($arg:tt)*) => {};
}

macro_rules! defer {
  ($($body:tt)*) => {
    let _guard = $crate::utils::Defer::new(|| { $($body)* });
  };
}

pub(crate) struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Defer<F> {
  pub(crate) fn new(f: F) -> Defer<F> {
    Defer(Some(f))
  }
}

impl<F: FnOnce()> Drop for Defer<F> {
  fn drop(&mut self) {
    if let Some(f) = self.0.take() {
      f()
    }
  }
}

/// Run `f`, aborting the process if it panics.
///
/// A panic that crosses a task boundary leaves the runtime bookkeeping in an
/// unknown state, there is no way to unwind a half-finished task graph.
pub(crate) fn abort_on_panic<T>(f: impl FnOnce() -> T) -> T {
  struct Bomb;

  impl Drop for Bomb {
    fn drop(&mut self) {
      std::process::abort();
    }
  }

  let bomb = Bomb;
  let t = f();
  std::mem::forget(bomb);
  t
}

/// Spinning test-and-set mutex.
///
/// Used where a lock is held for a handful of instructions and a guard object
/// is inconvenient, notably the commutativity mutex that is acquired at task
/// start and released at task finish.
pub(crate) struct CasMutex {
  locked: AtomicBool,
}

impl CasMutex {
  pub(crate) const fn new() -> CasMutex {
    CasMutex {
      locked: AtomicBool::new(false),
    }
  }

  pub(crate) fn lock(&self) {
    let backoff = Backoff::new();
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      backoff.snooze();
    }
  }

  pub(crate) fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

// xorshift, per-worker victim selection
pub(crate) struct XorShift(u64);

impl XorShift {
  pub(crate) fn new(seed: u64) -> XorShift {
    XorShift(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1)
  }

  pub(crate) fn next(&mut self) -> u64 {
    let mut x = self.0;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    self.0 = x;
    x
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defer_runs_at_scope_exit() {
    let mut hit = false;
    {
      let _guard = Defer::new(|| hit = true);
    }
    assert!(hit);
  }

  #[test]
  fn cas_mutex_excludes() {
    let m = CasMutex::new();
    m.lock();
    m.unlock();
    m.lock();
    m.unlock();
  }

  #[test]
  fn xorshift_is_nonzero() {
    let mut rng = XorShift::new(0);
    for _ in 0..64 {
      assert_ne!(rng.next(), 0);
    }
  }
}
