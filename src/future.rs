use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result cell shared between a spawned task and the handle returned from
/// `spawn()`. The task posts exactly once; readers may only look after the
/// post has been observed (normally guaranteed by `ssync()`).
pub(crate) struct FutureCell<T> {
  done: AtomicBool,
  slot: UnsafeCell<Option<T>>,
}

unsafe impl<T: Send> Send for FutureCell<T> {}
unsafe impl<T: Send> Sync for FutureCell<T> {}

impl<T> FutureCell<T> {
  pub(crate) fn new() -> FutureCell<T> {
    FutureCell {
      done: AtomicBool::new(false),
      slot: UnsafeCell::new(None),
    }
  }

  pub(crate) fn post(&self, value: T) {
    // single producer: the task that owns this cell
    unsafe {
      *self.slot.get() = Some(value);
    }
    self.done.store(true, Ordering::Release);
  }

  pub(crate) fn is_finished(&self) -> bool {
    self.done.load(Ordering::Acquire)
  }

  pub(crate) fn take(&self) -> Option<T> {
    assert!(self.is_finished());
    unsafe { (*self.slot.get()).take() }
  }
}

/// Handle to the return value of a spawned task.
///
/// The value may be extracted only after the matching `ssync()`; asking
/// earlier is a programming error.
pub struct Chandle<T> {
  pub(crate) cell: Arc<FutureCell<T>>,
}

impl<T> Clone for Chandle<T> {
  fn clone(&self) -> Chandle<T> {
    Chandle {
      cell: self.cell.clone(),
    }
  }
}

impl<T> Chandle<T> {
  pub fn is_finished(&self) -> bool {
    self.cell.is_finished()
  }

  pub fn get(&self) -> T
  where
    T: Clone,
  {
    assert!(
      self.cell.is_finished(),
      "requesting value from non-finished future"
    );
    unsafe { (*self.cell.slot.get()).as_ref().cloned().unwrap() }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn post_then_get() {
    let c = Arc::new(FutureCell::new());
    let h = Chandle { cell: c.clone() };
    assert!(!h.is_finished());
    c.post(7);
    assert!(h.is_finished());
    assert_eq!(h.get(), 7);
  }

  #[test]
  #[should_panic]
  fn get_before_post_panics() {
    let h = Chandle {
      cell: Arc::new(FutureCell::<i32>::new()),
    };
    let _ = h.get();
  }
}
