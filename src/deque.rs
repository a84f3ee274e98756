use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::frame::{FrameState, Task};

/// Extended spawn deque: one per worker.
///
/// The store is an ordered sequence of call levels, one level per frame that
/// is currently executing on the owner's native stack. A level holds the
/// ready children that frame has spawned and not yet run. The owner pushes
/// and pops at the young end; thieves take the oldest frame of the oldest
/// level, which is the frame closest to the root of the computation.
///
/// A single mutex covers both sides. This also settles the race between the
/// owner draining the deque and a thief promoting the stolen frame's parent:
/// the promotion happens while the lock is held, so the owner can never
/// observe a stolen frame whose parent is not yet full.
pub(crate) struct SpawnDeque {
  inner: Mutex<Store>,
  nframes: AtomicUsize,
}

struct Store {
  levels: Vec<Level>,
}

struct Level {
  frames: VecDeque<Task>,
}

impl SpawnDeque {
  pub(crate) fn new() -> SpawnDeque {
    SpawnDeque {
      inner: Mutex::new(Store { levels: Vec::new() }),
      nframes: AtomicUsize::new(0),
    }
  }

  /// Cheap probe for thieves; pairs with the owner-side counters.
  pub(crate) fn stealable(&self) -> bool {
    self.nframes.load(Ordering::Acquire) > 0
  }

  /// The owner starts executing a frame: open a call level for its spawns.
  pub(crate) fn enter_frame(&self) {
    let mut s = self.inner.lock().unwrap();
    s.levels.push(Level {
      frames: VecDeque::new(),
    });
  }

  /// The owner finished a frame. Its level must have been drained, either by
  /// the sync loop or by thieves.
  pub(crate) fn exit_frame(&self) {
    let mut s = self.inner.lock().unwrap();
    let level = s.levels.pop().expect("exit_frame on empty deque");
    assert!(
      level.frames.is_empty(),
      "task returned with unspawned children on its deque"
    );
  }

  pub(crate) fn push_spawn(&self, t: Task) {
    t.frame.set_state(FrameState::Waiting);
    let mut s = self.inner.lock().unwrap();
    let level = s.levels.last_mut().expect("push_spawn outside a frame");
    level.frames.push_back(t);
    self.nframes.fetch_add(1, Ordering::Release);
  }

  /// Owner side: youngest ready frame, if any.
  pub(crate) fn try_pop(&self) -> Option<Task> {
    let mut s = self.inner.lock().unwrap();
    for level in s.levels.iter_mut().rev() {
      if let Some(t) = level.frames.pop_back() {
        self.nframes.fetch_sub(1, Ordering::Release);
        return Some(t);
      }
    }
    None
  }

  /// Thief side: take the oldest frame of the oldest level and promote its
  /// parent to full before letting go of the lock, so the owner's sync
  /// bookkeeping sees a full frame from the moment the child can run
  /// elsewhere.
  pub(crate) fn steal_oldest(&self) -> Option<Task> {
    if !self.stealable() {
      return None;
    }
    let mut s = self.inner.lock().unwrap();
    for level in s.levels.iter_mut() {
      if let Some(t) = level.frames.pop_front() {
        if let Some(parent) = &t.frame.parent {
          parent.ensure_full();
        }
        self.nframes.fetch_sub(1, Ordering::Release);
        return Some(t);
      }
    }
    None
  }
}
