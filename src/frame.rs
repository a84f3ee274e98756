use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

pub(crate) const NO_OWNER: usize = usize::MAX;

static FRAME_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Lifecycle of a frame.
///
/// `Executing` frames sit on top of some worker's native stack, `Waiting`
/// frames are parked on a spawn deque, `Suspended` frames are blocked at a
/// sync point, `Pending` frames have unsatisfied dependencies and no stack
/// yet, and `Dummy` is the root ancestor of a computation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum FrameState {
  Dummy = 0,
  Pending = 1,
  Waiting = 2,
  Executing = 3,
  Suspended = 4,
}

impl FrameState {
  fn from_u8(v: u8) -> FrameState {
    match v {
      0 => FrameState::Dummy,
      1 => FrameState::Pending,
      2 => FrameState::Waiting,
      3 => FrameState::Executing,
      4 => FrameState::Suspended,
      _ => unreachable!(),
    }
  }
}

/// Extension a frame gains once concurrency around it is possible, i.e. when
/// one of its children is stolen or created out of order. The promotion is
/// single-shot.
pub(crate) struct FullFrame {
  // serializes child-completion bookkeeping against concurrent finishers
  pub(crate) sync: Mutex<()>,
}

pub(crate) struct Frame {
  id: usize,
  pub(crate) parent: Option<Arc<Frame>>,
  pub(crate) is_call: bool,
  state: AtomicU8,
  owner: AtomicUsize,
  children: AtomicUsize,
  full: OnceCell<FullFrame>,
}

impl Frame {
  pub(crate) fn new(parent: Option<Arc<Frame>>, is_call: bool, state: FrameState) -> Frame {
    Frame {
      id: FRAME_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
      parent,
      is_call,
      state: AtomicU8::new(state as u8),
      owner: AtomicUsize::new(NO_OWNER),
      children: AtomicUsize::new(0),
      full: OnceCell::new(),
    }
  }

  pub(crate) fn dummy() -> Frame {
    Frame::new(None, false, FrameState::Dummy)
  }

  pub(crate) fn state(&self) -> FrameState {
    FrameState::from_u8(self.state.load(Ordering::Relaxed))
  }

  pub(crate) fn set_state(&self, s: FrameState) {
    self.state.store(s as u8, Ordering::Relaxed);
  }

  pub(crate) fn set_owner(&self, w: usize) {
    self.owner.store(w, Ordering::Relaxed);
  }

  pub(crate) fn owner(&self) -> usize {
    self.owner.load(Ordering::Relaxed)
  }

  pub(crate) fn add_child(&self) {
    self.children.fetch_add(1, Ordering::AcqRel);
  }

  /// Count one finished child; returns the number still outstanding.
  pub(crate) fn child_done(&self) -> usize {
    let prev = self.children.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "child_done without outstanding children");
    prev - 1
  }

  pub(crate) fn all_children_done(&self) -> bool {
    self.children.load(Ordering::Acquire) == 0
  }

  pub(crate) fn is_full(&self) -> bool {
    self.full.get().is_some()
  }

  pub(crate) fn ensure_full(&self) -> &FullFrame {
    self.full.get_or_init(|| {
      trace!("{:?} promoted to full", self);
      FullFrame {
        sync: Mutex::new(()),
      }
    })
  }
}

impl std::fmt::Debug for Frame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&format!("F({})", self.id))
  }
}

/// A ready-to-run task: a frame plus the job that executes its body, posts
/// the result and releases the argument dependencies.
pub(crate) struct Task {
  pub(crate) frame: Arc<Frame>,
  pub(crate) job: Box<dyn FnOnce() + Send + 'static>,
}

impl std::fmt::Debug for Task {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    self.frame.fmt(f)
  }
}

/// Gate between issuing a task's dependencies and running it.
///
/// Created with one blocked slot (the creation bias) so that the task cannot
/// be released while its arguments are still being issued. Every argument
/// that is not immediately ready adds one more. The holder that drops the
/// count to zero takes the parked task and is responsible for running or
/// scheduling it.
pub(crate) struct PendingGate {
  nblocked: AtomicUsize,
  slot: Mutex<Option<Task>>,
}

impl PendingGate {
  pub(crate) fn new() -> Arc<PendingGate> {
    Arc::new(PendingGate {
      nblocked: AtomicUsize::new(1),
      slot: Mutex::new(None),
    })
  }

  pub(crate) fn block(&self) {
    self.nblocked.fetch_add(1, Ordering::AcqRel);
  }

  pub(crate) fn park(&self, t: Task) {
    let mut slot = self.slot.lock().unwrap();
    debug_assert!(slot.is_none());
    *slot = Some(t);
  }

  pub(crate) fn unblock(&self) -> Option<Task> {
    if self.nblocked.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.slot.lock().unwrap().take()
    } else {
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn noop_task() -> Task {
    Task {
      frame: Arc::new(Frame::dummy()),
      job: Box::new(|| {}),
    }
  }

  #[test]
  fn child_counting() {
    let f = Frame::dummy();
    f.add_child();
    f.add_child();
    assert!(!f.all_children_done());
    assert_eq!(f.child_done(), 1);
    assert_eq!(f.child_done(), 0);
    assert!(f.all_children_done());
  }

  #[test]
  fn promotion_is_single_shot() {
    let f = Frame::dummy();
    assert!(!f.is_full());
    f.ensure_full();
    f.ensure_full();
    assert!(f.is_full());
  }

  #[test]
  fn gate_with_no_blockers_releases_at_bias_drop() {
    let g = PendingGate::new();
    g.park(noop_task());
    assert!(g.unblock().is_some());
  }

  #[test]
  fn gate_waits_for_all_blockers() {
    let g = PendingGate::new();
    g.block();
    g.park(noop_task());
    assert!(g.unblock().is_none()); // bias dropped, one dep outstanding
    assert!(g.unblock().is_some()); // dep released
  }
}
