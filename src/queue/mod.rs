// Hyperqueues: typed concurrent FIFOs usable as dependency arguments.
//
// Producers run in parallel, each on a private view; hypermap reduction
// stitches their segment chains into program textual order. Pops are
// serialized in program order through the queue's tickets and observe the
// concatenation of all pushes. Pop, peek and empty spin until either data
// arrives or every producer has signed off.

pub(crate) mod segment;
pub(crate) mod segmented;
pub(crate) mod version;

use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam_utils::Backoff;

use crate::config::DEFAULT_SEGMENT;
use crate::obj::{DepArg, IssueCx, ReleaseCx};
use crate::worker::submit_ready;

use segment::Segment;
use version::{cursor_await, cursor_peek, root_of, Cursor, Probe, QueueVersion, ViewKind};

/// A typed concurrent FIFO. Clones share the queue.
pub struct Hyperqueue<T: Send + 'static> {
  root: Arc<QueueVersion<T>>,
}

impl<T: Send + 'static> Hyperqueue<T> {
  pub fn new() -> Hyperqueue<T> {
    Hyperqueue::with_config(DEFAULT_SEGMENT, 0)
  }

  /// Queue with explicit segment capacity and peek distance. Segments
  /// always reserve room for `peek_dist` elements.
  pub fn with_config(segment_size: usize, peek_dist: usize) -> Hyperqueue<T> {
    assert!(segment_size > 0, "segment size must be positive");
    Hyperqueue {
      root: QueueVersion::new_root(segment_size, peek_dist),
    }
  }

  pub fn peek_dist(&self) -> usize {
    self.root.rootstate().peek
  }

  /// True once every producer has signed off with nothing left to pop.
  /// Blocks while the answer is not yet provable.
  pub fn is_empty(&self) -> bool {
    let mut cur = self.root.probe_cursor();
    matches!(cursor_await(&self.root, &mut cur), Probe::End)
  }
}

impl<T: Send + 'static> Default for Hyperqueue<T> {
  fn default() -> Hyperqueue<T> {
    Hyperqueue::new()
  }
}

impl<T: Send + 'static> Clone for Hyperqueue<T> {
  fn clone(&self) -> Hyperqueue<T> {
    Hyperqueue {
      root: self.root.clone(),
    }
  }
}

// ---------------------------------------------------------------------------
// producer view

/// Producer end of a queue, private to one task.
pub struct PushView<T: Send + 'static> {
  node: Arc<QueueVersion<T>>,
}

impl<T: Send + 'static> PushView<T> {
  pub fn push(&mut self, value: T) {
    self.node.push_value(value);
  }

  /// Reserve `len` contiguous slots on the tail segment; the slice commits
  /// what was actually pushed when it drops.
  pub fn get_write_slice(&mut self, len: usize) -> WriteSlice<'_, T> {
    let (seg, start) = self.node.reserve(len);
    WriteSlice {
      node: self.node.clone(),
      seg,
      start,
      len,
      n: 0,
      _borrow: PhantomData,
    }
  }

  /// Producer annotation for a nested task, ordered under this view.
  pub fn dep(&self) -> PushDep<T> {
    PushDep {
      parent: self.node.clone(),
      node: None,
    }
  }
}

pub struct WriteSlice<'a, T: Send + 'static> {
  node: Arc<QueueVersion<T>>,
  seg: Arc<Segment<T>>,
  start: usize,
  len: usize,
  n: usize,
  _borrow: PhantomData<&'a mut ()>,
}

impl<'a, T: Send + 'static> WriteSlice<'a, T> {
  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Returns false once the slice is full.
  pub fn push(&mut self, value: T) -> bool {
    assert!(self.n < self.len, "write slice overflow");
    self.seg.write_at(self.start + self.n, value);
    self.n += 1;
    self.n < self.len
  }

  pub fn commit(self) {}
}

impl<'a, T: Send + 'static> Drop for WriteSlice<'a, T> {
  fn drop(&mut self) {
    self.seg.publish(self.start + self.n);
    self.node.push_bookkeeping(self.n);
  }
}

// ---------------------------------------------------------------------------
// consumer view

/// Consumer end of a queue; holds the shared pop cursor for the duration of
/// its pop ticket. Dropping the view (or exhausting a prefix budget)
/// releases the ticket so the next pop task in program order can start.
pub struct PopView<T: Send + 'static> {
  node: Arc<QueueVersion<T>>,
  root: Arc<QueueVersion<T>>,
  cur: Cursor<T>,
  remaining: i64, // prefix budget, -1 when unlimited
  _peeked: Option<Arc<Segment<T>>>,
}

impl<T: Send + 'static> PopView<T> {
  fn new(node: Arc<QueueVersion<T>>) -> PopView<T> {
    let root = root_of(&node);
    let cur = node.take_cursor();
    let remaining = node.budget;
    PopView {
      node,
      root,
      cur,
      remaining,
      _peeked: None,
    }
  }

  pub fn pop(&mut self) -> T {
    assert!(self.remaining != 0, "prefix view popped past its budget");
    match cursor_await(&self.root, &mut self.cur) {
      Probe::Data => {}
      Probe::End => panic!("pop from a finished empty hyperqueue"),
    }
    let seg = self.cur.seg.clone().unwrap();
    let v = seg.pop();
    self.cur.pos += 1;
    if self.remaining > 0 {
      self.remaining -= 1;
      if self.remaining == 0 {
        self.retire();
      }
    }
    v
  }

  /// The element that would be popped after `off` pops; spins until it is
  /// produced.
  pub fn peek(&mut self, off: usize) -> &T {
    let (seg, k) = cursor_peek(&self.root, &mut self.cur, off);
    let p = seg.slot(k);
    self._peeked = Some(seg);
    unsafe { &*p }
  }

  /// True once the stream has ended with nothing left for this view.
  pub fn empty(&mut self) -> bool {
    if self.remaining == 0 {
      return true;
    }
    matches!(cursor_await(&self.root, &mut self.cur), Probe::End)
  }

  /// Readable run of up to `max_pop` elements from the current segment;
  /// pops commit when the slice drops. At least `peek` elements beyond the
  /// remaining pops stay reachable through `ReadSlice::peek`, which crosses
  /// segment boundaries and waits for production when needed.
  pub fn get_read_slice_upto(&mut self, max_pop: usize, peek: usize) -> ReadSlice<'_, T> {
    let at_end = match cursor_await(&self.root, &mut self.cur) {
      Probe::Data => false,
      Probe::End => true,
    };
    if at_end {
      return ReadSlice {
        view: self,
        seg: None,
        start: 0,
        len: 0,
        npop: 0,
        npeek: 0,
        _peeked: None,
      };
    }
    let seg = self.cur.seg.clone().unwrap();
    let start = seg.consumed();
    let mut take = std::cmp::min(seg.produced() - start, max_pop);
    if self.remaining >= 0 {
      take = std::cmp::min(take, self.remaining as usize);
    }
    ReadSlice {
      view: self,
      seg: Some(seg),
      start,
      len: take,
      npop: 0,
      npeek: peek,
      _peeked: None,
    }
  }

  /// Consumer annotation for a nested task. Drop this view before syncing
  /// on such a task: the child's pop ticket comes after ours.
  pub fn dep(&self) -> PopDep<T> {
    PopDep {
      parent: self.node.clone(),
      node: None,
    }
  }

  fn retire(&mut self) {
    let woken = self.node.release_pop_ticket(&self.cur);
    submit_ready(woken);
  }
}

impl<T: Send + 'static> Drop for PopView<T> {
  fn drop(&mut self) {
    self.retire();
  }
}

pub struct ReadSlice<'a, T: Send + 'static> {
  view: &'a mut PopView<T>,
  seg: Option<Arc<Segment<T>>>,
  start: usize,
  len: usize,
  npop: usize,
  npeek: usize,
  _peeked: Option<Arc<Segment<T>>>,
}

impl<'a, T: Send + 'static> ReadSlice<'a, T> {
  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn pop(&mut self) -> T {
    assert!(self.npop < self.len, "read slice exhausted");
    let seg = self.seg.as_ref().unwrap();
    let v = seg.take_slot(self.start + self.npop);
    self.npop += 1;
    v
  }

  /// Element `off` places past the next pop. The window spans the
  /// remaining pops plus the slice's peek reservation; it follows the
  /// segment chain and waits for production when the element is not there
  /// yet.
  pub fn peek(&mut self, off: usize) -> &T {
    assert!(
      off < self.len - self.npop + self.npeek,
      "peek outside the slice's window"
    );
    let backoff = Backoff::new();
    let mut seg = self.seg.clone().expect("peek on an empty slice");
    let mut k = self.start + self.npop + off;
    loop {
      if k < seg.produced() {
        let p = seg.slot(k);
        self._peeked = Some(seg);
        return unsafe { &*p };
      }
      if let Some(next) = seg.next() {
        k -= seg.produced();
        seg = next;
        continue;
      }
      if seg.is_producing() {
        crate::worker::wait_tick(&backoff);
        continue;
      }
      panic!("peek past the end of a hyperqueue");
    }
  }
}

impl<'a, T: Send + 'static> Drop for ReadSlice<'a, T> {
  fn drop(&mut self) {
    if let Some(seg) = &self.seg {
      seg.advance(self.npop);
      self.view.cur.pos += self.npop as u64;
      if self.view.remaining > 0 {
        assert!(
          self.view.remaining >= self.npop as i64,
          "prefix view popped past its budget"
        );
        self.view.remaining -= self.npop as i64;
        if self.view.remaining == 0 {
          self.view.retire();
        }
      }
    }
  }
}

/// Fused producer and consumer, internal to one task.
pub struct PushPopView<T: Send + 'static> {
  inner: PopView<T>,
}

impl<T: Send + 'static> PushPopView<T> {
  pub fn push(&mut self, value: T) {
    self.inner.node.push_value(value);
  }

  pub fn pop(&mut self) -> T {
    self.inner.pop()
  }

  pub fn peek(&mut self, off: usize) -> &T {
    self.inner.peek(off)
  }

  pub fn empty(&mut self) -> bool {
    self.inner.empty()
  }
}

// ---------------------------------------------------------------------------
// dependency requests

macro_rules! queue_dep {
  ($(#[$doc:meta])* $name:ident) => {
    $(#[$doc])*
    pub struct $name<T: Send + 'static> {
      parent: Arc<QueueVersion<T>>,
      node: Option<Arc<QueueVersion<T>>>,
    }
  };
}

queue_dep! {
  /// Producer annotation: the task may push; peers run in parallel and
  /// their output is concatenated in program order.
  PushDep
}
queue_dep! {
  /// Consumer annotation: the task pops; pops serialize in program order
  /// across the whole computation.
  PopDep
}
queue_dep! {
  /// Fused producer/consumer annotation.
  PushPopDep
}
/// Consumer annotation restricted to the first `n` remaining elements; the
/// pop ticket is released after exactly `n` pops or when the view goes
/// away.
pub struct PrefixDep<T: Send + 'static> {
  parent: Arc<QueueVersion<T>>,
  node: Option<Arc<QueueVersion<T>>>,
  budget: i64,
}

/// Producer annotation with a push budget of `n`.
pub struct SuffixDep<T: Send + 'static> {
  parent: Arc<QueueVersion<T>>,
  node: Option<Arc<QueueVersion<T>>>,
  budget: i64,
}

pub fn pushdep<T: Send + 'static>(q: &Hyperqueue<T>) -> PushDep<T> {
  PushDep {
    parent: q.root.clone(),
    node: None,
  }
}

pub fn popdep<T: Send + 'static>(q: &Hyperqueue<T>) -> PopDep<T> {
  PopDep {
    parent: q.root.clone(),
    node: None,
  }
}

pub fn pushpopdep<T: Send + 'static>(q: &Hyperqueue<T>) -> PushPopDep<T> {
  PushPopDep {
    parent: q.root.clone(),
    node: None,
  }
}

pub fn prefixdep<T: Send + 'static>(q: &Hyperqueue<T>, n: usize) -> PrefixDep<T> {
  PrefixDep {
    parent: q.root.clone(),
    node: None,
    budget: n as i64,
  }
}

pub fn suffixdep<T: Send + 'static>(q: &Hyperqueue<T>, n: usize) -> SuffixDep<T> {
  SuffixDep {
    parent: q.root.clone(),
    node: None,
    budget: n as i64,
  }
}

impl<T: Send + 'static> DepArg for PushDep<T> {
  type View = PushView<T>;

  fn issue(&mut self, cx: &mut IssueCx<'_>) {
    self.node = Some(QueueVersion::nest(&self.parent, ViewKind::Push, -1, cx.gate));
  }

  fn make_view(&mut self) -> PushView<T> {
    PushView {
      node: self.node.clone().unwrap(),
    }
  }

  fn release(&mut self, _cx: &mut ReleaseCx) {
    self.node.take().unwrap().release_view();
  }
}

impl<T: Send + 'static> DepArg for PopDep<T> {
  type View = PopView<T>;

  fn issue(&mut self, cx: &mut IssueCx<'_>) {
    self.node = Some(QueueVersion::nest(&self.parent, ViewKind::Pop, -1, cx.gate));
  }

  fn make_view(&mut self) -> PopView<T> {
    PopView::new(self.node.clone().unwrap())
  }

  fn release(&mut self, _cx: &mut ReleaseCx) {
    self.node.take().unwrap().release_view();
  }
}

impl<T: Send + 'static> DepArg for PushPopDep<T> {
  type View = PushPopView<T>;

  fn issue(&mut self, cx: &mut IssueCx<'_>) {
    self.node = Some(QueueVersion::nest(
      &self.parent,
      ViewKind::PushPop,
      -1,
      cx.gate,
    ));
  }

  fn make_view(&mut self) -> PushPopView<T> {
    PushPopView {
      inner: PopView::new(self.node.clone().unwrap()),
    }
  }

  fn release(&mut self, _cx: &mut ReleaseCx) {
    self.node.take().unwrap().release_view();
  }
}

impl<T: Send + 'static> DepArg for PrefixDep<T> {
  type View = PopView<T>;

  fn issue(&mut self, cx: &mut IssueCx<'_>) {
    self.node = Some(QueueVersion::nest(
      &self.parent,
      ViewKind::Prefix,
      self.budget,
      cx.gate,
    ));
  }

  fn make_view(&mut self) -> PopView<T> {
    PopView::new(self.node.clone().unwrap())
  }

  fn release(&mut self, _cx: &mut ReleaseCx) {
    self.node.take().unwrap().release_view();
  }
}

impl<T: Send + 'static> DepArg for SuffixDep<T> {
  type View = PushView<T>;

  fn issue(&mut self, cx: &mut IssueCx<'_>) {
    self.node = Some(QueueVersion::nest(
      &self.parent,
      ViewKind::Suffix,
      self.budget,
      cx.gate,
    ));
  }

  fn make_view(&mut self) -> PushView<T> {
    PushView {
      node: self.node.clone().unwrap(),
    }
  }

  fn release(&mut self, _cx: &mut ReleaseCx) {
    self.node.take().unwrap().release_view();
  }
}
