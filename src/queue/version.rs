// Hypermap nodes and the shared queue state.
//
// Every queue argument gets its own node linked under the spawning task's
// node in issue order. A node carries three chains: `user` is what the view
// itself produced, `children` accumulates finished child contributions,
// `right` collects what finished right siblings handed over early. When a
// task finishes, children ∘ user ∘ right is folded and moved to the left
// sibling's `right` map, or to the parent's `children` when the node is the
// oldest survivor. The producing bit of a merged tail clears only after the
// merge has linked everything that precedes end-of-stream.
//
// The root node additionally owns the pop tickets (pops are serialized in
// program order), the shared pop cursor, and the index from known logical
// positions to segments, which lets a consumer find its first segment even
// when producers run out of program order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::Backoff;

use crate::frame::{PendingGate, Task};

use super::segment::Segment;
use super::segmented::SegChain;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ViewKind {
  Root,
  Push,
  Pop,
  PushPop,
  Prefix,
  Suffix,
}

impl ViewKind {
  pub(crate) fn pushes(self) -> bool {
    matches!(self, ViewKind::Push | ViewKind::PushPop | ViewKind::Suffix)
  }

  pub(crate) fn pops(self) -> bool {
    matches!(self, ViewKind::Pop | ViewKind::PushPop | ViewKind::Prefix)
  }
}

struct QvInner<T> {
  user: SegChain<T>,
  children: SegChain<T>,
  right: SegChain<T>,
  fleft: Option<Arc<QueueVersion<T>>>,
  fright: Option<Arc<QueueVersion<T>>>,
  chead: Option<Arc<QueueVersion<T>>>,
  ctail: Option<Arc<QueueVersion<T>>>,
  // producer-local bookkeeping
  ltail: i64, // logical position of this view's first push, -1 when unknown
  npushed: usize,
  published: bool, // the view's first segment has been handed up already
}

impl<T> QvInner<T> {
  fn new(ltail: i64) -> QvInner<T> {
    QvInner {
      user: SegChain::new(),
      children: SegChain::new(),
      right: SegChain::new(),
      fleft: None,
      fright: None,
      chead: None,
      ctail: None,
      ltail,
      npushed: 0,
      published: false,
    }
  }
}

pub(crate) struct Cursor<T> {
  pub(crate) seg: Option<Arc<Segment<T>>>,
  pub(crate) pos: u64,
}

struct QTickets {
  pop: u64,
  pop_done: u64,
  waiters: VecDeque<(u64, Arc<PendingGate>)>,
}

pub(crate) struct RootState<T> {
  pub(crate) seg_cap: usize,
  pub(crate) peek: usize,
  tickets: Mutex<QTickets>,
  index: Mutex<BTreeMap<i64, Arc<Segment<T>>>>,
  cursor: Mutex<Cursor<T>>,
  push_views: AtomicUsize,
}

pub(crate) struct QueueVersion<T> {
  pub(crate) kind: ViewKind,
  pub(crate) parent: Option<Arc<QueueVersion<T>>>,
  pub(crate) budget: i64, // fixed length of prefix/suffix views, -1 otherwise
  ticket_done: AtomicBool,
  inner: Mutex<QvInner<T>>,
  root: Option<RootState<T>>,
}

pub(crate) fn root_of<T>(node: &Arc<QueueVersion<T>>) -> Arc<QueueVersion<T>> {
  let mut n = node.clone();
  loop {
    let p = match &n.parent {
      Some(p) => p.clone(),
      None => return n,
    };
    n = p;
  }
}

pub(crate) enum Probe {
  Data,
  End,
}

impl<T: Send + 'static> QueueVersion<T> {
  pub(crate) fn new_root(seg_cap: usize, peek: usize) -> Arc<QueueVersion<T>> {
    Arc::new(QueueVersion {
      kind: ViewKind::Root,
      parent: None,
      budget: -1,
      ticket_done: AtomicBool::new(true),
      inner: Mutex::new(QvInner::new(0)),
      root: Some(RootState {
        seg_cap,
        peek,
        tickets: Mutex::new(QTickets {
          pop: 0,
          pop_done: 0,
          waiters: VecDeque::new(),
        }),
        index: Mutex::new(BTreeMap::new()),
        cursor: Mutex::new(Cursor { seg: None, pos: 0 }),
        push_views: AtomicUsize::new(0),
      }),
    })
  }

  pub(crate) fn rootstate(&self) -> &RootState<T> {
    self.root.as_ref().expect("not the root queue node")
  }

  /// The root node, reached through the parent chain. Views always have an
  /// ancestor; the root itself never produces or consumes.
  fn root_arc(&self) -> Arc<QueueVersion<T>> {
    let mut n = self.parent.clone().expect("root node used as a view");
    loop {
      let p = match &n.parent {
        Some(p) => p.clone(),
        None => return n,
      };
      n = p;
    }
  }

  /// Snapshot of the shared pop cursor for non-destructive probing.
  pub(crate) fn probe_cursor(&self) -> Cursor<T> {
    let rs = self.rootstate();
    let c = rs.cursor.lock().unwrap();
    Cursor {
      seg: c.seg.clone(),
      pos: c.pos,
    }
  }

  /// Create and link a child view at issue time, in program order.
  pub(crate) fn nest(
    parent: &Arc<QueueVersion<T>>,
    kind: ViewKind,
    budget: i64,
    gate: &Arc<PendingGate>,
  ) -> Arc<QueueVersion<T>> {
    let root = root_of(parent);
    let rs = root.rootstate();

    let child = Arc::new(QueueVersion {
      kind,
      parent: Some(parent.clone()),
      budget,
      ticket_done: AtomicBool::new(!kind.pops()),
      inner: Mutex::new(QvInner::new(-1)),
      root: None,
    });

    if kind.pops() {
      // pops are fully serialized: this view runs after all earlier pops
      let mut t = rs.tickets.lock().unwrap();
      let ticket = t.pop;
      t.pop += 1;
      if t.pop_done < ticket {
        gate.block();
        t.waiters.push_back((ticket, gate.clone()));
      }
    }
    if kind.pushes() {
      rs.push_views.fetch_add(1, Ordering::AcqRel);
    }

    let mut p = parent.inner.lock().unwrap();
    {
      let mut c = child.inner.lock().unwrap();
      if kind.pushes() {
        // the child continues the parent's physical chain; its tail is
        // producing again until the child signs off
        c.user = p.user.take();
        if let Some(t) = &c.user.tail {
          t.set_producing();
        }
        // an inherited chain's head already travelled up, the child must
        // not publish a second one
        c.published = c.user.tail.is_some();
        c.ltail = if p.ltail >= 0 {
          p.ltail + p.npushed as i64
        } else {
          -1
        };
        if kind == ViewKind::Suffix {
          if p.ltail >= 0 {
            p.ltail += p.npushed as i64 + budget;
            p.npushed = 0;
          }
        } else {
          p.ltail = -1;
        }
      }
      c.fleft = p.ctail.clone();
    }
    match p.ctail.clone() {
      Some(prev) => {
        prev.inner.lock().unwrap().fright = Some(child.clone());
        p.ctail = Some(child.clone());
      }
      None => {
        p.chead = Some(child.clone());
        p.ctail = Some(child.clone());
      }
    }
    child
  }

  // -------------------------------------------------------------------
  // producer side

  fn alloc_segment(&self, min_room: usize) -> Arc<Segment<T>> {
    let root = self.root_arc();
    let rs = root.rootstate();
    let mut me = self.inner.lock().unwrap();
    let base = if me.ltail >= 0 {
      me.ltail + me.npushed as i64
    } else {
      -1
    };
    let seg = Segment::new(std::cmp::max(rs.seg_cap, min_room), rs.peek, base);
    if base >= 0 {
      rs.index.lock().unwrap().insert(base, seg.clone());
    }
    match me.user.tail.clone() {
      Some(t) => {
        t.set_next(seg.clone());
        me.user.tail = Some(seg.clone());
      }
      None if me.published => {
        // a child took the first chain; later pushes start a fresh one
        // that travels up in hypermap order at release
        me.user.head = Some(seg.clone());
        me.user.tail = Some(seg.clone());
      }
      None => {
        me.published = true;
        me.user.tail = Some(seg.clone());
        drop(me);
        // the view's first segment: hand its head to whoever precedes us
        self.push_head(seg.clone());
      }
    }
    seg
  }

  /// Publish the first segment of this view so consumers can reach it: to
  /// the left sibling's `right` map, or to the parent's `children` when
  /// there is no older live sibling.
  fn push_head(&self, seg: Arc<Segment<T>>) {
    let parent = self
      .parent
      .clone()
      .expect("push on the root queue node");
    let mut p = parent.inner.lock().unwrap();
    let fleft = self.inner.lock().unwrap().fleft.clone();
    match fleft {
      Some(left) => left.inner.lock().unwrap().right.reduce_headonly(seg),
      None => p.children.reduce_headonly(seg),
    }
  }

  pub(crate) fn push_value(&self, value: T) {
    debug_assert!(self.kind.pushes());
    if self.budget >= 0 {
      let me = self.inner.lock().unwrap();
      assert!(
        (me.npushed as i64) < self.budget,
        "suffix view pushed past its budget"
      );
    }
    let tail = {
      let me = self.inner.lock().unwrap();
      me.user.tail.clone()
    };
    let tail = match tail {
      Some(t) if !t.is_full() => t,
      _ => self.alloc_segment(1),
    };
    tail.push(value);
    self.inner.lock().unwrap().npushed += 1;
  }

  /// Reserve `len` contiguous slots on the tail segment, allocating a new
  /// one when the current tail lacks the room.
  pub(crate) fn reserve(&self, len: usize) -> (Arc<Segment<T>>, usize) {
    debug_assert!(self.kind.pushes());
    let tail = {
      let me = self.inner.lock().unwrap();
      me.user.tail.clone()
    };
    let tail = match tail {
      Some(t) if t.has_space(len) => t,
      _ => self.alloc_segment(len),
    };
    let start = tail.produced();
    (tail, start)
  }

  pub(crate) fn push_bookkeeping(&self, npush: usize) {
    let mut me = self.inner.lock().unwrap();
    me.npushed += npush;
    if self.budget >= 0 {
      assert!(
        me.npushed as i64 <= self.budget,
        "suffix view pushed past its budget"
      );
    }
  }

  // -------------------------------------------------------------------
  // consumer side

  /// Take the shared pop cursor; only the holder of the pop ticket calls
  /// this, so the placeholder left behind is never observed.
  pub(crate) fn take_cursor(&self) -> Cursor<T> {
    let root = self.root_arc();
    let rs = root.rootstate();
    let mut c = rs.cursor.lock().unwrap();
    std::mem::replace(&mut *c, Cursor { seg: None, pos: 0 })
  }

  /// Put the cursor back and retire this view's pop ticket, waking the next
  /// pop in program order. Idempotent.
  pub(crate) fn release_pop_ticket(&self, cur: &Cursor<T>) -> Vec<Task> {
    if self.ticket_done.swap(true, Ordering::AcqRel) {
      return Vec::new();
    }
    let root = self.root_arc();
    let rs = root.rootstate();
    {
      let mut c = rs.cursor.lock().unwrap();
      c.seg = cur.seg.clone();
      c.pos = cur.pos;
    }
    let mut t = rs.tickets.lock().unwrap();
    t.pop_done += 1;
    let mut out = Vec::new();
    while let Some((ticket, _)) = t.waiters.front() {
      if *ticket > t.pop_done {
        break;
      }
      let (_, gate) = t.waiters.pop_front().unwrap();
      if let Some(task) = gate.unblock() {
        out.push(task);
      }
    }
    out
  }

  // -------------------------------------------------------------------
  // completion

  /// Fold this view's hypermap and hand the result to the left sibling or
  /// the parent, then unlink. Called once, when the owning task finishes.
  pub(crate) fn reduce_hypermaps(&self) {
    let parent = match &self.parent {
      Some(p) => p.clone(),
      None => return,
    };
    let mut p = parent.inner.lock().unwrap();

    let (mut merged, fleft, fright) = {
      let mut me = self.inner.lock().unwrap();
      let right = me.right.take();
      let mut user = me.user.take();
      user.reduce(right);
      let mut merged = me.children.take();
      merged.reduce(user);
      (merged, me.fleft.take(), me.fright.take())
    };

    match &fleft {
      Some(left) => {
        let mut l = left.inner.lock().unwrap();
        l.right.reduce(merged.take());
      }
      None => p.children.reduce(merged.take()),
    }

    // unlink from the sibling list
    match &fleft {
      Some(left) => left.inner.lock().unwrap().fright = fright.clone(),
      None => p.chead = fright.clone(),
    }
    match &fright {
      Some(right) => right.inner.lock().unwrap().fleft = fleft.clone(),
      None => p.ctail = fleft.clone(),
    }
  }

  /// Completion bookkeeping shared by all view kinds.
  pub(crate) fn release_view(&self) {
    self.reduce_hypermaps();
    if self.kind.pushes() {
      let root = self.root_arc();
      let rs = root.rootstate();
      if rs.push_views.fetch_sub(1, Ordering::AcqRel) == 1 {
        // last producer signed off: the stream tail is final
        let r = root.inner.lock().unwrap();
        if let Some(t) = r.children.tail.as_ref().or_else(|| r.user.tail.as_ref()) {
          t.clr_producing();
        }
      }
    }
  }
}

// ---------------------------------------------------------------------------
// cursor movement

/// Find the segment covering `pos`, preferring the index and falling back
/// to the head of the root's accumulated chain.
fn locate<T: Send + 'static>(
  root: &Arc<QueueVersion<T>>,
  pos: u64,
) -> Option<Arc<Segment<T>>> {
  let rs = root.rootstate();
  let hit = rs
    .index
    .lock()
    .unwrap()
    .range(..=(pos as i64))
    .next_back()
    .map(|(_, s)| s.clone());
  hit.or_else(|| root.inner.lock().unwrap().children.head.clone())
}

/// Advance the cursor to the next element, spinning while producers are
/// still at work. `Probe::End` is definitive: every producer has signed off
/// and nothing is left.
pub(crate) fn cursor_await<T: Send + 'static>(
  root: &Arc<QueueVersion<T>>,
  cur: &mut Cursor<T>,
) -> Probe {
  let rs = root.rootstate();
  let backoff = Backoff::new();
  loop {
    let seg = match &cur.seg {
      Some(s) => s.clone(),
      None => match locate(root, cur.pos) {
        Some(s) => {
          cur.seg = Some(s.clone());
          s
        }
        None => {
          if rs.push_views.load(Ordering::Acquire) == 0 {
            // recheck: the last producer publishes before signing off
            match locate(root, cur.pos) {
              Some(s) => {
                cur.seg = Some(s.clone());
                s
              }
              None => return Probe::End,
            }
          } else {
            crate::worker::wait_tick(&backoff);
            continue;
          }
        }
      },
    };

    if seg.consumed() < seg.produced() {
      return Probe::Data;
    }
    if let Some(next) = seg.next() {
      if seg.base() >= 0 {
        rs.index.lock().unwrap().remove(&seg.base());
      }
      cur.seg = Some(next);
      continue;
    }
    if seg.is_producing() {
      crate::worker::wait_tick(&backoff);
      continue;
    }
    // closed, drained, unlinked: a producer at a known position may still
    // continue the stream (suffix views run out of program order)
    let jump = rs
      .index
      .lock()
      .unwrap()
      .range((cur.pos as i64)..)
      .next()
      .map(|(_, s)| s.clone());
    if let Some(s) = jump {
      if s.base() == cur.pos as i64 {
        cur.seg = Some(s);
        continue;
      }
    }
    if rs.push_views.load(Ordering::Acquire) > 0 {
      crate::worker::wait_tick(&backoff);
      continue;
    }
    return Probe::End;
  }
}

/// Address of the element `off` places past the cursor, crossing segment
/// boundaries; spins until it is produced. The returned segment keeps the
/// slot alive.
pub(crate) fn cursor_peek<T: Send + 'static>(
  root: &Arc<QueueVersion<T>>,
  cur: &mut Cursor<T>,
  off: usize,
) -> (Arc<Segment<T>>, usize) {
  let backoff = Backoff::new();
  match cursor_await(root, cur) {
    Probe::Data => {}
    Probe::End => panic!("peek past the end of a hyperqueue"),
  }
  let mut seg = cur.seg.clone().unwrap();
  let mut k = seg.consumed() + off;
  loop {
    if k < seg.produced() {
      return (seg, k);
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

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{Frame, FrameState};

  fn gate() -> Arc<PendingGate> {
    let g = PendingGate::new();
    g.park(Task {
      frame: Arc::new(Frame::new(None, false, FrameState::Pending)),
      job: Box::new(|| {}),
    });
    g
  }

  #[test]
  fn pops_serialize_in_issue_order() {
    let root = QueueVersion::<i32>::new_root(8, 0);
    let g1 = gate();
    let g2 = gate();
    let p1 = QueueVersion::nest(&root, ViewKind::Pop, -1, &g1);
    let p2 = QueueVersion::nest(&root, ViewKind::Pop, -1, &g2);
    assert!(g1.unblock().is_some());
    assert!(g2.unblock().is_none());

    let cur = p1.take_cursor();
    let woken = p1.release_pop_ticket(&cur);
    assert_eq!(woken.len(), 1);
    let cur = p2.take_cursor();
    assert!(p2.release_pop_ticket(&cur).is_empty());
  }

  #[test]
  fn single_producer_stream_is_consumable() {
    let root = QueueVersion::<i32>::new_root(2, 0);
    let g = gate();
    let p = QueueVersion::nest(&root, ViewKind::Push, -1, &g);
    assert!(g.unblock().is_some());
    for i in 0..5 {
      p.push_value(i);
    }
    p.release_view();

    let mut cur = Cursor { seg: None, pos: 0 };
    for i in 0..5 {
      match cursor_await(&root, &mut cur) {
        Probe::Data => {}
        Probe::End => panic!("stream ended early"),
      }
      let seg = cur.seg.clone().unwrap();
      assert_eq!(seg.pop(), i);
      cur.pos += 1;
    }
    match cursor_await(&root, &mut cur) {
      Probe::End => {}
      Probe::Data => panic!("expected end of stream"),
    }
  }

  #[test]
  fn sibling_contributions_concatenate_in_program_order() {
    let root = QueueVersion::<i32>::new_root(4, 0);
    let g1 = gate();
    let g2 = gate();
    let p1 = QueueVersion::nest(&root, ViewKind::Push, -1, &g1);
    let p2 = QueueVersion::nest(&root, ViewKind::Push, -1, &g2);

    // the right sibling produces and finishes first
    p2.push_value(10);
    p2.push_value(11);
    p2.release_view();
    p1.push_value(1);
    p1.release_view();

    let mut cur = Cursor { seg: None, pos: 0 };
    let mut got = Vec::new();
    loop {
      match cursor_await(&root, &mut cur) {
        Probe::Data => {
          let seg = cur.seg.clone().unwrap();
          got.push(seg.pop());
          cur.pos += 1;
        }
        Probe::End => break,
      }
    }
    assert_eq!(got, vec![1, 10, 11]);
  }

  #[test]
  fn empty_stream_ends_after_producers_sign_off() {
    let root = QueueVersion::<i32>::new_root(4, 0);
    let g = gate();
    let p = QueueVersion::nest(&root, ViewKind::Push, -1, &g);
    p.release_view();
    let mut cur = Cursor { seg: None, pos: 0 };
    match cursor_await(&root, &mut cur) {
      Probe::End => {}
      Probe::Data => panic!("nothing was pushed"),
    }
  }
}
