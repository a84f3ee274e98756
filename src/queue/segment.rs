// Fixed-capacity queue segment.
//
// Slots are written once by a single producer view and consumed once, in
// order, by the serialized consumer side. Indices only grow; a drained
// segment is replaced by its successor rather than recycled, which keeps
// peeked elements addressable until the whole segment is gone.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;

pub(crate) struct Segment<T> {
  base: AtomicI64, // logical index of slot 0, -1 when unknown
  cap: usize,
  buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
  // producer and consumer indices live on their own cache lines
  produced: CachePadded<AtomicUsize>,
  consumed: CachePadded<AtomicUsize>,
  producing: AtomicBool,
  next: Mutex<Option<Arc<Segment<T>>>>,
}

unsafe impl<T: Send> Send for Segment<T> {}
unsafe impl<T: Send> Sync for Segment<T> {}

impl<T> Segment<T> {
  /// A fresh producing segment. Capacity reserves at least the peek
  /// distance plus one so a consumer can always peek that far without
  /// overrunning the stream.
  pub(crate) fn new(cap: usize, peek: usize, base: i64) -> Arc<Segment<T>> {
    let cap = std::cmp::max(cap, peek + 1);
    Arc::new(Segment {
      base: AtomicI64::new(base),
      cap,
      buf: (0..cap)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice(),
      produced: CachePadded::new(AtomicUsize::new(0)),
      consumed: CachePadded::new(AtomicUsize::new(0)),
      producing: AtomicBool::new(true),
      next: Mutex::new(None),
    })
  }

  pub(crate) fn base(&self) -> i64 {
    self.base.load(Ordering::Relaxed)
  }

  pub(crate) fn produced(&self) -> usize {
    self.produced.load(Ordering::Acquire)
  }

  pub(crate) fn consumed(&self) -> usize {
    self.consumed.load(Ordering::Relaxed)
  }

  pub(crate) fn is_full(&self) -> bool {
    self.produced.load(Ordering::Relaxed) == self.cap
  }

  pub(crate) fn has_space(&self, len: usize) -> bool {
    self.cap - self.produced.load(Ordering::Relaxed) >= len
  }

  pub(crate) fn is_producing(&self) -> bool {
    self.producing.load(Ordering::Acquire)
  }

  pub(crate) fn set_producing(&self) {
    self.producing.store(true, Ordering::Release);
  }

  pub(crate) fn clr_producing(&self) {
    self.producing.store(false, Ordering::Release);
  }

  pub(crate) fn next(&self) -> Option<Arc<Segment<T>>> {
    self.next.lock().unwrap().clone()
  }

  /// Link the successor. A segment with a successor is definitively closed,
  /// so the producing flag drops with the same store.
  pub(crate) fn set_next(&self, seg: Arc<Segment<T>>) {
    let mut next = self.next.lock().unwrap();
    debug_assert!(next.is_none(), "segment successor linked twice");
    *next = Some(seg);
    drop(next);
    self.clr_producing();
  }

  // producer side

  pub(crate) fn push(&self, value: T) {
    let t = self.produced.load(Ordering::Relaxed);
    assert!(t < self.cap, "push on a full segment");
    unsafe {
      (*self.buf[t].get()).as_mut_ptr().write(value);
    }
    self.produced.store(t + 1, Ordering::Release);
  }

  /// Write a reserved slot without publishing it; paired with `publish`.
  pub(crate) fn write_at(&self, i: usize, value: T) {
    debug_assert!(i < self.cap);
    unsafe {
      (*self.buf[i].get()).as_mut_ptr().write(value);
    }
  }

  pub(crate) fn publish(&self, upto: usize) {
    debug_assert!(upto >= self.produced.load(Ordering::Relaxed));
    self.produced.store(upto, Ordering::Release);
  }

  // consumer side, one consumer at a time

  pub(crate) fn pop(&self) -> T {
    let h = self.consumed.load(Ordering::Relaxed);
    debug_assert!(h < self.produced());
    let v = unsafe { (*self.buf[h].get()).as_ptr().read() };
    self.consumed.store(h + 1, Ordering::Release);
    v
  }

  /// Read a produced slot without consuming it.
  pub(crate) fn slot(&self, i: usize) -> *const T {
    debug_assert!(i < self.produced());
    unsafe { (*self.buf[i].get()).as_ptr() }
  }

  /// Move a produced slot out without touching the consumed index; the
  /// caller advances it afterwards with `advance`.
  pub(crate) fn take_slot(&self, i: usize) -> T {
    debug_assert!(i >= self.consumed() && i < self.produced());
    unsafe { (*self.buf[i].get()).as_ptr().read() }
  }

  pub(crate) fn advance(&self, n: usize) {
    let h = self.consumed.load(Ordering::Relaxed);
    debug_assert!(h + n <= self.produced());
    self.consumed.store(h + n, Ordering::Release);
  }
}

impl<T> Drop for Segment<T> {
  fn drop(&mut self) {
    let h = self.consumed.load(Ordering::Relaxed);
    let t = self.produced.load(Ordering::Relaxed);
    for i in h..t {
      unsafe {
        std::ptr::drop_in_place((*self.buf[i].get()).as_mut_ptr());
      }
    }
  }
}
