// Segment chains and their O(1) concatenation.
//
// A chain is a (head, tail) pair over the linked list of segments. Either
// end may be absent: a view whose first segment was published upward keeps
// only the tail it is producing into, and the receiving side holds a
// head-only chain whose physical tail is still owned elsewhere. Reduction
// is pointer surgery on the boundary segments; the element order that comes
// out equals program textual order because chains are only ever appended in
// hypermap order.

use std::sync::Arc;

use super::segment::Segment;

pub(crate) struct SegChain<T> {
  pub(crate) head: Option<Arc<Segment<T>>>,
  pub(crate) tail: Option<Arc<Segment<T>>>,
}

impl<T> SegChain<T> {
  pub(crate) fn new() -> SegChain<T> {
    SegChain {
      head: None,
      tail: None,
    }
  }

  pub(crate) fn take(&mut self) -> SegChain<T> {
    std::mem::replace(self, SegChain::new())
  }

  /// Append `right`. When this chain is tail-less its physical end is owned
  /// by a still-producing view; in that case `right`'s head has already
  /// been linked behind it by an earlier publication and only the tail
  /// pointer moves over.
  pub(crate) fn reduce(&mut self, mut right: SegChain<T>) {
    if self.tail.is_none() {
      if self.head.is_none() {
        self.head = right.head.take();
      }
      self.tail = right.tail.take();
    } else if let Some(h) = right.head.take() {
      self.tail.as_ref().unwrap().set_next(h);
      self.tail = right.tail.take();
    } else {
      debug_assert!(right.tail.is_none());
    }
  }

  /// Receive the first segment of a view that is still producing: link it
  /// behind the current tail and leave the chain open.
  pub(crate) fn reduce_headonly(&mut self, h: Arc<Segment<T>>) {
    match self.tail.take() {
      Some(t) => t.set_next(h),
      None => {
        debug_assert!(self.head.is_none(), "open chain cannot take another head");
        self.head = Some(h);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn seg(vals: &[i32]) -> Arc<Segment<i32>> {
    let s = Segment::new(vals.len().max(1), 0, -1);
    for v in vals {
      s.push(*v);
    }
    s
  }

  fn drain(chain: &SegChain<i32>) -> Vec<i32> {
    let mut out = Vec::new();
    let mut cur = chain.head.clone();
    while let Some(s) = cur {
      for i in s.consumed()..s.produced() {
        out.push(unsafe { *s.slot(i) });
      }
      cur = s.next();
    }
    out
  }

  #[test]
  fn reduce_concatenates_closed_chains() {
    let mut a = SegChain::new();
    let s1 = seg(&[1, 2]);
    a.head = Some(s1.clone());
    a.tail = Some(s1);

    let mut b = SegChain::new();
    let s2 = seg(&[3]);
    b.head = Some(s2.clone());
    b.tail = Some(s2);

    a.reduce(b);
    assert_eq!(drain(&a), vec![1, 2, 3]);
    assert!(a.tail.is_some());
  }

  #[test]
  fn reduce_into_empty_takes_right() {
    let mut a = SegChain::new();
    let mut b = SegChain::new();
    let s = seg(&[7]);
    b.head = Some(s.clone());
    b.tail = Some(s);
    a.reduce(b);
    assert_eq!(drain(&a), vec![7]);
  }

  #[test]
  fn headonly_publication_links_and_opens() {
    let mut a = SegChain::new();
    let s1 = seg(&[1]);
    a.head = Some(s1.clone());
    a.tail = Some(s1.clone());

    let s2 = seg(&[2]);
    a.reduce_headonly(s2);
    assert!(a.tail.is_none());
    assert!(!s1.is_producing()); // linking retired the old tail
    assert_eq!(drain(&a), vec![1, 2]);

    // the producing view later closes: only the tail pointer moves
    let mut b = SegChain::new();
    b.tail = a.head.as_ref().unwrap().next();
    a.reduce(b);
    assert!(a.tail.is_some());
  }
}
