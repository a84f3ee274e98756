// Hyperqueue streaming: FIFO order across parallel producers, serialized
// consumers, peeking, prefix/suffix views and slices.

use cygnet::{
  popdep, prefixdep, pushdep, pushpopdep, run, spawn, ssync, suffixdep, Hyperqueue,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn single_producer_single_consumer_fifo() {
  let q = Hyperqueue::<i32>::new();
  let qp = q.clone();
  run(move || {
    spawn((pushdep(&qp),), |(mut p,)| {
      for i in 0..1000 {
        p.push(i);
      }
    });
    spawn((popdep(&qp),), |(mut c,)| {
      for i in 0..1000 {
        assert_eq!(c.pop(), i);
      }
    });
    ssync();
  });
  assert!(q.is_empty());
}

#[test]
fn four_producers_two_consumers_concatenate_in_program_order() {
  const PER: usize = 4096;
  let q = Hyperqueue::<usize>::with_config(256, 0);
  let got = Arc::new(Mutex::new(Vec::new()));

  let qp = q.clone();
  let g = got.clone();
  run(move || {
    for p in 0..4 {
      let lo = p * PER;
      spawn((pushdep(&qp),), move |(mut v,)| {
        for i in lo..lo + PER {
          v.push(i);
        }
      });
    }
    for _ in 0..2 {
      let g = g.clone();
      spawn((popdep(&qp),), move |(mut v,)| {
        let mut local = Vec::with_capacity(2 * PER);
        for _ in 0..2 * PER {
          local.push(v.pop());
        }
        g.lock().unwrap().extend(local);
      });
    }
    ssync();
  });

  let got = got.lock().unwrap();
  assert_eq!(got.len(), 4 * PER);
  for (i, v) in got.iter().enumerate() {
    assert_eq!(*v, i);
  }
  assert!(q.is_empty());
}

#[test]
fn peek_distance_sees_the_element_k_pops_ahead() {
  const N: usize = 50;
  const PEEK: usize = 3;
  let q = Hyperqueue::<usize>::with_config(10, PEEK);
  assert_eq!(q.peek_dist(), PEEK);

  let qp = q.clone();
  run(move || {
    spawn((pushdep(&qp),), |(mut p,)| {
      for i in 0..N + PEEK {
        p.push(i);
      }
    });
    spawn((popdep(&qp),), |(mut c,)| {
      for i in 0..N {
        for j in 0..PEEK {
          assert_eq!(*c.peek(j), i + j);
        }
        assert_eq!(c.pop(), i);
      }
    });
    ssync();
  });
}

#[test]
fn empty_is_provable_after_producers_sign_off() {
  let q = Hyperqueue::<u8>::new();
  let qp = q.clone();
  run(move || {
    spawn((pushdep(&qp),), |(_p,)| {
      // produces nothing
    });
    spawn((popdep(&qp),), |(mut c,)| {
      assert!(c.empty());
    });
    ssync();
  });
  assert!(q.is_empty());
}

#[test]
fn prefix_view_with_a_short_stream_drains_and_ends() {
  let q = Hyperqueue::<u32>::new();
  let qp = q.clone();
  run(move || {
    spawn((pushdep(&qp),), |(mut p,)| {
      for i in 0..5 {
        p.push(i);
      }
    });
    spawn((prefixdep(&qp, 10),), |(mut c,)| {
      let mut got = Vec::new();
      while !c.empty() {
        got.push(c.pop());
      }
      assert_eq!(got, vec![0, 1, 2, 3, 4]);
    });
    ssync();
  });
}

#[test]
fn prefix_views_split_the_stream_at_their_budgets() {
  let q = Hyperqueue::<usize>::with_config(16, 0);
  let first = Arc::new(Mutex::new(Vec::new()));
  let second = Arc::new(Mutex::new(Vec::new()));

  let qp = q.clone();
  let (f, s) = (first.clone(), second.clone());
  run(move || {
    spawn((pushdep(&qp),), |(mut p,)| {
      for i in 0..64 {
        p.push(i);
      }
    });
    let f = f.clone();
    spawn((prefixdep(&qp, 24),), move |(mut c,)| {
      for _ in 0..24 {
        f.lock().unwrap().push(c.pop());
      }
    });
    let s = s.clone();
    spawn((popdep(&qp),), move |(mut c,)| {
      for _ in 0..40 {
        s.lock().unwrap().push(c.pop());
      }
    });
    ssync();
  });

  assert_eq!(*first.lock().unwrap(), (0..24).collect::<Vec<_>>());
  assert_eq!(*second.lock().unwrap(), (24..64).collect::<Vec<_>>());
}

#[test]
fn suffix_views_produce_at_known_positions() {
  const PER: usize = 100;
  let q = Hyperqueue::<usize>::with_config(32, 0);
  let qp = q.clone();
  run(move || {
    for p in 0..3 {
      let lo = p * PER;
      spawn((suffixdep(&qp, PER),), move |(mut v,)| {
        for i in lo..lo + PER {
          v.push(i);
        }
      });
    }
    spawn((popdep(&qp),), |(mut c,)| {
      for i in 0..3 * PER {
        assert_eq!(c.pop(), i);
      }
    });
    ssync();
  });
}

#[test]
fn write_and_read_slices_move_batches() {
  const N: usize = 300;
  let q = Hyperqueue::<usize>::with_config(128, 0);
  let qp = q.clone();
  run(move || {
    spawn((pushdep(&qp),), |(mut p,)| {
      let mut next = 0;
      while next < N {
        let want = std::cmp::min(100, N - next);
        let mut slice = p.get_write_slice(want);
        for _ in 0..want {
          slice.push(next);
          next += 1;
        }
        slice.commit();
      }
    });
    spawn((popdep(&qp),), |(mut c,)| {
      let mut seen = 0;
      while seen < N {
        let mut slice = c.get_read_slice_upto(64, 0);
        let n = slice.len();
        for _ in 0..n {
          assert_eq!(slice.pop(), seen);
          seen += 1;
        }
      }
    });
    ssync();
  });
  assert!(q.is_empty());
}

#[test]
fn read_slice_peek_reaches_beyond_the_slice() {
  const N: usize = 40;
  let q = Hyperqueue::<usize>::with_config(8, 4);
  let qp = q.clone();
  run(move || {
    spawn((pushdep(&qp),), |(mut p,)| {
      for i in 0..N {
        p.push(i);
      }
    });
    spawn((popdep(&qp),), |(mut c,)| {
      let mut seen = 0;
      while seen < N {
        let mut slice = c.get_read_slice_upto(4, 4);
        let n = slice.len();
        for k in 0..n {
          // the window covers the remaining pops plus the reservation,
          // crossing into segments that may still be in production
          let window = (n - k) + 4;
          for j in 0..window {
            if seen + j < N {
              assert_eq!(*slice.peek(j), seen + j);
            }
          }
          assert_eq!(slice.pop(), seen);
          seen += 1;
        }
      }
    });
    ssync();
  });
  assert!(q.is_empty());
}

#[test]
fn pushpop_transforms_the_stream_in_place() {
  const N: usize = 10;
  let q = Hyperqueue::<usize>::with_config(8, 0);
  let qp = q.clone();
  run(move || {
    spawn((pushdep(&qp),), |(mut p,)| {
      for i in 0..N {
        p.push(i);
      }
    });
    spawn((pushpopdep(&qp),), |(mut f,)| {
      for _ in 0..N {
        let v = f.pop();
        f.push(v * 10);
      }
    });
    spawn((popdep(&qp),), |(mut c,)| {
      for i in 0..N {
        assert_eq!(c.pop(), i * 10);
      }
    });
    ssync();
  });
}

#[test]
fn nested_producers_keep_textual_order() {
  let q = Hyperqueue::<u32>::with_config(4, 0);
  let counted = Arc::new(AtomicUsize::new(0));
  let qp = q.clone();
  let cnt = counted.clone();
  run(move || {
    spawn((pushdep(&qp),), |(mut p,)| {
      p.push(0);
      spawn((p.dep(),), |(mut inner,)| {
        inner.push(1);
        inner.push(2);
      });
      p.push(3);
      ssync();
    });
    let cnt = cnt.clone();
    spawn((popdep(&qp),), move |(mut c,)| {
      // the nested task's output lands between the pushes around the spawn
      assert_eq!(c.pop(), 0);
      assert_eq!(c.pop(), 1);
      assert_eq!(c.pop(), 2);
      assert_eq!(c.pop(), 3);
      cnt.fetch_add(4, Ordering::SeqCst);
    });
    ssync();
  });
  assert_eq!(counted.load(Ordering::SeqCst), 4);
}
