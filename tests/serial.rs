// With a single worker nothing is ever stolen and execution must match a
// serial elaboration of the same program.

use cygnet::{call, indep, inoutdep, outdep, popdep, pushdep, run, spawn, ssync, Hyperqueue, ObjectT};

fn one_worker() {
  // all tests in this binary pin the pool to one worker; whichever runs
  // first initializes the runtime with it
  std::env::set_var("NUM_THREADS", "1");
}

fn fib(n: u64) -> u64 {
  if n < 2 {
    return n;
  }
  let x = spawn((), move |_| fib(n - 1));
  let y = call((), move |_| fib(n - 2));
  ssync();
  x.get() + y
}

#[test]
fn fib_on_one_worker() {
  one_worker();
  assert_eq!(run(|| fib(15)), 610);
}

#[test]
fn dataflow_on_one_worker() {
  one_worker();
  let obj = ObjectT::new(0i64);
  let o = obj.clone();
  run(move || {
    for i in 1..=10i64 {
      spawn((inoutdep(&o),), move |(mut v,)| *v += i);
      spawn((indep(&o),), move |(v,)| assert_eq!(*v, (1..=i).sum::<i64>()));
    }
    ssync();
  });
  assert_eq!(obj.get(), 55);
}

#[test]
fn renaming_on_one_worker() {
  one_worker();
  let obj = ObjectT::new(0u32);
  let o = obj.clone();
  run(move || {
    for i in 0..20u32 {
      spawn((outdep(&o),), move |(mut v,)| *v = i);
      spawn((indep(&o),), move |(v,)| assert_eq!(*v, i));
    }
    ssync();
  });
}

#[test]
fn pipe_on_one_worker() {
  one_worker();
  let q = Hyperqueue::<u32>::with_config(16, 0);
  let qp = q.clone();
  run(move || {
    spawn((pushdep(&qp),), |(mut p,)| {
      for i in 0..100 {
        p.push(i);
      }
    });
    spawn((popdep(&qp),), |(mut c,)| {
      for i in 0..100 {
        assert_eq!(c.pop(), i);
      }
    });
    ssync();
  });
  assert!(q.is_empty());
}
