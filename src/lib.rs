//! cygnet is a task-parallel runtime: programs are trees of recursively
//! spawned tasks whose arguments carry access-mode annotations (`indep`,
//! `outdep`, `inoutdep`, `cinoutdep`, reductions and hyperqueue views). The
//! runtime enforces dataflow order between tasks touching the same objects
//! and runs everything else in parallel on a fixed pool of work-stealing
//! workers.
//!
//! The worker count comes from the `NUM_THREADS` environment variable
//! (default 2, `0` for one worker per CPU).
//!
//! ```
//! use cygnet::{call, run, spawn, ssync};
//!
//! fn fib(n: u64) -> u64 {
//!   if n < 2 {
//!     return n;
//!   }
//!   let x = spawn((), move |_| fib(n - 1));
//!   let y = call((), move |_| fib(n - 2));
//!   ssync();
//!   x.get() + y
//! }
//!
//! assert_eq!(run(|| fib(10)), 55);
//! ```
//!
//! Objects introduce dependencies between tasks:
//!
//! ```
//! use cygnet::{inoutdep, run, spawn, ssync, ObjectT};
//!
//! let total = ObjectT::new(0u32);
//! let t = total.clone();
//! run(move || {
//!   for i in 0..10u32 {
//!     spawn((inoutdep(&t),), move |(mut total,)| *total += i);
//!   }
//!   ssync();
//! });
//! assert_eq!(total.get(), 45);
//! ```

#[macro_use]
mod utils;

mod config;
mod deque;
mod frame;
mod future;
mod obj;
mod queue;
mod reduction;
mod worker;

pub use future::Chandle;
pub use obj::{
  cinoutdep, indep, inoutdep, outdep, reduction, CinoutDep, CinoutView, InDep, InOutDep,
  InOutView, InView, ObjectT, OutDep, OutView, RedDep, RedView, SpawnArgs,
};
pub use queue::{
  popdep, prefixdep, pushdep, pushpopdep, suffixdep, Hyperqueue, PopDep, PopView, PrefixDep,
  PushDep, PushPopDep, PushPopView, PushView, ReadSlice, SuffixDep, WriteSlice,
};
pub use reduction::{finalize_reduction, Monoid};
pub use worker::{call, leaf_call, run, spawn, ssync, ssync_obj};

#[doc(hidden)]
pub use obj::{CommLock, DepArg, IssueCx, ReleaseCx};

/// Divide-and-conquer parallel for over `begin..end` with grain size 1.
pub fn foreach<F>(begin: usize, end: usize, f: F)
where
  F: Fn(usize) + Send + Sync + 'static,
{
  foreach_grain(begin, end, 1, f)
}

/// Divide-and-conquer parallel for: ranges at most `grain` long run
/// sequentially, larger ones split in half, spawning the left part.
pub fn foreach_grain<F>(begin: usize, end: usize, grain: usize, f: F)
where
  F: Fn(usize) + Send + Sync + 'static,
{
  let f = std::sync::Arc::new(f);
  let grain = std::cmp::max(grain, 1);
  call((), move |_| foreach_rec(begin, end, grain, f));
}

fn foreach_rec<F>(begin: usize, end: usize, grain: usize, f: std::sync::Arc<F>)
where
  F: Fn(usize) + Send + Sync + 'static,
{
  if end.saturating_sub(begin) <= grain {
    for i in begin..end {
      f(i);
    }
    return;
  }
  let half = begin + (end + 1 - begin) / 2;
  let fl = f.clone();
  spawn((), move |_| foreach_rec(begin, half, grain, fl));
  call((), move |_| foreach_rec(half, end, grain, f));
  ssync();
}
