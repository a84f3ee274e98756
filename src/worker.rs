// Worker pool and scheduling loop.
//
// A fixed set of OS threads, sized by NUM_THREADS, each owning one extended
// spawn deque. The main thread takes the worker-0 role for the duration of a
// run(). Workers that run out of local work steal released pending tasks
// from the shared injector or the oldest frame of a random victim's deque,
// and go to sleep on their wake-up channel when the machine is idle.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::{Backoff, CachePadded};
use once_cell::sync::Lazy;

use crate::config::CONFIG;
use crate::deque::SpawnDeque;
use crate::frame::{Frame, FrameState, PendingGate, Task};
use crate::future::{Chandle, FutureCell};
use crate::obj::{CommLock, IssueCx, ObjectT, ReleaseCx, SpawnArgs};
use crate::utils::{abort_on_panic, XorShift};

// how long an idle worker waits for a wake-up before probing again
const SLEEP_TICK: Duration = Duration::from_millis(1);

/// Why the last frame left this worker's hands; inspected when the
/// scheduling loop looks for the next thing to do.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EmptyDequeReason {
  Bootstrap,
  CallReturn,
  SpawnReturn,
  Sync,
}

struct WorkerTls {
  id: usize,
  rng: XorShift,
  current: Option<Arc<Frame>>,
  reason: EmptyDequeReason,
}

thread_local! {
  static TLS: RefCell<Option<WorkerTls>> = RefCell::new(None);
}

fn install_tls(id: usize) {
  TLS.with(|t| {
    let mut b = t.borrow_mut();
    if b.is_none() {
      *b = Some(WorkerTls {
        id,
        rng: XorShift::new(id as u64 + 1),
        current: None,
        reason: EmptyDequeReason::Bootstrap,
      });
    }
  });
}

fn current_ctx() -> (usize, Arc<Frame>) {
  TLS.with(|t| {
    let b = t.borrow();
    let tls = b.as_ref().expect("cygnet API used outside run()");
    let frame = tls
      .current
      .clone()
      .expect("cygnet API used outside a task");
    (tls.id, frame)
  })
}

pub(crate) fn tls_worker_id() -> usize {
  TLS.with(|t| t.borrow().as_ref().expect("not on a cygnet worker").id)
}

fn tls_rng() -> u64 {
  TLS.with(|t| t.borrow_mut().as_mut().unwrap().rng.next())
}

fn set_reason(r: EmptyDequeReason) {
  TLS.with(|t| {
    if let Some(tls) = t.borrow_mut().as_mut() {
      tls.reason = r;
    }
  });
}

fn get_reason() -> EmptyDequeReason {
  TLS.with(|t| {
    t.borrow()
      .as_ref()
      .map(|tls| tls.reason)
      .unwrap_or(EmptyDequeReason::Bootstrap)
  })
}

pub(crate) struct WorkerShared {
  pub(crate) deque: SpawnDeque,
  wake_up: Sender<()>,
  wake_up_notif: Receiver<()>,
  sleeping: AtomicBool,
}

impl WorkerShared {
  fn sleep(&self, timeout: Option<Duration>) {
    self.sleeping.store(true, Ordering::SeqCst);
    defer! {
      self.sleeping.store(false, Ordering::SeqCst);
    }

    let backoff = Backoff::new();
    loop {
      match self.wake_up_notif.try_recv() {
        Ok(()) => return,
        Err(_) => {
          if backoff.is_completed() {
            match timeout {
              Some(d) => {
                let _ = self.wake_up_notif.recv_timeout(d);
              }
              None => {
                let _ = self.wake_up_notif.recv();
              }
            }
            return;
          } else {
            backoff.snooze();
          }
        }
      }
    }
  }

  fn wake(&self) {
    // buffer of one is enough to give notification
    let _ = self.wake_up.try_send(());
  }
}

pub(crate) struct Runtime {
  workers: Vec<CachePadded<WorkerShared>>,
  injector: Injector<Task>,
  active: AtomicBool,
}

pub(crate) static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
  let nthreads = CONFIG.nthreads;

  let mut workers = Vec::with_capacity(nthreads);
  for _ in 0..nthreads {
    let (wake_up, wake_up_notif) = bounded(1);
    workers.push(CachePadded::new(WorkerShared {
      deque: SpawnDeque::new(),
      wake_up,
      wake_up_notif,
      sleeping: AtomicBool::new(false),
    }));
  }

  // worker 0 is whichever thread is inside run(); the rest get OS threads
  for id in 1..nthreads {
    thread::Builder::new()
      .name(format!("cygnet-worker-{}", id))
      .spawn(move || abort_on_panic(|| RUNTIME.worker_main(id)))
      .expect("failed to spawn worker thread");
  }

  Runtime {
    workers,
    injector: Injector::new(),
    active: AtomicBool::new(false),
  }
});

impl Runtime {
  fn worker_main(&self, id: usize) {
    install_tls(id);
    trace!("worker {} up", id);
    loop {
      if !self.active.load(Ordering::Acquire) {
        self.workers[id].sleep(None);
        continue;
      }
      match self.find_task(id) {
        Some(t) => self.run_task(id, t),
        None => self.workers[id].sleep(Some(SLEEP_TICK)),
      }
    }
  }

  fn pop_injector(&self) -> Option<Task> {
    loop {
      match self.injector.steal() {
        Steal::Success(t) => return Some(t),
        Steal::Empty => return None,
        Steal::Retry => {}
      }
    }
  }

  fn random_steal(&self, id: usize) -> Option<Task> {
    let n = self.workers.len();
    if n <= 1 {
      return None;
    }
    // single attempt per call so the caller can poll for termination
    let victim = (tls_rng() as usize) % n;
    if victim == id || !self.workers[victim].deque.stealable() {
      return None;
    }
    let t = self.workers[victim].deque.steal_oldest();
    if let Some(t) = &t {
      trace!("worker {} stole {:?} from worker {}", id, t, victim);
    }
    t
  }

  fn find_task(&self, id: usize) -> Option<Task> {
    // after a sync suspension, local work comes first; after a spawn return
    // the release step may just have readied a pending sibling
    if get_reason() == EmptyDequeReason::Sync {
      if let Some(t) = self.workers[id].deque.try_pop() {
        return Some(t);
      }
      if let Some(t) = self.pop_injector() {
        return Some(t);
      }
    } else {
      if let Some(t) = self.pop_injector() {
        return Some(t);
      }
      if let Some(t) = self.workers[id].deque.try_pop() {
        return Some(t);
      }
    }
    self.random_steal(id)
  }

  /// One step of the sync loop: run the youngest local ready child, else any
  /// released pending task, else steal. Returns false when there was nothing
  /// to do.
  pub(crate) fn help_one(&self, id: usize) -> bool {
    if let Some(t) = self.workers[id].deque.try_pop() {
      self.run_task(id, t);
      return true;
    }
    if let Some(t) = self.pop_injector() {
      self.run_task(id, t);
      return true;
    }
    if let Some(t) = self.random_steal(id) {
      self.run_task(id, t);
      return true;
    }
    false
  }

  pub(crate) fn run_task(&self, id: usize, t: Task) {
    let frame = t.frame.clone();
    frame.set_owner(id);
    frame.set_state(FrameState::Executing);
    trace!("worker {} runs {:?}", id, frame);

    let prev = TLS.with(|tls| {
      tls
        .borrow_mut()
        .as_mut()
        .unwrap()
        .current
        .replace(frame.clone())
    });
    self.workers[id].deque.enter_frame();
    (t.job)();
    self.workers[id].deque.exit_frame();
    assert!(
      frame.all_children_done(),
      "task returned with outstanding children (missing ssync)"
    );
    TLS.with(|tls| {
      tls.borrow_mut().as_mut().unwrap().current = prev;
    });
    set_reason(if frame.is_call {
      EmptyDequeReason::CallReturn
    } else {
      EmptyDequeReason::SpawnReturn
    });

    if let Some(parent) = &frame.parent {
      let outstanding = if parent.is_full() {
        let _guard = parent.ensure_full().sync.lock().unwrap();
        parent.child_done()
      } else {
        parent.child_done()
      };
      if outstanding == 0 && parent.state() == FrameState::Suspended {
        // last child of a suspended parent: its owner resumes from sync
        trace!("provably-good resume of {:?}", parent);
      }
    }
  }

  fn wake_one(&self) {
    for w in self.workers.iter() {
      if w.sleeping.load(Ordering::Relaxed) {
        w.wake();
        return;
      }
    }
  }

  fn wake_all(&self) {
    for w in self.workers.iter() {
      w.wake();
    }
  }
}

/// Hand released pending tasks to the pool.
pub(crate) fn submit_ready(tasks: Vec<Task>) {
  if tasks.is_empty() {
    return;
  }
  let rt = &*RUNTIME;
  for t in tasks {
    trace!("{:?} ready", t);
    t.frame.set_state(FrameState::Waiting);
    rt.injector.push(t);
    rt.wake_one();
  }
}

fn make_job<A, R, F>(mut args: A, f: F, cell: Arc<FutureCell<R>>) -> Box<dyn FnOnce() + Send>
where
  A: SpawnArgs + 'static,
  R: Send + 'static,
  F: FnOnce(A::Views) -> R + Send + 'static,
{
  Box::new(move || {
    // commutativity mutexes are held for the whole task body; a fixed
    // object-id order keeps concurrent peers out of a lock cycle
    let mut comm: Vec<Arc<dyn CommLock>> = Vec::new();
    args.collect_comm(&mut comm);
    comm.sort_by_key(|l| l.obj_id());
    for l in &comm {
      l.lock_comm();
    }
    let views = args.make_views();
    let r = f(views);
    for l in comm.iter().rev() {
      l.unlock_comm();
    }
    let mut cx = ReleaseCx { ready: Vec::new() };
    args.release(&mut cx);
    cell.post(r);
    submit_ready(cx.ready);
  })
}

/// Create a task that runs `f` in parallel with the spawning task once the
/// dependencies declared in `args` allow it.
pub fn spawn<A, R, F>(args: A, f: F) -> Chandle<R>
where
  A: SpawnArgs + 'static,
  R: Send + 'static,
  F: FnOnce(A::Views) -> R + Send + 'static,
{
  let rt = &*RUNTIME;
  let (id, parent) = current_ctx();
  parent.add_child();

  let frame = Arc::new(Frame::new(Some(parent.clone()), false, FrameState::Pending));
  let gate = PendingGate::new();
  let mut args = args;
  args.issue(&mut IssueCx { gate: &gate });

  let cell = Arc::new(FutureCell::new());
  let job = make_job(args, f, cell.clone());
  gate.park(Task {
    frame: frame.clone(),
    job,
  });
  match gate.unblock() {
    Some(t) => {
      rt.workers[id].deque.push_spawn(t);
      rt.wake_one();
    }
    None => {
      // an out-of-order child: the parent must track it as a full frame
      trace!("{:?} pending", frame);
      parent.ensure_full();
    }
  }
  Chandle { cell }
}

/// Run `f` inline, like `spawn` immediately followed by a sync on that one
/// child. Participates in dependency tracking; adds no parallelism.
pub fn call<A, R, F>(args: A, f: F) -> R
where
  A: SpawnArgs + 'static,
  R: Send + 'static,
  F: FnOnce(A::Views) -> R + Send + 'static,
{
  let rt = &*RUNTIME;
  let (id, parent) = current_ctx();
  parent.add_child();

  let frame = Arc::new(Frame::new(Some(parent.clone()), true, FrameState::Pending));
  let gate = PendingGate::new();
  let mut args = args;
  args.issue(&mut IssueCx { gate: &gate });

  let cell = Arc::new(FutureCell::new());
  let job = make_job(args, f, cell.clone());
  gate.park(Task { frame, job });
  match gate.unblock() {
    Some(t) => rt.run_task(id, t),
    None => {
      parent.ensure_full();
      let backoff = Backoff::new();
      while !cell.is_finished() {
        if rt.help_one(id) {
          backoff.reset();
        } else {
          backoff.snooze();
        }
      }
    }
  }
  cell.take().unwrap()
}

/// Call a plain function on the worker's native stack, outside dependency
/// tracking and frame bookkeeping.
pub fn leaf_call<R>(f: impl FnOnce() -> R) -> R {
  f()
}

/// Wait for all children spawned by the current task.
pub fn ssync() {
  let rt = &*RUNTIME;
  let (id, frame) = current_ctx();
  debug_assert_eq!(frame.owner(), id);
  if frame.all_children_done() {
    return;
  }
  set_reason(EmptyDequeReason::Sync);
  frame.set_state(FrameState::Suspended);
  trace!("{:?} suspends at sync", frame);
  let backoff = Backoff::new();
  while !frame.all_children_done() {
    if rt.help_one(id) {
      backoff.reset();
    } else {
      backoff.snooze();
    }
  }
  frame.set_state(FrameState::Executing);
}

/// Wait until the named object has no outstanding writers, then fold any
/// pending reduction views. Does not wait for readers.
pub fn ssync_obj<T: Send + Sync + 'static>(obj: &ObjectT<T>) {
  let o = obj.clone();
  help_until(move || o.writers_quiescent());
  obj.finalize();
}

/// Whether the calling thread is currently executing a task.
pub(crate) fn in_task() -> bool {
  TLS.with(|t| {
    t.borrow()
      .as_ref()
      .map(|tls| tls.current.is_some())
      .unwrap_or(false)
  })
}

/// One tick of a queue wait: a worker stuck on data that is not there yet
/// helps with other work instead of spinning. Tasks that would conflict
/// with the waiter (later pops) are still pending, so helping cannot run
/// them. Outside a task this degrades to a plain backoff.
pub(crate) fn wait_tick(backoff: &Backoff) {
  if in_task() {
    let rt = &*RUNTIME;
    let id = tls_worker_id();
    if rt.help_one(id) {
      backoff.reset();
      return;
    }
  }
  backoff.snooze();
}

/// Help with other work until `done` reports true. Used by the object and
/// queue layers for conditional syncs.
pub(crate) fn help_until(mut done: impl FnMut() -> bool) {
  let rt = &*RUNTIME;
  let (id, _frame) = current_ctx();
  let backoff = Backoff::new();
  while !done() {
    if rt.help_one(id) {
      backoff.reset();
    } else {
      backoff.snooze();
    }
  }
}

/// Enter the runtime from sequential code; blocks until the root task and
/// everything it spawned have finished.
pub fn run<R, F>(f: F) -> R
where
  R: Send + 'static,
  F: FnOnce() -> R + Send + 'static,
{
  let rt = &*RUNTIME;
  TLS.with(|t| {
    if let Some(tls) = t.borrow().as_ref() {
      assert!(
        tls.current.is_none(),
        "run() may not be called from inside a task"
      );
    }
  });

  // one computation at a time; concurrent callers queue up here
  let backoff = Backoff::new();
  while rt
    .active
    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
    .is_err()
  {
    backoff.snooze();
  }

  install_tls(0);
  set_reason(EmptyDequeReason::Bootstrap);

  let dummy = Arc::new(Frame::dummy());
  dummy.add_child();
  let root = Arc::new(Frame::new(Some(dummy.clone()), false, FrameState::Waiting));
  let cell = Arc::new(FutureCell::new());
  let c2 = cell.clone();
  let job: Box<dyn FnOnce() + Send> = Box::new(move || {
    let r = f();
    ssync();
    c2.post(r);
  });

  rt.wake_all();
  // run_task balances the dummy's child counter when the root finishes
  rt.run_task(0, Task { frame: root, job });
  debug_assert!(dummy.all_children_done());
  rt.active.store(false, Ordering::Release);
  cell.take().unwrap()
}
