// Versioned objects and the dependency engine.
//
// An object is a named cell with one current version. Task arguments carry
// access-mode annotations on objects; issuing an argument takes tickets on
// the version in program order, releasing it bumps completion counters and
// wakes compatible waiters head-first. An out-dependency on a version with
// outstanding accesses renames the object: a fresh version becomes current
// so the writer can start immediately while old readers keep the old
// payload.

pub(crate) mod tickets;

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::Backoff;

use crate::frame::{PendingGate, Task};
use crate::reduction::Monoid;
use crate::utils::CasMutex;
use crate::worker::tls_worker_id;

use tickets::{DepEngine, Mode, Need, Tickets};

static OBJ_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

struct Waiter {
  gate: Arc<PendingGate>,
  need: Need,
}

struct Meta<T> {
  tickets: Tickets,
  waiters: VecDeque<Waiter>,
  // per-worker privatised reduction views of the open generation
  views: Vec<(usize, Box<T>)>,
  merge: Option<fn(&mut T, &T)>,
}

impl<T> Default for Meta<T> {
  fn default() -> Meta<T> {
    Meta {
      tickets: Tickets::default(),
      waiters: VecDeque::new(),
      views: Vec::new(),
      merge: None,
    }
  }
}

pub(crate) struct Version<T> {
  meta: Mutex<Meta<T>>,
  payload: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Version<T> {}
unsafe impl<T: Send + Sync> Sync for Version<T> {}

impl<T> Version<T> {
  fn new(payload: T) -> Version<T> {
    Version {
      meta: Mutex::new(Meta::default()),
      payload: UnsafeCell::new(payload),
    }
  }

  fn issue(&self, mode: Mode, gate: &Arc<PendingGate>) {
    let mut m = self.meta.lock().unwrap();
    if mode != Mode::Reduction && m.tickets.reduction_idle() && !m.views.is_empty() {
      // this access closes the reduction generation and all its tasks have
      // finished; fold the views before anyone observes the payload
      merge_views(&mut m, &self.payload);
    }
    let need = m.tickets.issue(mode);
    if !m.tickets.satisfied(&need) {
      gate.block();
      m.waiters.push_back(Waiter {
        gate: gate.clone(),
        need,
      });
    }
  }

  fn release(&self, mode: Mode, ready: &mut Vec<Task>) {
    let mut m = self.meta.lock().unwrap();
    m.tickets.release(mode);
    loop {
      let need = match m.waiters.front() {
        Some(w) => w.need,
        None => break,
      };
      if !m.tickets.satisfied(&need) {
        break;
      }
      if need.mode != Mode::Reduction && !m.views.is_empty() {
        // a non-reduction access is about to be let through: its tickets
        // being satisfied means the generation that filled these views is
        // completely done, so the releasing thread folds them here
        merge_views(&mut m, &self.payload);
      }
      let w = m.waiters.pop_front().unwrap();
      if let Some(t) = w.gate.unblock() {
        ready.push(t);
      }
    }
  }

  /// The calling worker's privatised view for the open reduction
  /// generation, created from the monoid identity on first touch.
  fn reduction_view(&self, worker: usize, identity: fn() -> T, merge: fn(&mut T, &T)) -> *mut T {
    let mut m = self.meta.lock().unwrap();
    m.merge = Some(merge);
    let idx = match m.views.iter().position(|e| e.0 == worker) {
      Some(i) => i,
      None => {
        m.views.push((worker, Box::new(identity())));
        m.views.len() - 1
      }
    };
    &mut *m.views[idx].1 as *mut T
  }
}

fn merge_views<T>(m: &mut Meta<T>, payload: &UnsafeCell<T>) {
  let merge = m.merge.expect("reduction views without a merge function");
  let dst = unsafe { &mut *payload.get() };
  for (_, v) in m.views.drain(..) {
    merge(dst, &v);
  }
}

/// Object-side commutativity lock, type-erased for acquisition in a global
/// object-id order.
#[doc(hidden)]
pub trait CommLock: Send + Sync {
  fn obj_id(&self) -> usize;
  fn lock_comm(&self);
  fn unlock_comm(&self);
}

pub(crate) struct ObjInner<T> {
  id: usize,
  current: Mutex<Arc<Version<T>>>,
  comm: CasMutex,
}

impl<T: Send + Sync + 'static> CommLock for ObjInner<T> {
  fn obj_id(&self) -> usize {
    self.id
  }

  fn lock_comm(&self) {
    self.comm.lock();
  }

  fn unlock_comm(&self) {
    self.comm.unlock();
  }
}

impl<T> ObjInner<T> {
  fn current_version(&self) -> Arc<Version<T>> {
    self.current.lock().unwrap().clone()
  }
}

/// A named object usable as a dependency argument. Clones share the cell.
pub struct ObjectT<T> {
  inner: Arc<ObjInner<T>>,
}

impl<T> Clone for ObjectT<T> {
  fn clone(&self) -> ObjectT<T> {
    ObjectT {
      inner: self.inner.clone(),
    }
  }
}

impl<T: Send + Sync + 'static> ObjectT<T> {
  pub fn new(value: T) -> ObjectT<T> {
    ObjectT {
      inner: Arc::new(ObjInner {
        id: OBJ_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        current: Mutex::new(Arc::new(Version::new(value))),
        comm: CasMutex::new(),
      }),
    }
  }

  /// Read the committed value. Spins until the current version has no
  /// outstanding accesses, then folds any pending reduction views.
  pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
    let v = self.inner.current_version();
    let backoff = Backoff::new();
    loop {
      let mut m = v.meta.lock().unwrap();
      if m.tickets.quiescent() {
        if !m.views.is_empty() {
          merge_views(&mut m, &v.payload);
        }
        let r = f(unsafe { &*v.payload.get() });
        return r;
      }
      drop(m);
      crate::worker::wait_tick(&backoff);
    }
  }

  pub fn get(&self) -> T
  where
    T: Clone,
  {
    self.with(|v| v.clone())
  }

  /// Overwrite the committed value; discards unmerged reduction views.
  pub fn set(&self, value: T) {
    let v = self.inner.current_version();
    let backoff = Backoff::new();
    loop {
      let mut m = v.meta.lock().unwrap();
      if m.tickets.quiescent() {
        m.views.clear();
        unsafe {
          *v.payload.get() = value;
        }
        return;
      }
      drop(m);
      crate::worker::wait_tick(&backoff);
    }
  }

  pub(crate) fn writers_quiescent(&self) -> bool {
    let v = self.inner.current_version();
    let m = v.meta.lock().unwrap();
    m.tickets.writers_quiescent()
  }

  /// Fold pending reduction views once the writer side is quiet.
  pub(crate) fn finalize(&self) {
    let v = self.inner.current_version();
    let mut m = v.meta.lock().unwrap();
    debug_assert!(m.tickets.writers_quiescent());
    if !m.views.is_empty() {
      merge_views(&mut m, &v.payload);
    }
  }

  /// Detach the outstanding reduction views for an external merge.
  pub(crate) fn take_views(&self) -> Vec<Box<T>> {
    let v = self.inner.current_version();
    let mut m = v.meta.lock().unwrap();
    debug_assert!(m.tickets.writers_quiescent());
    std::mem::take(&mut m.views)
      .into_iter()
      .map(|(_, b)| b)
      .collect()
  }

  /// Fold detached values into the payload.
  pub(crate) fn fold_values(&self, values: Vec<Box<T>>, merge: fn(&mut T, &T)) {
    let v = self.inner.current_version();
    let m = v.meta.lock().unwrap();
    debug_assert!(m.tickets.writers_quiescent());
    let dst = unsafe { &mut *v.payload.get() };
    for b in values {
      merge(dst, &b);
    }
    drop(m);
  }
}

impl<T: Default + Send + Sync + 'static> Default for ObjectT<T> {
  fn default() -> ObjectT<T> {
    ObjectT::new(T::default())
  }
}

// ---------------------------------------------------------------------------
// argument plumbing

#[doc(hidden)]
pub struct IssueCx<'a> {
  pub(crate) gate: &'a Arc<PendingGate>,
}

#[doc(hidden)]
pub struct ReleaseCx {
  pub(crate) ready: Vec<Task>,
}

/// One annotated argument of a task: issued in program order at spawn,
/// turned into a view when the task starts, released when it finishes.
#[doc(hidden)]
pub trait DepArg: Send {
  type View;
  fn issue(&mut self, cx: &mut IssueCx<'_>);
  fn make_view(&mut self) -> Self::View;
  fn release(&mut self, cx: &mut ReleaseCx);
  fn collect_comm(&self, _out: &mut Vec<Arc<dyn CommLock>>) {}
}

/// The tuple of annotated arguments passed to `spawn`/`call`.
pub trait SpawnArgs: Send {
  type Views;
  #[doc(hidden)]
  fn issue(&mut self, cx: &mut IssueCx<'_>);
  #[doc(hidden)]
  fn make_views(&mut self) -> Self::Views;
  #[doc(hidden)]
  fn release(&mut self, cx: &mut ReleaseCx);
  #[doc(hidden)]
  fn collect_comm(&self, out: &mut Vec<Arc<dyn CommLock>>);
}

impl SpawnArgs for () {
  type Views = ();

  fn issue(&mut self, _cx: &mut IssueCx<'_>) {}

  fn make_views(&mut self) -> () {}

  fn release(&mut self, _cx: &mut ReleaseCx) {}

  fn collect_comm(&self, _out: &mut Vec<Arc<dyn CommLock>>) {}
}

macro_rules! impl_spawn_args {
  ($($name:ident : $idx:tt),+) => {
    impl<$($name: DepArg),+> SpawnArgs for ($($name,)+) {
      type Views = ($($name::View,)+);

      fn issue(&mut self, cx: &mut IssueCx<'_>) {
        $( self.$idx.issue(cx); )+
      }

      fn make_views(&mut self) -> Self::Views {
        ($( self.$idx.make_view(), )+)
      }

      fn release(&mut self, cx: &mut ReleaseCx) {
        $( self.$idx.release(cx); )+
      }

      fn collect_comm(&self, out: &mut Vec<Arc<dyn CommLock>>) {
        $( self.$idx.collect_comm(out); )+
      }
    }
  };
}

impl_spawn_args!(A0: 0);
impl_spawn_args!(A0: 0, A1: 1);
impl_spawn_args!(A0: 0, A1: 1, A2: 2);
impl_spawn_args!(A0: 0, A1: 1, A2: 2, A3: 3);
impl_spawn_args!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);
impl_spawn_args!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5);
impl_spawn_args!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6);
impl_spawn_args!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6, A7: 7);

// ---------------------------------------------------------------------------
// access-mode requests and views

/// Read access to the current generation; parallel with other readers.
pub struct InDep<T> {
  obj: Arc<ObjInner<T>>,
  version: Option<Arc<Version<T>>>,
}

pub fn indep<T: Send + Sync + 'static>(obj: &ObjectT<T>) -> InDep<T> {
  InDep {
    obj: obj.inner.clone(),
    version: None,
  }
}

impl<T: Send + Sync + 'static> DepArg for InDep<T> {
  type View = InView<T>;

  fn issue(&mut self, cx: &mut IssueCx<'_>) {
    let v = self.obj.current_version();
    v.issue(Mode::In, cx.gate);
    self.version = Some(v);
  }

  fn make_view(&mut self) -> InView<T> {
    InView {
      v: self.version.clone().unwrap(),
    }
  }

  fn release(&mut self, cx: &mut ReleaseCx) {
    self.version.take().unwrap().release(Mode::In, &mut cx.ready);
  }
}

pub struct InView<T> {
  v: Arc<Version<T>>,
}

impl<T> std::ops::Deref for InView<T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.v.payload.get() }
  }
}

/// Write access producing a new generation; renames on contention so the
/// writer never waits (unless built with the `norename` feature).
pub struct OutDep<T> {
  obj: Arc<ObjInner<T>>,
  version: Option<Arc<Version<T>>>,
}

pub fn outdep<T: Default + Send + Sync + 'static>(obj: &ObjectT<T>) -> OutDep<T> {
  OutDep {
    obj: obj.inner.clone(),
    version: None,
  }
}

impl<T: Default + Send + Sync + 'static> DepArg for OutDep<T> {
  type View = OutView<T>;

  fn issue(&mut self, cx: &mut IssueCx<'_>) {
    let mut cur = self.obj.current.lock().unwrap();
    {
      let v = cur.clone();
      let mut m = v.meta.lock().unwrap();
      if m.tickets.quiescent() && m.waiters.is_empty() {
        let need = m.tickets.issue(Mode::Out);
        debug_assert!(m.tickets.satisfied(&need));
        drop(m);
        self.version = Some(v);
        return;
      }
      if cfg!(feature = "norename") {
        let need = m.tickets.issue(Mode::Out);
        if !m.tickets.satisfied(&need) {
          cx.gate.block();
          m.waiters.push_back(Waiter {
            gate: cx.gate.clone(),
            need,
          });
        }
        drop(m);
        self.version = Some(v);
        return;
      }
      assert!(
        !m.tickets.commutative_live(),
        "renaming an object with live commutative accesses"
      );
    }
    // rename: this task writes a fresh version, remaining readers keep the
    // old payload; later arguments resolve to the new current version
    let fresh = Arc::new(Version::new(T::default()));
    fresh.meta.lock().unwrap().tickets.issue(Mode::Out);
    *cur = fresh.clone();
    self.version = Some(fresh);
  }

  fn make_view(&mut self) -> OutView<T> {
    OutView {
      v: self.version.clone().unwrap(),
    }
  }

  fn release(&mut self, cx: &mut ReleaseCx) {
    self
      .version
      .take()
      .unwrap()
      .release(Mode::Out, &mut cx.ready);
  }
}

pub struct OutView<T> {
  v: Arc<Version<T>>,
}

impl<T> std::ops::Deref for OutView<T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.v.payload.get() }
  }
}

impl<T> std::ops::DerefMut for OutView<T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.v.payload.get() }
  }
}

/// Exclusive read-write access, serialized behind all previous accesses.
pub struct InOutDep<T> {
  obj: Arc<ObjInner<T>>,
  version: Option<Arc<Version<T>>>,
}

pub fn inoutdep<T: Send + Sync + 'static>(obj: &ObjectT<T>) -> InOutDep<T> {
  InOutDep {
    obj: obj.inner.clone(),
    version: None,
  }
}

impl<T: Send + Sync + 'static> DepArg for InOutDep<T> {
  type View = InOutView<T>;

  fn issue(&mut self, cx: &mut IssueCx<'_>) {
    let v = self.obj.current_version();
    v.issue(Mode::InOut, cx.gate);
    self.version = Some(v);
  }

  fn make_view(&mut self) -> InOutView<T> {
    InOutView {
      v: self.version.clone().unwrap(),
    }
  }

  fn release(&mut self, cx: &mut ReleaseCx) {
    self
      .version
      .take()
      .unwrap()
      .release(Mode::InOut, &mut cx.ready);
  }
}

pub struct InOutView<T> {
  v: Arc<Version<T>>,
}

impl<T> std::ops::Deref for InOutView<T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.v.payload.get() }
  }
}

impl<T> std::ops::DerefMut for InOutView<T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.v.payload.get() }
  }
}

/// Commutative read-write access: mutually exclusive with every other
/// access, but peers may run in any order. Exclusion among peers comes from
/// the per-object mutex held for the task body.
pub struct CinoutDep<T> {
  obj: Arc<ObjInner<T>>,
  version: Option<Arc<Version<T>>>,
}

pub fn cinoutdep<T: Send + Sync + 'static>(obj: &ObjectT<T>) -> CinoutDep<T> {
  CinoutDep {
    obj: obj.inner.clone(),
    version: None,
  }
}

impl<T: Send + Sync + 'static> DepArg for CinoutDep<T> {
  type View = CinoutView<T>;

  fn issue(&mut self, cx: &mut IssueCx<'_>) {
    let v = self.obj.current_version();
    v.issue(Mode::Cinout, cx.gate);
    self.version = Some(v);
  }

  fn make_view(&mut self) -> CinoutView<T> {
    CinoutView {
      v: self.version.clone().unwrap(),
    }
  }

  fn release(&mut self, cx: &mut ReleaseCx) {
    self
      .version
      .take()
      .unwrap()
      .release(Mode::Cinout, &mut cx.ready);
  }

  fn collect_comm(&self, out: &mut Vec<Arc<dyn CommLock>>) {
    out.push(self.obj.clone());
  }
}

pub struct CinoutView<T> {
  v: Arc<Version<T>>,
}

impl<T> std::ops::Deref for CinoutView<T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.v.payload.get() }
  }
}

impl<T> std::ops::DerefMut for CinoutView<T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.v.payload.get() }
  }
}

/// Reduction access under monoid `M`: peers run in parallel on per-worker
/// views which are folded into the payload at the next non-reduction access
/// or at a sync.
pub struct RedDep<M: Monoid> {
  obj: Arc<ObjInner<M::Value>>,
  version: Option<Arc<Version<M::Value>>>,
  _m: std::marker::PhantomData<fn() -> M>,
}

pub fn reduction<M: Monoid>(obj: &ObjectT<M::Value>) -> RedDep<M> {
  RedDep {
    obj: obj.inner.clone(),
    version: None,
    _m: std::marker::PhantomData,
  }
}

impl<M: Monoid> DepArg for RedDep<M> {
  type View = RedView<M::Value>;

  fn issue(&mut self, cx: &mut IssueCx<'_>) {
    let v = self.obj.current_version();
    v.issue(Mode::Reduction, cx.gate);
    self.version = Some(v);
  }

  fn make_view(&mut self) -> RedView<M::Value> {
    let v = self.version.clone().unwrap();
    let ptr = v.reduction_view(tls_worker_id(), M::identity, M::reduce);
    RedView { ptr, _v: v }
  }

  fn release(&mut self, cx: &mut ReleaseCx) {
    self
      .version
      .take()
      .unwrap()
      .release(Mode::Reduction, &mut cx.ready);
  }
}

pub struct RedView<T> {
  ptr: *mut T,
  _v: Arc<Version<T>>,
}

impl<T> std::ops::Deref for RedView<T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.ptr }
  }
}

impl<T> std::ops::DerefMut for RedView<T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.ptr }
  }
}
