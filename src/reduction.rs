// Reduction monoids and the merge of privatised views.
//
// Tasks annotated with `reduction::<M>` write per-worker views created from
// the monoid identity; the dependency engine folds the views into the
// object payload when the next non-reduction access arrives. This module
// adds the sync-point finalization: cheap monoids fold inline on the
// finalizing thread, expensive ones through a binary tree of spawned merge
// tasks, log2(n) levels deep, ordered by in/inout annotations.

use crossbeam_utils::Backoff;

use crate::obj::{indep, inoutdep, ObjectT};
use crate::worker::{call, help_until, in_task, spawn, ssync};

/// A reduction monoid: an identity value and an associative combine.
///
/// Merges respect association only; a monoid whose combine is not also
/// commutative may observe view order, which follows worker identity.
pub trait Monoid: 'static {
  type Value: Send + Sync + 'static;

  /// Merge cost class: expensive monoids are worth a parallel merge tree.
  const EXPENSIVE: bool = false;

  fn identity() -> Self::Value;
  fn reduce(left: &mut Self::Value, right: &Self::Value);
}

/// Wait until the object's writer side is quiet, then fold any outstanding
/// reduction views into the payload.
pub fn finalize_reduction<M: Monoid>(obj: &ObjectT<M::Value>) {
  if in_task() {
    let o = obj.clone();
    help_until(move || o.writers_quiescent());
  } else {
    let backoff = Backoff::new();
    while !obj.writers_quiescent() {
      backoff.snooze();
    }
  }

  let views = obj.take_views();
  if views.is_empty() {
    return;
  }
  if !M::EXPENSIVE || views.len() < 3 || !in_task() {
    obj.fold_values(views, M::reduce);
    return;
  }

  // pairwise merge tree over the accumulator and the views
  let mut nodes: Vec<ObjectT<M::Value>> = Vec::with_capacity(views.len() + 1);
  nodes.push(obj.clone());
  nodes.extend(views.into_iter().map(|b| ObjectT::new(*b)));
  let n = nodes.len();
  call((), move |_| {
    let mut levels = 0;
    while (1 << levels) < n {
      levels += 1;
    }
    for lvl in 0..levels {
      let mut i = 0;
      while i + (1 << lvl) < n {
        let left = nodes[i].clone();
        let right = nodes[i + (1 << lvl)].clone();
        spawn((inoutdep(&left), indep(&right)), |(mut l, r)| {
          M::reduce(&mut *l, &*r);
        });
        i += 1 << (lvl + 1);
      }
    }
    ssync();
  });
}
