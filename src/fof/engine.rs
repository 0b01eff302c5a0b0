//! Group-finding engine.
//!
//! Classic friends-of-friends as a breadth-first flood over tree range
//! queries: every particle the filter admits seeds a component, and the
//! component is grown by linking admitted neighbours that satisfy the
//! predicate. Groups below the minimum size are dissolved before labels
//! are compacted, so callers always receive contiguous ids `1..=ngroups`.

use rayon::prelude::*;
use tracing::debug;

use super::predicate::{FofPredicate, LinkFilter, LinkParams};
use crate::groups::{self, UNGROUPED};
use crate::kdtree::KdTree;

/// Result of one linking pass.
pub struct FofOutcome {
  /// Per-particle group labels, 0 = ungrouped, ids contiguous.
  pub pfof: Vec<usize>,
  /// Number of groups.
  pub ngroups: usize,
}

impl FofOutcome {
  fn empty(n: usize) -> Self {
    Self {
      pfof: vec![UNGROUPED; n],
      ngroups: 0,
    }
  }
}

/// Plain 3D FOF at linking length `ell`.
pub fn fof(tree: &KdTree<'_>, ell: f64, min_size: usize, reorder: bool) -> FofOutcome {
  let params = LinkParams::spatial(ell, tree.period());
  fof_criterion(
    tree,
    FofPredicate::Spatial,
    &params,
    &[],
    min_size,
    reorder,
    LinkFilter::None,
  )
}

/// General predicate-driven FOF.
///
/// `scores` is the per-particle outlier-score array for the stream and
/// background predicates; pass an empty slice for predicates that ignore
/// it. The filter gates which particles may seed or join groups at all.
pub fn fof_criterion(
  tree: &KdTree<'_>,
  predicate: FofPredicate,
  params: &LinkParams,
  scores: &[f64],
  min_size: usize,
  reorder: bool,
  filter: LinkFilter<'_>,
) -> FofOutcome {
  let n = tree.len();
  if n == 0 || params.rx2 <= 0.0 {
    return FofOutcome::empty(n);
  }
  let r2 = predicate.search_radius2(params);
  let score = |i: usize| scores.get(i).copied().unwrap_or(0.0);

  let mut pfof = vec![UNGROUPED; n];
  let mut ngroups = 0usize;
  let mut stack: Vec<usize> = Vec::new();

  for seed in 0..n {
    if pfof[seed] != UNGROUPED || !filter.admits(seed) {
      continue;
    }
    let gid = ngroups + 1;
    pfof[seed] = gid;
    stack.push(seed);
    while let Some(p) = stack.pop() {
      let pp = &tree.particles()[p];
      let sp = score(p);
      tree.for_each_within(pp.position, r2, |q, _| {
        if pfof[q] != UNGROUPED || !filter.admits(q) {
          return;
        }
        if predicate.links(pp, &tree.particles()[q], sp, score(q), params) {
          pfof[q] = gid;
          stack.push(q);
        }
      });
    }
    ngroups += 1;
  }

  finalize(tree, pfof, ngroups, min_size, reorder)
}

/// FOF restricted to each particle's `nsearch` nearest neighbours.
///
/// The neighbour lists are computed up front (in parallel) and linking
/// only ever follows list edges, which bounds the damage an unusually
/// dense region can do to a stream search.
pub fn fof_nn_criterion(
  tree: &KdTree<'_>,
  predicate: FofPredicate,
  params: &LinkParams,
  scores: &[f64],
  nsearch: usize,
  min_size: usize,
  reorder: bool,
  filter: LinkFilter<'_>,
) -> FofOutcome {
  let n = tree.len();
  if n == 0 {
    return FofOutcome::empty(n);
  }
  let score = |i: usize| scores.get(i).copied().unwrap_or(0.0);
  let nn: Vec<Vec<usize>> = (0..n)
    .into_par_iter()
    .map(|i| {
      tree
        .find_nearest(i, nsearch)
        .into_iter()
        .map(|(j, _)| j)
        .collect()
    })
    .collect();

  let mut pfof = vec![UNGROUPED; n];
  let mut ngroups = 0usize;
  let mut stack: Vec<usize> = Vec::new();
  for seed in 0..n {
    if pfof[seed] != UNGROUPED || !filter.admits(seed) {
      continue;
    }
    let gid = ngroups + 1;
    pfof[seed] = gid;
    stack.push(seed);
    while let Some(p) = stack.pop() {
      let pp = &tree.particles()[p];
      let sp = score(p);
      for &q in &nn[p] {
        if pfof[q] != UNGROUPED || !filter.admits(q) {
          continue;
        }
        if predicate.links(pp, &tree.particles()[q], sp, score(q), params) {
          pfof[q] = gid;
          stack.push(q);
        }
      }
    }
    ngroups += 1;
  }

  finalize(tree, pfof, ngroups, min_size, reorder)
}

/// Mark every particle that links to `root` under the predicate.
///
/// A particle's mark is overwritten with `ref_label` only if it is 0 or
/// strictly greater than `ref_label`, so concurrent marking from several
/// references commutes: the smallest label always wins. Negative marks are
/// blockers and are never touched.
pub fn search_criterion(
  tree: &KdTree<'_>,
  predicate: FofPredicate,
  params: &LinkParams,
  scores: &[f64],
  root: usize,
  ref_label: i64,
  marks: &mut [i64],
) {
  let r2 = predicate.search_radius2(params);
  if !(r2 > 0.0) {
    return;
  }
  let score = |i: usize| scores.get(i).copied().unwrap_or(0.0);
  let pp = &tree.particles()[root];
  let sp = score(root);
  tree.for_each_within(pp.position, r2, |q, _| {
    if q == root {
      return;
    }
    let m = marks[q];
    if (m == 0 || m > ref_label)
      && predicate.links(pp, &tree.particles()[q], sp, score(q), params)
    {
      marks[q] = ref_label;
    }
  });
}

/// Dissolve undersized groups, make ids contiguous, optionally order by
/// descending size.
fn finalize(
  tree: &KdTree<'_>,
  mut pfof: Vec<usize>,
  ngroups: usize,
  min_size: usize,
  reorder: bool,
) -> FofOutcome {
  groups::dissolve_small(&mut pfof, ngroups, min_size.max(1));
  let ngroups = if reorder {
    let ids: Vec<i64> = tree.particles().iter().map(|p| p.id).collect();
    groups::reorder_by_size(&mut pfof, ngroups, &ids).0
  } else {
    groups::compact_labels(&mut pfof, ngroups).0
  };
  debug!(ngroups, n = pfof.len(), "fof pass complete");
  FofOutcome { pfof, ngroups }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;
