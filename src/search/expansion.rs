//! Iterative expansion machinery.
//!
//! The expansion passes grow existing groups by repeatedly (i) marking
//! every particle a group member can reach under the current predicate
//! into a per-particle mark array, (ii) collecting the newly marked
//! ungrouped particles per group, and (iii) appending them to the group
//! chains. Marks follow the smaller-label-wins rule of
//! [`search_criterion`](crate::fof::search_criterion), so a particle that
//! two groups reach in the same sweep always lands in the lower id and a
//! particle already in a group can never be stolen - only `pfof == 0`
//! slots are writable.
//!
//! The same mark array doubles as the inter-group link detector: a mark
//! smaller than the owner's label records that the lower group reached
//! into the higher one, which feeds the merger decision.

use rayon::prelude::*;
use smallvec::SmallVec;
use tracing::trace;

use crate::fof::{search_criterion, FofPredicate, LinkParams};
use crate::groups::{GroupLinks, UNGROUPED};
use crate::kdtree::KdTree;

/// Mark value that blocks a particle from ever being linked.
pub const BLOCKED: i64 = -1;

/// Seed count above which the mark sweep runs on partitioned per-thread
/// mark slices.
pub const PAR_SEARCH_MIN: usize = 8192;

/// Mark everything reachable from `seeds` under the predicate.
///
/// Each seed marks with its own current label. Above [`PAR_SEARCH_MIN`]
/// seeds the sweep partitions into per-thread copies of the mark array
/// (`n * nthreads` cells) and reduces by minimum positive label, which
/// keeps concurrent writes commutative. The thread count is capped so the
/// replicated array stays addressable.
pub fn search_new_links(
  tree: &KdTree<'_>,
  predicate: FofPredicate,
  params: &LinkParams,
  scores: &[f64],
  seeds: &[usize],
  pfof: &[usize],
  nnid: &mut [i64],
) {
  let n = nnid.len();
  if seeds.is_empty() || n == 0 {
    return;
  }
  let avail = rayon::current_num_threads().max(1);
  let cap = ((u32::MAX as usize) / n.max(1)).max(1);
  let nthreads = avail.min(cap);

  if seeds.len() > PAR_SEARCH_MIN && nthreads > 1 {
    let mut buffer: Vec<i64> = Vec::with_capacity(n * nthreads);
    for _ in 0..nthreads {
      buffer.extend_from_slice(nnid);
    }
    let chunk = seeds.len().div_ceil(nthreads);
    buffer
      .par_chunks_mut(n)
      .zip(seeds.par_chunks(chunk))
      .for_each(|(marks, seed_chunk)| {
        for &s in seed_chunk {
          search_criterion(tree, predicate, params, scores, s, pfof[s] as i64, marks);
        }
      });
    for i in 0..n {
      let mut out = nnid[i];
      for t in 0..nthreads {
        let v = buffer[t * n + i];
        if v > 0 && (out == 0 || v < out) {
          out = v;
        }
      }
      nnid[i] = out;
    }
  } else {
    for &s in seeds {
      search_criterion(tree, predicate, params, scores, s, pfof[s] as i64, nnid);
    }
  }
}

/// Collect, per group, the newly marked ungrouped particles.
///
/// Returns the flat list of new links and the per-group member lists
/// (index 0 unused).
pub fn determine_new_links(
  pfof: &[usize],
  nnid: &[i64],
  ngroups: usize,
) -> (Vec<usize>, Vec<Vec<usize>>) {
  let mut newlinks = Vec::new();
  let mut per_group: Vec<Vec<usize>> = vec![Vec::new(); ngroups + 1];
  for (j, (&g, &mark)) in pfof.iter().zip(nnid.iter()).enumerate() {
    if g == UNGROUPED && mark > 0 {
      per_group[mark as usize].push(j);
      newlinks.push(j);
    }
  }
  (newlinks, per_group)
}

/// Append each group's new links to its chain and take ownership of the
/// labels. O(1) per particle.
pub fn link_untagged(
  per_group: &[Vec<usize>],
  pfof: &mut [usize],
  nnid: &mut [i64],
  links: &mut GroupLinks,
  num_in_group: &mut [usize],
) {
  for (g, members) in per_group.iter().enumerate().skip(1) {
    if members.is_empty() || links.tail[g] == crate::groups::CHAIN_END {
      continue;
    }
    for &p in members {
      links.append(g, p);
      pfof[p] = g;
      nnid[p] = g as i64;
    }
    num_in_group[g] += members.len();
  }
}

/// Collect, per *marking* group, the already-grouped particles it reached:
/// `per_group[i]` holds particles `p` with `nnid[p] == i` but
/// `pfof[p] != i`. These are the raw inter-group links.
pub fn determine_group_links(
  seeds: &[usize],
  pfof: &[usize],
  nnid: &[i64],
  ngroups: usize,
) -> Vec<Vec<usize>> {
  let mut per_group: Vec<Vec<usize>> = vec![Vec::new(); ngroups + 1];
  for &p in seeds {
    let mark = nnid[p];
    if mark > 0 && mark as usize != pfof[p] && pfof[p] != UNGROUPED {
      per_group[mark as usize].push(p);
    }
  }
  per_group
}

/// Reduce raw links to per-group merger candidates: for each group, the
/// distinct neighbour groups it linked into and how many of their members
/// it reached.
pub fn merger_connections(
  per_group_links: &[Vec<usize>],
  pfof: &[usize],
  ngroups: usize,
) -> Vec<SmallVec<[(usize, usize); 8]>> {
  let mut seen = vec![0usize; ngroups + 1];
  let mut connections: Vec<SmallVec<[(usize, usize); 8]>> = vec![SmallVec::new(); ngroups + 1];
  for (i, linked) in per_group_links.iter().enumerate().skip(1) {
    for &p in linked {
      let other = pfof[p];
      if other == UNGROUPED || other == i {
        continue;
      }
      if seen[other] == 0 {
        connections[i].push((other, 1));
        seen[other] = connections[i].len();
      } else {
        connections[i][seen[other] - 1].1 += 1;
      }
    }
    for &(other, _) in connections[i].iter() {
      seen[other] = 0;
    }
  }
  connections
}

/// Merger acceptance rule.
#[derive(Clone, Copy, Debug)]
pub enum MergeRule {
  /// Absorb `j` into `i` when the shared links exceed
  /// `fmerge * oldsize(j)`.
  Substructure { fmerge: f64 },
  /// Background rule: as above with `fmergebg`, or outright when `j` is
  /// tiny next to `i` (`oldsize(j)/oldsize(i) < ratio * fmergebg`).
  Background { fmergebg: f64, ratio: f64 },
}

impl MergeRule {
  #[inline]
  fn accepts(&self, shared: usize, old_i: usize, old_j: usize) -> bool {
    match *self {
      MergeRule::Substructure { fmerge } => shared as f64 > fmerge * old_j as f64,
      MergeRule::Background { fmergebg, ratio } => {
        shared as f64 > fmergebg * old_j as f64
          || (old_i > 0 && (old_j as f64 / old_i as f64) < ratio * fmergebg)
      }
    }
  }
}

/// Merge every neighbour that passes the rule. The absorbed group's
/// members are relabeled (both `pfof` and the marks), its chain spliced
/// onto the absorber, and the group retired via `inactive`. Absorbed
/// members are appended to `new_seeds` so the caller can cascade.
///
/// Returns the number of mergers performed.
#[allow(clippy::too_many_arguments)]
pub fn merge_groups(
  connections: &[SmallVec<[(usize, usize); 8]>],
  rule: MergeRule,
  old_num: &[usize],
  pfof: &mut [usize],
  nnid: &mut [i64],
  links: &mut GroupLinks,
  num_in_group: &mut [usize],
  inactive: &mut [bool],
  new_seeds: &mut Vec<usize>,
) -> usize {
  let mut mergers = 0;
  for i in 1..connections.len() {
    if inactive[i] || num_in_group[i] == 0 {
      continue;
    }
    for &(j, shared) in connections[i].iter() {
      if j == i || inactive[j] || num_in_group[j] == 0 {
        continue;
      }
      if !rule.accepts(shared, old_num[i], old_num[j]) {
        continue;
      }
      let walked = links.splice(i, j);
      for &p in &walked {
        pfof[p] = i;
        nnid[p] = i as i64;
        new_seeds.push(p);
      }
      num_in_group[i] += num_in_group[j];
      num_in_group[j] = 0;
      inactive[j] = true;
      mergers += 1;
      trace!(into = i, from = j, shared, "groups merged");
    }
  }
  mergers
}

#[cfg(test)]
#[path = "expansion_test.rs"]
mod expansion_test;
