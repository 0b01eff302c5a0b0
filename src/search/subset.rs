//! Substructure search within one subset (a halo, or recursively one
//! substructure).
//!
//! The subset arrives in its parent's rest frame with outlier scores
//! already computed. The search runs up to four passes:
//!
//! 1. **Primary**: FOF with the configured stream predicate. When the
//!    iterative flag is set, thresholds start *tighter* than configured
//!    (the expansion passes will loosen them), so the initial list is a
//!    conservative set of candidate cores.
//! 2. **Iterative expansion**: recover near-cell-size members, expand
//!    with widened tolerances to a fixed point, resolve over-linked
//!    groups through the inter-group merger machinery, then expand once
//!    more with a `2.25 x` widened spatial window for stream debris.
//! 3. **Background pass**: on a much coarser grid, a 6D
//!    background-picking FOF recovers compact massive subhaloes whose
//!    own bodies defined the local background of the fine grid.
//! 4. **Core pass**: the 6D halo-core search for major mergers.

use std::f64::consts::PI;

use tracing::{debug, info_span};

use crate::config::{FofType, HaloCoreSearch, SearchConfig};
use crate::density::DensityGrid;
use crate::fof::{fof_criterion, fof_nn_criterion, FofPredicate, LinkFilter, LinkParams};
use crate::groups::{self, GroupLinks, UNGROUPED};
use crate::kdtree::KdTree;
use crate::particle::Particle;
use crate::significance::check_significance;

use super::cores::halo_core_search;
use super::expansion::{
  determine_group_links, determine_new_links, link_untagged, merge_groups, merger_connections,
  search_new_links, MergeRule, BLOCKED,
};

/// Result of one subset search.
pub struct SubsetOutcome {
  /// Subset-local labels, contiguous `1..=ngroups`. Core groups occupy
  /// the trailing `num_cores` ids.
  pub pfof: Vec<usize>,
  pub ngroups: usize,
  /// Number of halo-core groups appended by the core pass.
  pub num_cores: usize,
}

/// Search one subset for dynamically distinct substructure.
///
/// `scores` are the subset's outlier scores (empty slice for subsets too
/// small to score), `sigma_v2` the fine-grid velocity variance scale and
/// `sublevel` the recursion depth (1 = searching a field halo).
pub fn search_subset(
  cfg: &SearchConfig,
  parts: &[Particle],
  scores: &[f64],
  sigma_v2: f64,
  sublevel: usize,
) -> SubsetOutcome {
  let n = parts.len();
  let _span = info_span!("search_subset", n, sublevel).entered();
  if n == 0 {
    return SubsetOutcome {
      pfof: Vec::new(),
      ngroups: 0,
      num_cores: 0,
    };
  }
  let tree = KdTree::build(parts, cfg.bucket_size, 0.0);
  let ncell = cfg.cell_occupancy(n);

  let mut min_size = cfg.min_size;
  let sub_ll = cfg.sub_link_length();
  let mut params = LinkParams {
    rx2: sub_ll * sub_ll,
    rv2: cfg.vel_link_length2(),
    vratio: cfg.vratio,
    cos_theta: (cfg.thetaopen * PI).cos(),
    ell_threshold: cfg.ellthreshold,
    period: 0.0,
  };
  // When iterating, tighten the first pass: a conservative seed list that
  // the expansion passes then grow with loosened tolerances.
  if cfg.iterate {
    params.rx2 *= cfg.ellxfac * cfg.ellxfac / 4.0;
    if cfg.foftype == FofType::SixDSubset {
      params.rv2 *= cfg.vfac * cfg.vfac;
    } else {
      params.vratio *= cfg.vfac;
    }
    params.cos_theta = (cfg.thetaopen * PI * cfg.thetafac).cos();
    params.ell_threshold = cfg.ellthreshold * cfg.ellfac;
    min_size = ((min_size as f64 * cfg.nminfac) as usize).max(2);
  }

  // --- primary pass ---
  let (mut pfof, mut ngroups) = if n >= cfg.min_sub_size {
    let out = match cfg.foftype {
      FofType::StreamProb => fof_criterion(
        &tree,
        FofPredicate::StreamProb,
        &params,
        scores,
        min_size,
        true,
        LinkFilter::None,
      ),
      FofType::SixDSubset => fof_criterion(
        &tree,
        FofPredicate::Phase6d,
        &params,
        scores,
        min_size,
        true,
        LinkFilter::None,
      ),
      FofType::StreamProbNn | FofType::StreamProbNnLx | FofType::StreamProbNnNoDist => {
        let mut p = params;
        if cfg.foftype == FofType::StreamProbNnNoDist {
          p.rx2 = f64::INFINITY;
        }
        fof_nn_criterion(
          &tree,
          FofPredicate::StreamProb,
          &p,
          scores,
          cfg.nvel,
          min_size,
          true,
          LinkFilter::None,
        )
      }
    };
    (out.pfof, out.ngroups)
  } else {
    (vec![UNGROUPED; n], 0)
  };
  debug!(ngroups, "primary pass done");

  // --- iterative expansion ---
  if cfg.iterate && ngroups > 0 {
    ngroups = iterative_expansion(cfg, parts, &tree, scores, &mut pfof, ngroups, ncell);
    debug!(ngroups, "iterative expansion done");
  }

  // --- significance ---
  if ngroups > 0 {
    let ids: Vec<i64> = parts.iter().map(|p| p.id).collect();
    let (ng, _) = check_significance(cfg, scores, &ids, &mut pfof, ngroups);
    ngroups = ng;
  }

  // --- background large-structure pass ---
  if n > cfg.min_sub_size && ngroups > 0 {
    ngroups = background_pass(cfg, parts, &tree, &mut pfof, ngroups, ncell, sigma_v2);
    debug!(ngroups, "background pass done");
  }

  // --- halo-core pass ---
  let mut num_cores = 0;
  let core_level = (!cfg.single_halo && sublevel == 1) || (cfg.single_halo && sublevel == 0);
  if cfg.halo_core_search != HaloCoreSearch::Off && core_level {
    let out = halo_core_search(cfg, parts, &tree, &mut pfof, ngroups, sigma_v2);
    num_cores = out.num_cores;
    ngroups = out.ngroups;
  }

  SubsetOutcome {
    pfof,
    ngroups,
    num_cores,
  }
}

/// Collect the members of every active group, optionally keeping only
/// those at or above `score_min`.
fn group_seeds(
  links: &GroupLinks,
  counts: &[usize],
  inactive: &[bool],
  scores: &[f64],
  score_min: Option<f64>,
  size_min: usize,
) -> Vec<usize> {
  let ngroups = counts.len() - 1;
  let mut seeds = Vec::new();
  for g in 1..=ngroups {
    if inactive[g] || counts[g] == 0 || counts[g] < size_min {
      continue;
    }
    for p in links.iter_group(g) {
      match score_min {
        Some(min) => {
          if scores.get(p).copied().unwrap_or(0.0) >= min {
            seeds.push(p);
          }
        }
        None => seeds.push(p),
      }
    }
  }
  seeds
}

/// The three expansion sub-passes plus the merger loop. Returns the new
/// group count; labels come back compacted and size-ordered.
fn iterative_expansion(
  cfg: &SearchConfig,
  parts: &[Particle],
  tree: &KdTree<'_>,
  scores: &[f64],
  pfof: &mut Vec<usize>,
  ngroups: usize,
  ncell: usize,
) -> usize {
  let n = parts.len();
  let _span = info_span!("iterative_expansion", ngroups).entered();
  let mut counts = groups::num_in_group(pfof, ngroups);
  let pglist = groups::build_pglist(pfof, ngroups);
  let mut links = GroupLinks::build(n, &pglist);
  let mut inactive = vec![false; ngroups + 1];
  let mut nnid = vec![0i64; n];

  let thr_low = cfg.ellthreshold * cfg.ellfac;
  let sub_ll = cfg.sub_link_length();
  let base = LinkParams {
    rx2: sub_ll * sub_ll,
    rv2: cfg.vel_link_length2(),
    vratio: cfg.vratio,
    cos_theta: (cfg.thetaopen * PI).cos(),
    ell_threshold: thr_low,
    period: 0.0,
  };

  // Sub-pass 1: near-cell-size recovery. Subhaloes close to the cell
  // scale have centres that defined the background, so their members do
  // not look like outliers; admit them through grouped seeds at the
  // lowered threshold, unchanged link length.
  for (i, &g) in pfof.iter().enumerate() {
    if g != UNGROUPED {
      nnid[i] = g as i64;
    }
  }
  let seeds = group_seeds(&links, &counts, &inactive, scores, None, ncell / 10);
  search_new_links(
    tree,
    FofPredicate::StreamProbIterative,
    &base,
    scores,
    &seeds,
    pfof,
    &mut nnid,
  );
  let (_, per_group) = determine_new_links(pfof, &nnid, ngroups);
  link_untagged(&per_group, pfof, &mut nnid, &mut links, &mut counts);

  // Anything still unmarked and below the lowered threshold can never be
  // admitted by the widened passes either; block it outright.
  for i in 0..n {
    if nnid[i] == 0 && scores.get(i).copied().unwrap_or(0.0) < thr_low {
      nnid[i] = BLOCKED;
    }
  }

  // Sub-pass 2: expanded linking to a fixed point.
  let mut widened = base;
  widened.rx2 = sub_ll * sub_ll * cfg.ellxfac * cfg.ellxfac;
  widened.vratio = cfg.vratio * cfg.vfac;
  widened.cos_theta = (cfg.thetaopen * PI * cfg.thetafac).cos();
  // Group sizes before expansion: the merger fraction is measured
  // against these, so growth cannot make every neighbour absorbable.
  let old_num = counts.clone();
  let mut seeds = group_seeds(&links, &counts, &inactive, scores, Some(thr_low), 0);
  loop {
    search_new_links(
      tree,
      FofPredicate::StreamProb,
      &widened,
      scores,
      &seeds,
      pfof,
      &mut nnid,
    );
    let (newlinks, per_group) = determine_new_links(pfof, &nnid, ngroups);
    if newlinks.is_empty() {
      break;
    }
    link_untagged(&per_group, pfof, &mut nnid, &mut links, &mut counts);
    seeds = newlinks;
  }

  // Inter-group mergers, cascading until quiescent.
  let mut seeds = group_seeds(&links, &counts, &inactive, scores, Some(thr_low), 0);
  for &p in &seeds {
    nnid[p] = pfof[p] as i64;
  }
  let all_members: Vec<usize> = (0..n).filter(|&i| pfof[i] != UNGROUPED).collect();
  loop {
    search_new_links(
      tree,
      FofPredicate::StreamProb,
      &widened,
      scores,
      &seeds,
      pfof,
      &mut nnid,
    );
    let glinks = determine_group_links(&all_members, pfof, &nnid, ngroups);
    let connections = merger_connections(&glinks, pfof, ngroups);
    let mut new_seeds = Vec::new();
    let mergers = merge_groups(
      &connections,
      MergeRule::Substructure { fmerge: cfg.fmerge },
      &old_num,
      pfof,
      &mut nnid,
      &mut links,
      &mut counts,
      &mut inactive,
      &mut new_seeds,
    );
    if mergers == 0 {
      break;
    }
    seeds = new_seeds;
  }

  // Sub-pass 3: a second expansion with a 2.25x wider spatial window
  // mops up outlying stream debris around the merged groups.
  let mut wide2 = widened;
  wide2.rx2 *= 2.25;
  let mut seeds = group_seeds(&links, &counts, &inactive, scores, Some(thr_low), 0);
  loop {
    search_new_links(
      tree,
      FofPredicate::StreamProb,
      &wide2,
      scores,
      &seeds,
      pfof,
      &mut nnid,
    );
    let (newlinks, per_group) = determine_new_links(pfof, &nnid, ngroups);
    if newlinks.is_empty() {
      break;
    }
    link_untagged(&per_group, pfof, &mut nnid, &mut links, &mut counts);
    seeds = newlinks;
  }

  // Adjust: the full minimum size applies again after expansion.
  groups::dissolve_small(pfof, ngroups, cfg.min_size);
  let ids: Vec<i64> = parts.iter().map(|p| p.id).collect();
  groups::reorder_by_size(pfof, ngroups, &ids).0
}

/// Background large-structure pass: rebuild the velocity grid with very
/// coarse cells, rescore, and run a 6D background-up FOF that may only
/// claim untagged particles. New groups are reconciled against the
/// existing ones with the background merger rule.
fn background_pass(
  cfg: &SearchConfig,
  parts: &[Particle],
  tree: &KdTree<'_>,
  pfof: &mut Vec<usize>,
  ngroups: usize,
  ncell: usize,
  sigma_v2: f64,
) -> usize {
  let n = parts.len();
  let _span = info_span!("background_pass", ngroups).entered();
  let occupancy = (n / 10).max(1);
  let grid = DensityGrid::build(parts, occupancy, sigma_v2);
  let bg_scores = grid.outlier_scores(parts, cfg.nvel);

  let thr_bg = cfg.ellthreshold * cfg.ellfac * 0.8;
  let sub_ll = cfg.sub_link_length();
  let params = LinkParams {
    rx2: sub_ll * sub_ll * cfg.ellxfac * cfg.ellxfac,
    rv2: grid.sigma_v2.max(f64::MIN_POSITIVE),
    vratio: cfg.vratio,
    cos_theta: (cfg.thetaopen * PI).cos(),
    ell_threshold: thr_bg,
    period: 0.0,
  };
  let min_bg = ((ncell as f64 * 0.2) as usize).max(2);
  let out = fof_criterion(
    tree,
    FofPredicate::Background6d,
    &params,
    &bg_scores,
    min_bg,
    true,
    LinkFilter::Untagged { labels: pfof },
  );
  if out.ngroups == 0 {
    debug!("no large background substructure");
    return ngroups;
  }
  let oldng = ngroups;
  let ngroups = ngroups + out.ngroups;
  for i in 0..n {
    if pfof[i] == UNGROUPED && out.pfof[i] != UNGROUPED {
      pfof[i] = oldng + out.pfof[i];
    }
  }

  let mut counts = groups::num_in_group(pfof, ngroups);
  let pglist = groups::build_pglist(pfof, ngroups);
  let mut links = GroupLinks::build(n, &pglist);
  let mut inactive = vec![false; ngroups + 1];
  let mut nnid = vec![0i64; n];
  for (i, &g) in pfof.iter().enumerate() {
    if g != UNGROUPED {
      nnid[i] = g as i64;
    }
  }

  // Recover stragglers around the new groups at the relaxed threshold.
  let base = LinkParams {
    rx2: sub_ll * sub_ll,
    rv2: cfg.vel_link_length2(),
    vratio: cfg.vratio,
    cos_theta: (cfg.thetaopen * PI).cos(),
    ell_threshold: thr_bg,
    period: 0.0,
  };
  let new_members: Vec<usize> = (0..n).filter(|&i| pfof[i] > oldng).collect();
  search_new_links(
    tree,
    FofPredicate::StreamProbIterative,
    &base,
    &bg_scores,
    &new_members,
    pfof,
    &mut nnid,
  );
  let (_, per_group) = determine_new_links(pfof, &nnid, ngroups);
  link_untagged(&per_group, pfof, &mut nnid, &mut links, &mut counts);

  // Merger reconciliation. Old-group marks are shifted above every valid
  // id so the (higher-numbered) background groups can mark them at all;
  // marks the sweep leaves untouched are then restored.
  let old_members: Vec<usize> = (0..n)
    .filter(|&i| pfof[i] != UNGROUPED && pfof[i] <= oldng)
    .collect();
  for &p in &old_members {
    nnid[p] = (pfof[p] + ngroups) as i64;
  }
  let new_members: Vec<usize> = (0..n).filter(|&i| pfof[i] > oldng).collect();
  let mut wide = params;
  wide.vratio = cfg.vratio * cfg.vfac;
  wide.cos_theta = (cfg.thetaopen * PI * cfg.thetafac).cos();
  wide.ell_threshold = f64::NEG_INFINITY;
  search_new_links(
    tree,
    FofPredicate::StreamProb,
    &wide,
    &bg_scores,
    &new_members,
    pfof,
    &mut nnid,
  );
  for &p in &old_members {
    if nnid[p] == (pfof[p] + ngroups) as i64 {
      nnid[p] = pfof[p] as i64;
    }
  }
  let glinks = determine_group_links(&old_members, pfof, &nnid, ngroups);
  let connections = merger_connections(&glinks, pfof, ngroups);
  let old_num = counts.clone();
  let mut new_seeds = Vec::new();
  merge_groups(
    &connections,
    MergeRule::Background {
      fmergebg: cfg.fmergebg,
      ratio: cfg.halo_merger_ratio,
    },
    &old_num,
    pfof,
    &mut nnid,
    &mut links,
    &mut counts,
    &mut inactive,
    &mut new_seeds,
  );

  groups::dissolve_small(pfof, ngroups, cfg.min_size);
  let ids: Vec<i64> = parts.iter().map(|p| p.id).collect();
  groups::reorder_by_size(pfof, ngroups, &ids).0
}

#[cfg(test)]
#[path = "subset_test.rs"]
mod subset_test;
