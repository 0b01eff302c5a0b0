//! 6D halo-core search.
//!
//! A halo hosting an ongoing major merger carries several coeval dense
//! cores that a fine-grid outlier search cannot see (each core *is* the
//! local background). A dedicated 6D FOF with a very tight spatial link
//! and a generous velocity link picks them out; if more than one core
//! emerges the halo has multiple major progenitors. In assignment mode
//! every remaining halo particle is then attached to its nearest core by
//! mass-weighted phase-space distance, splitting the halo body between
//! the progenitors.

use rayon::prelude::*;
use tracing::debug;

use crate::config::{HaloCoreSearch, SearchConfig};
use crate::fof::{fof_criterion, FofPredicate, LinkFilter, LinkParams};
use crate::kdtree::KdTree;
use crate::particle::Particle;

/// Outcome of the core pass.
pub struct CoreOutcome {
  /// Updated group count (core groups are appended after existing ids).
  pub ngroups: usize,
  /// Number of core groups added (`detected cores - 1`: the primary core
  /// stays part of the halo body).
  pub num_cores: usize,
}

/// Search `parts` (one halo or substructure subset) for multiple 6D
/// cores. `sigma_v2` is the subset's fine-grid velocity variance scale.
/// Particles already claimed by substructure (`pfof != 0`) are masked out
/// of the core FOF; in assignment mode they keep their substructure.
pub fn halo_core_search(
  cfg: &SearchConfig,
  parts: &[Particle],
  tree: &KdTree<'_>,
  pfof: &mut [usize],
  ngroups: usize,
  sigma_v2: f64,
) -> CoreOutcome {
  let n = parts.len();
  let ell_core = cfg.halo_link_length() * cfg.halocorexfac;
  let params = LinkParams::phase(
    ell_core * ell_core,
    sigma_v2 * cfg.halocorevfac * cfg.halocorevfac,
    0.0,
  );
  let min_core = ((n as f64 * cfg.halocorenfac) as usize).max(2);
  let out = fof_criterion(
    tree,
    FofPredicate::Phase6d,
    &params,
    &[],
    min_core,
    true,
    LinkFilter::Untagged { labels: pfof },
  );
  let ncores = out.ngroups;
  if ncores < 2 {
    debug!(ncores, "no excess cores, halo has a single progenitor");
    return CoreOutcome {
      ngroups,
      num_cores: 0,
    };
  }
  debug!(ncores, min_core, "multiple cores found");

  let mut core_label = out.pfof;
  if cfg.halo_core_search == HaloCoreSearch::DetectAssign {
    assign_to_cores(cfg, parts, pfof, &mut core_label, ncores, &params);
  }
  // Core 1 (the most massive) is the halo's own body; the secondaries
  // become new groups appended after the existing ids.
  for i in 0..n {
    if core_label[i] > 1 && pfof[i] == 0 {
      pfof[i] = ngroups + core_label[i] - 1;
    }
  }
  CoreOutcome {
    ngroups: ngroups + ncores - 1,
    num_cores: ncores - 1,
  }
}

/// Attach every unassigned halo particle to the core minimizing the
/// mass-weighted phase-space distance `D^2 / m_core`. Ties go to the
/// first candidate in neighbour order, which is deterministic.
fn assign_to_cores(
  cfg: &SearchConfig,
  parts: &[Particle],
  pfof: &[usize],
  core_label: &mut [usize],
  ncores: usize,
  params: &LinkParams,
) {
  let n = parts.len();
  // Contiguous copy of the tagged core particles, tagged with their core.
  let mut core_parts: Vec<Particle> = Vec::new();
  let mut core_of: Vec<usize> = Vec::new();
  let mut mcore = vec![0.0f64; ncores + 1];
  for i in 0..n {
    if core_label[i] > 0 {
      core_parts.push(parts[i]);
      core_of.push(core_label[i]);
      mcore[core_label[i]] += parts[i].mass;
    }
  }
  if core_parts.is_empty() || core_parts.len() == n {
    return;
  }
  let nsearch = cfg.nvel.min(core_parts.len());
  let bucket = cfg.bucket_size.min((core_parts.len() / 8).max(1));
  let tcore = KdTree::build(&core_parts, bucket, 0.0);

  let tagged: &[usize] = core_label;
  let assigned: Vec<(usize, usize)> = (0..n)
    .into_par_iter()
    .filter(|&i| pfof[i] == 0 && tagged[i] == 0)
    .map(|i| {
      let p = &parts[i];
      let nn = tcore.find_nearest_pos(p.position, nsearch);
      let mut best_core = core_of[nn[0].0];
      let mut best = phase_dist2(p, &core_parts[nn[0].0], params) / mcore[best_core];
      for &(j, _) in nn.iter().skip(1) {
        let cand = core_of[j];
        let d = phase_dist2(p, &core_parts[j], params) / mcore[cand];
        if d < best {
          best = d;
          best_core = cand;
        }
      }
      (i, best_core)
    })
    .collect();
  for (i, c) in assigned {
    core_label[i] = c;
  }
}

/// Scaled 6D distance used for core assignment.
#[inline]
fn phase_dist2(a: &Particle, b: &Particle, params: &LinkParams) -> f64 {
  (a.position - b.position).length_squared() / params.rx2
    + (a.velocity - b.velocity).length_squared() / params.rv2
}

#[cfg(test)]
#[path = "cores_test.rs"]
mod cores_test;
