//! Field-halo search over the full particle set.
//!
//! A 3D FOF at the halo linking length finds the field haloes. If the 6D
//! background mode is on, the velocity scale of the largest 3D halo sets
//! a velocity linking length and each 3D halo is re-searched with a 6D
//! FOF, which splits spurious bridges between dynamically distinct
//! objects. The surviving groups seed level 0 of the hierarchy.

use glam::DVec3;
use rayon::prelude::*;
use tracing::{debug, info, info_span};

use crate::config::{FofBgType, SearchConfig};
use crate::domain;
use crate::error::Result;
use crate::fof::{fof, fof_criterion, FofPredicate, LinkFilter, LinkParams};
use crate::groups::{self, UNGROUPED};
use crate::hierarchy::StructureHierarchy;
use crate::kdtree::KdTree;
use crate::particle::{periodic_delta, Particle};

/// Group size above which the periodic adjustment loops in parallel.
const PAR_PERIOD_MIN: usize = 100_000;

/// Result of the field search.
pub struct FullSearchOutcome {
  pub pfof: Vec<usize>,
  pub ngroups: usize,
}

/// Search the full particle set for field haloes and seed the hierarchy's
/// field level. With `period > 0` the particles of each group are also
/// shifted to the group representative's image, so every later phase can
/// treat coordinates as non-periodic.
pub fn search_full_set(
  cfg: &SearchConfig,
  parts: &mut [Particle],
  hierarchy: &mut StructureHierarchy,
) -> Result<FullSearchOutcome> {
  let n = parts.len();
  let _span = info_span!("search_full_set", n).entered();
  let ell = cfg.halo_link_length();
  info!(ell, minsize = cfg.halo_min_size, "3D FOF over full set");

  let (mut pfof, mut ngroups) = if cfg.num_workers > 1 {
    let out = domain::distributed_fof(cfg, parts)?;
    (out.pfof, out.ngroups)
  } else {
    let tree = KdTree::build(parts, cfg.bucket_size, cfg.period);
    let out = fof(&tree, ell, cfg.halo_min_size, true);
    (out.pfof, out.ngroups)
  };
  debug!(ngroups, "3D FOF done");

  if cfg.fofbgtype == FofBgType::Fof6d && ngroups > 0 {
    ngroups = refine_6d(cfg, parts, &mut pfof, ngroups);
    debug!(ngroups, "6D refinement done");
  }

  // Seed the field level: one halo entry per group, head = first member.
  let mut head_ids = vec![-1i64; ngroups + 1];
  for (i, &g) in pfof.iter().enumerate() {
    if g != UNGROUPED && head_ids[g] == -1 {
      head_ids[g] = parts[i].id;
    }
  }
  hierarchy.seed_field_level(&head_ids);

  if cfg.period > 0.0 && ngroups > 0 {
    adjust_for_period(cfg.period, parts, &pfof, ngroups);
  }
  Ok(FullSearchOutcome { pfof, ngroups })
}

/// Re-search each 3D group with a 6D FOF whose velocity scale comes from
/// the largest halo's velocity variance (inflated by 1.25^2 so outlying
/// streams of the halo still link).
fn refine_6d(cfg: &SearchConfig, parts: &[Particle], pfof: &mut Vec<usize>, ngroups: usize) -> usize {
  let pglist = groups::build_pglist(pfof, ngroups);

  // Velocity scale from the largest group (id 1 after size ordering).
  let mut mtot = 0.0;
  let mut vmean = DVec3::ZERO;
  for &i in &pglist[1] {
    mtot += parts[i].mass;
    vmean += parts[i].velocity * parts[i].mass;
  }
  if mtot <= 0.0 {
    return ngroups;
  }
  vmean /= mtot;
  let mut vscale2 = 0.0;
  for &i in &pglist[1] {
    vscale2 += (parts[i].velocity - vmean).length_squared() * parts[i].mass;
  }
  vscale2 /= mtot;
  vscale2 *= 1.25 * 1.25;
  if vscale2 <= 0.0 {
    return ngroups;
  }

  let ell = cfg.halo_link_length();
  let params = LinkParams {
    rx2: ell * ell,
    rv2: vscale2,
    vratio: f64::INFINITY,
    cos_theta: -1.0,
    ell_threshold: f64::NEG_INFINITY,
    period: cfg.period,
  };
  info!(
    ellvel = vscale2.sqrt(),
    ngroups, "6D FOF within 3D groups"
  );

  // Each 3D group is refined independently; the per-group searches run
  // in parallel, the splice is sequential in group order so the id
  // layout is deterministic.
  let refined: Vec<(usize, Vec<usize>, usize)> = (1..=ngroups)
    .into_par_iter()
    .map(|g| {
      let members = &pglist[g];
      let subparts: Vec<Particle> = members.iter().map(|&i| parts[i]).collect();
      let tree = KdTree::build(&subparts, cfg.bucket_size, cfg.period);
      let out = fof_criterion(
        &tree,
        FofPredicate::Phase6d,
        &params,
        &[],
        cfg.halo_min_size,
        true,
        LinkFilter::None,
      );
      (g, out.pfof, out.ngroups)
    })
    .collect();

  pfof.iter_mut().for_each(|g| *g = UNGROUPED);
  let mut offset = 0usize;
  for (g, sub, ng) in refined {
    for (j, &sp) in sub.iter().enumerate() {
      if sp != UNGROUPED {
        pfof[pglist[g][j]] = offset + sp;
      }
    }
    offset += ng;
  }
  let ids: Vec<i64> = parts.iter().map(|p| p.id).collect();
  groups::reorder_by_size(pfof, offset, &ids).0
}

/// Shift each group member to the image nearest the group's
/// representative (its first member), so that in-group distances never
/// exceed half the period. Required before any centroid or profile is
/// computed downstream.
pub fn adjust_for_period(period: f64, parts: &mut [Particle], pfof: &[usize], ngroups: usize) {
  let pglist = groups::build_pglist(pfof, ngroups);
  let reps: Vec<DVec3> = pglist
    .iter()
    .map(|members| {
      members
        .first()
        .map(|&i| parts[i].position)
        .unwrap_or(DVec3::ZERO)
    })
    .collect();

  let shift = |p: &mut Particle, rep: DVec3| {
    p.position = rep - periodic_delta(rep, p.position, period);
  };

  // Keyed by particle: every particle belongs to at most one group, so
  // the parallel sweep is write-disjoint.
  if parts.len() > PAR_PERIOD_MIN {
    parts.par_iter_mut().enumerate().for_each(|(i, p)| {
      let g = pfof[i];
      if g != UNGROUPED {
        shift(p, reps[g]);
      }
    });
  } else {
    for (i, p) in parts.iter_mut().enumerate() {
      let g = pfof[i];
      if g != UNGROUPED {
        shift(p, reps[g]);
      }
    }
  }
}

#[cfg(test)]
#[path = "full_test.rs"]
mod full_test;
