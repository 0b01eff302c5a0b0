//! Baryon association.
//!
//! After the dark-matter hierarchy is final, gas and star particles are
//! attached to existing groups by phase-space proximity: a kNN search
//! against the *grouped* dark-matter particles, a 6D window at the halo
//! linking scales, and an energy-aware distance that charges a gas
//! particle's thermal energy against the velocity window. A baryon that
//! passes no window stays ungrouped.
//!
//! In the all-species FOF mode baryons arrive with their FOF labels and
//! may only be moved into a *smaller* group than their current one - the
//! substructure-affinity rule - so haloes cannot steal substructure gas.

use rayon::prelude::*;
use tracing::{debug, info_span};

use crate::config::{PartSearchType, SearchConfig};
use crate::fof::{FofPredicate, LinkParams};
use crate::groups::{self, UNGROUPED};
use crate::kdtree::KdTree;
use crate::particle::{periodic_delta, Particle, ParticleType};

/// Associate `baryons` with the dark-matter groups in `pfof_dark`.
///
/// `pfof_baryons` holds the baryons' current labels (all zero in
/// dark-only mode, FOF labels in all-species mode) and is updated in
/// place. `halo_vel_disp_scale` is the running halo velocity variance
/// scale; when it is zero the dispersion of the largest group is used.
pub fn search_baryons(
  cfg: &SearchConfig,
  dark: &[Particle],
  pfof_dark: &[usize],
  ngroups: usize,
  baryons: &[Particle],
  pfof_baryons: &mut [usize],
  halo_vel_disp_scale: f64,
) {
  let _span = info_span!("search_baryons", nbaryons = baryons.len(), ngroups).entered();
  if ngroups == 0 || baryons.is_empty() {
    return;
  }
  let counts = groups::num_in_group(pfof_dark, ngroups);
  let npartingroups: usize = counts[1..].iter().sum();
  if npartingroups == 0 {
    return;
  }
  let nsearch = npartingroups.min(2 * cfg.min_size);

  // Contiguous copy of the grouped dark matter, so the tree only ever
  // proposes groupable neighbours.
  let mut grouped_parts: Vec<Particle> = Vec::with_capacity(npartingroups);
  let mut grouped_gid: Vec<usize> = Vec::with_capacity(npartingroups);
  for (i, &g) in pfof_dark.iter().enumerate() {
    if g != UNGROUPED {
      grouped_parts.push(dark[i]);
      grouped_gid.push(g);
    }
  }

  let ell = cfg.halo_link_length();
  let rv2 = if halo_vel_disp_scale > 0.0 {
    // Local halo dispersions run well below the global scale; a factor
    // 16 on the variance keeps the window from clipping hot haloes.
    halo_vel_disp_scale * 16.0
  } else {
    largest_group_dispersion(dark, pfof_dark)
  };
  if rv2 <= 0.0 {
    return;
  }
  let params = LinkParams::phase(ell * ell, rv2, cfg.period);
  debug!(
    ell,
    ellvel = rv2.sqrt(),
    npartingroups,
    nsearch,
    "baryon phase-space match"
  );

  let bucket = (nsearch / 2).max(1);
  let tree = KdTree::build(&grouped_parts, bucket, cfg.period);
  let all_mode = cfg.part_search_type == PartSearchType::All;

  let current_labels: &[usize] = pfof_baryons;
  let assignments: Vec<(usize, usize)> = baryons
    .par_iter()
    .enumerate()
    .filter_map(|(i, b)| {
      let current = current_labels[i];
      if all_mode && current == UNGROUPED {
        // never grouped by the FOF: not a structure member
        return None;
      }
      let nn = tree.find_nearest_pos(b.position, nsearch);
      if nn.is_empty() || nn[0].1 > params.rx2 {
        return None;
      }
      let mut best: Option<(f64, usize)> = None;
      for &(j, _) in &nn {
        let cand = grouped_gid[j];
        if all_mode && (cand == current || counts[cand] >= counts[current]) {
          // substructure affinity: only strictly smaller groups may
          // claim an already-grouped baryon
          continue;
        }
        let neighbour = &grouped_parts[j];
        if !FofPredicate::Phase6d.links(b, neighbour, 0.0, 0.0, &params) {
          continue;
        }
        let dx = periodic_delta(b.position, neighbour.position, cfg.period);
        let dv = b.velocity - neighbour.velocity;
        let mut d2 = dx.length_squared() / params.rx2 + dv.length_squared() / params.rv2;
        if b.ptype == ParticleType::Gas {
          d2 += b.internal_energy / params.rv2;
        }
        if best.map(|(bd, _)| d2 < bd).unwrap_or(true) {
          best = Some((d2, cand));
        }
      }
      best.map(|(_, gid)| (i, gid))
    })
    .collect();

  let moved = assignments.len();
  for (i, gid) in assignments {
    pfof_baryons[i] = gid;
  }
  debug!(moved, "baryons associated");
}

/// Mass-weighted velocity variance of the largest group, the fallback
/// velocity window when no halo dispersion scale has been measured yet.
fn largest_group_dispersion(dark: &[Particle], pfof_dark: &[usize]) -> f64 {
  let mut mtot = 0.0;
  let mut vmean = glam::DVec3::ZERO;
  for (i, &g) in pfof_dark.iter().enumerate() {
    if g == 1 {
      mtot += dark[i].mass;
      vmean += dark[i].velocity * dark[i].mass;
    }
  }
  if mtot <= 0.0 {
    return 0.0;
  }
  vmean /= mtot;
  let mut var = 0.0;
  for (i, &g) in pfof_dark.iter().enumerate() {
    if g == 1 {
      var += (dark[i].velocity - vmean).length_squared() * dark[i].mass;
    }
  }
  var / mtot
}

#[cfg(test)]
#[path = "baryons_test.rs"]
mod baryons_test;
