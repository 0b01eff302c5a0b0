//! Recursion driver: walk the candidate list level by level, searching
//! every structure large enough to host substructure.
//!
//! Each candidate group's particles are *copied* and shifted into the
//! group's centre-of-mass rest frame, so the parent's coordinates are
//! never touched. Subset labels splice back into the global label array
//! at a running id offset; particles the unbinding hook rejects keep
//! their parent-level id (the sub-child simply never claims them).

use glam::DVec3;
use rayon::prelude::*;
use tracing::{debug, info_span};

use crate::config::{PartSearchType, SearchConfig};
use crate::density::DensityGrid;
use crate::groups::{self, UNGROUPED};
use crate::hierarchy::{GroupHandle, LevelEntry, StructureHierarchy, StructureType};
use crate::particle::{Particle, ParticleType};
use crate::unbind::Unbinder;

use super::subset::search_subset;

/// Subset size above which the centre-of-mass reduction runs in parallel.
const PAR_CM_MIN: usize = 100_000;

struct Candidate {
  parent: GroupHandle,
  uber: GroupHandle,
  members: Vec<usize>,
}

/// Search every group of the field level (and recursively every
/// substructure) for nested structure, extending `pfof`, `ngroup` and the
/// hierarchy in place. `halo_vel_disp_scale` carries the largest velocity
/// variance scale seen so far and is used as the fallback for degenerate
/// local estimates.
pub fn search_sub_sub(
  cfg: &SearchConfig,
  parts: &[Particle],
  pfof: &mut [usize],
  ngroup: &mut usize,
  hierarchy: &mut StructureHierarchy,
  halo_vel_disp_scale: &mut f64,
  unbinder: &dyn Unbinder,
) {
  if *ngroup == 0 {
    return;
  }
  let _span = info_span!("search_sub_sub", ngroup = *ngroup).entered();

  // In the all-species FOF mode only dark matter takes part in the
  // substructure search; baryons rejoin through the association pass.
  let dark_only = cfg.baryon_search && cfg.part_search_type == PartSearchType::All;
  let searchable =
    |i: usize| -> bool { !dark_only || parts[i].ptype == ParticleType::Dark };

  // Field-level candidates, in id order.
  let mut pglist: Vec<Vec<usize>> = vec![Vec::new(); *ngroup + 1];
  for (i, &g) in pfof.iter().enumerate() {
    if g != UNGROUPED && searchable(i) {
      pglist[g].push(i);
    }
  }
  let field_handles: Vec<GroupHandle> = hierarchy.levels()[0]
    .entries
    .iter()
    .map(|e| e.handle)
    .collect();
  let mut candidates: Vec<Candidate> = Vec::new();
  for gid in 1..=*ngroup {
    if pglist[gid].len() >= cfg.min_cell_size {
      let handle = field_handles[gid - 1];
      candidates.push(Candidate {
        parent: handle,
        uber: handle,
        members: std::mem::take(&mut pglist[gid]),
      });
    }
  }

  let mut sublevel = 1usize;
  let mut offset = 0usize;
  while !candidates.is_empty() {
    debug!(sublevel, n = candidates.len(), "searching sublevel");
    let mut next: Vec<Candidate> = Vec::new();
    let mut level_entries: Vec<LevelEntry> = Vec::new();

    for cand in &candidates {
      let members = &cand.members;
      let m = members.len();
      let mut subparts: Vec<Particle> = members.iter().map(|&i| parts[i]).collect();
      if cfg.cm_ref_adjust {
        shift_to_cm_frame(&mut subparts);
      }
      let occupancy = cfg.cell_occupancy(m);
      let grid = DensityGrid::build(&subparts, occupancy, *halo_vel_disp_scale);
      let sigma_v2 = grid.sigma_v2;
      if sigma_v2 > *halo_vel_disp_scale {
        *halo_vel_disp_scale = sigma_v2;
      }
      let scores = if m >= cfg.min_sub_size {
        grid.outlier_scores(&subparts, cfg.nvel)
      } else {
        Vec::new()
      };
      let mut out = search_subset(cfg, &subparts, &scores, sigma_v2, sublevel);
      if out.ngroups == 0 {
        continue;
      }

      // Unbinding: rejected particles keep the parent id, shrunken
      // groups below the minimum dissolve entirely.
      if unbinder.unbind(&subparts, &mut out.pfof, out.ngroups) > 0 {
        groups::dissolve_small(&mut out.pfof, out.ngroups, cfg.min_size);
        let (ng, _) = groups::compact_labels(&mut out.pfof, out.ngroups);
        out.num_cores = out.num_cores.min(ng);
        out.ngroups = ng;
        if ng == 0 {
          continue;
        }
      }

      // Splice subset labels into the global array.
      let id_base = *ngroup + offset;
      for (j, &sp) in out.pfof.iter().enumerate() {
        if sp != UNGROUPED {
          pfof[members[j]] = id_base + sp;
        }
      }
      offset += out.ngroups;

      // The parent's head particle may have moved into a child; repoint
      // it at the first member the parent kept.
      if let Some(&kept) = members
        .iter()
        .enumerate()
        .find(|&(j, _)| out.pfof[j] == UNGROUPED)
        .map(|(_, i)| i)
      {
        if let Some(entry) = hierarchy.entry_mut(sublevel - 1, cand.parent) {
          entry.head_id = parts[kept].id;
        }
      }

      // Hierarchy entries and next-level candidates.
      let subpg = groups::build_pglist(&out.pfof, out.ngroups);
      for sg in 1..=out.ngroups {
        let gmembers: Vec<usize> = subpg[sg].iter().map(|&j| members[j]).collect();
        let handle = hierarchy.alloc_handle(id_base + sg);
        let is_core = sg > out.ngroups - out.num_cores;
        let stype = if is_core {
          StructureType::HaloCore {
            depth: sublevel as u32,
          }
        } else {
          StructureType::Subhalo {
            depth: sublevel as u32,
          }
        };
        level_entries.push(LevelEntry {
          handle,
          head_id: parts[gmembers[0]].id,
          parent: Some(cand.parent),
          uber: Some(cand.uber),
          stype,
        });
        if gmembers.len() > cfg.min_sub_size {
          next.push(Candidate {
            parent: handle,
            uber: cand.uber,
            members: gmembers,
          });
        }
      }
    }

    if !level_entries.is_empty() {
      hierarchy.append_level(sublevel, level_entries);
    }
    candidates = next;
    sublevel += 1;
  }

  *ngroup += offset;
  debug!(ngroup = *ngroup, levels = hierarchy.depth(), "substructure search done");
}

/// Shift a subset into its mass-weighted centre-of-mass rest frame (both
/// position and velocity).
pub fn shift_to_cm_frame(subparts: &mut [Particle]) {
  let m = subparts.len();
  if m == 0 {
    return;
  }
  let (mtot, cm, cmvel) = if m > PAR_CM_MIN {
    subparts
      .par_iter()
      .map(|p| (p.mass, p.position * p.mass, p.velocity * p.mass))
      .reduce(
        || (0.0, DVec3::ZERO, DVec3::ZERO),
        |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2),
      )
  } else {
    subparts.iter().fold((0.0, DVec3::ZERO, DVec3::ZERO), |a, p| {
      (a.0 + p.mass, a.1 + p.position * p.mass, a.2 + p.velocity * p.mass)
    })
  };
  if mtot <= 0.0 {
    return;
  }
  let cm = cm / mtot;
  let cmvel = cmvel / mtot;
  for p in subparts.iter_mut() {
    p.position -= cm;
    p.velocity -= cmvel;
  }
}
