//! Pipeline driver.
//!
//! Wires the phases together: field search -> substructure recursion ->
//! bound-halo filtering -> baryon association -> catalog assembly. All
//! mutable search state lives on the [`PipelineContext`] created for the
//! invocation; nothing survives between runs.

use tracing::{debug, info, info_span};

use crate::catalog::Catalog;
use crate::config::{PartSearchType, SearchConfig};
use crate::error::Result;
use crate::groups::{self, UNGROUPED};
use crate::hierarchy::StructureHierarchy;
use crate::particle::{Particle, ParticleType};
use crate::search::{search_full_set, search_sub_sub};
use crate::unbind::Unbinder;

/// Per-invocation pipeline state.
pub struct PipelineContext {
  pub config: SearchConfig,
  /// Largest velocity variance scale seen across all halo grids; the
  /// fallback for degenerate local estimates and the baryon window.
  pub halo_vel_disp_scale: f64,
  /// Structure hierarchy built by the searches.
  pub hierarchy: StructureHierarchy,
}

impl PipelineContext {
  pub fn new(config: SearchConfig) -> Self {
    Self {
      config,
      halo_vel_disp_scale: 0.0,
      hierarchy: StructureHierarchy::new(),
    }
  }
}

/// Run the full search pipeline over a particle snapshot.
///
/// Particles may arrive in any order; the catalog's per-particle ids are
/// reported in the order given here. The unbinder hook is invoked after
/// every substructure search and once more after baryon association.
pub fn run_pipeline(
  particles: &[Particle],
  config: &SearchConfig,
  unbinder: &dyn Unbinder,
) -> Result<Catalog> {
  config.validate()?;
  let _span = info_span!("run_pipeline", n = particles.len()).entered();
  let mut ctx = PipelineContext::new(config.clone());
  let cfg = config;

  // Split the input into the search set and the baryon set. In
  // all-species mode everything is searched together and baryons are
  // reconsidered afterwards; in dark mode only dark matter is searched.
  let all_mode = cfg.part_search_type == PartSearchType::All;
  let mut search_idx: Vec<usize> = Vec::new();
  let mut baryon_idx: Vec<usize> = Vec::new();
  for (i, p) in particles.iter().enumerate() {
    match p.ptype {
      ParticleType::Dark => search_idx.push(i),
      ParticleType::Gas | ParticleType::Star => {
        if all_mode {
          search_idx.push(i);
        }
        baryon_idx.push(i);
      }
      ParticleType::Other => {}
    }
  }
  let mut search_parts: Vec<Particle> = search_idx.iter().map(|&i| particles[i]).collect();
  info!(
    nsearch = search_parts.len(),
    nbaryons = baryon_idx.len(),
    "pipeline start"
  );

  // Field haloes.
  let out = search_full_set(cfg, &mut search_parts, &mut ctx.hierarchy)?;
  let mut pfof = out.pfof;
  let mut ngroups = out.ngroups;
  let nhalos = ngroups;

  // Substructure recursion.
  search_sub_sub(
    cfg,
    &search_parts,
    &mut pfof,
    &mut ngroups,
    &mut ctx.hierarchy,
    &mut ctx.halo_vel_disp_scale,
    unbinder,
  );

  // Bound field haloes, when requested and baryons will not re-open the
  // groups anyway.
  if cfg.bound_halos && !cfg.baryon_search && ngroups > 0 {
    let removed = unbinder.unbind(&search_parts, &mut pfof, ngroups);
    if removed > 0 {
      debug!(removed, "halo unbinding removed particles");
      ngroups = renumber_after_removal(cfg, &mut pfof, ngroups, &mut ctx.hierarchy);
    }
  }

  // Baryon association.
  if cfg.baryon_search && !baryon_idx.is_empty() {
    ngroups = associate_baryons(
      &mut ctx,
      particles,
      &search_idx,
      &baryon_idx,
      &mut search_parts,
      &mut pfof,
      ngroups,
      nhalos,
      unbinder,
    );
  }

  // Assemble the catalog in original input order. In dark mode the
  // associated baryons were appended after the search set.
  let mut group_ids = vec![UNGROUPED; particles.len()];
  for (k, &i) in search_idx.iter().enumerate() {
    group_ids[i] = pfof[k];
  }
  if pfof.len() > search_idx.len() {
    for (j, &i) in baryon_idx.iter().enumerate() {
      group_ids[i] = pfof[search_idx.len() + j];
    }
  }
  ctx.hierarchy.prune_dead();
  let flat = ctx.hierarchy.flatten(ngroups);
  let catalog = Catalog::assemble(group_ids, ngroups, &flat);
  info!(
    ngroups,
    levels = ctx.hierarchy.depth(),
    "pipeline done"
  );
  Ok(catalog)
}

/// Dissolve undersized groups, compact ids and push the renumbering
/// through the hierarchy. Keeps relative id order.
fn renumber_after_removal(
  cfg: &SearchConfig,
  pfof: &mut [usize],
  ngroups: usize,
  hierarchy: &mut StructureHierarchy,
) -> usize {
  groups::dissolve_small(pfof, ngroups, cfg.min_size);
  let (ng, map) = groups::compact_labels(pfof, ngroups);
  hierarchy.renumber(&map);
  hierarchy.prune_dead();
  ng
}

/// Baryon association plus the optional post-association unbinding and
/// reordering. Returns the (possibly reduced) group count.
#[allow(clippy::too_many_arguments)]
fn associate_baryons(
  ctx: &mut PipelineContext,
  particles: &[Particle],
  search_idx: &[usize],
  baryon_idx: &[usize],
  search_parts: &mut Vec<Particle>,
  pfof: &mut Vec<usize>,
  ngroups: usize,
  nhalos: usize,
  unbinder: &dyn Unbinder,
) -> usize {
  let cfg = &ctx.config;
  let all_mode = cfg.part_search_type == PartSearchType::All;
  let _span = info_span!("associate_baryons", nbaryons = baryon_idx.len()).entered();

  // Dark-matter view: in all-species mode the search set contains the
  // baryons too, so carve out the dark prefix by type.
  let dark_pos: Vec<usize> = (0..search_parts.len())
    .filter(|&k| search_parts[k].ptype == ParticleType::Dark)
    .collect();
  let dark: Vec<Particle> = dark_pos.iter().map(|&k| search_parts[k]).collect();
  let pfof_dark: Vec<usize> = dark_pos.iter().map(|&k| pfof[k]).collect();

  let baryons: Vec<Particle> = baryon_idx.iter().map(|&i| particles[i]).collect();
  let mut pfof_baryons: Vec<usize> = if all_mode {
    // labels the baryons picked up in the all-species FOF
    let mut by_input = vec![UNGROUPED; particles.len()];
    for (k, &i) in search_idx.iter().enumerate() {
      by_input[i] = pfof[k];
    }
    baryon_idx.iter().map(|&i| by_input[i]).collect()
  } else {
    vec![UNGROUPED; baryons.len()]
  };

  crate::baryons::search_baryons(
    cfg,
    &dark,
    &pfof_dark,
    ngroups,
    &baryons,
    &mut pfof_baryons,
    ctx.halo_vel_disp_scale,
  );

  // Fold the baryon labels back into the search-set label array. In dark
  // mode the baryons were not part of the search set: append them so the
  // unified label array covers dark + baryons.
  if all_mode {
    let mut baryon_pos = 0usize;
    for (k, part) in search_parts.iter().enumerate() {
      if part.ptype.is_baryon() {
        pfof[k] = pfof_baryons[baryon_pos];
        baryon_pos += 1;
      }
    }
  } else {
    search_parts.extend(baryons.iter().copied());
    pfof.extend(pfof_baryons.iter().copied());
  }

  // Re-run unbinding over the unified dark + baryon groups, then restore
  // size ordering (by dark-matter content) and repatch the hierarchy.
  let removed = unbinder.unbind(search_parts, pfof, ngroups);
  if removed == 0 {
    return ngroups;
  }
  debug!(removed, "post-association unbinding removed particles");
  groups::dissolve_small(pfof, ngroups, ctx.config.min_size);

  // Order by dark-matter count; with inclusive ordering field haloes are
  // lifted above every substructure first.
  let mut dark_counts = vec![0usize; ngroups + 1];
  for (k, part) in search_parts.iter().enumerate() {
    if part.ptype == ParticleType::Dark && pfof[k] != UNGROUPED {
      dark_counts[pfof[k]] += 1;
    }
  }
  if ctx.config.inclusive_halo {
    let total_grouped: usize = dark_counts[1..].iter().sum();
    for g in 1..=nhalos.min(ngroups) {
      if dark_counts[g] > 0 {
        dark_counts[g] += total_grouped;
      }
    }
  }
  let mut first_id = vec![i64::MAX; ngroups + 1];
  for (k, part) in search_parts.iter().enumerate() {
    let g = pfof[k];
    if g != UNGROUPED && part.id < first_id[g] {
      first_id[g] = part.id;
    }
  }
  let mut order: Vec<usize> = (1..=ngroups).filter(|&g| dark_counts[g] > 0).collect();
  order.sort_by(|&a, &b| {
    dark_counts[b]
      .cmp(&dark_counts[a])
      .then_with(|| first_id[a].cmp(&first_id[b]))
  });
  let mut map = vec![0usize; ngroups + 1];
  for (rank, &g) in order.iter().enumerate() {
    map[g] = rank + 1;
  }
  for label in pfof.iter_mut() {
    *label = map[*label];
  }
  ctx.hierarchy.renumber(&map);
  ctx.hierarchy.prune_dead();
  order.len()
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
