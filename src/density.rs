//! Local phase-space density estimation and outlier scoring.
//!
//! A coarse, cell-balanced grid is laid over a particle subset (the leaves
//! of a k-d tree built with the cell occupancy as its bucket size). Each
//! cell gets a mass-weighted mean velocity and a 3x3 velocity-dispersion
//! matrix; together they define the local background as a Gaussian flow.
//!
//! Every particle is then scored by the ratio of its *measured* local
//! phase-space density (a k-nearest-neighbour estimate inside its cell,
//! with velocities whitened by the cell dispersion) to the density the
//! cell's Gaussian model *predicts* at its velocity offset. The
//! standardized log-ratio is the outlier score: background particles sit
//! near zero, dynamically cold or fast-moving substructure scores high.

use glam::{DMat3, DVec3};
use rayon::prelude::*;
use tracing::debug;

use crate::kdtree::KdTree;
use crate::particle::Particle;

/// Floor on cell extents and neighbour distances, keeping logs finite for
/// degenerate (coincident-particle) cells.
const TINY: f64 = 1e-30;

/// One grid cell: membership plus the local Gaussian velocity model.
#[derive(Clone, Debug)]
pub struct GridCell {
  /// Subset indices of the member particles.
  pub members: Vec<usize>,
  /// Total member mass.
  pub mass: f64,
  /// Mass-weighted mean velocity.
  pub mean_velocity: DVec3,
  /// Mass-weighted velocity-dispersion matrix.
  pub dispersion: DMat3,
  /// Inverse of the dispersion matrix (isotropic fallback if singular).
  pub inv_dispersion: DMat3,
  /// Determinant of the dispersion matrix.
  pub det: f64,
  /// Spatial extent of the cell per axis.
  pub extent: DVec3,
}

/// Cell grid over one particle subset.
pub struct DensityGrid {
  pub cells: Vec<GridCell>,
  /// Subset index -> cell id.
  pub cell_of: Vec<usize>,
  /// Mean `det(dispersion)^(1/3)` over cells: the subset's velocity
  /// variance scale, used as the 6D velocity linking scale of background
  /// and core searches.
  pub sigma_v2: f64,
}

impl DensityGrid {
  /// Build the grid with target cell occupancy `occupancy`. Cells whose
  /// statistics are degenerate (zero mass, singular dispersion) fall back
  /// to an isotropic model with variance `fallback_sigma2`.
  pub fn build(parts: &[Particle], occupancy: usize, fallback_sigma2: f64) -> Self {
    let n = parts.len();
    if n == 0 {
      return Self {
        cells: Vec::new(),
        cell_of: Vec::new(),
        sigma_v2: fallback_sigma2.max(0.0),
      };
    }
    let tree = KdTree::build(parts, occupancy.max(1), 0.0);
    let mut member_lists: Vec<Vec<usize>> = Vec::with_capacity(tree.num_leaves());
    tree.for_each_leaf(|members| member_lists.push(members.to_vec()));

    let cells: Vec<GridCell> = member_lists
      .into_par_iter()
      .map(|members| cell_stats(parts, members, fallback_sigma2))
      .collect();

    let mut cell_of = vec![0usize; n];
    for (c, cell) in cells.iter().enumerate() {
      for &i in &cell.members {
        cell_of[i] = c;
      }
    }
    let sigma_v2 = if cells.is_empty() {
      fallback_sigma2.max(0.0)
    } else {
      cells.iter().map(|c| c.det.max(0.0).powf(1.0 / 3.0)).sum::<f64>() / cells.len() as f64
    };
    debug!(
      ncells = cells.len(),
      n, sigma_v2, "density grid built"
    );
    Self { cells, cell_of, sigma_v2 }
  }

  /// Per-particle outlier scores: the log of measured-over-predicted local
  /// phase-space density, standardized over the subset.
  ///
  /// `nvel` is the neighbour count of the density estimate, clamped to the
  /// cell size. Subsets too small to standardize get all-zero scores.
  pub fn outlier_scores(&self, parts: &[Particle], nvel: usize) -> Vec<f64> {
    let n = parts.len();
    let mut lnr = vec![0.0f64; n];
    let chunks: Vec<(usize, Vec<(usize, f64)>)> = self
      .cells
      .par_iter()
      .enumerate()
      .map(|(c, cell)| (c, cell_log_ratios(parts, cell, nvel)))
      .collect();
    for (_, pairs) in chunks {
      for (i, v) in pairs {
        lnr[i] = v;
      }
    }
    standardize(&mut lnr);
    lnr
  }
}

/// Compute one cell's Gaussian velocity model.
fn cell_stats(parts: &[Particle], members: Vec<usize>, fallback_sigma2: f64) -> GridCell {
  let mut mass = 0.0;
  let mut vsum = DVec3::ZERO;
  let mut pmin = DVec3::splat(f64::INFINITY);
  let mut pmax = DVec3::splat(f64::NEG_INFINITY);
  for &i in &members {
    let p = &parts[i];
    mass += p.mass;
    vsum += p.velocity * p.mass;
    pmin = pmin.min(p.position);
    pmax = pmax.max(p.position);
  }
  let mean_velocity = if mass > 0.0 { vsum / mass } else { DVec3::ZERO };
  let mut disp = DMat3::ZERO;
  if mass > 0.0 {
    for &i in &members {
      let p = &parts[i];
      let dv = p.velocity - mean_velocity;
      disp += DMat3::from_cols(dv * dv.x, dv * dv.y, dv * dv.z) * p.mass;
    }
    disp *= 1.0 / mass;
  }
  let det = disp.determinant();
  let (dispersion, inv_dispersion, det) = if mass > 0.0 && det > TINY {
    (disp, disp.inverse(), det)
  } else {
    // Degenerate region: fall back to an isotropic dispersion at the
    // running halo velocity scale.
    let s2 = if fallback_sigma2 > 0.0 { fallback_sigma2 } else { 1.0 };
    (
      DMat3::from_diagonal(DVec3::splat(s2)),
      DMat3::from_diagonal(DVec3::splat(1.0 / s2)),
      s2 * s2 * s2,
    )
  };
  let extent = (pmax - pmin).max(DVec3::splat(TINY));
  GridCell {
    members,
    mass,
    mean_velocity,
    dispersion,
    inv_dispersion,
    det,
    extent,
  }
}

/// Log density ratios for every member of one cell.
///
/// Distances are measured in cell-scaled phase space: positions divided by
/// the cell extent per axis, velocity offsets contracted with the inverse
/// dispersion. In those units the cell model is a unit-box uniform spatial
/// density times a standard normal in velocity, so
/// `ln R = ln k - 3 ln r_k^2 + maha^2 / 2 - ln m` up to constants that the
/// later standardization removes.
fn cell_log_ratios(parts: &[Particle], cell: &GridCell, nvel: usize) -> Vec<(usize, f64)> {
  let m = cell.members.len();
  if m < 2 {
    return cell.members.iter().map(|&i| (i, 0.0)).collect();
  }
  let k = nvel.clamp(1, m - 1);
  let mut out = Vec::with_capacity(m);
  let mut d2: Vec<f64> = Vec::with_capacity(m - 1);
  for (a, &i) in cell.members.iter().enumerate() {
    let pi = &parts[i];
    d2.clear();
    for (b, &j) in cell.members.iter().enumerate() {
      if a == b {
        continue;
      }
      let pj = &parts[j];
      let dx = (pi.position - pj.position) / cell.extent;
      let dv = pi.velocity - pj.velocity;
      d2.push(dx.length_squared() + dv.dot(cell.inv_dispersion * dv));
    }
    d2.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    let r2k = d2[k - 1].max(TINY);
    let dv = pi.velocity - cell.mean_velocity;
    let maha2 = dv.dot(cell.inv_dispersion * dv);
    let lnr = (k as f64).ln() - 3.0 * r2k.ln() + 0.5 * maha2 - (m as f64).ln();
    out.push((i, lnr));
  }
  out
}

/// In-place standardization to zero mean, unit variance. Subsets with no
/// spread are zeroed.
fn standardize(values: &mut [f64]) {
  let n = values.len();
  if n < 2 {
    values.iter_mut().for_each(|v| *v = 0.0);
    return;
  }
  let mean = values.iter().sum::<f64>() / n as f64;
  let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
  if var <= TINY {
    values.iter_mut().for_each(|v| *v = 0.0);
    return;
  }
  let inv_sd = 1.0 / var.sqrt();
  for v in values.iter_mut() {
    *v = (*v - mean) * inv_sd;
  }
}

#[cfg(test)]
#[path = "density_test.rs"]
mod density_test;
