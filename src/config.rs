//! Search configuration.
//!
//! All recognized options live on [`SearchConfig`]; there is no hidden
//! process-wide state. Link lengths are multiplicative: the 3D halo link
//! length is `ellxscale * ellphys * ellhalophysfac`, the substructure link
//! length drops the halo factor, and the 6D velocity link length is
//! `ellvscale * ellvel` (or a measured dispersion where the pipeline
//! computes one).

use serde::{Deserialize, Serialize};

use crate::error::{FinderError, Result};

/// Which FOF the background (field halo) pass runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FofBgType {
  /// 3D configuration-space FOF only.
  Fof3d,
  /// 3D FOF followed by a per-halo 6D phase-space refinement.
  Fof6d,
}

/// Which predicate the substructure search uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FofType {
  /// Stream predicate: position + velocity ratio + alignment + outlier
  /// admission. The default.
  StreamProb,
  /// Stream predicate restricted to each particle's nearest neighbours.
  StreamProbNn,
  /// Nearest-neighbour variant that also applies the spatial cut.
  StreamProbNnLx,
  /// Nearest-neighbour variant without the spatial cut.
  StreamProbNnNoDist,
  /// Plain 6D phase-space FOF of the subset.
  SixDSubset,
}

/// Halo-core search mode for merger detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaloCoreSearch {
  /// No core search.
  Off,
  /// Detect and tag cores only.
  Detect,
  /// Detect cores and assign every untagged halo particle to its nearest
  /// core in mass-weighted phase-space distance.
  DetectAssign,
}

/// Which species enter the initial FOF search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartSearchType {
  /// Search dark matter only; baryons are phase-matched afterwards.
  Dark,
  /// Search all species together; the baryon pass may only move a baryon
  /// to a *smaller* group than its FOF one.
  All,
}

/// Closed enumeration of recognized options.
///
/// Defaults follow the values the searches were tuned with; every field can
/// be overridden before [`SearchConfig::validate`] is called.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
  /// Physical FOF linking length in units of `ellxscale`.
  pub ellphys: f64,
  /// Length-unit scale applied to every spatial linking length.
  pub ellxscale: f64,
  /// Extra factor on the 3D halo linking length.
  pub ellhalophysfac: f64,

  /// Velocity-unit scale applied to every velocity linking length.
  pub ellvscale: f64,
  /// 6D velocity linking length in units of `ellvscale`.
  pub ellvel: f64,

  /// Maximum velocity-magnitude ratio accepted by the stream predicate.
  pub vratio: f64,
  /// Velocity opening angle of the stream predicate, in units of pi.
  pub thetaopen: f64,
  /// Outlier-score admission threshold of the stream predicate.
  pub ellthreshold: f64,

  /// Spatial widening applied by the expansion passes.
  pub ellxfac: f64,
  /// Velocity-ratio widening applied by the expansion passes.
  pub vfac: f64,
  /// Opening-angle widening applied by the expansion passes.
  pub thetafac: f64,
  /// Threshold lowering applied by the expansion passes.
  pub ellfac: f64,
  /// Minimum-size scaling applied while iterating.
  pub nminfac: f64,

  /// Fraction of a group's pre-expansion size that cross-links must exceed
  /// for the group to be absorbed.
  pub fmerge: f64,
  /// As `fmerge`, for the background large-structure pass.
  pub fmergebg: f64,
  /// Size ratio below which a secondary background group is merged
  /// outright.
  pub halo_merger_ratio: f64,

  /// Minimum substructure size.
  pub min_size: usize,
  /// Minimum field-halo size.
  pub halo_min_size: usize,
  /// Smallest subset searched for substructure.
  pub min_sub_size: usize,
  /// Smallest grid cell (and smallest subset recursed into).
  pub min_cell_size: usize,

  /// Core search: spatial linking factor on the halo link length.
  pub halocorexfac: f64,
  /// Core search: velocity linking factor on the halo dispersion.
  pub halocorevfac: f64,
  /// Core search: minimum core size as a fraction of the subset.
  pub halocorenfac: f64,

  /// Target grid-cell occupancy as a fraction of the subset size.
  pub ncellfac: f64,
  /// Tree bucket (leaf) size.
  pub bucket_size: usize,
  /// Number of phase-space neighbours used by density and association
  /// searches.
  pub nvel: usize,

  /// Background FOF mode.
  pub fofbgtype: FofBgType,
  /// Substructure predicate selection.
  pub foftype: FofType,
  /// Enable the iterative expansion passes.
  pub iterate: bool,
  /// Halo-core search mode.
  pub halo_core_search: HaloCoreSearch,

  /// Enable baryon association after the dark-matter hierarchy is final.
  pub baryon_search: bool,
  /// Which species the initial FOF covers.
  pub part_search_type: PartSearchType,

  /// Treat the input as one pre-cut halo instead of a full volume.
  pub single_halo: bool,
  /// Require field haloes to be self-bound.
  pub bound_halos: bool,
  /// Inclusive (substructure counted into parent) halo ordering.
  pub inclusive_halo: bool,
  /// Shift each recursed subset into its centre-of-mass frame.
  pub cm_ref_adjust: bool,

  /// Periodic box length per axis; `<= 0` means non-periodic.
  pub period: f64,

  /// Significance level for the group outlier-average test.
  pub sig_level: f64,

  /// Number of spatial-domain workers for the distributed search.
  pub num_workers: usize,
}

impl Default for SearchConfig {
  fn default() -> Self {
    Self {
      ellphys: 0.2,
      ellxscale: 1.0,
      ellhalophysfac: 1.0,
      ellvscale: 1.0,
      ellvel: 1.0,
      vratio: 2.0,
      thetaopen: 0.25,
      ellthreshold: 1.5,
      ellxfac: 2.0,
      vfac: 1.25,
      thetafac: 1.25,
      ellfac: 0.8,
      nminfac: 0.5,
      fmerge: 0.25,
      fmergebg: 0.5,
      halo_merger_ratio: 0.2,
      min_size: 20,
      halo_min_size: 32,
      min_sub_size: 800,
      min_cell_size: 100,
      halocorexfac: 0.5,
      halocorevfac: 2.0,
      halocorenfac: 0.1,
      ncellfac: 0.005,
      bucket_size: 16,
      nvel: 32,
      fofbgtype: FofBgType::Fof3d,
      foftype: FofType::StreamProb,
      iterate: true,
      halo_core_search: HaloCoreSearch::Off,
      baryon_search: false,
      part_search_type: PartSearchType::Dark,
      single_halo: false,
      bound_halos: false,
      inclusive_halo: false,
      cm_ref_adjust: true,
      period: 0.0,
      sig_level: 2.0,
      num_workers: 1,
    }
  }
}

impl SearchConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Set the physical linking length.
  pub fn with_link_length(mut self, ellphys: f64) -> Self {
    self.ellphys = ellphys;
    self
  }

  /// Set the minimum substructure and field-halo sizes together.
  pub fn with_min_size(mut self, min_size: usize) -> Self {
    self.min_size = min_size;
    self.halo_min_size = min_size;
    self
  }

  pub fn with_periodic(mut self, period: f64) -> Self {
    self.period = period;
    self
  }

  pub fn with_fof_bg_type(mut self, fofbgtype: FofBgType) -> Self {
    self.fofbgtype = fofbgtype;
    self
  }

  pub fn with_core_search(mut self, mode: HaloCoreSearch) -> Self {
    self.halo_core_search = mode;
    self
  }

  pub fn with_baryon_search(mut self, part_search_type: PartSearchType) -> Self {
    self.baryon_search = true;
    self.part_search_type = part_search_type;
    self
  }

  pub fn with_workers(mut self, num_workers: usize) -> Self {
    self.num_workers = num_workers;
    self
  }

  /// 3D halo linking length (length units).
  #[inline]
  pub fn halo_link_length(&self) -> f64 {
    self.ellxscale * self.ellphys * self.ellhalophysfac
  }

  /// 3D substructure linking length (length units).
  #[inline]
  pub fn sub_link_length(&self) -> f64 {
    self.ellxscale * self.ellphys
  }

  /// Squared 6D velocity linking length (velocity units).
  #[inline]
  pub fn vel_link_length2(&self) -> f64 {
    let ev = self.ellvscale * self.ellvel;
    ev * ev
  }

  /// Target grid-cell occupancy for a subset of `n` particles: the
  /// `ncellfac` fraction, raised to `min_cell_size` by doubling while more
  /// than a quarter of the subset would still not fit one cell.
  pub fn cell_occupancy(&self, n: usize) -> usize {
    let mut ncell = ((self.ncellfac * n as f64) as usize).max(1);
    while ncell < self.min_cell_size && n / 4 > ncell {
      ncell *= 2;
    }
    ncell
  }

  /// Check option consistency. Called once before the pipeline starts.
  pub fn validate(&self) -> Result<()> {
    if self.ellphys <= 0.0 {
      return Err(FinderError::config("ellphys", "link length must be positive"));
    }
    if self.ellxscale <= 0.0 || self.ellvscale <= 0.0 {
      return Err(FinderError::config("ellxscale", "unit scales must be positive"));
    }
    if self.ellvel <= 0.0 {
      return Err(FinderError::config("ellvel", "velocity link length must be positive"));
    }
    if self.min_size < 1 {
      return Err(FinderError::config("min_size", "minimum group size must be at least 1"));
    }
    if self.halo_min_size < 1 {
      return Err(FinderError::config("halo_min_size", "minimum halo size must be at least 1"));
    }
    if self.vratio < 1.0 {
      return Err(FinderError::config("vratio", "velocity ratio bound must be >= 1"));
    }
    if !(self.fmerge > 0.0) || !(self.fmergebg > 0.0) {
      return Err(FinderError::config("fmerge", "merger fractions must be positive"));
    }
    if !(self.ncellfac > 0.0) {
      return Err(FinderError::config("ncellfac", "cell fraction must be positive"));
    }
    if self.bucket_size == 0 {
      return Err(FinderError::config("bucket_size", "tree bucket size must be positive"));
    }
    if self.nvel == 0 {
      return Err(FinderError::config("nvel", "neighbour count must be positive"));
    }
    if self.num_workers == 0 {
      return Err(FinderError::config("num_workers", "at least one worker is required"));
    }
    Ok(())
  }
}
