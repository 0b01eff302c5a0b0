//! End-to-end pipeline scenarios.

use glam::DVec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::catalog::Catalog;
use crate::config::{FofBgType, HaloCoreSearch, SearchConfig};
use crate::hierarchy::StructureType;
use crate::particle::ParticleType;
use crate::unbind::NoopUnbinder;

// ---------------------------------------------------------------------------
// Sample builders
// ---------------------------------------------------------------------------

/// Standard normal via Box-Muller, driven by the seeded generator.
fn normal(rng: &mut StdRng) -> f64 {
  let u1: f64 = rng.random::<f64>().max(1e-12);
  let u2: f64 = rng.random::<f64>();
  (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn normal3(rng: &mut StdRng, sigma: f64) -> DVec3 {
  DVec3::new(normal(rng), normal(rng), normal(rng)) * sigma
}

fn uniform3(rng: &mut StdRng, half: f64) -> DVec3 {
  DVec3::new(
    rng.random::<f64>() * 2.0 - 1.0,
    rng.random::<f64>() * 2.0 - 1.0,
    rng.random::<f64>() * 2.0 - 1.0,
  ) * half
}

fn gaussian_blob(
  rng: &mut StdRng,
  center: DVec3,
  sigma: f64,
  vel: DVec3,
  vel_sigma: f64,
  n: usize,
  id0: i64,
) -> Vec<Particle> {
  (0..n)
    .map(|i| {
      Particle::dark(
        id0 + i as i64,
        center + normal3(rng, sigma),
        vel + normal3(rng, vel_sigma),
        1.0,
      )
    })
    .collect()
}

fn group_sizes(catalog: &Catalog) -> Vec<usize> {
  let mut sizes = vec![0usize; catalog.ngroups() + 1];
  for &g in &catalog.group_ids {
    sizes[g] += 1;
  }
  sizes
}

fn check_invariants(catalog: &Catalog, min_size: usize) {
  let ng = catalog.ngroups();
  for &g in &catalog.group_ids {
    assert!(g <= ng, "label {g} out of range 0..={ng}");
  }
  let sizes = group_sizes(catalog);
  for g in 1..=ng {
    assert!(sizes[g] >= min_size, "group {g} undersized: {}", sizes[g]);
    assert_eq!(
      sizes[g],
      catalog.groups[g - 1].size,
      "recorded size mismatch for group {g}"
    );
  }
}

// ---------------------------------------------------------------------------
// Scenario 1: two isolated blobs
// ---------------------------------------------------------------------------

#[test]
fn test_two_isolated_blobs() {
  let mut rng = StdRng::seed_from_u64(42);
  let mut parts = gaussian_blob(&mut rng, DVec3::ZERO, 1.0, DVec3::ZERO, 1.0, 200, 0);
  parts.extend(gaussian_blob(
    &mut rng,
    DVec3::new(50.0, 0.0, 0.0),
    1.0,
    DVec3::ZERO,
    1.0,
    200,
    200,
  ));
  let mut cfg = SearchConfig::default().with_min_size(20);
  cfg.ellphys = 0.8;
  cfg.fofbgtype = FofBgType::Fof3d;
  let catalog = run_pipeline(&parts, &cfg, &NoopUnbinder).unwrap();

  assert_eq!(catalog.ngroups(), 2, "two field haloes expected");
  check_invariants(&catalog, 20);
  let sizes = group_sizes(&catalog);
  // Gaussian outskirts can leave a handful of stragglers unlinked
  assert!(sizes[1] >= 190 && sizes[1] <= 200, "sizes: {sizes:?}");
  assert!(sizes[2] >= 190 && sizes[2] <= 200, "sizes: {sizes:?}");
  // the two haloes split the input down the middle
  let first_blob_label = catalog.group_ids[..200]
    .iter()
    .find(|&&g| g != 0)
    .copied()
    .unwrap();
  assert!(catalog.group_ids[..200]
    .iter()
    .all(|&g| g == 0 || g == first_blob_label));
  assert!(catalog.group_ids[200..]
    .iter()
    .all(|&g| g == 0 || g != first_blob_label));
  assert!(catalog
    .groups
    .iter()
    .all(|r| StructureType::from_code(r.stype) == StructureType::Halo));
}

// ---------------------------------------------------------------------------
// Scenario 2: nested substructure (cold stream in a hot halo)
// ---------------------------------------------------------------------------

fn stream_in_halo(seed: u64) -> (Vec<Particle>, SearchConfig) {
  let mut rng = StdRng::seed_from_u64(seed);
  let nbg = 5000;
  let nstream = 400;
  let mut parts: Vec<Particle> = (0..nbg)
    .map(|i| {
      Particle::dark(
        i as i64,
        uniform3(&mut rng, 10.0),
        normal3(&mut rng, 5.0),
        1.0,
      )
    })
    .collect();
  // cold stream: a thin spatial filament with a coherent bulk flow
  for i in 0..nstream {
    let x = rng.random::<f64>() * 16.0 - 8.0;
    let yz = normal3(&mut rng, 0.35);
    parts.push(Particle::dark(
      (nbg + i) as i64,
      DVec3::new(x, yz.y, yz.z),
      DVec3::new(10.0, 0.0, 0.0) + normal3(&mut rng, 0.5),
      1.0,
    ));
  }
  let mut cfg = SearchConfig::default();
  cfg.ellphys = 1.5;
  cfg.halo_min_size = 32;
  cfg.min_size = 20;
  cfg.ellthreshold = 1.5;
  cfg.thetaopen = 0.15;
  cfg.vratio = 1.5;
  cfg.nvel = 8;
  // cells larger than the stream cross-section, so the stream never
  // defines its own cell background
  cfg.ncellfac = 0.1;
  cfg.iterate = true;
  (parts, cfg)
}

#[test]
fn test_nested_substructure() {
  let (parts, cfg) = stream_in_halo(7);
  let catalog = run_pipeline(&parts, &cfg, &NoopUnbinder).unwrap();
  check_invariants(&catalog, cfg.min_size.min(cfg.halo_min_size));

  // one field halo holding essentially everything
  let haloes: Vec<usize> = (1..=catalog.ngroups())
    .filter(|&g| {
      StructureType::from_code(catalog.groups[g - 1].stype) == StructureType::Halo
    })
    .collect();
  assert_eq!(haloes.len(), 1, "one field halo expected");
  let halo = haloes[0];
  let total: usize = catalog.groups.iter().map(|r| r.size).sum();
  assert!(total >= 5350, "halo lost too many particles: {total}");

  // exactly one substructure, essentially the stream
  let subs: Vec<usize> = (1..=catalog.ngroups())
    .filter(|&g| {
      matches!(
        StructureType::from_code(catalog.groups[g - 1].stype),
        StructureType::Subhalo { .. }
      )
    })
    .collect();
  assert_eq!(subs.len(), 1, "one substructure expected, got {subs:?}");
  let sub = subs[0];
  let size = catalog.groups[sub - 1].size;
  assert!(
    (380..=430).contains(&size),
    "stream recovery off: {size} of 400"
  );
  // recovered members are overwhelmingly true stream particles
  let true_positives = catalog.group_ids[5000..]
    .iter()
    .filter(|&&g| g == sub)
    .count();
  assert!(
    true_positives >= 370,
    "only {true_positives}/400 stream members recovered"
  );
  assert_eq!(
    catalog.groups[sub - 1].parent, halo,
    "substructure must hang off the field halo"
  );
  assert_eq!(catalog.groups[sub - 1].uber_parent, halo);
  assert_eq!(catalog.groups[halo - 1].nsub, 1);
}

#[test]
fn test_pipeline_idempotent() {
  let (parts, cfg) = stream_in_halo(7);
  let a = run_pipeline(&parts, &cfg, &NoopUnbinder).unwrap();
  let b = run_pipeline(&parts, &cfg, &NoopUnbinder).unwrap();
  assert_eq!(a, b, "identical input must yield identical catalogs");
}

#[test]
fn test_catalog_round_trip() {
  let (parts, cfg) = stream_in_halo(7);
  let catalog = run_pipeline(&parts, &cfg, &NoopUnbinder).unwrap();
  let text = serde_json::to_string(&catalog).unwrap();
  let reloaded: Catalog = serde_json::from_str(&text).unwrap();
  assert_eq!(reloaded, catalog);
  // the hierarchy reconstructed from the records reproduces the arrays
  let rebuilt = reloaded.rebuild_hierarchy();
  assert_eq!(rebuilt.flatten(catalog.ngroups()), catalog.hierarchy_arrays());
}

// ---------------------------------------------------------------------------
// Scenario 3: major merger with two cores
// ---------------------------------------------------------------------------

#[test]
fn test_merger_with_two_cores() {
  let mut rng = StdRng::seed_from_u64(11);
  let mut parts = gaussian_blob(
    &mut rng,
    DVec3::ZERO,
    0.5,
    DVec3::new(0.0, 2.0, 0.0),
    0.7,
    2000,
    0,
  );
  parts.extend(gaussian_blob(
    &mut rng,
    DVec3::new(2.0, 0.0, 0.0),
    0.5,
    DVec3::new(0.0, -2.0, 0.0),
    0.7,
    2000,
    2000,
  ));
  let mut cfg = SearchConfig::default().with_min_size(20);
  cfg.ellphys = 0.5;
  cfg.halocorexfac = 0.5;
  cfg.halocorevfac = 2.0;
  cfg.halocorenfac = 0.2;
  // isolate the core machinery: the halo is too small for the outlier
  // search but well above the core-search floor
  cfg.min_sub_size = 5000;
  cfg.halo_core_search = HaloCoreSearch::DetectAssign;
  let catalog = run_pipeline(&parts, &cfg, &NoopUnbinder).unwrap();
  check_invariants(&catalog, 20);

  assert_eq!(catalog.ngroups(), 2, "halo body + one secondary core");
  let halo = &catalog.groups[0];
  assert_eq!(StructureType::from_code(halo.stype), StructureType::Halo);
  let core = &catalog.groups[1];
  assert_eq!(
    StructureType::from_code(core.stype),
    StructureType::HaloCore { depth: 1 }
  );
  // under full assignment the two progenitors split the halo roughly in
  // half
  assert!(
    (1700..=2300).contains(&halo.size),
    "primary progenitor size {}",
    halo.size
  );
  assert!(
    (1700..=2300).contains(&core.size),
    "secondary progenitor size {}",
    core.size
  );
  assert_eq!(halo.size + core.size, 4000, "assignment must cover the halo");
  assert_eq!(core.parent, 1);
  assert_eq!(core.uber_parent, 1);
}

// ---------------------------------------------------------------------------
// Scenario 4: baryon association
// ---------------------------------------------------------------------------

#[test]
fn test_baryon_association() {
  let mut rng = StdRng::seed_from_u64(4);
  let mut parts = gaussian_blob(&mut rng, DVec3::ZERO, 1.0, DVec3::ZERO, 1.0, 200, 0);
  parts.extend(gaussian_blob(
    &mut rng,
    DVec3::new(50.0, 0.0, 0.0),
    1.0,
    DVec3::ZERO,
    1.0,
    200,
    200,
  ));
  // gas tracing each blob's centre, at the blob's bulk velocity
  for i in 0..100 {
    parts.push(Particle::gas(
      400 + i,
      normal3(&mut rng, 0.3),
      normal3(&mut rng, 0.3),
      0.2,
      0.01,
    ));
  }
  for i in 0..100 {
    parts.push(Particle::gas(
      500 + i,
      DVec3::new(50.0, 0.0, 0.0) + normal3(&mut rng, 0.3),
      normal3(&mut rng, 0.3),
      0.2,
      0.01,
    ));
  }
  let mut cfg = SearchConfig::default().with_min_size(20);
  cfg.ellphys = 0.8;
  cfg.baryon_search = true;
  let catalog = run_pipeline(&parts, &cfg, &NoopUnbinder).unwrap();

  assert_eq!(catalog.ngroups(), 2);
  // residual ungrouped gas must be zero, each blob's gas with its halo
  let gas_labels: Vec<usize> = catalog.group_ids[400..].to_vec();
  assert!(
    gas_labels.iter().all(|&g| g != 0),
    "ungrouped gas remains: {}",
    gas_labels.iter().filter(|&&g| g == 0).count()
  );
  let g1 = catalog.group_ids[400];
  assert!(gas_labels[..100].iter().all(|&g| g == g1));
  assert!(gas_labels[100..].iter().all(|&g| g != g1));
  // group sizes now include the gas
  let sizes = group_sizes(&catalog);
  assert!(sizes[1] >= 280 && sizes[2] >= 280, "sizes: {sizes:?}");
}

// ---------------------------------------------------------------------------
// Scenario 5: periodic wrap
// ---------------------------------------------------------------------------

#[test]
fn test_periodic_wrap_cluster() {
  let mut rng = StdRng::seed_from_u64(5);
  let parts: Vec<Particle> = (0..300)
    .map(|i| {
      let mut x = DVec3::new(0.1, 0.5, 0.5) + normal3(&mut rng, 0.3);
      // fold into the unit box
      for k in 0..3 {
        x[k] = x[k].rem_euclid(1.0);
      }
      Particle::dark(i as i64, x, normal3(&mut rng, 1.0), 1.0)
    })
    .collect();

  let mut cfg = SearchConfig::default().with_min_size(20);
  cfg.ellphys = 0.4;
  cfg.period = 1.0;
  let catalog = run_pipeline(&parts, &cfg, &NoopUnbinder).unwrap();
  assert_eq!(catalog.ngroups(), 1, "wrap-around cluster is one group");
  let grouped = catalog.group_ids.iter().filter(|&&g| g == 1).count();
  assert_eq!(grouped, 300);
  // the single group contains particles from both sides of the boundary
  let low = parts
    .iter()
    .zip(&catalog.group_ids)
    .any(|(p, &g)| g == 1 && p.position.x < 0.2 && p.position.x >= 0.0);
  let high = parts
    .iter()
    .zip(&catalog.group_ids)
    .any(|(p, &g)| g == 1 && p.position.x > 0.8);
  assert!(low && high, "group must span the periodic boundary");
}

// ---------------------------------------------------------------------------
// Scenario 6: significance pruning of noise
// ---------------------------------------------------------------------------

#[test]
fn test_noise_yields_no_substructure() {
  let mut rng = StdRng::seed_from_u64(6);
  // pure noise: uniform positions, isotropic velocities, no structure
  let parts: Vec<Particle> = (0..2000)
    .map(|i| {
      Particle::dark(
        i as i64,
        uniform3(&mut rng, 7.0),
        normal3(&mut rng, 5.0),
        1.0,
      )
    })
    .collect();
  let mut cfg = SearchConfig::default();
  cfg.ellphys = 1.5;
  cfg.halo_min_size = 32;
  cfg.min_size = 20;
  // force substructure searches on the noise and demand high significance
  cfg.min_sub_size = 500;
  cfg.sig_level = 5.0;
  cfg.ellthreshold = 3.0;
  cfg.ncellfac = 0.05;
  let catalog = run_pipeline(&parts, &cfg, &NoopUnbinder).unwrap();
  for rec in &catalog.groups {
    assert_eq!(
      StructureType::from_code(rec.stype),
      StructureType::Halo,
      "spurious substructure survived: {rec:?}"
    );
  }
}

// ---------------------------------------------------------------------------
// Degenerate inputs
// ---------------------------------------------------------------------------

#[test]
fn test_empty_input() {
  let cfg = SearchConfig::default();
  let catalog = run_pipeline(&[], &cfg, &NoopUnbinder).unwrap();
  assert_eq!(catalog.ngroups(), 0);
  assert!(catalog.group_ids.is_empty());
}

#[test]
fn test_invalid_config_rejected() {
  let cfg = SearchConfig::default().with_link_length(-1.0);
  let err = run_pipeline(&[], &cfg, &NoopUnbinder).unwrap_err();
  assert!(matches!(err, crate::error::FinderError::Config { .. }));
}

#[test]
fn test_other_species_ignored() {
  let mut rng = StdRng::seed_from_u64(9);
  let mut parts = gaussian_blob(&mut rng, DVec3::ZERO, 1.0, DVec3::ZERO, 1.0, 100, 0);
  for p in parts.iter_mut().take(10) {
    p.ptype = ParticleType::Other;
  }
  let mut cfg = SearchConfig::default().with_min_size(20);
  cfg.ellphys = 0.8;
  let catalog = run_pipeline(&parts, &cfg, &NoopUnbinder).unwrap();
  assert!(catalog.group_ids[..10].iter().all(|&g| g == 0));
}
