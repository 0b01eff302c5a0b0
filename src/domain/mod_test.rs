use glam::DVec3;

use super::*;

fn halton(mut i: usize, base: usize) -> f64 {
  let mut f = 1.0;
  let mut r = 0.0;
  while i > 0 {
    f /= base as f64;
    r += f * (i % base) as f64;
    i /= base;
  }
  r
}

fn blob(center: DVec3, n: usize, scale: f64, id0: i64, seed: usize) -> Vec<Particle> {
  (0..n)
    .map(|i| {
      let j = seed + i;
      let off = DVec3::new(
        halton(j + 1, 2) - 0.5,
        halton(j + 1, 3) - 0.5,
        halton(j + 1, 5) - 0.5,
      ) * scale;
      Particle::dark(id0 + i as i64, center + off, DVec3::ZERO, 1.0)
    })
    .collect()
}

fn cfg(workers: usize) -> SearchConfig {
  let mut cfg = SearchConfig::default();
  cfg.ellphys = 0.5;
  cfg.halo_min_size = 20;
  cfg.num_workers = workers;
  cfg
}

/// Three well-separated blobs along x, sliced across 3 slabs.
fn three_blobs() -> Vec<Particle> {
  let mut parts = blob(DVec3::ZERO, 100, 1.5, 0, 0);
  parts.extend(blob(DVec3::new(20.0, 0.0, 0.0), 150, 1.5, 100, 1000));
  parts.extend(blob(DVec3::new(40.0, 0.0, 0.0), 60, 1.0, 250, 2000));
  parts
}

#[test]
fn test_matches_serial_result() {
  let parts = three_blobs();
  let serial = distributed_fof(&cfg(1), &parts).unwrap();
  let distributed = distributed_fof(&cfg(3), &parts).unwrap();
  assert_eq!(serial.ngroups, 3);
  assert_eq!(distributed.ngroups, 3);
  // identical labels: both order by size with id tie-break
  assert_eq!(serial.pfof, distributed.pfof);
}

/// A group straddling a slab boundary must close across workers.
#[test]
fn test_group_across_slab_boundary() {
  // one elongated chain along x: every slab cut crosses it
  let parts: Vec<Particle> = (0..300)
    .map(|i| {
      Particle::dark(
        i as i64,
        DVec3::new(0.1 * i as f64, 0.0, 0.0),
        DVec3::ZERO,
        1.0,
      )
    })
    .collect();
  let out = distributed_fof(&cfg(4), &parts).unwrap();
  assert_eq!(out.ngroups, 1, "chain must survive the decomposition");
  assert!(out.pfof.iter().all(|&g| g == 1));
}

#[test]
fn test_undersized_fragments_are_dropped() {
  // 10-particle clump: below halo_min_size even though local floors
  // keep it alive mid-flight
  let mut parts = blob(DVec3::ZERO, 100, 2.0, 0, 0);
  parts.extend(blob(DVec3::new(30.0, 0.0, 0.0), 10, 0.5, 100, 5000));
  let out = distributed_fof(&cfg(2), &parts).unwrap();
  assert_eq!(out.ngroups, 1);
  assert!(out.pfof[100..].iter().all(|&g| g == 0));
}

#[test]
fn test_owner_is_home_of_lowest_id() {
  let parts = three_blobs();
  let out = distributed_fof(&cfg(3), &parts).unwrap();
  for g in 1..=out.ngroups {
    let lowest = (0..parts.len())
      .filter(|&i| out.pfof[i] == g)
      .map(|i| parts[i].id)
      .min()
      .unwrap();
    // recompute the home slab of that particle
    let slabs = decompose(&parts, 3);
    let idx = parts.iter().position(|p| p.id == lowest).unwrap();
    let home = slabs.iter().position(|s| s.owned.contains(&idx)).unwrap();
    assert_eq!(out.group_owner[g], home, "group {g}");
  }
}

#[test]
fn test_periodic_wrap_across_first_and_last_slab() {
  let mut cfg = cfg(3);
  cfg.period = 30.0;
  cfg.ellphys = 0.4;
  cfg.halo_min_size = 10;
  // cluster wrapped around x = 0 / x = 30, plus a separate mid-box blob
  let mut parts: Vec<Particle> = (0..60)
    .map(|i| {
      let x = (29.0 + 0.05 * i as f64) % 30.0;
      Particle::dark(i as i64, DVec3::new(x, 15.0, 15.0), DVec3::ZERO, 1.0)
    })
    .collect();
  parts.extend(blob(DVec3::new(15.0, 15.0, 15.0), 50, 1.0, 60, 9000));
  let out = distributed_fof(&cfg, &parts).unwrap();
  assert_eq!(out.ngroups, 2);
  // the wrapped chain is one group
  let g = out.pfof[0];
  assert!(g > 0);
  assert!((0..60).all(|i| out.pfof[i] == g), "wrap-around group split");
}

#[test]
fn test_empty_and_single_worker_paths() {
  let parts: Vec<Particle> = Vec::new();
  let out = distributed_fof(&cfg(4), &parts).unwrap();
  assert_eq!(out.ngroups, 0);

  let parts = blob(DVec3::ZERO, 50, 2.0, 0, 0);
  let one = distributed_fof(&cfg(1), &parts).unwrap();
  assert_eq!(one.ngroups, 1);
}
