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

fn jitter(i: usize, scale: f64) -> DVec3 {
  DVec3::new(
    halton(i + 1, 2) - 0.5,
    halton(i + 1, 3) - 0.5,
    halton(i + 1, 5) - 0.5,
  ) * scale
}

/// Two grouped dark blobs plus gas near each blob centre.
fn setup() -> (Vec<Particle>, Vec<usize>, Vec<Particle>) {
  let mut dark = Vec::new();
  let mut pfof = Vec::new();
  for (g, center) in [(1usize, DVec3::ZERO), (2, DVec3::new(50.0, 0.0, 0.0))] {
    for i in 0..100 {
      dark.push(Particle::dark(
        (dark.len()) as i64,
        center + jitter(i + g * 3000, 1.5),
        jitter(i + g * 7000, 1.0),
        1.0,
      ));
      pfof.push(g);
    }
  }
  let mut gas = Vec::new();
  for (g, center) in [(1usize, DVec3::ZERO), (2, DVec3::new(50.0, 0.0, 0.0))] {
    for i in 0..20 {
      gas.push(Particle::gas(
        (1000 + gas.len()) as i64,
        center + jitter(i + g * 11000, 1.0),
        jitter(i + g * 13000, 0.5),
        0.2,
        0.01,
      ));
    }
  }
  (dark, pfof, gas)
}

fn cfg() -> SearchConfig {
  let mut cfg = SearchConfig::default();
  cfg.ellphys = 1.0;
  cfg.min_size = 20;
  cfg
}

#[test]
fn test_gas_attaches_to_nearest_group() {
  let (dark, pfof_dark, gas) = setup();
  let mut pfof_gas = vec![0usize; gas.len()];
  search_baryons(&cfg(), &dark, &pfof_dark, 2, &gas, &mut pfof_gas, 4.0);
  assert!(pfof_gas[..20].iter().all(|&g| g == 1), "{pfof_gas:?}");
  assert!(pfof_gas[20..].iter().all(|&g| g == 2));
}

#[test]
fn test_distant_gas_stays_ungrouped() {
  let (dark, pfof_dark, _) = setup();
  let gas = vec![Particle::gas(
    5000,
    DVec3::new(25.0, 0.0, 0.0),
    DVec3::ZERO,
    0.2,
    0.0,
  )];
  let mut pfof_gas = vec![0usize];
  search_baryons(&cfg(), &dark, &pfof_dark, 2, &gas, &mut pfof_gas, 4.0);
  assert_eq!(pfof_gas[0], 0);
}

#[test]
fn test_velocity_window_rejects_fast_gas() {
  let (dark, pfof_dark, _) = setup();
  // spatially inside blob 1 but moving far outside any plausible window
  let gas = vec![Particle::gas(
    5001,
    DVec3::ZERO,
    DVec3::new(1000.0, 0.0, 0.0),
    0.2,
    0.0,
  )];
  let mut pfof_gas = vec![0usize];
  search_baryons(&cfg(), &dark, &pfof_dark, 2, &gas, &mut pfof_gas, 4.0);
  assert_eq!(pfof_gas[0], 0);
}

#[test]
fn test_no_groups_is_a_noop() {
  let (dark, _, gas) = setup();
  let pfof_dark = vec![0usize; dark.len()];
  let mut pfof_gas = vec![0usize; gas.len()];
  search_baryons(&cfg(), &dark, &pfof_dark, 0, &gas, &mut pfof_gas, 4.0);
  assert!(pfof_gas.iter().all(|&g| g == 0));
}

#[test]
fn test_all_mode_only_moves_to_smaller_groups() {
  let mut cfg = cfg();
  cfg.part_search_type = PartSearchType::All;
  // group 1 large (halo), group 2 small (substructure embedded in it)
  let mut dark = Vec::new();
  let mut pfof_dark = Vec::new();
  for i in 0..200 {
    dark.push(Particle::dark(i as i64, jitter(i, 3.0), jitter(i + 500, 1.0), 1.0));
    pfof_dark.push(1);
  }
  for i in 0..40 {
    dark.push(Particle::dark(
      (200 + i) as i64,
      DVec3::new(0.5, 0.0, 0.0) + jitter(i + 9000, 0.3),
      DVec3::new(2.0, 0.0, 0.0) + jitter(i + 9500, 0.2),
      1.0,
    ));
    pfof_dark.push(2);
  }
  // gas sitting on the substructure, FOF-labelled with the big halo
  let gas = vec![Particle::gas(
    400,
    DVec3::new(0.5, 0.0, 0.0),
    DVec3::new(2.0, 0.0, 0.0),
    0.2,
    0.0,
  )];
  let mut pfof_gas = vec![1usize];
  search_baryons(&cfg, &dark, &pfof_dark, 2, &gas, &mut pfof_gas, 4.0);
  assert_eq!(pfof_gas[0], 2, "substructure claims its gas");

  // an ungrouped baryon is never considered in all-species mode
  let mut untouched = vec![0usize];
  search_baryons(&cfg, &dark, &pfof_dark, 2, &gas, &mut untouched, 4.0);
  assert_eq!(untouched[0], 0);
}
