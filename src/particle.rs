//! Core particle record.
//!
//! Particles are reordered in place by the pipeline (type sorts, group
//! sorts, reference-frame shifts); only [`Particle::id`] is guaranteed to
//! survive as a link back to the input ordering. Transient per-particle
//! state (sort keys, outlier scores, provenance tags) lives in parallel
//! arrays owned by the phase that needs it, never on the record itself.

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Closed set of particle species the finder distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticleType {
  /// Collisionless dark matter. Drives every structure search.
  Dark,
  /// Gas. Carries internal energy; associated to structures after the
  /// dark-matter hierarchy is final.
  Gas,
  /// Stars. Associated like gas, without the thermal-energy term.
  Star,
  /// Anything else (tracers, black holes). Ignored by the searches.
  Other,
}

impl ParticleType {
  /// Whether this species participates in the baryon association pass.
  pub fn is_baryon(self) -> bool {
    matches!(self, ParticleType::Gas | ParticleType::Star)
  }
}

/// One particle of the input snapshot.
#[derive(Clone, Copy, Debug)]
pub struct Particle {
  /// Stable index into the original input. Survives every in-place
  /// reorder the pipeline performs.
  pub id: i64,

  /// Species tag.
  pub ptype: ParticleType,

  /// Position in simulation length units.
  pub position: DVec3,

  /// Peculiar velocity in simulation velocity units.
  pub velocity: DVec3,

  /// Mass in simulation mass units.
  pub mass: f64,

  /// Internal (thermal) energy per unit mass. Zero for collisionless
  /// species.
  pub internal_energy: f64,

  /// Metallicity. Zero when the snapshot does not carry it.
  pub metallicity: f64,

  /// Stellar age. Zero for non-star species.
  pub age: f64,
}

impl Particle {
  /// Create a dark-matter particle with the given phase-space coordinates.
  pub fn dark(id: i64, position: DVec3, velocity: DVec3, mass: f64) -> Self {
    Self {
      id,
      ptype: ParticleType::Dark,
      position,
      velocity,
      mass,
      internal_energy: 0.0,
      metallicity: 0.0,
      age: 0.0,
    }
  }

  /// Create a gas particle with internal energy `u`.
  pub fn gas(id: i64, position: DVec3, velocity: DVec3, mass: f64, u: f64) -> Self {
    Self {
      id,
      ptype: ParticleType::Gas,
      position,
      velocity,
      mass,
      internal_energy: u,
      metallicity: 0.0,
      age: 0.0,
    }
  }

  /// Create a star particle.
  pub fn star(id: i64, position: DVec3, velocity: DVec3, mass: f64) -> Self {
    Self {
      id,
      ptype: ParticleType::Star,
      position,
      velocity,
      mass,
      internal_energy: 0.0,
      metallicity: 0.0,
      age: 0.0,
    }
  }
}

/// Minimum-image separation of two positions in a periodic box of length
/// `period` per axis. With `period <= 0` this is the plain difference.
#[inline]
pub fn periodic_delta(a: DVec3, b: DVec3, period: f64) -> DVec3 {
  let mut d = a - b;
  if period > 0.0 {
    let half = 0.5 * period;
    for k in 0..3 {
      if d[k] > half {
        d[k] -= period;
      } else if d[k] < -half {
        d[k] += period;
      }
    }
  }
  d
}

/// Squared minimum-image distance.
#[inline]
pub fn periodic_dist2(a: DVec3, b: DVec3, period: f64) -> f64 {
  periodic_delta(a, b, period).length_squared()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_periodic_delta_wraps() {
    let a = DVec3::new(0.95, 0.0, 0.0);
    let b = DVec3::new(0.05, 0.0, 0.0);
    let d = periodic_delta(a, b, 1.0);
    assert!((d.x - (-0.1)).abs() < 1e-12, "wrap across x failed: {d:?}");
    assert_eq!(d.y, 0.0);
  }

  #[test]
  fn test_periodic_delta_nonperiodic() {
    let a = DVec3::new(0.95, 0.0, 0.0);
    let b = DVec3::new(0.05, 0.0, 0.0);
    let d = periodic_delta(a, b, 0.0);
    assert!((d.x - 0.9).abs() < 1e-12);
  }

  #[test]
  fn test_species_helpers() {
    assert!(ParticleType::Gas.is_baryon());
    assert!(ParticleType::Star.is_baryon());
    assert!(!ParticleType::Dark.is_baryon());
    let p = Particle::gas(7, DVec3::ZERO, DVec3::ZERO, 1.0, 2.5);
    assert_eq!(p.internal_energy, 2.5);
    assert_eq!(p.ptype, ParticleType::Gas);
  }
}
