//! Unbinding hook.
//!
//! Gravitational unbinding (removing members whose kinetic energy exceeds
//! their binding energy) is delegated to the caller: the pipeline invokes
//! the hook synchronously after each search phase and only reacts to the
//! labels it zeroes. Particles an unbinder removes from a substructure
//! rejoin their parent group.

use crate::particle::Particle;

/// External unbinding routine.
///
/// Implementations may zero entries of `pfof` (and nothing else); the
/// return value is the number of particles removed. Group ids must not be
/// invented or swapped - the caller recounts, compacts and reorders
/// afterwards.
pub trait Unbinder: Send + Sync {
  fn unbind(&self, parts: &[Particle], pfof: &mut [usize], ngroups: usize) -> usize;
}

/// Default hook: binds everything, removes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUnbinder;

impl Unbinder for NoopUnbinder {
  fn unbind(&self, _parts: &[Particle], _pfof: &mut [usize], _ngroups: usize) -> usize {
    0
  }
}

/// Blanket impl so a boxed hook can be passed around.
impl Unbinder for Box<dyn Unbinder> {
  fn unbind(&self, parts: &[Particle], pfof: &mut [usize], ngroups: usize) -> usize {
    (**self).unbind(parts, pfof, ngroups)
  }
}
