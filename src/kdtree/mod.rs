//! Balanced k-d tree over a particle slice.
//!
//! The tree owns no particle memory: it holds an index permutation into an
//! external slice, and leaves reference contiguous ranges of that
//! permutation. Construction splits on the longest-extent axis at the
//! median, so the tree is balanced regardless of clustering.
//!
//! Periodic boundaries are handled during distance evaluation with the
//! minimum-image convention, per axis, so image shifts only matter where a
//! node's bounding box actually straddles the boundary.

use glam::DVec3;

use crate::particle::Particle;

pub mod query;

/// One tree node. Leaves have no children and reference
/// `indices[start..end]`.
#[derive(Clone, Debug)]
pub(crate) struct KdNode {
  pub min: DVec3,
  pub max: DVec3,
  pub start: usize,
  pub end: usize,
  /// `(left, right)` node ids, or `None` for a leaf.
  pub children: Option<(usize, usize)>,
}

/// Balanced k-d tree over `parts`.
pub struct KdTree<'a> {
  pub(crate) parts: &'a [Particle],
  pub(crate) nodes: Vec<KdNode>,
  pub(crate) indices: Vec<usize>,
  pub(crate) period: f64,
}

impl<'a> KdTree<'a> {
  /// Build a tree with the given leaf capacity. `period <= 0` disables
  /// periodic wrapping. An empty slice yields a valid tree that returns
  /// empty results from every query.
  pub fn build(parts: &'a [Particle], bucket_size: usize, period: f64) -> Self {
    let bucket = bucket_size.max(1);
    let n = parts.len();
    let mut tree = Self {
      parts,
      nodes: Vec::new(),
      indices: (0..n).collect(),
      period,
    };
    if n > 0 {
      tree.build_node(0, n, bucket);
    }
    tree
  }

  /// Number of particles indexed.
  pub fn len(&self) -> usize {
    self.parts.len()
  }

  /// The particle slice this tree indexes.
  pub fn particles(&self) -> &'a [Particle] {
    self.parts
  }

  /// Periodic box length the tree was built with (`<= 0` if none).
  pub fn period(&self) -> f64 {
    self.period
  }

  pub fn is_empty(&self) -> bool {
    self.parts.is_empty()
  }

  /// Number of leaf nodes.
  pub fn num_leaves(&self) -> usize {
    self.nodes.iter().filter(|n| n.children.is_none()).count()
  }

  /// Visit every leaf's particle-index range.
  pub fn for_each_leaf(&self, mut visit: impl FnMut(&[usize])) {
    for node in &self.nodes {
      if node.children.is_none() {
        visit(&self.indices[node.start..node.end]);
      }
    }
  }

  /// Recursively build the subtree over `indices[start..end]`; returns the
  /// node id.
  fn build_node(&mut self, start: usize, end: usize, bucket: usize) -> usize {
    let (min, max) = self.bounds_of(start, end);
    let id = self.nodes.len();
    self.nodes.push(KdNode {
      min,
      max,
      start,
      end,
      children: None,
    });
    if end - start <= bucket {
      return id;
    }
    let extent = max - min;
    let axis = if extent.x >= extent.y && extent.x >= extent.z {
      0
    } else if extent.y >= extent.z {
      1
    } else {
      2
    };
    // Degenerate spread (all particles coincident on the split axis):
    // keep the node as a leaf rather than recursing forever.
    if extent[axis] <= 0.0 {
      return id;
    }
    let mid = start + (end - start) / 2;
    let parts = self.parts;
    self.indices[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
      parts[a].position[axis]
        .partial_cmp(&parts[b].position[axis])
        .unwrap_or(std::cmp::Ordering::Equal)
    });
    let left = self.build_node(start, mid, bucket);
    let right = self.build_node(mid, end, bucket);
    self.nodes[id].children = Some((left, right));
    id
  }

  fn bounds_of(&self, start: usize, end: usize) -> (DVec3, DVec3) {
    let mut min = DVec3::splat(f64::INFINITY);
    let mut max = DVec3::splat(f64::NEG_INFINITY);
    for &i in &self.indices[start..end] {
      min = min.min(self.parts[i].position);
      max = max.max(self.parts[i].position);
    }
    (min, max)
  }
}
