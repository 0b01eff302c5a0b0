//! Neighbour queries: fixed-radius traversal and k-nearest-neighbour.

use glam::DVec3;

use super::KdTree;
use crate::particle::periodic_dist2;

/// One axis of minimum-image distance from a point to an interval.
#[inline]
fn axis_gap(x: f64, lo: f64, hi: f64, period: f64) -> f64 {
  let direct = (lo - x).max(x - hi).max(0.0);
  if period <= 0.0 || direct == 0.0 {
    return direct;
  }
  let up = (lo - (x - period)).max((x - period) - hi).max(0.0);
  let down = (lo - (x + period)).max((x + period) - hi).max(0.0);
  direct.min(up).min(down)
}

impl KdTree<'_> {
  /// Squared minimum-image distance from `pos` to a node's bounding box.
  #[inline]
  pub(crate) fn box_dist2(&self, node: usize, pos: DVec3) -> f64 {
    let n = &self.nodes[node];
    let mut d2 = 0.0;
    for k in 0..3 {
      let g = axis_gap(pos[k], n.min[k], n.max[k], self.period);
      d2 += g * g;
    }
    d2
  }

  /// Visit the index of every particle within squared distance `r2` of
  /// `pos` (minimum-image if periodic). Includes a particle exactly at
  /// `pos` if one exists.
  pub fn for_each_within(&self, pos: DVec3, r2: f64, mut visit: impl FnMut(usize, f64)) {
    if self.nodes.is_empty() || r2 < 0.0 {
      return;
    }
    let mut stack = vec![0usize];
    while let Some(id) = stack.pop() {
      if self.box_dist2(id, pos) > r2 {
        continue;
      }
      let node = &self.nodes[id];
      match node.children {
        Some((l, r)) => {
          stack.push(l);
          stack.push(r);
        }
        None => {
          for &i in &self.indices[node.start..node.end] {
            let d2 = periodic_dist2(self.parts[i].position, pos, self.period);
            if d2 <= r2 {
              visit(i, d2);
            }
          }
        }
      }
    }
  }

  /// Indices of all particles within squared distance `r2` of `pos`.
  pub fn find_within(&self, pos: DVec3, r2: f64) -> Vec<usize> {
    let mut hits = Vec::new();
    self.for_each_within(pos, r2, |i, _| hits.push(i));
    hits
  }

  /// The `k` nearest particles to `pos`, as `(index, dist2)` sorted by
  /// ascending distance. Returns fewer than `k` entries when the tree is
  /// smaller than `k`.
  pub fn find_nearest_pos(&self, pos: DVec3, k: usize) -> Vec<(usize, f64)> {
    let mut best: Vec<(usize, f64)> = Vec::with_capacity(k + 1);
    if self.nodes.is_empty() || k == 0 {
      return best;
    }
    self.knn_node(0, pos, k, &mut best);
    best
  }

  /// The `k` nearest particles to particle `i`, excluding `i` itself.
  pub fn find_nearest(&self, i: usize, k: usize) -> Vec<(usize, f64)> {
    let pos = self.parts[i].position;
    let mut best = self.find_nearest_pos(pos, k + 1);
    best.retain(|&(j, _)| j != i);
    best.truncate(k);
    best
  }

  fn knn_node(&self, id: usize, pos: DVec3, k: usize, best: &mut Vec<(usize, f64)>) {
    let worst = if best.len() < k {
      f64::INFINITY
    } else {
      best.last().unwrap().1
    };
    if self.box_dist2(id, pos) > worst {
      return;
    }
    let node = &self.nodes[id];
    match node.children {
      Some((l, r)) => {
        // Visit the closer child first so the bound tightens early.
        let (dl, dr) = (self.box_dist2(l, pos), self.box_dist2(r, pos));
        if dl <= dr {
          self.knn_node(l, pos, k, best);
          self.knn_node(r, pos, k, best);
        } else {
          self.knn_node(r, pos, k, best);
          self.knn_node(l, pos, k, best);
        }
      }
      None => {
        for &i in &self.indices[node.start..node.end] {
          let d2 = periodic_dist2(self.parts[i].position, pos, self.period);
          if best.len() < k || d2 < best.last().unwrap().1 {
            let at = best.partition_point(|&(_, bd2)| bd2 <= d2);
            best.insert(at, (i, d2));
            if best.len() > k {
              best.pop();
            }
          }
        }
      }
    }
  }
}
