use glam::DVec3;

use super::*;
use crate::particle::Particle;

/// Two clumps of 4 particles each, 10 length units apart.
fn two_clumps() -> Vec<Particle> {
  let mut parts = Vec::new();
  let offsets = [
    DVec3::ZERO,
    DVec3::new(0.1, 0.0, 0.0),
    DVec3::new(0.0, 0.1, 0.0),
    DVec3::new(0.0, 0.0, 0.1),
  ];
  for (c, center) in [DVec3::ZERO, DVec3::new(10.0, 0.0, 0.0)].iter().enumerate() {
    for (i, off) in offsets.iter().enumerate() {
      parts.push(Particle::dark((c * 4 + i) as i64, *center + *off, DVec3::ZERO, 1.0));
    }
  }
  parts
}

#[test]
fn test_fof_finds_two_components() {
  let parts = two_clumps();
  let tree = KdTree::build(&parts, 2, 0.0);
  let out = fof(&tree, 0.2, 2, true);
  assert_eq!(out.ngroups, 2);
  // both groups fully linked
  assert_eq!(out.pfof[0], out.pfof[1]);
  assert_eq!(out.pfof[0], out.pfof[3]);
  assert_eq!(out.pfof[4], out.pfof[7]);
  assert_ne!(out.pfof[0], out.pfof[4]);
  // ids contiguous from 1
  assert!(out.pfof.iter().all(|&g| g >= 1 && g <= 2));
}

#[test]
fn test_fof_min_size_dissolves() {
  let parts = two_clumps();
  let tree = KdTree::build(&parts, 2, 0.0);
  let out = fof(&tree, 0.2, 5, true);
  assert_eq!(out.ngroups, 0);
  assert!(out.pfof.iter().all(|&g| g == 0));
}

#[test]
fn test_fof_nonpositive_link_length_is_no_groups() {
  let parts = two_clumps();
  let tree = KdTree::build(&parts, 2, 0.0);
  let out = fof(&tree, -1.0, 2, true);
  assert_eq!(out.ngroups, 0);
}

#[test]
fn test_fof_size_ordering() {
  // one clump of 4 and one of 3: the larger must get id 1
  let mut parts = two_clumps();
  parts.remove(7);
  let tree = KdTree::build(&parts, 2, 0.0);
  let out = fof(&tree, 0.2, 2, true);
  assert_eq!(out.ngroups, 2);
  assert_eq!(out.pfof[0], 1);
  assert_eq!(out.pfof[4], 2);
}

#[test]
fn test_fof_periodic_joins_across_boundary() {
  let mut parts = Vec::new();
  for i in 0..5 {
    parts.push(Particle::dark(i, DVec3::new(0.02 * i as f64, 0.5, 0.5), DVec3::ZERO, 1.0));
  }
  for i in 0..5 {
    parts.push(Particle::dark(
      5 + i,
      DVec3::new(1.0 - 0.02 - 0.02 * i as f64, 0.5, 0.5),
      DVec3::ZERO,
      1.0,
    ));
  }
  let periodic = KdTree::build(&parts, 2, 1.0);
  let out = fof(&periodic, 0.05, 2, true);
  assert_eq!(out.ngroups, 1, "wrap-around cluster must be one group");

  let open = KdTree::build(&parts, 2, 0.0);
  let out = fof(&open, 0.05, 2, true);
  assert_eq!(out.ngroups, 2, "without wrapping the cluster splits");
}

#[test]
fn test_fof_criterion_filter_excludes_tagged() {
  let parts = two_clumps();
  let tree = KdTree::build(&parts, 2, 0.0);
  // pretend the first clump is already tagged
  let taken: Vec<usize> = (0..8).map(|i| if i < 4 { 7 } else { 0 }).collect();
  let params = LinkParams::spatial(0.2, 0.0);
  let out = fof_criterion(
    &tree,
    FofPredicate::Spatial,
    &params,
    &[],
    2,
    true,
    LinkFilter::Untagged { labels: &taken },
  );
  assert_eq!(out.ngroups, 1);
  assert!(out.pfof[..4].iter().all(|&g| g == 0));
  assert!(out.pfof[4..].iter().all(|&g| g == 1));
}

#[test]
fn test_fof_nn_criterion_matches_plain_on_clumps() {
  let parts = two_clumps();
  let tree = KdTree::build(&parts, 2, 0.0);
  let params = LinkParams::spatial(0.2, 0.0);
  let out = fof_nn_criterion(
    &tree,
    FofPredicate::Spatial,
    &params,
    &[],
    3,
    2,
    true,
    LinkFilter::None,
  );
  assert_eq!(out.ngroups, 2);
}

#[test]
fn test_search_criterion_smaller_label_wins() {
  let parts = two_clumps();
  let tree = KdTree::build(&parts, 2, 0.0);
  let params = LinkParams::spatial(0.2, 0.0);
  let mut marks = vec![0i64; parts.len()];
  marks[1] = 5; // already claimed by a later group
  marks[2] = 1; // already claimed by an earlier group
  marks[3] = -1; // blocked
  search_criterion(&tree, FofPredicate::Spatial, &params, &[], 0, 2, &mut marks);
  assert_eq!(marks[1], 2, "larger mark overwritten");
  assert_eq!(marks[2], 1, "smaller mark kept");
  assert_eq!(marks[3], -1, "blocked mark untouched");
  assert_eq!(marks[0], 0, "reference itself is not marked");
}
