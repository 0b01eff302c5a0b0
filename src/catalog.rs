//! Catalog output: the arrays the pipeline hands back to the caller.
//!
//! The catalog is plain data - per-particle group ids in the original
//! input order plus one record per group - and round-trips through serde.
//! The structure hierarchy can be reconstructed exactly from the records,
//! which is how downstream consumers (and the round-trip test) rebuild
//! parent/child relations without the search state.

use serde::{Deserialize, Serialize};

use crate::hierarchy::{GroupHandle, HierarchyArrays, LevelEntry, StructureHierarchy, StructureType};

/// One group of the final catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
  /// Stable id of the group's head particle.
  pub head_id: i64,
  /// Member count (all species).
  pub size: usize,
  /// Direct parent group id, 0 for field structures.
  pub parent: usize,
  /// Root-of-tree group id, 0 for field structures.
  pub uber_parent: usize,
  /// Structure type code (see [`StructureType`]).
  pub stype: i32,
  /// Number of substructures at any depth below this group.
  pub nsub: usize,
}

/// Final pipeline output.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
  /// Per-particle group id, original input order, 0 = ungrouped.
  pub group_ids: Vec<usize>,
  /// Group records; group `g` lives at `groups[g - 1]`.
  pub groups: Vec<GroupRecord>,
}

impl Catalog {
  pub fn ngroups(&self) -> usize {
    self.groups.len()
  }

  /// Number of hierarchy levels present (0 for an empty catalog).
  pub fn depth(&self) -> usize {
    self
      .groups
      .iter()
      .map(|g| match StructureType::from_code(g.stype) {
        StructureType::Halo => 1,
        StructureType::Subhalo { depth } => depth as usize + 1,
        StructureType::HaloCore { depth } => depth as usize + 1,
      })
      .max()
      .unwrap_or(0)
  }

  /// Assemble from the final labels and the flattened hierarchy.
  pub fn assemble(group_ids: Vec<usize>, ngroups: usize, flat: &HierarchyArrays) -> Self {
    let mut sizes = vec![0usize; ngroups + 1];
    for &g in &group_ids {
      sizes[g] += 1;
    }
    let groups = (1..=ngroups)
      .map(|g| GroupRecord {
        head_id: flat.head_id[g],
        size: sizes[g],
        parent: flat.parentgid[g],
        uber_parent: flat.uparentgid[g],
        stype: flat.stype[g],
        nsub: flat.nsub[g],
      })
      .collect();
    Self { group_ids, groups }
  }

  /// Flattened hierarchy arrays as recorded in the catalog.
  pub fn hierarchy_arrays(&self) -> HierarchyArrays {
    let n = self.ngroups();
    let mut flat = HierarchyArrays {
      nsub: vec![0; n + 1],
      parentgid: vec![0; n + 1],
      uparentgid: vec![0; n + 1],
      stype: vec![0; n + 1],
      head_id: vec![-1; n + 1],
    };
    for (i, rec) in self.groups.iter().enumerate() {
      let g = i + 1;
      flat.nsub[g] = rec.nsub;
      flat.parentgid[g] = rec.parent;
      flat.uparentgid[g] = rec.uber_parent;
      flat.stype[g] = rec.stype;
      flat.head_id[g] = rec.head_id;
    }
    flat
  }

  /// Rebuild a [`StructureHierarchy`] from the records. Levels are
  /// reconstructed from the structure-type depths, parent links from the
  /// recorded parent ids.
  pub fn rebuild_hierarchy(&self) -> StructureHierarchy {
    let mut hierarchy = StructureHierarchy::new();
    let n = self.ngroups();
    if n == 0 {
      return hierarchy;
    }
    let depth_of = |stype: i32| match StructureType::from_code(stype) {
      StructureType::Halo => 0usize,
      StructureType::Subhalo { depth } => depth as usize,
      StructureType::HaloCore { depth } => depth as usize,
    };
    // handles indexed by gid
    let mut handles: Vec<GroupHandle> = vec![usize::MAX; n + 1];
    for g in 1..=n {
      handles[g] = hierarchy.alloc_handle(g);
    }
    let max_depth = self
      .groups
      .iter()
      .map(|r| depth_of(r.stype))
      .max()
      .unwrap_or(0);
    for depth in 0..=max_depth {
      let entries: Vec<LevelEntry> = self
        .groups
        .iter()
        .enumerate()
        .filter(|(_, r)| depth_of(r.stype) == depth)
        .map(|(i, r)| LevelEntry {
          handle: handles[i + 1],
          head_id: r.head_id,
          parent: (r.parent != 0).then(|| handles[r.parent]),
          uber: (r.uber_parent != 0).then(|| handles[r.uber_parent]),
          stype: StructureType::from_code(r.stype),
        })
        .collect();
      if depth == 0 && entries.is_empty() {
        break;
      }
      hierarchy.append_level(depth, entries);
    }
    hierarchy
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> Catalog {
    Catalog {
      group_ids: vec![1, 1, 2, 2, 3, 0, 1, 3],
      groups: vec![
        GroupRecord {
          head_id: 0,
          size: 3,
          parent: 0,
          uber_parent: 0,
          stype: StructureType::Halo.code(),
          nsub: 1,
        },
        GroupRecord {
          head_id: 2,
          size: 2,
          parent: 0,
          uber_parent: 0,
          stype: StructureType::Halo.code(),
          nsub: 0,
        },
        GroupRecord {
          head_id: 4,
          size: 2,
          parent: 1,
          uber_parent: 1,
          stype: StructureType::Subhalo { depth: 1 }.code(),
          nsub: 0,
        },
      ],
    }
  }

  #[test]
  fn test_serde_round_trip() {
    let cat = sample();
    let text = serde_json::to_string(&cat).unwrap();
    let back: Catalog = serde_json::from_str(&text).unwrap();
    assert_eq!(back, cat);
  }

  #[test]
  fn test_depth() {
    assert_eq!(sample().depth(), 2);
    assert_eq!(Catalog::default().depth(), 0);
  }

  #[test]
  fn test_rebuild_hierarchy_matches_arrays() {
    let cat = sample();
    let rebuilt = cat.rebuild_hierarchy();
    let flat = rebuilt.flatten(cat.ngroups());
    assert_eq!(flat, cat.hierarchy_arrays());
  }
}
