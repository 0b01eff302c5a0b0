//! Structure hierarchy bookkeeping.
//!
//! The hierarchy is a chain of levels: level 0 holds the field haloes,
//! each deeper level the substructures found inside groups of the level
//! above. Levels reference groups through [`GroupHandle`]s - indices into
//! a single arena table mapping handle to *current* group id - so a
//! renumbering of the label array is one table rewrite and every level
//! sees it at once, without walking the chain.

use serde::{Deserialize, Serialize};

/// Arena index of one group. Stable across renumbering and pruning.
pub type GroupHandle = usize;

/// Structure type codes, compatible with the usual halo-catalog
/// convention: field haloes are 10, substructure at depth `d` is
/// `10 + 10 d`, a halo core found at depth `d` is `10 + 10 (d - 1) + 5`.
const HALO_STYPE: i32 = 10;
const HALO_CORE_STYPE: i32 = 5;

/// Tag describing what kind of structure a group is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureType {
  /// Field (top-level) halo.
  Halo,
  /// Substructure at the given depth (1 = directly inside a halo).
  Subhalo { depth: u32 },
  /// One of several coeval dense cores of a merging halo at `depth - 1`.
  HaloCore { depth: u32 },
}

impl StructureType {
  /// Numeric catalog code.
  pub fn code(&self) -> i32 {
    match *self {
      StructureType::Halo => HALO_STYPE,
      StructureType::Subhalo { depth } => HALO_STYPE + 10 * depth as i32,
      StructureType::HaloCore { depth } => {
        HALO_STYPE + 10 * (depth.saturating_sub(1)) as i32 + HALO_CORE_STYPE
      }
    }
  }

  /// Inverse of [`code`](Self::code).
  pub fn from_code(code: i32) -> Self {
    if code == HALO_STYPE {
      StructureType::Halo
    } else if (code - HALO_STYPE) % 10 == HALO_CORE_STYPE {
      StructureType::HaloCore {
        depth: ((code - HALO_STYPE - HALO_CORE_STYPE) / 10 + 1) as u32,
      }
    } else {
      StructureType::Subhalo {
        depth: ((code - HALO_STYPE) / 10) as u32,
      }
    }
  }
}

/// One group's slot in a level.
#[derive(Clone, Debug)]
pub struct LevelEntry {
  /// Arena handle; resolve with
  /// [`StructureHierarchy::gid_of`].
  pub handle: GroupHandle,
  /// Stable `id` of the group's head particle.
  pub head_id: i64,
  /// Direct parent group, `None` for field structures.
  pub parent: Option<GroupHandle>,
  /// Root of the ancestry chain, `None` for field structures.
  pub uber: Option<GroupHandle>,
  /// Structure type tag.
  pub stype: StructureType,
}

/// One level of the chain.
#[derive(Clone, Debug, Default)]
pub struct StructureLevel {
  /// Depth below the field level (0 = field haloes).
  pub depth: usize,
  pub entries: Vec<LevelEntry>,
}

/// The level chain plus the handle arena.
#[derive(Clone, Debug, Default)]
pub struct StructureHierarchy {
  gids: Vec<usize>,
  levels: Vec<StructureLevel>,
}

/// Flattened hierarchy arrays, indexed by group id (entry 0 unused).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HierarchyArrays {
  /// Number of substructures at any depth below each group.
  pub nsub: Vec<usize>,
  /// Direct parent group id, 0 for field structures.
  pub parentgid: Vec<usize>,
  /// Root (uber-parent) group id, 0 for field structures.
  pub uparentgid: Vec<usize>,
  /// Structure type code per group.
  pub stype: Vec<i32>,
  /// Head particle id per group, -1 where unset.
  pub head_id: Vec<i64>,
}

impl StructureHierarchy {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of levels.
  pub fn depth(&self) -> usize {
    self.levels.len()
  }

  pub fn levels(&self) -> &[StructureLevel] {
    &self.levels
  }

  /// Current group id of a handle (0 once the group is gone).
  pub fn gid_of(&self, handle: GroupHandle) -> usize {
    self.gids[handle]
  }

  /// Allocate a handle for a group currently labelled `gid`.
  pub fn alloc_handle(&mut self, gid: usize) -> GroupHandle {
    self.gids.push(gid);
    self.gids.len() - 1
  }

  /// Create level 0 with one halo entry per group id `1..=ngroups`.
  /// `head_ids[g]` is the head particle id of group `g`. Returns the
  /// handles, indexed by gid (entry 0 unused).
  pub fn seed_field_level(&mut self, head_ids: &[i64]) -> Vec<GroupHandle> {
    debug_assert!(self.levels.is_empty(), "field level seeded twice");
    let ngroups = head_ids.len().saturating_sub(1);
    let mut handles = vec![usize::MAX; ngroups + 1];
    let mut entries = Vec::with_capacity(ngroups);
    for gid in 1..=ngroups {
      let handle = self.alloc_handle(gid);
      handles[gid] = handle;
      entries.push(LevelEntry {
        handle,
        head_id: head_ids[gid],
        parent: None,
        uber: None,
        stype: StructureType::Halo,
      });
    }
    self.levels.push(StructureLevel { depth: 0, entries });
    handles
  }

  /// Append one level of substructures.
  pub fn append_level(&mut self, depth: usize, entries: Vec<LevelEntry>) {
    debug_assert_eq!(depth, self.levels.len(), "levels must be appended in order");
    self.levels.push(StructureLevel { depth, entries });
  }

  /// Apply a group renumbering: `map[old_gid] = new_gid` (0 drops the
  /// group). Every level sees the rename through the arena.
  pub fn renumber(&mut self, map: &[usize]) {
    for gid in self.gids.iter_mut() {
      *gid = map.get(*gid).copied().unwrap_or(0);
    }
  }

  /// Mutable access to the entry of `handle` at `depth`, if present.
  pub fn entry_mut(&mut self, depth: usize, handle: GroupHandle) -> Option<&mut LevelEntry> {
    self
      .levels
      .get_mut(depth)?
      .entries
      .iter_mut()
      .find(|e| e.handle == handle)
  }

  /// Remove entries whose group has dissolved (gid 0), compacting each
  /// level leftwards in order.
  pub fn prune_dead(&mut self) {
    let gids = &self.gids;
    for level in self.levels.iter_mut() {
      level.entries.retain(|e| gids[e.handle] != 0);
    }
  }

  /// Flatten to per-group arrays, accumulating substructure counts from
  /// the deepest level upwards.
  pub fn flatten(&self, ngroups: usize) -> HierarchyArrays {
    let mut out = HierarchyArrays {
      nsub: vec![0; ngroups + 1],
      parentgid: vec![0; ngroups + 1],
      uparentgid: vec![0; ngroups + 1],
      stype: vec![0; ngroups + 1],
      head_id: vec![-1; ngroups + 1],
    };
    for level in self.levels.iter().rev() {
      for entry in &level.entries {
        let gid = self.gids[entry.handle];
        if gid == 0 || gid > ngroups {
          continue;
        }
        out.stype[gid] = entry.stype.code();
        out.head_id[gid] = entry.head_id;
        if let Some(parent) = entry.parent {
          let pgid = self.gids[parent];
          if pgid != 0 {
            out.parentgid[gid] = pgid;
            out.nsub[pgid] += 1 + out.nsub[gid];
          }
        }
        if let Some(uber) = entry.uber {
          out.uparentgid[gid] = self.gids[uber];
        }
      }
    }
    out
  }
}

#[cfg(test)]
#[path = "hierarchy_test.rs"]
mod hierarchy_test;
