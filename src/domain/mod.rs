//! Distributed (multi-worker) field search.
//!
//! Particles are partitioned into disjoint spatial slabs along the
//! longest extent axis, one worker thread per slab. Each worker runs a
//! local 3D FOF, then the coordinator drives collective rounds over
//! message channels:
//!
//! 1. all-gather the local group counts and shift every worker's labels
//!    by the prefix sum, making them globally unique;
//! 2. each worker exports its boundary particles (those whose search
//!    sphere reaches another slab) to the affected workers, searches the
//!    particles it imported against its own tree, and reports every
//!    cross-domain link as a label pair;
//! 3. the coordinator folds the pairs into a union-find keyed by the
//!    smallest label and broadcasts the relabel map; rounds repeat until
//!    an all-reduce of new links reports zero;
//! 4. groups migrate to their canonical owner (the home slab of the
//!    group's lowest particle id), undersized groups are dropped, and
//!    ids are renumbered globally by descending size.
//!
//! A worker failing to report during any collective phase is fatal
//! ([`FinderError::Distributed`]).

use crossbeam_channel::{bounded, Receiver, Sender};
use glam::DVec3;
use tracing::{debug, info_span};

use crate::config::SearchConfig;
use crate::error::{FinderError, Result};
use crate::fof;
use crate::groups;
use crate::kdtree::KdTree;
use crate::particle::Particle;

/// Local FOF floor in distributed mode: every particle gets a label, even
/// singletons, so cross-domain closure is pure label union. The true
/// minimum is enforced at compile time.
const MIN_LINK_SIZE: usize = 1;

/// Result of the distributed field search, in the original particle
/// order.
pub struct DistributedOutcome {
  pub pfof: Vec<usize>,
  pub ngroups: usize,
  /// Canonical owner worker per group id (entry 0 unused).
  pub group_owner: Vec<usize>,
}

/// One exported boundary particle.
#[derive(Clone, Copy, Debug)]
struct ExportRecord {
  position: DVec3,
  label: usize,
}

enum WorkerMsg {
  NumGroups(usize),
  /// Export records addressed per destination worker.
  Exports(Vec<Vec<ExportRecord>>),
  /// Cross-domain link label pairs observed this round.
  Links(Vec<(usize, usize)>),
  /// Final `(global_index, label)` assignments.
  Labels(Vec<(usize, usize)>),
}

enum MainMsg {
  Offset(usize),
  Imports(Vec<ExportRecord>),
  Relabel { map: Vec<usize>, done: bool },
}

/// One slab of the decomposition.
#[derive(Clone, Debug)]
struct Slab {
  axis: usize,
  lo: f64,
  hi: f64,
  /// Global indices owned by this slab, sorted by (coordinate, id).
  owned: Vec<usize>,
}

/// Partition particle indices into at most `nworkers` contiguous slabs
/// along the longest extent axis. Deterministic: ties broken by particle
/// id.
fn decompose(parts: &[Particle], nworkers: usize) -> Vec<Slab> {
  let mut min = DVec3::splat(f64::INFINITY);
  let mut max = DVec3::splat(f64::NEG_INFINITY);
  for p in parts {
    min = min.min(p.position);
    max = max.max(p.position);
  }
  let extent = max - min;
  let axis = if extent.x >= extent.y && extent.x >= extent.z {
    0
  } else if extent.y >= extent.z {
    1
  } else {
    2
  };
  let mut order: Vec<usize> = (0..parts.len()).collect();
  order.sort_by(|&a, &b| {
    parts[a].position[axis]
      .partial_cmp(&parts[b].position[axis])
      .unwrap_or(std::cmp::Ordering::Equal)
      .then(parts[a].id.cmp(&parts[b].id))
  });
  let chunk = parts.len().div_ceil(nworkers).max(1);
  order
    .chunks(chunk)
    .map(|owned| Slab {
      axis,
      lo: parts[owned[0]].position[axis],
      hi: parts[*owned.last().unwrap()].position[axis],
      owned: owned.to_vec(),
    })
    .collect()
}

/// Minimum-image distance from coordinate `x` to a slab's interval along
/// the decomposition axis.
fn slab_gap(x: f64, slab: &Slab, period: f64) -> f64 {
  let direct = (slab.lo - x).max(x - slab.hi).max(0.0);
  if period <= 0.0 || direct == 0.0 {
    return direct;
  }
  let up = (slab.lo - (x - period)).max((x - period) - slab.hi).max(0.0);
  let down = (slab.lo - (x + period)).max((x + period) - slab.hi).max(0.0);
  direct.min(up).min(down)
}

/// Union-find over global labels, representative = smallest label.
struct LabelUnion {
  parent: Vec<usize>,
}

impl LabelUnion {
  fn new(total: usize) -> Self {
    Self {
      parent: (0..=total).collect(),
    }
  }

  fn find(&mut self, mut l: usize) -> usize {
    while self.parent[l] != l {
      self.parent[l] = self.parent[self.parent[l]];
      l = self.parent[l];
    }
    l
  }

  /// Union two labels; returns `true` if the components were distinct.
  fn union(&mut self, a: usize, b: usize) -> bool {
    let ra = self.find(a);
    let rb = self.find(b);
    if ra == rb {
      return false;
    }
    let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
    self.parent[hi] = lo;
    true
  }
}

/// Distributed 3D FOF over the full set. With one worker (or a tiny set)
/// this degenerates to the plain serial search.
pub fn distributed_fof(cfg: &SearchConfig, parts: &[Particle]) -> Result<DistributedOutcome> {
  let n = parts.len();
  let nworkers = cfg.num_workers.min(n.max(1));
  let _span = info_span!("distributed_fof", n, nworkers).entered();
  if n == 0 || nworkers <= 1 {
    let tree = KdTree::build(parts, cfg.bucket_size, cfg.period);
    let out = fof::fof(&tree, cfg.halo_link_length(), cfg.halo_min_size, true);
    return Ok(DistributedOutcome {
      group_owner: vec![0usize; out.ngroups + 1],
      pfof: out.pfof,
      ngroups: out.ngroups,
    });
  }

  let slabs = decompose(parts, nworkers);
  let ell = cfg.halo_link_length();

  let mut main_rx: Vec<Receiver<WorkerMsg>> = Vec::new();
  let mut main_tx: Vec<Sender<MainMsg>> = Vec::new();
  let mut worker_ends: Vec<(Sender<WorkerMsg>, Receiver<MainMsg>)> = Vec::new();
  for _ in 0..slabs.len() {
    let (tx_w, rx_m) = bounded::<WorkerMsg>(1);
    let (tx_m, rx_w) = bounded::<MainMsg>(1);
    main_rx.push(rx_m);
    main_tx.push(tx_m);
    worker_ends.push((tx_w, rx_w));
  }

  let coordination = std::thread::scope(|scope| {
    for (w, (tx, rx)) in worker_ends.drain(..).enumerate() {
      let slabs_ref = &slabs;
      scope.spawn(move || run_worker(cfg, parts, slabs_ref, w, ell, tx, rx));
    }
    // Owning the send ends here means they drop on an early error, which
    // unblocks any worker still waiting on a collective phase.
    let tx_handles = main_tx;
    coordinate(&slabs, n, &main_rx, &tx_handles)
  });
  let mut pfof = coordination?;

  // Compile: enforce the true minimum size, renumber by size, resolve
  // canonical owners from each group's lowest particle id.
  let raw_groups = pfof.iter().copied().max().unwrap_or(0);
  groups::dissolve_small(&mut pfof, raw_groups, cfg.halo_min_size);
  let ids: Vec<i64> = parts.iter().map(|p| p.id).collect();
  let (ngroups, _) = groups::reorder_by_size(&mut pfof, raw_groups, &ids);

  let mut home_of = vec![0usize; n];
  for (w, slab) in slabs.iter().enumerate() {
    for &i in &slab.owned {
      home_of[i] = w;
    }
  }
  let mut group_owner = vec![0usize; ngroups + 1];
  let mut min_id = vec![i64::MAX; ngroups + 1];
  for (i, &g) in pfof.iter().enumerate() {
    if g != 0 && parts[i].id < min_id[g] {
      min_id[g] = parts[i].id;
      group_owner[g] = home_of[i];
    }
  }
  debug!(ngroups, "distributed FOF compiled");
  Ok(DistributedOutcome {
    pfof,
    ngroups,
    group_owner,
  })
}

/// Worker body: local tree + FOF, then the collective rounds.
fn run_worker(
  cfg: &SearchConfig,
  parts: &[Particle],
  slabs: &[Slab],
  me: usize,
  ell: f64,
  tx: Sender<WorkerMsg>,
  rx: Receiver<MainMsg>,
) {
  let slab = &slabs[me];
  let local: Vec<Particle> = slab.owned.iter().map(|&i| parts[i]).collect();
  let tree = KdTree::build(&local, cfg.bucket_size, cfg.period);
  let out = fof::fof(&tree, ell, MIN_LINK_SIZE, false);
  let mut labels = out.pfof;
  if tx.send(WorkerMsg::NumGroups(out.ngroups)).is_err() {
    return;
  }
  let offset = match rx.recv() {
    Ok(MainMsg::Offset(o)) => o,
    _ => return,
  };
  for l in labels.iter_mut() {
    if *l != 0 {
      *l += offset;
    }
  }

  let r2 = ell * ell;
  loop {
    // Boundary export: particles whose search sphere reaches another
    // slab, addressed to that slab's worker.
    let mut exports: Vec<Vec<ExportRecord>> = vec![Vec::new(); slabs.len()];
    for (j, p) in local.iter().enumerate() {
      if labels[j] == 0 {
        continue;
      }
      let x = p.position[slab.axis];
      for (d, other) in slabs.iter().enumerate() {
        if d != me && slab_gap(x, other, cfg.period) <= ell {
          exports[d].push(ExportRecord {
            position: p.position,
            label: labels[j],
          });
        }
      }
    }
    if tx.send(WorkerMsg::Exports(exports)).is_err() {
      return;
    }
    let imports = match rx.recv() {
      Ok(MainMsg::Imports(v)) => v,
      _ => return,
    };

    // Search imported particles against the local tree; any pair within
    // the linking length is a cross-domain link.
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for rec in &imports {
      tree.for_each_within(rec.position, r2, |q, _| {
        if labels[q] != 0 && labels[q] != rec.label {
          pairs.push((rec.label, labels[q]));
        }
      });
    }
    if tx.send(WorkerMsg::Links(pairs)).is_err() {
      return;
    }
    match rx.recv() {
      Ok(MainMsg::Relabel { map, done }) => {
        for l in labels.iter_mut() {
          *l = map[*l];
        }
        if done {
          break;
        }
      }
      _ => return,
    }
  }

  let final_labels: Vec<(usize, usize)> = slab
    .owned
    .iter()
    .zip(labels.iter())
    .map(|(&i, &l)| (i, l))
    .collect();
  let _ = tx.send(WorkerMsg::Labels(final_labels));
}

/// Coordinator: gathers each collective phase in worker order, which
/// makes the global numbering deterministic.
fn coordinate(
  slabs: &[Slab],
  n: usize,
  main_rx: &[Receiver<WorkerMsg>],
  main_tx: &[Sender<MainMsg>],
) -> Result<Vec<usize>> {
  let nworkers = slabs.len();
  let desync = |phase: &str, w: usize| {
    FinderError::Distributed(format!("worker {w} did not report during {phase}"))
  };

  // Phase 1: all-gather counts, broadcast prefix-sum offsets.
  let mut counts = Vec::with_capacity(nworkers);
  for (w, rx) in main_rx.iter().enumerate() {
    match rx.recv() {
      Ok(WorkerMsg::NumGroups(ng)) => counts.push(ng),
      _ => return Err(desync("count gather", w)),
    }
  }
  let total: usize = counts.iter().sum();
  let mut offset = 0usize;
  for (w, tx) in main_tx.iter().enumerate() {
    if tx.send(MainMsg::Offset(offset)).is_err() {
      return Err(desync("offset broadcast", w));
    }
    offset += counts[w];
  }

  // Phases 2-3: link rounds until the all-reduce reports no new links.
  let mut union = LabelUnion::new(total);
  loop {
    let mut routed: Vec<Vec<ExportRecord>> = vec![Vec::new(); nworkers];
    for (w, rx) in main_rx.iter().enumerate() {
      match rx.recv() {
        Ok(WorkerMsg::Exports(per_dest)) => {
          for (d, recs) in per_dest.into_iter().enumerate() {
            routed[d].extend(recs);
          }
        }
        _ => return Err(desync("boundary exchange", w)),
      }
    }
    for (w, (tx, imports)) in main_tx.iter().zip(routed.into_iter()).enumerate() {
      if tx.send(MainMsg::Imports(imports)).is_err() {
        return Err(desync("import delivery", w));
      }
    }
    let mut new_links = 0usize;
    for (w, rx) in main_rx.iter().enumerate() {
      match rx.recv() {
        Ok(WorkerMsg::Links(pairs)) => {
          for (a, b) in pairs {
            if union.union(a, b) {
              new_links += 1;
            }
          }
        }
        _ => return Err(desync("link gather", w)),
      }
    }
    debug!(new_links, "link round complete");
    let done = new_links == 0;
    let mut map = vec![0usize; total + 1];
    for l in 1..=total {
      map[l] = union.find(l);
    }
    for (w, tx) in main_tx.iter().enumerate() {
      if tx
        .send(MainMsg::Relabel {
          map: map.clone(),
          done,
        })
        .is_err()
      {
        return Err(desync("relabel broadcast", w));
      }
    }
    if done {
      break;
    }
  }

  // Phase 4: gather final labels in worker order.
  let mut pfof = vec![0usize; n];
  for (w, rx) in main_rx.iter().enumerate() {
    match rx.recv() {
      Ok(WorkerMsg::Labels(assignments)) => {
        for (i, l) in assignments {
          pfof[i] = l;
        }
      }
      _ => return Err(desync("label gather", w)),
    }
  }
  Ok(pfof)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
