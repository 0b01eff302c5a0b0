//! Statistical significance filter for candidate groups.
//!
//! Outlier scores of background particles follow the upper tail of a unit
//! Gaussian above the admission threshold, so the mean score a *random*
//! group of tagged particles would show is known. A group whose average
//! score does not exceed that expectation by `sig_level` standard errors
//! is trimmed from its lowest-score member upwards until it either passes
//! or drops below the minimum size and dissolves.

use tracing::debug;

use crate::config::SearchConfig;
use crate::groups::{self, UNGROUPED};

/// Expected mean of a unit Gaussian truncated below at `t`.
fn truncated_gaussian_mean(t: f64) -> f64 {
  let phi = (2.0 / std::f64::consts::PI).sqrt() * (-0.5 * t * t).exp();
  let tail = 1.0 - erf(t / std::f64::consts::SQRT_2);
  if tail <= 0.0 {
    // Threshold far in the tail: the truncated mean approaches t.
    return t.max(0.0);
  }
  phi / tail
}

/// Abramowitz & Stegun 7.1.26, good to ~1.5e-7.
fn erf(x: f64) -> f64 {
  let sign = if x < 0.0 { -1.0 } else { 1.0 };
  let x = x.abs();
  let t = 1.0 / (1.0 + 0.3275911 * x);
  let y = 1.0
    - (((((1.061405429 * t - 1.453152027) * t) + 1.421413741) * t - 0.284496736) * t
      + 0.254829592)
      * t
      * (-x * x).exp();
  sign * y
}

/// Significance statistic of a group: `(ave / expected - 1) * sqrt(N)`.
#[inline]
fn beta(ave: f64, expected: f64, n: usize) -> f64 {
  (ave / expected - 1.0) * (n as f64).sqrt()
}

/// Remove insignificant groups.
///
/// Returns the new group count; labels come back compacted and
/// size-ordered, with the renumber map as second element so hierarchy
/// state can follow.
pub fn check_significance(
  cfg: &SearchConfig,
  scores: &[f64],
  ids: &[i64],
  pfof: &mut [usize],
  ngroups: usize,
) -> (usize, Vec<usize>) {
  if ngroups == 0 {
    return (0, vec![0]);
  }
  let threshold = if cfg.iterate {
    cfg.ellthreshold * cfg.ellfac
  } else {
    cfg.ellthreshold
  };
  let expected = truncated_gaussian_mean(threshold);

  let mut pglist = groups::build_pglist(pfof, ngroups);
  let mut removed_groups = 0usize;
  for g in 1..=ngroups {
    let members = &mut pglist[g];
    if members.is_empty() {
      continue;
    }
    let mut sum: f64 = members.iter().map(|&i| scores[i]).sum();
    while beta(sum / members.len() as f64, expected, members.len()) < cfg.sig_level {
      if members.len() < cfg.min_size.max(2) {
        for &i in members.iter() {
          pfof[i] = UNGROUPED;
        }
        members.clear();
        removed_groups += 1;
        break;
      }
      // drop the weakest member and retest
      let (at, &weakest) = members
        .iter()
        .enumerate()
        .min_by(|a, b| {
          scores[*a.1]
            .partial_cmp(&scores[*b.1])
            .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap();
      sum -= scores[weakest];
      pfof[weakest] = UNGROUPED;
      members.swap_remove(at);
    }
  }
  debug!(removed_groups, ngroups, "significance check done");
  let (ng, map) = groups::reorder_by_size(pfof, ngroups, ids);
  (ng, map)
}
