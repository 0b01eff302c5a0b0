//! Friends-of-friends linking: comparison predicates and the group-finding
//! engine.
//!
//! The engine consumes a [`KdTree`](crate::kdtree::KdTree), a
//! [`FofPredicate`] with its [`LinkParams`], and an optional
//! [`LinkFilter`], and produces a dense label array. Two modes exist:
//! standalone component finding ([`fof_criterion`]) and predicate-guided
//! marking of pre-existing labels ([`search_criterion`]), which is the
//! primitive the iterative expansion passes are built on.

pub mod engine;
pub mod predicate;

pub use engine::{fof, fof_criterion, fof_nn_criterion, search_criterion, FofOutcome};
pub use predicate::{FofPredicate, LinkFilter, LinkParams};
