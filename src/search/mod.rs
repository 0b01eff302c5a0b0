//! Structure search passes.
//!
//! - [`full`]: the field-halo pass (3D FOF, optional 6D refinement,
//!   hierarchy seeding, periodic adjustment)
//! - [`subset`]: the substructure search within one halo or substructure
//! - [`expansion`]: the iterative mark/link/merge machinery the subset
//!   search is built from
//! - [`cores`]: the dedicated 6D halo-core search for major mergers
//! - [`recurse`]: the recursion driver that walks the hierarchy downwards

pub mod cores;
pub mod expansion;
pub mod full;
pub mod recurse;
pub mod subset;

pub use full::{adjust_for_period, search_full_set, FullSearchOutcome};
pub use recurse::search_sub_sub;
pub use subset::{search_subset, SubsetOutcome};
