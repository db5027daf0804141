//! A pure-Rust library of delta-state CRDT's.
//!
//! [Conflict-free Replicated Data Types][crdt] (CRDTs) are data structures
//! which can be replicated across multiple networked nodes, and whose
//! properties allow for deterministic, local resolution of
//! possible inconsistencies which might result from concurrent
//! operations.
//!
//! The types in this crate are *delta* CRDTs: instead of shipping full
//! state, replicas exchange only the changes made since they last talked.
//! A replica snapshots its [`CausalTimestamp`], hands it to a peer, and the
//! peer answers with the [`Delta`]s the snapshot is missing; applying them
//! with `merge` is idempotent and commutative, so losing, duplicating or
//! reordering messages never breaks convergence.
//!
//! [crdt]: https://en.wikipedia.org/wiki/Conflict-free_replicated_data_type
#![crate_type = "lib"]
#![deny(missing_docs)]

mod error;
pub use crate::error::{Error, Result};

mod traits;
pub use crate::traits::{AddOutcome, DeltaItem, DeltaSink, DeltaValue};

/// This module contains the actor and dot primitives.
pub mod dot;

/// This module contains range-compressed per-actor version histories.
pub mod ranges;

/// This module contains a concurrent skip-list map keyed by version.
pub mod skiplist;

/// This module contains the generic observed-remove delta engine.
pub mod engine;

/// This module contains an Observed-Remove Set.
pub mod orset;

/// This module contains an Observed-Remove Map with nested CRDT values.
pub mod ormap;

/// This module contains a Last-Write-Wins Register delta value.
pub mod lwwreg;

/// This module contains a Grow-only Set delta value.
pub mod gset;

// Top-level re-exports for CRDT structures.
pub use crate::{
    dot::{Actor, Dot, Version},
    engine::{CausalTimestamp, Delta, MergeOutcome, OrEngine},
    gset::GrowSet,
    lwwreg::LwwReg,
    ormap::{KeyedDeltas, MapDelta, OrMap},
    orset::{OrSet, SetChange},
    ranges::{VersionRange, VersionRanges},
    skiplist::SkipListMap,
};
