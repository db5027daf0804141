use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dot::{Actor, Version};

/// Trait alias for the payload a delta can carry: anything cloneable,
/// comparable (so a dot arriving twice with different content can be caught)
/// and serializable by the external codec that moves deltas between replicas.
pub trait DeltaItem: Clone + PartialEq + Debug + Send + Serialize + DeserializeOwned {}
impl<I: Clone + PartialEq + Debug + Send + Serialize + DeserializeOwned> DeltaItem for I {}

/// What happened when a dot was offered to a [`DeltaSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The actor had no dot on this item yet; the dot was stored.
    Fresh,
    /// The actor's previous dot on this item was replaced; the engine must
    /// drop the returned version from its inverse store.
    Superseded(Version),
    /// An existing dot for this actor already dominates the offered one.
    /// Higher version wins; the offered dot is observed but stores nothing.
    Stale,
}

/// Item-specific storage hooks behind the generic observed-remove engine.
///
/// The engine owns the causal bookkeeping (what was observed, what is
/// present); a sink owns what a dot *means* for the concrete data type. Sets
/// and maps in this crate implement this trait and hand themselves to their
/// engine by composition.
///
/// Both hooks are invoked with the per-actor engine lock held, so a sink may
/// assume calls for one actor never overlap.
pub trait DeltaSink<A: Actor, I: DeltaItem> {
    /// Apply an addition to item-specific storage. If the actor already had
    /// an active dot on this item, report it via the outcome so the engine
    /// can retire it.
    fn add_dot(&self, actor: &A, version: Version, item: &I) -> AddOutcome;

    /// Undo item-specific storage for exactly this dot. Called only for dots
    /// the engine held in its inverse store, with the item that was stored.
    fn remove_dot(&self, actor: &A, version: Version, item: &I);
}

/// A value that can live inside an observed-remove map.
///
/// Mutations are expressed as deltas: idempotent, commutative fragments that
/// any replica can apply in any order, any number of times. When a
/// contributing actor's dot is removed, the map first asks the value to
/// reverse that actor's deltas one by one; `unapply` answering `false` makes
/// the map fall back to rebuilding the value from the remaining actors'
/// deltas, trading CPU for exactness.
pub trait DeltaValue: Default + Clone {
    /// One mutation fragment.
    type Delta: Clone + PartialEq + Debug + Send + Serialize + DeserializeOwned;

    /// Fold a delta into the value. Must be idempotent and commutative.
    fn apply(&mut self, delta: &Self::Delta);

    /// Try to undo a previously applied delta exactly. Return `true` only
    /// when the value provably no longer reflects the delta afterwards;
    /// answer `false` whenever concurrent deltas may have touched the same
    /// sub-state, and the caller rebuilds instead. Leaving the value half
    /// reversed before answering `false` is fine.
    fn unapply(&mut self, delta: &Self::Delta) -> bool;
}
