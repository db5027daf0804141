//! The generic observed-remove delta engine.
//!
//! Concrete CRDTs in this crate (the set, the map) are thin item-semantics
//! layers over this engine. The engine owns two structures per actor: the
//! causal context (every version ever observed from that actor, compressed
//! into ranges) and the inverse store (only the versions whose item is still
//! present, in a concurrent skip list). Removed dots therefore survive as
//! range-compressed tombstones in the context rather than as per-dot
//! records, which is what bounds memory under heavy churn.
//!
//! Synchronization between replicas needs exactly three operations:
//! [`timestamp`], [`deltas_since`] and [`merge`]. Two replicas exchange
//! timestamps, stream each other the deltas the peer has not seen, and merge
//! what arrives; merging is idempotent and commutative, so message loss,
//! duplication and reordering all heal on the next exchange.
//!
//! [`timestamp`]: OrEngine::timestamp
//! [`deltas_since`]: OrEngine::deltas_since
//! [`merge`]: OrEngine::merge

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::dot::{Actor, Version};
use crate::error::{Error, Result};
use crate::ranges::{SharedVersionRanges, VersionRange, VersionRanges};
use crate::skiplist::SkipListMap;
use crate::traits::{AddOutcome, DeltaItem, DeltaSink};

/// One change, small enough to ship to another replica.
///
/// Produced by local mutation or by [`OrEngine::deltas_since`]; consumed by
/// [`OrEngine::merge`]. Serializable, so any external codec can carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = ""))]
pub enum Delta<A: Actor, I: DeltaItem> {
    /// A dot and the item it added.
    Added {
        /// The added payload.
        item: I,
        /// The actor that issued the dot.
        actor: A,
        /// The version of the dot.
        version: Version,
    },
    /// A single dot whose item was removed.
    RemovedDot {
        /// The actor that issued the removed dot.
        actor: A,
        /// The version of the removed dot.
        version: Version,
    },
    /// A whole range of one actor's dots, none of which still carry an item.
    RemovedRange {
        /// The actor whose dots were removed.
        actor: A,
        /// The removed versions, as a half-open range.
        range: VersionRange,
    },
}

/// Whether a merge taught the local replica anything.
///
/// The propagation layer uses this to decide whether a received delta is
/// worth re-broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Local state changed.
    Updated,
    /// The delta was already known; nothing changed.
    Unchanged,
}

impl MergeOutcome {
    /// True for [`MergeOutcome::Updated`].
    pub fn updated(self) -> bool {
        self == MergeOutcome::Updated
    }

    /// Combine with another outcome; updated wins.
    pub fn combine(self, other: MergeOutcome) -> MergeOutcome {
        if self.updated() || other.updated() {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        }
    }
}

/// An immutable snapshot of a replica's causal context, used as the "since"
/// argument when asking a peer for deltas.
///
/// Serializes as `{actor: [{start, end}, ...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = ""))]
pub struct CausalTimestamp<A: Actor> {
    ranges: BTreeMap<A, VersionRanges>,
}

impl<A: Actor> Default for CausalTimestamp<A> {
    fn default() -> Self {
        CausalTimestamp {
            ranges: BTreeMap::new(),
        }
    }
}

impl<A: Actor> CausalTimestamp<A> {
    /// The timestamp of a replica that has seen nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded history for one actor.
    pub fn get(&self, actor: &A) -> Option<&VersionRanges> {
        self.ranges.get(actor)
    }

    /// True iff the snapshot covers this exact dot.
    pub fn contains(&self, actor: &A, version: Version) -> bool {
        self.ranges
            .get(actor)
            .map(|r| r.contains(version))
            .unwrap_or(false)
    }

    /// Iterate over the per-actor histories.
    pub fn iter(&self) -> impl Iterator<Item = (&A, &VersionRanges)> {
        self.ranges.iter()
    }

    /// True iff the snapshot covers no dots at all.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Per-actor engine state: the context/inverse pair and the lock that makes
/// compound operations on them atomic for this one actor.
struct Shard<I> {
    op_lock: Mutex<()>,
    ranges: SharedVersionRanges,
    inverse: SkipListMap<I>,
}

impl<I> Shard<I> {
    fn new() -> Self {
        Shard {
            op_lock: Mutex::new(()),
            ranges: SharedVersionRanges::new(),
            inverse: SkipListMap::new(),
        }
    }
}

/// The generic observed-remove protocol, parameterized by the item-semantics
/// sink a concrete CRDT provides.
///
/// Every public operation is safe to call concurrently on a shared
/// reference. Locking is per actor, never global: merging actor A's deltas
/// does not contend with merging actor B's, and enumeration takes no
/// engine-wide lock at all.
pub struct OrEngine<A: Actor, I: DeltaItem, S: DeltaSink<A, I>> {
    shards: RwLock<BTreeMap<A, Arc<Shard<I>>>>,
    sink: S,
}

impl<A: Actor, I: DeltaItem, S: DeltaSink<A, I>> OrEngine<A, I, S> {
    /// Build an engine around the given sink.
    pub fn new(sink: S) -> Self {
        OrEngine {
            shards: RwLock::new(BTreeMap::new()),
            sink,
        }
    }

    /// The sink this engine forwards item semantics to.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn shard(&self, actor: &A) -> Arc<Shard<I>> {
        if let Some(shard) = self.shards.read().get(actor) {
            return shard.clone();
        }
        let mut shards = self.shards.write();
        shards
            .entry(actor.clone())
            .or_insert_with(|| Arc::new(Shard::new()))
            .clone()
    }

    /// Snapshot the full causal context.
    pub fn timestamp(&self) -> CausalTimestamp<A> {
        let shards = self.shards.read();
        let mut ranges = BTreeMap::new();
        for (actor, shard) in shards.iter() {
            let snapshot = shard.ranges.snapshot();
            if !snapshot.is_empty() {
                ranges.insert(actor.clone(), snapshot);
            }
        }
        CausalTimestamp { ranges }
    }

    /// Everything a peer whose timestamp is `since` has not seen: additions
    /// it is missing, and removals of dots it believes it knows.
    ///
    /// The sequence is finite and computed per actor on demand; re-invoking
    /// recomputes from current state. Ordering is per actor and then by
    /// version, with no total order across actors. The walk takes no
    /// engine-wide lock, so a mutation racing with it may be missed; the
    /// peer picks any missed change up on its next exchange.
    pub fn deltas_since(&self, since: Option<&CausalTimestamp<A>>) -> impl Iterator<Item = Delta<A, I>> {
        let work: Vec<(A, Arc<Shard<I>>, VersionRanges)> = {
            let shards = self.shards.read();
            shards
                .iter()
                .map(|(actor, shard)| {
                    let seen = since
                        .and_then(|t| t.get(actor))
                        .cloned()
                        .unwrap_or_default();
                    (actor.clone(), shard.clone(), seen)
                })
                .collect()
        };
        work.into_iter()
            .flat_map(|(actor, shard, seen)| Self::shard_deltas(&actor, &shard, &seen).into_iter())
    }

    fn shard_deltas(actor: &A, shard: &Shard<I>, seen: &VersionRanges) -> Vec<Delta<A, I>> {
        let known = shard.ranges.snapshot();
        if known.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();

        // additions: present dots outside what the peer has seen
        for (version, item) in shard.inverse.range(1, u64::max_value()) {
            if !seen.contains(version) {
                out.push(Delta::Added {
                    item,
                    actor: actor.clone(),
                    version,
                });
            }
        }

        // removals: gaps in the peer's claimed knowledge that we also know
        // about but hold no item for. Dots the peer knows and we do not are
        // left alone; we cannot have observed their removal.
        for window in known.intersect(seen).iter() {
            let mut cursor = window.start;
            for (version, _) in shard.inverse.range(window.start, window.end) {
                if version > cursor {
                    out.push(Self::removal(actor, cursor, version));
                }
                cursor = version + 1;
            }
            if cursor < window.end {
                out.push(Self::removal(actor, cursor, window.end));
            }
        }
        out
    }

    fn removal(actor: &A, start: Version, end: Version) -> Delta<A, I> {
        if end - start == 1 {
            Delta::RemovedDot {
                actor: actor.clone(),
                version: start,
            }
        } else {
            Delta::RemovedRange {
                actor: actor.clone(),
                range: VersionRange::new(start, end),
            }
        }
    }

    /// Apply one delta. Idempotent and commutative: duplicated, reordered
    /// and crossed deltas all converge.
    ///
    /// The only error is [`Error::ConflictingDot`], raised when a dot
    /// arrives carrying a different item than the one it is already bound
    /// to, which means two writers shared an actor identity.
    pub fn merge(&self, delta: Delta<A, I>) -> Result<MergeOutcome> {
        match delta {
            Delta::Added {
                item,
                actor,
                version,
            } => self.merge_added(actor, version, item),
            Delta::RemovedDot { actor, version } => Ok(self.merge_removed_dot(actor, version)),
            Delta::RemovedRange { actor, range } => Ok(self.merge_removed_range(actor, range)),
        }
    }

    /// Apply a batch of deltas, reporting whether any of them changed state.
    pub fn merge_all(&self, deltas: impl IntoIterator<Item = Delta<A, I>>) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::Unchanged;
        for delta in deltas {
            outcome = outcome.combine(self.merge(delta)?);
        }
        Ok(outcome)
    }

    fn merge_added(&self, actor: A, version: Version, item: I) -> Result<MergeOutcome> {
        let shard = self.shard(&actor);
        let _op = shard.op_lock.lock();
        if shard.ranges.contains(version) {
            // Known dot. If we still hold its item, make sure the duplicate
            // carries the same content; a mismatch means two writers shared
            // this actor identity. We cannot check dots whose item is gone.
            if let Some(existing) = shard.inverse.get(version) {
                if existing != item {
                    return Err(Error::ConflictingDot { version });
                }
            }
            return Ok(MergeOutcome::Unchanged);
        }
        // Inverse before context. A concurrent enumeration that found the
        // context updated but the inverse empty would report this addition
        // as a removal.
        if !shard.inverse.try_insert(version, item.clone()) {
            return Err(Error::ConflictingDot { version });
        }
        match self.sink.add_dot(&actor, version, &item) {
            AddOutcome::Fresh => {}
            AddOutcome::Superseded(old) => {
                shard.inverse.remove(old);
            }
            AddOutcome::Stale => {
                shard.inverse.remove(version);
            }
        }
        shard.ranges.observe(version);
        trace!(?actor, version, "applied addition");
        Ok(MergeOutcome::Updated)
    }

    fn merge_removed_dot(&self, actor: A, version: Version) -> MergeOutcome {
        let shard = self.shard(&actor);
        let _op = shard.op_lock.lock();
        if shard.ranges.observe(version) {
            // never observed locally: new tombstone, nothing present to drop
            trace!(?actor, version, "tombstoned unseen dot");
            return MergeOutcome::Updated;
        }
        match shard.inverse.remove(version) {
            Some(item) => {
                self.sink.remove_dot(&actor, version, &item);
                trace!(?actor, version, "removed dot");
                MergeOutcome::Updated
            }
            None => MergeOutcome::Unchanged,
        }
    }

    fn merge_removed_range(&self, actor: A, range: VersionRange) -> MergeOutcome {
        let shard = self.shard(&actor);
        let _op = shard.op_lock.lock();
        let mut changed = shard.ranges.observe_range(range);
        let present: Vec<(Version, I)> = shard.inverse.range(range.start, range.end).collect();
        for (version, item) in present {
            if shard.inverse.remove(version).is_some() {
                self.sink.remove_dot(&actor, version, &item);
                changed = true;
            }
        }
        if changed {
            trace!(?actor, %range, "applied range removal");
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// Allocate the next version for `actor`, bind `item` to it, and return
    /// the delta describing the mutation.
    ///
    /// Allocation, the inverse-store insert and the context update happen
    /// under the actor's lock, in that fixed order, so the new dot becomes
    /// visible to concurrent enumerations only with its item already in
    /// place.
    pub fn record(&self, actor: A, item: I) -> Result<Delta<A, I>> {
        let shard = self.shard(&actor);
        let _op = shard.op_lock.lock();
        let version = shard.ranges.next();
        if !shard.inverse.try_insert(version, item.clone()) {
            return Err(Error::ConflictingDot { version });
        }
        match self.sink.add_dot(&actor, version, &item) {
            AddOutcome::Fresh => {}
            AddOutcome::Superseded(old) => {
                shard.inverse.remove(old);
            }
            AddOutcome::Stale => {
                // a freshly allocated version can only be stale if another
                // writer shares this actor identity
                shard.inverse.remove(version);
                return Err(Error::ConflictingDot { version });
            }
        }
        shard.ranges.observe(version);
        trace!(?actor, version, "recorded local mutation");
        Ok(Delta::Added {
            item,
            actor,
            version,
        })
    }

    /// Drop a dot's item from the inverse store without touching the causal
    /// context. This is the local half of a removal: the dot stays observed
    /// forever, it just no longer carries anything.
    pub fn retire(&self, actor: &A, version: Version) -> bool {
        let shard = self.shard(actor);
        let _op = shard.op_lock.lock();
        shard.inverse.remove(version).is_some()
    }
}
