//! An observed-remove map whose values are themselves delta CRDTs.
//!
//! Every key holds a nested [`DeltaValue`] plus, per contributing actor, the
//! one active dot and the exact sub-deltas that actor's writes produced.
//! Removing a dot therefore has two paths: reverse exactly those sub-deltas
//! when the value can prove the reversal is trace-free, or rebuild the value
//! from the remaining actors' sub-deltas when it cannot. The fallback costs
//! CPU, never correctness.
//!
//! The upshot is the same reset-remove semantic as classic CRDT maps: if one
//! replica removes a key while another concurrently edits it, the key
//! survives the merge but only with the edits the remover never saw.
//!
//! # Examples
//!
//! ```
//! use delta_crdts::{GrowSet, OrMap};
//!
//! let friends: OrMap<String, GrowSet<String>, String> = OrMap::new();
//! let backup: OrMap<String, GrowSet<String>, String> = OrMap::new();
//!
//! let delta = friends
//!     .update("alice".to_string(), "node-1".to_string(), |_| {
//!         vec!["bob".to_string()]
//!     })
//!     .unwrap();
//! backup.merge(delta).unwrap();
//!
//! let alice = backup.get(&"alice".to_string()).unwrap();
//! assert!(alice.contains(&"bob".to_string()));
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dot::{Actor, Version};
use crate::engine::{CausalTimestamp, Delta, MergeOutcome, OrEngine};
use crate::error::Result;
use crate::traits::{AddOutcome, DeltaSink, DeltaValue};

/// Trait alias for the keys an [`OrMap`] may hold.
pub trait Key: Ord + Clone + PartialEq + Debug + Send + Serialize + DeserializeOwned {}
impl<K: Ord + Clone + PartialEq + Debug + Send + Serialize + DeserializeOwned> Key for K {}

/// The payload an [`OrMap`] dot carries: a key and the full set of
/// sub-deltas making up the issuing actor's contribution to that key.
///
/// The list is cumulative on purpose. It is what a receiving replica needs
/// to reverse the whole contribution later, and it makes a lone `Added`
/// delta sufficient to reconstruct the actor's part of the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = ""))]
pub struct KeyedDeltas<K: Key, D>
where
    D: Clone + PartialEq + Debug + Send + Serialize + DeserializeOwned,
{
    /// The key the contribution applies to.
    pub key: K,
    /// The issuing actor's sub-deltas for this key, oldest first.
    pub deltas: Vec<D>,
}

/// The delta type an [`OrMap`] replicates through.
pub type MapDelta<K, V, A> = Delta<A, KeyedDeltas<K, <V as DeltaValue>::Delta>>;

/// One actor's contribution to a key: its active dot and the sub-deltas
/// behind it.
struct DotDeltas<D> {
    version: Version,
    deltas: Vec<D>,
}

/// Per-key aggregate: the merged nested value plus every actor's recorded
/// contribution.
struct DottedValue<V: DeltaValue, A> {
    value: V,
    slots: BTreeMap<A, DotDeltas<V::Delta>>,
}

impl<V: DeltaValue, A> Default for DottedValue<V, A> {
    fn default() -> Self {
        DottedValue {
            value: V::default(),
            slots: BTreeMap::new(),
        }
    }
}

struct MapStore<K: Key, V: DeltaValue, A> {
    entries: Mutex<BTreeMap<K, DottedValue<V, A>>>,
}

impl<K: Key, V: DeltaValue, A> MapStore<K, V, A> {
    fn new() -> Self {
        MapStore {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<K: Key, V: DeltaValue, A: Actor> DeltaSink<A, KeyedDeltas<K, V::Delta>>
    for MapStore<K, V, A>
{
    fn add_dot(&self, actor: &A, version: Version, item: &KeyedDeltas<K, V::Delta>) -> AddOutcome {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(item.key.clone())
            .or_insert_with(DottedValue::default);
        match entry.slots.get_mut(actor) {
            Some(slot) if slot.version >= version => AddOutcome::Stale,
            Some(slot) => {
                let old = slot.version;
                slot.version = version;
                slot.deltas = item.deltas.clone();
                for delta in &item.deltas {
                    entry.value.apply(delta);
                }
                AddOutcome::Superseded(old)
            }
            None => {
                entry.slots.insert(
                    actor.clone(),
                    DotDeltas {
                        version,
                        deltas: item.deltas.clone(),
                    },
                );
                for delta in &item.deltas {
                    entry.value.apply(delta);
                }
                AddOutcome::Fresh
            }
        }
    }

    fn remove_dot(&self, actor: &A, version: Version, item: &KeyedDeltas<K, V::Delta>) {
        let mut entries = self.entries.lock();
        let entry = match entries.get_mut(&item.key) {
            Some(entry) => entry,
            None => return,
        };
        match entry.slots.get(actor) {
            Some(slot) if slot.version == version => {}
            // a different (newer) dot owns this actor's contribution now;
            // the removed dot left nothing behind
            _ => return,
        }
        let removed = entry.slots.remove(actor).expect("checked just above");
        if entry.slots.is_empty() {
            entries.remove(&item.key);
            return;
        }
        let mut reversed = true;
        for delta in removed.deltas.iter().rev() {
            if !entry.value.unapply(delta) {
                reversed = false;
                break;
            }
        }
        if !reversed {
            // the cheap path could not prove exactness; replay everyone else
            let mut rebuilt = V::default();
            for remaining in entry.slots.values() {
                for delta in &remaining.deltas {
                    rebuilt.apply(delta);
                }
            }
            entry.value = rebuilt;
        }
    }
}

/// A delta-replicated observed-remove map with nested CRDT values.
///
/// Like [`OrSet`](crate::OrSet), all operations take `&self`, are
/// thread-safe, and replication happens by shipping deltas.
pub struct OrMap<K: Key, V: DeltaValue, A: Actor> {
    engine: OrEngine<A, KeyedDeltas<K, V::Delta>, MapStore<K, V, A>>,
}

impl<K: Key, V: DeltaValue, A: Actor> Default for OrMap<K, V, A> {
    fn default() -> Self {
        OrMap::new()
    }
}

impl<K: Key, V: DeltaValue, A: Actor> OrMap<K, V, A> {
    /// Returns a new, empty map.
    pub fn new() -> Self {
        OrMap {
            engine: OrEngine::new(MapStore::new()),
        }
    }

    /// Mutate the value under `key` on behalf of `actor`.
    ///
    /// The closure sees the current merged value (or a default for a missing
    /// key) and returns the sub-deltas of its edit. Those are folded into
    /// the stored value, recorded under a fresh dot that supersedes the
    /// actor's previous one, and returned as a replicable delta.
    pub fn update<F>(&self, key: K, actor: A, mutate: F) -> Result<MapDelta<K, V, A>>
    where
        F: FnOnce(&V) -> Vec<V::Delta>,
    {
        let (current, mut contribution) = {
            let entries = self.engine.sink().entries.lock();
            match entries.get(&key) {
                Some(entry) => (
                    entry.value.clone(),
                    entry
                        .slots
                        .get(&actor)
                        .map(|slot| slot.deltas.clone())
                        .unwrap_or_default(),
                ),
                None => (V::default(), Vec::new()),
            }
        };
        contribution.extend(mutate(&current));
        self.engine.record(
            actor,
            KeyedDeltas {
                key,
                deltas: contribution,
            },
        )
    }

    /// Drop a key, returning one `RemovedDot` delta per contributing actor.
    /// An empty vector means the key was not present.
    pub fn remove(&self, key: &K) -> Vec<MapDelta<K, V, A>> {
        let dots: Vec<(A, Version)> = {
            let mut entries = self.engine.sink().entries.lock();
            match entries.remove(key) {
                Some(entry) => entry
                    .slots
                    .into_iter()
                    .map(|(actor, slot)| (actor, slot.version))
                    .collect(),
                None => return Vec::new(),
            }
        };
        dots.into_iter()
            .map(|(actor, version)| {
                self.engine.retire(&actor, version);
                Delta::RemovedDot { actor, version }
            })
            .collect()
    }

    /// A copy of the merged value under `key`, if present.
    pub fn get(&self, key: &K) -> Option<V> {
        self.engine
            .sink()
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// True iff the key is currently present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.engine.sink().entries.lock().contains_key(key)
    }

    /// The present keys, in their natural order.
    pub fn keys(&self) -> Vec<K> {
        self.engine.sink().entries.lock().keys().cloned().collect()
    }

    /// Number of present keys.
    pub fn len(&self) -> usize {
        self.engine.sink().entries.lock().len()
    }

    /// True iff no key is present.
    pub fn is_empty(&self) -> bool {
        self.engine.sink().entries.lock().is_empty()
    }

    /// Snapshot the causal context. See [`OrEngine::timestamp`].
    pub fn timestamp(&self) -> CausalTimestamp<A> {
        self.engine.timestamp()
    }

    /// Deltas a peer at `since` is missing. See [`OrEngine::deltas_since`].
    pub fn deltas_since(
        &self,
        since: Option<&CausalTimestamp<A>>,
    ) -> impl Iterator<Item = MapDelta<K, V, A>> {
        self.engine.deltas_since(since)
    }

    /// Apply one replicated delta. See [`OrEngine::merge`].
    pub fn merge(&self, delta: MapDelta<K, V, A>) -> Result<MergeOutcome> {
        self.engine.merge(delta)
    }

    /// Apply a batch of replicated deltas. See [`OrEngine::merge_all`].
    pub fn merge_all(
        &self,
        deltas: impl IntoIterator<Item = MapDelta<K, V, A>>,
    ) -> Result<MergeOutcome> {
        self.engine.merge_all(deltas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gset::GrowSet;
    use crate::lwwreg::{LwwReg, Write};

    type FriendMap = OrMap<String, GrowSet<String>, u8>;
    type RegMap = OrMap<String, LwwReg<u8>, u8>;

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn test_update_replicates_full_contribution() {
        let a = FriendMap::new();
        a.update(s("k"), 1, |_| vec![s("one")]).unwrap();
        let second = a.update(s("k"), 1, |_| vec![s("two")]).unwrap();

        // the second delta alone carries the actor's whole contribution
        let b = FriendMap::new();
        b.merge(second).unwrap();
        let value = b.get(&s("k")).unwrap();
        assert!(value.contains(&s("one")));
        assert!(value.contains(&s("two")));

        // one key, one slot: the new dot superseded the old one
        assert_eq!(b.keys(), vec![s("k")]);
    }

    #[test]
    fn test_reset_remove_semantics() {
        let m1 = FriendMap::new();
        let d = m1.update(s("alice"), 1, |_| vec![s("bob")]).unwrap();

        let m2 = FriendMap::new();
        m2.merge(d).unwrap();

        // m1 removes "alice" while m2 concurrently adds "clyde"
        let removals = m1.remove(&s("alice"));
        let concurrent = m2.update(s("alice"), 2, |_| vec![s("clyde")]).unwrap();

        m1.merge(concurrent).unwrap();
        m2.merge_all(removals).unwrap();

        // the key survives, but only with the edit the remover never saw
        for m in [&m1, &m2].iter() {
            let alice = m.get(&s("alice")).unwrap();
            assert!(!alice.contains(&s("bob")));
            assert!(alice.contains(&s("clyde")));
        }
    }

    #[test]
    fn test_removing_last_contribution_drops_the_key() {
        let a = FriendMap::new();
        a.update(s("k"), 1, |_| vec![s("x")]).unwrap();
        let removals = a.remove(&s("k"));
        assert_eq!(removals.len(), 1);
        assert!(a.is_empty());

        let b = FriendMap::new();
        b.merge_all(a.deltas_since(None).collect::<Vec<_>>()).unwrap();
        assert!(b.is_empty());
    }

    #[test]
    fn test_reversal_of_a_losing_write_skips_rebuild() {
        let a = RegMap::new();
        let low = a
            .update(s("k"), 1, |_| vec![Write { stamp: 1, value: 10 }])
            .unwrap();
        a.update(s("k"), 2, |_| vec![Write { stamp: 9, value: 20 }])
            .unwrap();
        assert_eq!(a.get(&s("k")).unwrap().read(), Some(&20));

        // a replica that only saw the losing write removes the key
        let b = RegMap::new();
        b.merge(low).unwrap();
        let removals = b.remove(&s("k"));

        a.merge_all(removals).unwrap();
        // actor 1's contribution reversed exactly; the winner stands
        assert_eq!(a.get(&s("k")).unwrap().read(), Some(&20));
    }

    #[test]
    fn test_irreversible_contribution_triggers_rebuild() {
        let a = FriendMap::new();
        let bob = a.update(s("k"), 1, |_| vec![s("bob")]).unwrap();
        a.update(s("k"), 2, |_| vec![s("clyde")]).unwrap();

        let b = FriendMap::new();
        b.merge(bob).unwrap();
        let removals = b.remove(&s("k"));

        a.merge_all(removals).unwrap();
        let value = a.get(&s("k")).unwrap();
        assert!(!value.contains(&s("bob")));
        assert!(value.contains(&s("clyde")));
    }
}
