//! An observed-remove set that replicates through deltas.
//!
//! Each member carries one active dot per actor that ever (re-)added it;
//! removal drops exactly the dots the removing replica has observed, so a
//! concurrent add on another replica survives the remove. Ported in spirit
//! from the ORSWOT family, with the causal machinery factored out into
//! [`OrEngine`].
//!
//! # Examples
//!
//! ```
//! use delta_crdts::OrSet;
//!
//! let chores = OrSet::new();
//! let backup = OrSet::new();
//!
//! let delta = chores
//!     .insert("paint the shed".to_string(), "alice".to_string())
//!     .unwrap();
//! backup.merge(delta).unwrap();
//! assert_eq!(backup.values(), vec!["paint the shed".to_string()]);
//!
//! for delta in chores.remove(&"paint the shed".to_string()) {
//!     backup.merge(delta).unwrap();
//! }
//! assert!(backup.values().is_empty());
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::dot::{Actor, Dot, Version};
use crate::engine::{CausalTimestamp, Delta, MergeOutcome, OrEngine};
use crate::error::Result;
use crate::traits::{AddOutcome, DeltaItem, DeltaSink};

/// A membership change reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetChange<M> {
    /// The member became present.
    Added(M),
    /// The member's last dot was dropped.
    Removed(M),
}

type Observer<M> = Arc<dyn Fn(&SetChange<M>) + Send + Sync>;

/// Member storage behind the engine: member -> one active dot per actor.
struct SetStore<M: Ord, A> {
    entries: Mutex<BTreeMap<M, SmallVec<[Dot<A>; 2]>>>,
    /// Read-mostly snapshot: writers clone-and-swap the `Arc`, readers clone
    /// it out and invoke callbacks with no lock held.
    observers: RwLock<Arc<Vec<Observer<M>>>>,
}

impl<M: Ord, A> SetStore<M, A> {
    fn new() -> Self {
        SetStore {
            entries: Mutex::new(BTreeMap::new()),
            observers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn notify(&self, change: SetChange<M>) {
        let observers = self.observers.read().clone();
        for observer in observers.iter() {
            observer(&change);
        }
    }
}

impl<M: DeltaItem + Ord, A: Actor> DeltaSink<A, M> for SetStore<M, A> {
    fn add_dot(&self, actor: &A, version: Version, item: &M) -> AddOutcome {
        let mut entries = self.entries.lock();
        let dots = entries.entry(item.clone()).or_insert_with(SmallVec::new);
        let outcome = match dots.iter_mut().find(|dot| &dot.actor == actor) {
            Some(dot) if dot.version < version => {
                let old = dot.version;
                dot.version = version;
                AddOutcome::Superseded(old)
            }
            Some(_) => AddOutcome::Stale,
            None => {
                dots.push(Dot::new(actor.clone(), version));
                AddOutcome::Fresh
            }
        };
        let became_member = outcome == AddOutcome::Fresh && dots.len() == 1;
        drop(entries);
        if became_member {
            self.notify(SetChange::Added(item.clone()));
        }
        outcome
    }

    fn remove_dot(&self, actor: &A, version: Version, item: &M) {
        let mut entries = self.entries.lock();
        let mut vanished = false;
        if let Some(dots) = entries.get_mut(item) {
            dots.retain(|dot| !(&dot.actor == actor && dot.version == version));
            if dots.is_empty() {
                entries.remove(item);
                vanished = true;
            }
        }
        drop(entries);
        if vanished {
            self.notify(SetChange::Removed(item.clone()));
        }
    }
}

/// A delta-replicated observed-remove set.
///
/// All operations take `&self` and are safe under concurrent use from many
/// threads; replication happens by shipping the returned [`Delta`]s (or the
/// output of [`deltas_since`]) to peers, which apply them with [`merge`].
///
/// [`deltas_since`]: OrSet::deltas_since
/// [`merge`]: OrSet::merge
pub struct OrSet<M: DeltaItem + Ord, A: Actor> {
    engine: OrEngine<A, M, SetStore<M, A>>,
}

impl<M: DeltaItem + Ord, A: Actor> Default for OrSet<M, A> {
    fn default() -> Self {
        OrSet::new()
    }
}

impl<M: DeltaItem + Ord, A: Actor> OrSet<M, A> {
    /// Returns a new, empty set.
    pub fn new() -> Self {
        OrSet {
            engine: OrEngine::new(SetStore::new()),
        }
    }

    /// Add a member on behalf of `actor`, returning the delta to replicate.
    ///
    /// Re-adding a present member allocates a fresh dot and supersedes the
    /// actor's previous one, which is what lets a re-add win against a
    /// removal still in flight.
    ///
    /// # Safety note
    ///
    /// `actor` must uniquely identify this writer. Two replicas inserting
    /// under the same actor identity corrupt each other's history; see
    /// [`Error::ConflictingDot`](crate::Error::ConflictingDot).
    pub fn insert(&self, member: M, actor: A) -> Result<Delta<A, M>> {
        self.engine.record(actor, member)
    }

    /// Drop a member, returning one `RemovedDot` delta per actor that had a
    /// dot on it. An empty vector means the member was not present.
    pub fn remove(&self, member: &M) -> Vec<Delta<A, M>> {
        let dots: SmallVec<[Dot<A>; 2]> = {
            let mut entries = self.engine.sink().entries.lock();
            entries.remove(member).unwrap_or_default()
        };
        if dots.is_empty() {
            return Vec::new();
        }
        self.engine.sink().notify(SetChange::Removed(member.clone()));
        dots.into_iter()
            .map(|dot| {
                self.engine.retire(&dot.actor, dot.version);
                Delta::RemovedDot {
                    actor: dot.actor,
                    version: dot.version,
                }
            })
            .collect()
    }

    /// True iff the member is currently present.
    pub fn contains(&self, member: &M) -> bool {
        self.engine.sink().entries.lock().contains_key(member)
    }

    /// The current members, in their natural order.
    pub fn values(&self) -> Vec<M> {
        self.engine.sink().entries.lock().keys().cloned().collect()
    }

    /// Number of present members.
    pub fn len(&self) -> usize {
        self.engine.sink().entries.lock().len()
    }

    /// True iff no member is present.
    pub fn is_empty(&self) -> bool {
        self.engine.sink().entries.lock().is_empty()
    }

    /// Register a callback for membership changes.
    ///
    /// Callbacks run on the thread performing the mutation and must not call
    /// back into this set; hand the change off if a reaction has to mutate.
    pub fn observe<F>(&self, observer: F)
    where
        F: Fn(&SetChange<M>) + Send + Sync + 'static,
    {
        let observers = &self.engine.sink().observers;
        let mut slot = observers.write();
        let mut next: Vec<Observer<M>> = slot.as_ref().clone();
        next.push(Arc::new(observer));
        *slot = Arc::new(next);
    }

    /// Snapshot the causal context. See [`OrEngine::timestamp`].
    pub fn timestamp(&self) -> CausalTimestamp<A> {
        self.engine.timestamp()
    }

    /// Deltas a peer at `since` is missing. See [`OrEngine::deltas_since`].
    pub fn deltas_since(
        &self,
        since: Option<&CausalTimestamp<A>>,
    ) -> impl Iterator<Item = Delta<A, M>> {
        self.engine.deltas_since(since)
    }

    /// Apply one replicated delta. See [`OrEngine::merge`].
    pub fn merge(&self, delta: Delta<A, M>) -> Result<MergeOutcome> {
        self.engine.merge(delta)
    }

    /// Apply a batch of replicated deltas. See [`OrEngine::merge_all`].
    pub fn merge_all(&self, deltas: impl IntoIterator<Item = Delta<A, M>>) -> Result<MergeOutcome> {
        self.engine.merge_all(deltas)
    }
}
