use std::collections::BTreeSet;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::traits::DeltaValue;

/// A `GrowSet` is a grow-only set expressed as a delta value, usable inside
/// an [`OrMap`](crate::OrMap).
///
/// Its delta is simply the inserted element. Insertions cannot be reversed
/// in isolation: once an element is present there is no local way to prove
/// it was not also inserted by someone else, so `unapply` of a present
/// element always reports failure and lets the map rebuild.
///
/// # Examples
///
/// ```
/// use delta_crdts::gset::GrowSet;
/// use delta_crdts::DeltaValue;
///
/// let mut a = GrowSet::new();
/// a.apply(&1);
/// a.apply(&2);
/// a.apply(&1);
/// assert!(a.contains(&1));
/// assert_eq!(a.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = ""))]
pub struct GrowSet<T: GrowVal> {
    value: BTreeSet<T>,
}

impl<T: GrowVal> Default for GrowSet<T> {
    fn default() -> Self {
        GrowSet {
            value: BTreeSet::new(),
        }
    }
}

/// Trait alias for elements a [`GrowSet`] may hold.
pub trait GrowVal: Ord + Clone + PartialEq + Debug + Send + Serialize + DeserializeOwned {}
impl<T: Ord + Clone + PartialEq + Debug + Send + Serialize + DeserializeOwned> GrowVal for T {}

impl<T: GrowVal> GrowSet<T> {
    /// Instantiates an empty `GrowSet`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the `GrowSet` contains the element.
    pub fn contains(&self, element: &T) -> bool {
        self.value.contains(element)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// True iff the set is empty.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Iterate the elements in order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.value.iter()
    }
}

impl<T: GrowVal> DeltaValue for GrowSet<T> {
    type Delta = T;

    fn apply(&mut self, delta: &Self::Delta) {
        self.value.insert(delta.clone());
    }

    fn unapply(&mut self, delta: &Self::Delta) -> bool {
        // absent means the insert left no trace here; present is
        // irreversible without global knowledge
        !self.value.contains(delta)
    }
}
