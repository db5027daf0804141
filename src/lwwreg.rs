use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::traits::DeltaValue;

/// `LwwReg` is a last-write-wins register expressed as a delta value, so it
/// can live inside an [`OrMap`](crate::OrMap).
///
/// Every write carries a stamp; the highest (stamp, value) pair wins, with
/// the value as tiebreaker so replicas agree even on stamp collisions. It is
/// the responsibility of the user to guarantee that the source of the stamp
/// is monotonic. Don't use wall-clock timestamps unless you are comfortable
/// with divergence.
///
/// ```
/// use delta_crdts::lwwreg::{LwwReg, Write};
/// use delta_crdts::DeltaValue;
///
/// let mut reg = LwwReg::default();
/// reg.apply(&Write { stamp: 2, value: "b".to_string() });
/// reg.apply(&Write { stamp: 1, value: "a".to_string() }); // stale, ignored
/// assert_eq!(reg.read(), Some(&"b".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = ""))]
pub struct LwwReg<T: RegVal> {
    state: Option<Write<T>>,
}

impl<T: RegVal> Default for LwwReg<T> {
    fn default() -> Self {
        LwwReg { state: None }
    }
}

/// Trait alias for values an [`LwwReg`] may hold.
pub trait RegVal:
    Clone + PartialEq + Eq + Ord + Debug + Send + Serialize + DeserializeOwned
{
}
impl<T: Clone + PartialEq + Eq + Ord + Debug + Send + Serialize + DeserializeOwned> RegVal for T {}

/// One write to an [`LwwReg`]: the delta type it replicates through.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(bound(deserialize = ""))]
pub struct Write<T: RegVal> {
    /// Monotonic marker deciding which write wins.
    pub stamp: u64,
    /// The written value.
    pub value: T,
}

impl<T: RegVal> LwwReg<T> {
    /// The winning value, if any write was ever applied.
    pub fn read(&self) -> Option<&T> {
        self.state.as_ref().map(|write| &write.value)
    }

    /// The winning write's stamp, if any.
    pub fn stamp(&self) -> Option<u64> {
        self.state.as_ref().map(|write| write.stamp)
    }
}

impl<T: RegVal> DeltaValue for LwwReg<T> {
    type Delta = Write<T>;

    fn apply(&mut self, delta: &Self::Delta) {
        let dominated = match &self.state {
            Some(current) => current >= delta,
            None => false,
        };
        if !dominated {
            self.state = Some(delta.clone());
        }
    }

    fn unapply(&mut self, delta: &Self::Delta) -> bool {
        match &self.state {
            // the delta lost to some other write; it left no trace
            Some(current) if current != delta => true,
            // the delta is the current winner and we do not know the
            // runner-up, or the register is empty: rebuild
            _ => false,
        }
    }
}
