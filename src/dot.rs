use std::cmp::Ordering;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};

use quickcheck::{Arbitrary, Gen};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A version is a per-actor, strictly increasing counter. The first version
/// an actor ever issues is 1; versions are never reused, even after the
/// mutation they identify has been removed.
pub type Version = u64;

/// Common Actor type. Actors are unique identifiers for every `thing`
/// mutating a CRDT. CRDT's will need to expose this Actor type to the user.
pub trait Actor: Ord + Clone + Hash + Send + Serialize + DeserializeOwned + Debug {}
impl<A: Ord + Clone + Hash + Send + Serialize + DeserializeOwned + Debug> Actor for A {}

/// Dot is a version marker for a single actor.
///
/// A dot names exactly one mutation event; no two mutations anywhere in the
/// system ever share a dot, which is what lets replicas deduplicate deltas
/// that arrive late, twice, or out of order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dot<A> {
    /// The actor that issued this dot
    pub actor: A,
    /// The version of the actor's stream this dot marks
    pub version: Version,
}

impl<A> Dot<A> {
    /// Build a Dot from an actor and version
    pub fn new(actor: A, version: Version) -> Self {
        Self { actor, version }
    }
}

impl<A: Copy> Copy for Dot<A> {}

impl<A: PartialEq> PartialEq for Dot<A> {
    fn eq(&self, other: &Self) -> bool {
        self.actor == other.actor && self.version == other.version
    }
}

impl<A: Eq> Eq for Dot<A> {}

impl<A: Hash> Hash for Dot<A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.actor.hash(state);
        self.version.hash(state);
    }
}

impl<A: PartialOrd> PartialOrd for Dot<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.actor == other.actor {
            self.version.partial_cmp(&other.version)
        } else {
            None
        }
    }
}

impl<A: Display> Display for Dot<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.actor, self.version)
    }
}

impl<A: Arbitrary + Clone> Arbitrary for Dot<A> {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        Dot {
            actor: A::arbitrary(g),
            version: u64::arbitrary(g) % 50 + 1,
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let mut shrunk_dots = Vec::new();
        if self.version > 1 {
            shrunk_dots.push(Self::new(self.actor.clone(), self.version - 1));
        }
        Box::new(shrunk_dots.into_iter())
    }
}
