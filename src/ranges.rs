//! Range-compressed version history for a single actor.
//!
//! Where a vector clock stores one counter per actor, a delta-CRDT has to
//! remember every individual version it has observed, including versions
//! whose payload has since been removed. Storing those as a set of disjoint
//! half-open ranges keeps the common case (a contiguous history) at one
//! entry per actor while still representing arbitrary gaps.
//!
//! # Examples
//!
//! ```
//! use delta_crdts::ranges::VersionRanges;
//! let mut history = VersionRanges::new();
//! history.observe(1);
//! history.observe(2);
//! history.observe(5);
//! assert!(history.contains(2));
//! assert!(!history.contains(3));
//! // [1, 3) and [5, 6): the contiguous prefix stays a single range
//! assert_eq!(history.iter().count(), 2);
//! ```

use std::fmt::{self, Display};
use std::iter::FromIterator;

use parking_lot::RwLock;
use quickcheck::{Arbitrary, Gen};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dot::Version;

/// A half-open interval `[start, end)` of versions issued by one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    /// First version covered by the range
    pub start: Version,
    /// First version past the range
    pub end: Version,
}

impl VersionRange {
    /// Build a range covering `[start, end)`
    pub fn new(start: Version, end: Version) -> Self {
        debug_assert!(start < end, "version range must be non-empty");
        Self { start, end }
    }

    /// A range covering exactly one version
    pub fn single(version: Version) -> Self {
        Self::new(version, version + 1)
    }

    /// True iff `version` falls within the range
    pub fn contains(&self, version: Version) -> bool {
        self.start <= version && version < self.end
    }

    /// Number of versions covered
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True iff the range covers nothing
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The set of versions one actor is known to have issued, compressed into
/// sorted, disjoint, coalesced ranges.
///
/// This is the building block of a causal context: an observed version stays
/// in here forever, whether or not the mutation it named is still present.
/// The structure only ever grows, which is what makes merges idempotent and
/// late deliveries harmless.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionRanges {
    ranges: Vec<VersionRange>,
}

impl VersionRanges {
    /// Returns a new, empty `VersionRanges` instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff no version was ever observed.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterator over the stored ranges, in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = &VersionRange> {
        self.ranges.iter()
    }

    /// The stored ranges as a slice.
    pub fn as_slice(&self) -> &[VersionRange] {
        &self.ranges
    }

    /// Total number of versions covered.
    pub fn version_count(&self) -> u64 {
        self.ranges.iter().map(VersionRange::len).sum()
    }

    /// The next version this actor has not yet issued: the end of the last
    /// range, or 1 for a fresh history.
    ///
    /// This only peeks. The caller must follow up with [`observe`] once the
    /// version has actually been used, otherwise the same version is handed
    /// out again.
    ///
    /// [`observe`]: VersionRanges::observe
    pub fn next(&self) -> Version {
        self.ranges.last().map(|r| r.end).unwrap_or(1)
    }

    /// True iff `version` was already observed.
    pub fn contains(&self, version: Version) -> bool {
        self.ranges
            .binary_search_by(|r| {
                use std::cmp::Ordering;
                if r.end <= version {
                    Ordering::Less
                } else if r.start > version {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Record a single observed version. Returns whether the history changed,
    /// i.e. `false` when the version was already known.
    ///
    /// ```
    /// use delta_crdts::ranges::VersionRanges;
    /// let mut h = VersionRanges::new();
    /// assert!(h.observe(4));
    /// assert!(!h.observe(4)); // duplicate observations are no-ops
    /// ```
    pub fn observe(&mut self, version: Version) -> bool {
        self.observe_range(VersionRange::single(version))
    }

    /// Record a whole range of observed versions, coalescing with any ranges
    /// it touches or bridges. Returns whether the history changed.
    ///
    /// ```
    /// use delta_crdts::ranges::{VersionRange, VersionRanges};
    /// let mut h = VersionRanges::new();
    /// h.observe_range(VersionRange::new(1, 3));
    /// h.observe_range(VersionRange::new(5, 7));
    /// // bridging the gap unions all three into one range
    /// h.observe_range(VersionRange::new(3, 5));
    /// assert_eq!(h.as_slice(), &[VersionRange::new(1, 7)]);
    /// ```
    pub fn observe_range(&mut self, range: VersionRange) -> bool {
        if range.is_empty() {
            return false;
        }

        // First stored range that touches `range`, counting adjacency so
        // [1, 3) coalesces with [3, 5).
        let insert_at = self
            .ranges
            .iter()
            .position(|r| r.end >= range.start)
            .unwrap_or_else(|| self.ranges.len());

        let mut start = range.start;
        let mut end = range.end;
        let mut merged_until = insert_at;
        while merged_until < self.ranges.len() && self.ranges[merged_until].start <= end {
            let existing = self.ranges[merged_until];
            if existing.start <= range.start && range.end <= existing.end {
                return false;
            }
            start = start.min(existing.start);
            end = end.max(existing.end);
            merged_until += 1;
        }

        if merged_until == insert_at {
            self.ranges.insert(insert_at, VersionRange::new(start, end));
        } else {
            self.ranges[insert_at] = VersionRange::new(start, end);
            self.ranges.drain(insert_at + 1..merged_until);
        }
        true
    }

    /// Union another history into this one. Returns whether anything new was
    /// learned.
    pub fn union(&mut self, other: &VersionRanges) -> bool {
        let mut changed = false;
        for range in other.iter() {
            changed |= self.observe_range(*range);
        }
        changed
    }

    /// The versions known to both histories.
    pub fn intersect(&self, other: &VersionRanges) -> VersionRanges {
        let (a, b) = (&self.ranges, &other.ranges);
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            let start = a[i].start.max(b[j].start);
            let end = a[i].end.min(b[j].end);
            if start < end {
                out.push(VersionRange::new(start, end));
            }
            if a[i].end <= b[j].end {
                i += 1;
            } else {
                j += 1;
            }
        }
        VersionRanges { ranges: out }
    }
}

impl Display for VersionRanges {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", range)?;
        }
        write!(f, "}}")
    }
}

impl From<VersionRange> for VersionRanges {
    fn from(range: VersionRange) -> Self {
        let mut ranges = VersionRanges::new();
        ranges.observe_range(range);
        ranges
    }
}

impl FromIterator<VersionRange> for VersionRanges {
    fn from_iter<I: IntoIterator<Item = VersionRange>>(iter: I) -> Self {
        let mut ranges = VersionRanges::new();
        for range in iter {
            ranges.observe_range(range);
        }
        ranges
    }
}

/// A `VersionRanges` that can be read and written from multiple threads.
///
/// One of these exists per actor inside an engine, so contention is scoped to
/// a single actor's stream rather than the whole CRDT. Reads (containment,
/// snapshots, next-version peeks) take a shared lock; observations take the
/// exclusive lock briefly.
#[derive(Debug, Default)]
pub struct SharedVersionRanges {
    inner: RwLock<VersionRanges>,
}

impl SharedVersionRanges {
    /// Returns a new, empty shared history.
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`VersionRanges::next`].
    pub fn next(&self) -> Version {
        self.inner.read().next()
    }

    /// See [`VersionRanges::contains`].
    pub fn contains(&self, version: Version) -> bool {
        self.inner.read().contains(version)
    }

    /// See [`VersionRanges::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// See [`VersionRanges::observe`].
    pub fn observe(&self, version: Version) -> bool {
        self.inner.write().observe(version)
    }

    /// See [`VersionRanges::observe_range`].
    pub fn observe_range(&self, range: VersionRange) -> bool {
        self.inner.write().observe_range(range)
    }

    /// See [`VersionRanges::union`].
    pub fn union(&self, other: &VersionRanges) -> bool {
        self.inner.write().union(other)
    }

    /// An owned copy of the current history.
    pub fn snapshot(&self) -> VersionRanges {
        self.inner.read().clone()
    }
}

impl Arbitrary for VersionRange {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        let start = g.gen_range(1, 40);
        VersionRange::new(start, start + g.gen_range(1, 8))
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let mut smaller = Vec::new();
        if self.len() > 1 {
            smaller.push(VersionRange::new(self.start, self.end - 1));
        }
        Box::new(smaller.into_iter())
    }
}

impl Arbitrary for VersionRanges {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        let mut ranges = VersionRanges::new();
        for _ in 0..g.gen_range(0, 7) {
            ranges.observe_range(VersionRange::arbitrary(g));
        }
        ranges
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let mut smaller = Vec::new();
        for i in 0..self.ranges.len() {
            let mut clone = self.clone();
            clone.ranges.remove(i);
            smaller.push(clone);
        }
        Box::new(smaller.into_iter())
    }
}
