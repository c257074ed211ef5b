//! Sparse sets of inclusive integer ranges
//!
//! An [`ExtentMap`] tracks which sector addresses have already been captured.
//! Extents are always kept disjoint, non-adjacent and ordered by their start,
//! so any two ranges that could be coalesced are merged on insertion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Address types an [`ExtentMap`] can be keyed by
pub trait ExtentIndex: Copy + Ord + Debug {
    const ZERO: Self;
    const MAX: Self;

    fn checked_add(self, rhs: Self) -> Option<Self>;
    fn checked_sub(self, rhs: Self) -> Option<Self>;
    fn one() -> Self;
    fn to_u64(self) -> u64;

    fn succ(self) -> Option<Self> {
        self.checked_add(Self::one())
    }

    fn pred(self) -> Option<Self> {
        self.checked_sub(Self::one())
    }
}

macro_rules! impl_extent_index {
    ($($t:ty),*) => {
        $(
            impl ExtentIndex for $t {
                const ZERO: Self = 0;
                const MAX: Self = <$t>::MAX;

                fn checked_add(self, rhs: Self) -> Option<Self> {
                    <$t>::checked_add(self, rhs)
                }

                fn checked_sub(self, rhs: Self) -> Option<Self> {
                    <$t>::checked_sub(self, rhs)
                }

                fn one() -> Self {
                    1
                }

                fn to_u64(self) -> u64 {
                    self as u64
                }
            }
        )*
    };
}

impl_extent_index!(u32, u64);

/// Inclusive range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent<T> {
    pub start: T,
    pub end: T,
}

impl<T: ExtentIndex> Extent<T> {
    pub fn new(start: T, end: T) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, value: T) -> bool {
        self.start <= value && value <= self.end
    }

    /// `start > end`, as found in damaged resume documents
    pub fn is_inverted(&self) -> bool {
        self.start > self.end
    }

    /// Number of values covered by this extent, saturating at `u64::MAX`.
    /// Inverted extents cover nothing.
    pub fn span(&self) -> u64 {
        if self.is_inverted() {
            return 0;
        }
        (self.end.to_u64() - self.start.to_u64()).saturating_add(1)
    }
}

impl<T> From<(T, T)> for Extent<T> {
    fn from((start, end): (T, T)) -> Self {
        Self { start, end }
    }
}

/// Ordered, coalescing set of extents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentMap<T: ExtentIndex> {
    // start -> end
    ranges: BTreeMap<T, T>,
}

impl<T: ExtentIndex> Default for ExtentMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ExtentIndex> ExtentMap<T> {
    pub fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    /// Build a map from an unordered list of extents.
    ///
    /// Overlapping or adjacent input extents are merged. Inverted extents
    /// (`start > end`) cover nothing and are ignored.
    pub fn from_extents<I>(extents: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Extent<T>>,
    {
        let mut map = Self::new();
        for extent in extents {
            let extent = extent.into();
            if extent.is_inverted() {
                tracing::warn!(
                    "Ignoring inverted extent {:?}-{:?}",
                    extent.start,
                    extent.end
                );
                continue;
            }
            map.add_range(extent.start, extent.end);
        }
        map
    }

    /// Add a single value. Returns `false` if it was already covered.
    pub fn add(&mut self, value: T) -> bool {
        if self.contains(value) {
            return false;
        }

        let left = value.pred().and_then(|prev| {
            self.ranges
                .range(..value)
                .next_back()
                .filter(|&(_, &end)| end == prev)
                .map(|(&start, _)| start)
        });
        let right = value
            .succ()
            .and_then(|next| self.ranges.get(&next).map(|&end| (next, end)));

        match (left, right) {
            (Some(left_start), Some((right_start, right_end))) => {
                self.ranges.remove(&right_start);
                self.ranges.insert(left_start, right_end);
            }
            (Some(left_start), None) => {
                self.ranges.insert(left_start, value);
            }
            (None, Some((right_start, right_end))) => {
                self.ranges.remove(&right_start);
                self.ranges.insert(value, right_end);
            }
            (None, None) => {
                self.ranges.insert(value, value);
            }
        }
        true
    }

    /// Add every value in `[start, end]`. An inverted range adds nothing.
    pub fn add_range(&mut self, start: T, end: T) {
        if start > end {
            return;
        }

        let mut merged_start = start;
        let mut merged_end = end;

        // Every extent starting at or before end + 1 is a merge candidate;
        // walk them backwards until one ends before start - 1.
        let candidates: Vec<(T, T)> = match end.succ() {
            Some(limit) => self.ranges.range(..=limit),
            None => self.ranges.range(..),
        }
        .rev()
        .take_while(|&(_, &e)| e >= start || e.succ() == Some(start))
        .map(|(&s, &e)| (s, e))
        .collect();

        for (s, e) in candidates {
            self.ranges.remove(&s);
            merged_start = merged_start.min(s);
            merged_end = merged_end.max(e);
        }

        self.ranges.insert(merged_start, merged_end);
    }

    /// Add `count` consecutive values starting at `start`.
    ///
    /// A run that would pass the top of the address space is clamped to it.
    pub fn add_run(&mut self, start: T, count: T) {
        if count == T::ZERO {
            return;
        }
        let end = count
            .pred()
            .and_then(|extra| start.checked_add(extra))
            .unwrap_or(T::MAX);
        self.add_range(start, end);
    }

    /// Remove a single value. Returns whether anything was removed.
    pub fn remove(&mut self, value: T) -> bool {
        let Some(extent) = self.extent_containing(value) else {
            return false;
        };

        self.ranges.remove(&extent.start);

        if let Some(before) = value.pred().filter(|&b| b >= extent.start) {
            self.ranges.insert(extent.start, before);
        }
        if let Some(after) = value.succ().filter(|&a| a <= extent.end) {
            self.ranges.insert(after, extent.end);
        }
        true
    }

    pub fn contains(&self, value: T) -> bool {
        self.extent_containing(value).is_some()
    }

    /// The extent covering `value`, if any
    pub fn extent_containing(&self, value: T) -> Option<Extent<T>> {
        self.ranges
            .range(..=value)
            .next_back()
            .filter(|&(_, &end)| value <= end)
            .map(|(&start, &end)| Extent::new(start, end))
    }

    /// Whether every value of `[start, end]` is covered
    pub fn contains_range(&self, start: T, end: T) -> bool {
        if start > end {
            return true;
        }
        self.extent_containing(start)
            .is_some_and(|extent| extent.end >= end)
    }

    /// Smallest value at or after `from` that is not covered
    pub fn next_uncovered(&self, from: T) -> Option<T> {
        match self.extent_containing(from) {
            Some(extent) => extent.end.succ(),
            None => Some(from),
        }
    }

    /// Start of the first extent beginning at or after `from`
    pub fn next_extent_start(&self, from: T) -> Option<T> {
        self.ranges.range(from..).next().map(|(&start, _)| start)
    }

    /// Number of extents (not covered values)
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of covered values
    pub fn covered(&self) -> u64 {
        self.iter()
            .fold(0u64, |total, extent| total.saturating_add(extent.span()))
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = Extent<T>> + '_ {
        self.ranges
            .iter()
            .map(|(&start, &end)| Extent::new(start, end))
    }

    /// Ordered snapshot of the extents, suitable for persisting
    pub fn to_vec(&self) -> Vec<Extent<T>> {
        self.iter().collect()
    }
}
