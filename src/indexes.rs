//! Collection index arithmetic.
//!
//! Satellites number their collections with a 16-bit counter that wraps at
//! 2^16, so every ordering and range test here works in the modular ring
//! rather than on plain integers.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// Number of distinct collection indexes.
pub const INDEX_SPACE: u32 = 1 << 16;

const_assert_eq!(INDEX_SPACE, u16::MAX as u32 + 1);

/// Steps needed to walk forward from `from` to `to`.
#[inline]
pub fn distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// `true` when `a` comes strictly before `b` in the modular ring.
///
/// Defined via the sign of the wrapped difference, so it holds for any pair
/// less than half the index space apart.
#[inline]
pub fn is_before(a: u16, b: u16) -> bool {
    (b.wrapping_sub(a) as i16) > 0
}

#[inline]
pub fn successor(index: u16) -> u16 {
    index.wrapping_add(1)
}

/// Half-open range `[start_index, end_index)` of collections resident on a
/// satellite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionIndexes {
    pub start_index: u16,
    pub end_index: u16,
}

impl CollectionIndexes {
    pub fn new(start_index: u16, end_index: u16) -> Self {
        Self {
            start_index,
            end_index,
        }
    }

    pub fn empty_at(index: u16) -> Self {
        Self::new(index, index)
    }

    pub fn len(&self) -> u16 {
        distance(self.start_index, self.end_index)
    }

    pub fn is_empty(&self) -> bool {
        self.start_index == self.end_index
    }

    /// `true` when `index` is resident, i.e. inside `[start, end)`.
    pub fn contains(&self, index: u16) -> bool {
        distance(self.start_index, index) < self.len()
    }

    /// `true` when `index` is a valid transfer start point, i.e. inside
    /// `[start, end]`. `end` itself means "transfer nothing".
    pub fn admits_start(&self, index: u16) -> bool {
        distance(self.start_index, index) <= self.len()
    }

    /// Sub-range `[index, end)`. Callers must check [`admits_start`] first.
    ///
    /// [`admits_start`]: CollectionIndexes::admits_start
    pub fn suffix_from(&self, index: u16) -> Self {
        debug_assert!(self.admits_start(index));
        Self::new(index, self.end_index)
    }

    /// Indexes in ascending modular order.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        let start = self.start_index;
        (0..u32::from(self.len())).map(move |step| start.wrapping_add(step as u16))
    }
}

impl core::fmt::Display for CollectionIndexes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}, {})", self.start_index, self.end_index)
    }
}
