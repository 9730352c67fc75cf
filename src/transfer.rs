//! Per-satellite transfer bookkeeping.
//!
//! A [`TransferSession`] walks its pending indexes strictly upward (modulo
//! 2^16). Indexes leave the pending set only once confirmed; everything
//! else survives into the satellite's backlog for the next connection.

use crate::indexes::{distance, is_before, CollectionIndexes};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferState {
    #[default]
    Idle,
    /// Connected, waiting for a state report to evaluate permissions.
    AwaitingPermission,
    Transferring,
}

/// Ordered set of collection indexes, ascending in modular order.
///
/// Order is the forward offset from the first index, so a set may span up
/// to the whole index space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingCollections {
    indexes: VecDeque<u16>,
}

impl PendingCollections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_range(range: CollectionIndexes) -> Self {
        Self {
            indexes: range.iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn contains(&self, index: u16) -> bool {
        self.indexes.contains(&index)
    }

    pub fn first(&self) -> Option<u16> {
        self.indexes.front().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.indexes.iter().copied()
    }

    /// Inserts `index` at its modular position. Duplicates are ignored. An
    /// index outside the current span goes to whichever end keeps the span
    /// shorter.
    pub fn insert(&mut self, index: u16) {
        let (Some(&first), Some(&last)) = (self.indexes.front(), self.indexes.back()) else {
            self.indexes.push_back(index);
            return;
        };
        let offset = distance(first, index);
        let span = distance(first, last);
        if offset > span {
            if distance(index, last) < offset {
                self.indexes.push_front(index);
            } else {
                self.indexes.push_back(index);
            }
            return;
        }
        match self
            .indexes
            .iter()
            .position(|&existing| distance(first, existing) >= offset)
        {
            Some(position) if self.indexes[position] == index => {}
            Some(position) => self.indexes.insert(position, index),
            None => self.indexes.push_back(index),
        }
    }

    pub fn extend_range(&mut self, range: CollectionIndexes) {
        for index in range.iter() {
            self.insert(index);
        }
    }

    pub fn remove(&mut self, index: u16) -> bool {
        match self.indexes.iter().position(|&existing| existing == index) {
            Some(position) => {
                self.indexes.remove(position);
                true
            }
            None => false,
        }
    }

    /// First pending index past `cursor`, measuring forward from `origin`.
    /// `origin` must not come after any pending index.
    pub fn next_after(&self, origin: u16, cursor: Option<u16>) -> Option<u16> {
        match cursor {
            None => self.first(),
            Some(cursor) => {
                let passed = distance(origin, cursor);
                self.iter().find(|&index| distance(origin, index) > passed)
            }
        }
    }
}

/// Part of `range` not offered by an earlier session. `frontier` is the end
/// of the previous session's range, or `None` before the first session.
pub fn unseen_indexes(range: CollectionIndexes, frontier: Option<u16>) -> CollectionIndexes {
    let Some(frontier) = frontier else {
        return range;
    };
    if range.admits_start(frontier) {
        range.suffix_from(frontier)
    } else if is_before(frontier, range.start_index) {
        range
    } else {
        CollectionIndexes::empty_at(range.end_index)
    }
}

/// Pending set for a new session: the carried `backlog` plus `unseen` from
/// `start` onward. `start` must be admitted by `unseen`.
pub fn plan_pending(mut backlog: PendingCollections, unseen: CollectionIndexes, start: u16) -> PendingCollections {
    backlog.extend_range(unseen.suffix_from(start));
    backlog
}

/// At most one per satellite; lives from the start of a transfer pass until
/// the pass ends or the connection drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    range: CollectionIndexes,
    pending: PendingCollections,
    /// First pending index when the session was built; the walk measures
    /// progress from here.
    origin: u16,
    cursor: Option<u16>,
    generation: u64,
    failed: usize,
}

impl TransferSession {
    pub fn new(range: CollectionIndexes, pending: PendingCollections, generation: u64) -> Self {
        let origin = pending.first().unwrap_or(range.start_index);
        Self {
            range,
            pending,
            origin,
            cursor: None,
            generation,
            failed: 0,
        }
    }

    pub fn range(&self) -> CollectionIndexes {
        self.range
    }

    pub fn pending(&self) -> &PendingCollections {
        &self.pending
    }

    pub fn cursor(&self) -> Option<u16> {
        self.cursor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn failed_count(&self) -> usize {
        self.failed
    }

    /// Advances the cursor to the next index to request.
    pub fn advance(&mut self) -> Option<u16> {
        let next = self.pending.next_after(self.origin, self.cursor)?;
        self.cursor = Some(next);
        Some(next)
    }

    pub fn confirm(&mut self, index: u16) {
        self.pending.remove(index);
    }

    /// Leaves `index` pending for a later connection.
    pub fn mark_failed(&mut self, _index: u16) {
        self.failed += 1;
    }

    pub fn into_pending(self) -> PendingCollections {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(pending: &PendingCollections) -> Vec<u16> {
        pending.iter().collect()
    }

    #[test]
    fn test_insert_keeps_modular_order() {
        let mut pending = PendingCollections::new();
        pending.insert(65_535);
        pending.insert(1);
        pending.insert(0);
        pending.insert(65_534);
        pending.insert(1);
        assert_eq!(collect(&pending), vec![65_534, 65_535, 0, 1]);
    }

    #[test]
    fn test_fresh_plan_starts_at_policy_choice() {
        let range = CollectionIndexes::new(5, 10);
        let unseen = unseen_indexes(range, None);
        assert_eq!(unseen, range);
        assert_eq!(collect(&plan_pending(PendingCollections::new(), unseen, 7)), vec![7, 8, 9]);
        assert!(plan_pending(PendingCollections::new(), unseen, 10).is_empty());
    }

    #[test]
    fn test_resume_plan_merges_backlog_with_new_indexes() {
        let mut backlog = PendingCollections::new();
        backlog.insert(7);
        backlog.insert(9);

        let same = unseen_indexes(CollectionIndexes::new(5, 10), Some(10));
        assert!(same.is_empty());
        assert_eq!(collect(&plan_pending(backlog.clone(), same, same.start_index)), vec![7, 9]);

        let grown = unseen_indexes(CollectionIndexes::new(5, 13), Some(10));
        assert_eq!(grown, CollectionIndexes::new(10, 13));
        assert_eq!(collect(&plan_pending(backlog, grown, 10)), vec![7, 9, 10, 11, 12]);
    }

    #[test]
    fn test_unseen_after_device_dropped_old_range() {
        assert_eq!(
            unseen_indexes(CollectionIndexes::new(20, 23), Some(10)),
            CollectionIndexes::new(20, 23)
        );
        assert!(unseen_indexes(CollectionIndexes::new(2, 6), Some(10)).is_empty());
    }

    #[test]
    fn test_unseen_across_wraparound() {
        let unseen = unseen_indexes(CollectionIndexes::new(65_530, 4), Some(65_534));
        assert_eq!(unseen.iter().collect::<Vec<_>>(), vec![65_534, 65_535, 0, 1, 2, 3]);
    }

    #[test]
    fn test_session_walks_upward_and_keeps_failures() {
        let range = CollectionIndexes::new(65_534, 2);
        let mut session = TransferSession::new(range, PendingCollections::from_range(range), 0);

        assert_eq!(session.advance(), Some(65_534));
        session.confirm(65_534);
        assert_eq!(session.advance(), Some(65_535));
        session.mark_failed(65_535);
        assert_eq!(session.advance(), Some(0));
        session.confirm(0);
        assert_eq!(session.advance(), Some(1));
        session.confirm(1);
        assert_eq!(session.advance(), None);

        assert_eq!(session.failed_count(), 1);
        assert_eq!(collect(&session.into_pending()), vec![65_535]);
    }

    #[test]
    fn test_session_over_more_than_half_the_index_space() {
        let range = CollectionIndexes::new(60_000, 40_000);
        assert_eq!(range.len(), 45_536);
        let mut session = TransferSession::new(range, PendingCollections::from_range(range), 0);

        let mut walked = Vec::new();
        while let Some(index) = session.advance() {
            walked.push(index);
            if index == 60_005 {
                session.mark_failed(index);
            } else {
                session.confirm(index);
            }
        }

        assert_eq!(walked, range.iter().collect::<Vec<_>>());
        assert_eq!(collect(&session.into_pending()), vec![60_005]);
    }

    #[test]
    fn test_large_backlog_extends_in_order() {
        let mut backlog = PendingCollections::new();
        backlog.insert(5);
        let pending = plan_pending(backlog, CollectionIndexes::new(10, 40_010), 10);

        assert_eq!(pending.len(), 40_001);
        assert_eq!(pending.first(), Some(5));
        assert_eq!(pending.iter().last(), Some(40_009));
        assert_eq!(pending.next_after(5, Some(32_780)), Some(32_781));
    }
}
