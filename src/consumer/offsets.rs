//! Per-partition offset bookkeeping.

use std::collections::BTreeMap;

use crate::types::TopicPartition;

/// Committed offset and consumed position of one assigned partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffsetState {
    /// Last offset acknowledged by the group coordinator.
    pub committed: Option<i64>,
    /// Next offset `poll` will return. `None` until initialized from the
    /// committed offset or the reset policy.
    pub position: Option<i64>,
}

/// Offsets of the currently assigned partitions.
#[derive(Debug, Default)]
pub(crate) struct OffsetStore {
    partitions: BTreeMap<TopicPartition, OffsetState>,
}

impl OffsetStore {
    /// Replace the assignment. Partitions kept across the change keep
    /// their state.
    pub(crate) fn assign(&mut self, partitions: impl IntoIterator<Item = TopicPartition>) {
        let mut next = BTreeMap::new();
        for tp in partitions {
            let state = self.partitions.get(&tp).copied().unwrap_or_default();
            next.insert(tp, state);
        }
        self.partitions = next;
    }

    pub(crate) fn clear(&mut self) {
        self.partitions.clear();
    }

    pub(crate) fn is_assigned(&self, tp: &TopicPartition) -> bool {
        self.partitions.contains_key(tp)
    }

    pub(crate) fn assignment(&self) -> Vec<TopicPartition> {
        self.partitions.keys().cloned().collect()
    }

    pub(crate) fn get(&self, tp: &TopicPartition) -> Option<OffsetState> {
        self.partitions.get(tp).copied()
    }

    /// Partitions that still need a starting position.
    pub(crate) fn uninitialized(&self) -> Vec<TopicPartition> {
        self.partitions
            .iter()
            .filter(|(_, s)| s.position.is_none())
            .map(|(tp, _)| tp.clone())
            .collect()
    }

    /// Partitions with a position, in fetch order.
    pub(crate) fn fetchable(&self) -> Vec<(TopicPartition, i64)> {
        self.partitions
            .iter()
            .filter_map(|(tp, s)| s.position.map(|p| (tp.clone(), p)))
            .collect()
    }

    pub(crate) fn set_position(&mut self, tp: &TopicPartition, position: i64) -> bool {
        match self.partitions.get_mut(tp) {
            Some(state) => {
                state.position = Some(position);
                true
            }
            None => false,
        }
    }

    /// Drop the position so the partition is initialized again.
    pub(crate) fn reset_position(&mut self, tp: &TopicPartition) {
        if let Some(state) = self.partitions.get_mut(tp) {
            state.position = None;
        }
    }

    /// Record offsets the coordinator acknowledged. Unassigned partitions
    /// are ignored.
    pub(crate) fn mark_committed(&mut self, offsets: &BTreeMap<TopicPartition, i64>) {
        for (tp, offset) in offsets {
            if let Some(state) = self.partitions.get_mut(tp) {
                state.committed = Some(*offset);
            }
        }
    }

    pub(crate) fn set_committed(&mut self, tp: &TopicPartition, committed: Option<i64>) {
        if let Some(state) = self.partitions.get_mut(tp) {
            state.committed = committed;
        }
    }

    /// Positions that moved past the committed offset.
    pub(crate) fn uncommitted(&self) -> BTreeMap<TopicPartition, i64> {
        self.partitions
            .iter()
            .filter_map(|(tp, s)| match (s.position, s.committed) {
                (Some(position), Some(committed)) if position == committed => None,
                (Some(position), _) => Some((tp.clone(), position)),
                (None, _) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(p: i32) -> TopicPartition {
        TopicPartition::new("t", p)
    }

    #[test]
    fn test_assign_keeps_state_of_retained_partitions() {
        let mut store = OffsetStore::default();
        store.assign([tp(0), tp(1)]);
        store.set_position(&tp(0), 10);
        store.set_position(&tp(1), 20);

        store.assign([tp(1), tp(2)]);
        assert!(!store.is_assigned(&tp(0)));
        assert_eq!(store.get(&tp(1)).unwrap().position, Some(20));
        assert_eq!(store.uninitialized(), vec![tp(2)]);
    }

    #[test]
    fn test_uncommitted_and_mark_committed() {
        let mut store = OffsetStore::default();
        store.assign([tp(0), tp(1), tp(2)]);
        store.set_position(&tp(0), 5);
        store.set_position(&tp(1), 7);
        store.set_committed(&tp(1), Some(7));

        let pending = store.uncommitted();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[&tp(0)], 5);

        store.mark_committed(&pending);
        assert!(store.uncommitted().is_empty());
        assert_eq!(store.get(&tp(0)).unwrap().committed, Some(5));
    }

    #[test]
    fn test_set_position_requires_assignment() {
        let mut store = OffsetStore::default();
        assert!(!store.set_position(&tp(0), 1));
        store.assign([tp(0)]);
        assert!(store.set_position(&tp(0), 1));
        store.reset_position(&tp(0));
        assert_eq!(store.fetchable(), vec![]);
    }
}
