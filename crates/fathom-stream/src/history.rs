//! Frozen facet snapshots of completed turns, keyed by turn index.

use std::collections::BTreeMap;

use fathom_core::types::FacetSnapshot;

/// Map from turn index to the snapshot captured at freeze time.
///
/// A later `put` for the same index replaces the earlier one. Completed turns
/// stay fixed because the accumulator freezes exactly once per turn.
#[derive(Debug, Clone, Default)]
pub struct TurnHistory {
    entries: BTreeMap<usize, FacetSnapshot>,
}

impl TurnHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, turn: usize) -> Option<&FacetSnapshot> {
        self.entries.get(&turn)
    }

    /// Store `snapshot` for `turn`, returning the snapshot it replaced.
    pub fn put(&mut self, turn: usize, snapshot: FacetSnapshot) -> Option<FacetSnapshot> {
        let previous = self.entries.insert(turn, snapshot);
        if previous.is_some() {
            tracing::debug!(turn, "Replaced history entry");
        }
        previous
    }

    pub fn contains(&self, turn: usize) -> bool {
        self.entries.contains_key(&turn)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending turn order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &FacetSnapshot)> {
        self.entries.iter().map(|(turn, snapshot)| (*turn, snapshot))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
