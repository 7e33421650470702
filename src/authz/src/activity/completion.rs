//! Gap-free floor plus out-of-order applied ids

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use treeacl_core::types::ActivityId;

/// Tracks which activities have been applied.
///
/// Every id `<= floor` is applied. Ids above the floor that completed out of
/// order are kept in `applied_above`; the floor advances as soon as the id
/// right above it completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionState {
    floor: ActivityId,
    applied_above: BTreeSet<ActivityId>,
}

impl CompletionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State where everything up to `floor` is applied
    pub fn with_floor(floor: ActivityId) -> Self {
        Self {
            floor,
            applied_above: BTreeSet::new(),
        }
    }

    /// State after a full reload: everything up to `last` is reflected in
    /// the loaded data except the unprocessed ids, which still have to run.
    pub fn recovered(last: ActivityId, unprocessed: &[ActivityId]) -> Self {
        let pending: BTreeSet<ActivityId> = unprocessed.iter().copied().filter(|id| *id <= last).collect();
        let Some(&first) = pending.iter().next() else {
            return Self::with_floor(last);
        };
        Self {
            floor: first.saturating_sub(1),
            applied_above: (first..=last).filter(|id| !pending.contains(id)).collect(),
        }
    }

    pub fn floor(&self) -> ActivityId {
        self.floor
    }

    pub fn applied_above(&self) -> &BTreeSet<ActivityId> {
        &self.applied_above
    }

    pub fn is_applied(&self, id: ActivityId) -> bool {
        id <= self.floor || self.applied_above.contains(&id)
    }

    /// Highest applied id
    pub fn last_applied(&self) -> ActivityId {
        self.applied_above.iter().next_back().copied().unwrap_or(self.floor)
    }

    /// Record `id` as applied. Returns `false` for duplicates.
    pub fn complete(&mut self, id: ActivityId) -> bool {
        if self.is_applied(id) {
            return false;
        }
        self.applied_above.insert(id);
        self.advance();
        true
    }

    /// Missing ids between the floor and the highest applied id
    pub fn gaps(&self) -> Vec<ActivityId> {
        self.gaps_up_to(self.last_applied())
    }

    /// Missing ids in `floor+1..=upper`
    pub fn gaps_up_to(&self, upper: ActivityId) -> Vec<ActivityId> {
        (self.floor.saturating_add(1)..=upper)
            .filter(|id| !self.applied_above.contains(id))
            .collect()
    }

    /// Fold confirmed ids (from a replay or a peer) into the state and prune
    /// entries the floor has overtaken.
    pub fn reconcile(&mut self, confirmed: impl IntoIterator<Item = ActivityId>) {
        for id in confirmed {
            if id > self.floor {
                self.applied_above.insert(id);
            }
        }
        self.advance();
    }

    fn advance(&mut self) {
        while self.applied_above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
        let floor = self.floor;
        self.applied_above.retain(|id| *id > floor);
    }
}

impl fmt::Display for CompletionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "floor={}", self.floor)?;
        if !self.applied_above.is_empty() {
            let ids: Vec<String> = self.applied_above.iter().map(|id| id.to_string()).collect();
            write!(f, " above=[{}]", ids.join(","))?;
        }
        Ok(())
    }
}
