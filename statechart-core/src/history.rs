//! History snapshots.

use crate::model::{HistoryType, StateChart, StateId, StateKind};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Saved configurations, keyed by history state. Survives stop; cleared on start.
#[derive(Debug, Default, Clone)]
pub struct HistoryTable {
    saved: HashMap<StateId, Vec<StateId>>,
}

impl HistoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The configuration recorded for a history state, if any.
    pub fn get(&self, history: StateId) -> Option<&[StateId]> {
        self.saved
            .get(&history)
            .filter(|c| !c.is_empty())
            .map(Vec::as_slice)
    }

    /// Records history for every state in `exiting`, against the
    /// configuration as it stands before any of them leaves it.
    pub fn record(
        &mut self,
        chart: &StateChart,
        exiting: &[StateId],
        configuration: &BTreeSet<StateId>,
    ) {
        for &parent in exiting {
            for &h in chart.state(parent).history_states() {
                let StateKind::History(kind) = chart.state(h).kind() else {
                    continue;
                };
                let snapshot: Vec<StateId> = configuration
                    .iter()
                    .copied()
                    .filter(|s| match kind {
                        HistoryType::Deep => {
                            chart.is_atomic(*s) && chart.is_descendant(*s, parent)
                        }
                        HistoryType::Shallow => chart.parent(*s) == Some(parent),
                    })
                    .collect();
                debug!(
                    history = %chart.name(h),
                    parent = %chart.name(parent),
                    ?kind,
                    states = snapshot.len(),
                    "recorded history"
                );
                self.saved.insert(h, snapshot);
            }
        }
    }

    /// Drops snapshots that refer to states no longer in the chart.
    pub(crate) fn retain_live(&mut self, chart: &StateChart) {
        self.saved.retain(|h, states| {
            states.retain(|s| chart.check_state(*s).is_ok());
            chart.check_state(*h).is_ok()
        });
    }

    pub fn clear(&mut self) {
        self.saved.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.saved.values().all(Vec::is_empty)
    }
}
