//! Transition selection and conflict removal.

use crate::cache::{EnabledTransition, TransitionKey};
use crate::entry_exit::Resolver;
use crate::event::Event;
use crate::model::StateId;
use std::cmp::Ordering;

impl Resolver<'_> {
    /// Transitions enabled by `event`, free of conflicts.
    ///
    /// Atomic states are visited in entry order. For each one, the state and
    /// then its ancestors are searched and the first transition whose test
    /// accepts the event is taken.
    pub fn select_transitions(&mut self, event: &Event) -> Vec<EnabledTransition> {
        let chart = self.chart;
        let mut atomic: Vec<StateId> = self
            .configuration
            .iter()
            .copied()
            .filter(|s| chart.is_atomic(*s))
            .collect();
        atomic.sort_by(|a, b| chart.entry_order(*a, *b));

        let mut enabled: Vec<EnabledTransition> = Vec::new();
        for state in atomic {
            let found = std::iter::once(state)
                .chain(chart.proper_ancestors(state, None))
                .find_map(|s| {
                    chart
                        .state(s)
                        .transitions()
                        .iter()
                        .copied()
                        .find(|t| chart.transition(*t).event_test().matches(event))
                });
            if let Some(t) = found {
                enabled.push(EnabledTransition::declared(chart, t));
                if enabled.len() > 1 {
                    self.remove_conflicting_transitions(&mut enabled);
                }
            }
        }
        enabled
    }

    /// Drops transitions whose exit sets overlap one that takes priority.
    ///
    /// Of two conflicting transitions, the one whose source is a descendant
    /// of the other's source wins; otherwise the one visited first wins.
    pub fn remove_conflicting_transitions(&mut self, enabled: &mut Vec<EnabledTransition>) {
        let mut sorted = std::mem::take(enabled);
        sorted.sort_by(|a, b| self.transition_order(a, b));

        let mut filtered: Vec<EnabledTransition> = Vec::with_capacity(sorted.len());
        for t1 in sorted {
            let exit1 = self.exit_set(&t1);
            let source1 = self.source_of(&t1);
            let mut preempted = false;
            let mut i = 0;
            while i < filtered.len() {
                if filtered[i].key == t1.key {
                    preempted = true;
                    break;
                }
                let exit2 = self.exit_set(&filtered[i]);
                if exit1.is_disjoint(&exit2) {
                    i += 1;
                    continue;
                }
                let source2 = self.source_of(&filtered[i]);
                if self.chart.is_descendant(source1, source2) {
                    filtered.remove(i);
                } else {
                    preempted = true;
                    break;
                }
            }
            if !preempted {
                filtered.push(t1);
            }
        }
        *enabled = filtered;
    }

    /// Deeper sources first; declaration order among peers.
    fn transition_order(&self, t1: &EnabledTransition, t2: &EnabledTransition) -> Ordering {
        let chart = self.chart;
        let s1 = self.source_of(t1);
        let s2 = self.source_of(t2);

        if s1 == s2 {
            return self.declaration_index(t1).cmp(&self.declaration_index(t2));
        }
        if chart.is_descendant(s1, s2) {
            return Ordering::Less;
        }
        if chart.is_descendant(s2, s1) {
            return Ordering::Greater;
        }
        match chart.find_lca(&[s1, s2]) {
            Some(lca) => {
                let base = chart.depth(lca);
                let d1 = chart.depth(s1) - base;
                let d2 = chart.depth(s2) - base;
                if d1 == d2 {
                    chart
                        .index_of_descendant(lca, s1)
                        .cmp(&chart.index_of_descendant(lca, s2))
                } else {
                    d2.cmp(&d1)
                }
            }
            None => s1.cmp(&s2),
        }
    }

    fn declaration_index(&self, t: &EnabledTransition) -> usize {
        match t.key {
            TransitionKey::Declared(id) => self.chart.transition_index(id).unwrap_or(usize::MAX),
            TransitionKey::Initial | TransitionKey::GoTo => usize::MAX,
        }
    }
}
