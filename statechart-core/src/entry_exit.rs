//! Transition domains, exit sets and entry sets.
//!
//! A [`Resolver`] borrows everything one loop iteration needs: the chart, the
//! configuration, the history table, and the iteration's calculation cache.
//! Run-time errors detected while resolving are collected in [`Faults`] and
//! may redirect the entry set to a configured error state.

use crate::cache::{CalculationCache, EnabledTransition};
use crate::error::MachineError;
use crate::history::HistoryTable;
use crate::model::{StateChart, StateId, TransitionType};
use std::collections::BTreeSet;
use tracing::debug;

/// A run-time error detected while resolving a microstep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ErrorReport {
    pub error: MachineError,
    pub context: StateId,
    /// The error state that will be entered instead, if any.
    pub error_state: Option<StateId>,
}

#[derive(Debug, Clone, Copy)]
struct Recovery {
    error_state: StateId,
    context: StateId,
}

/// Errors raised during one loop iteration.
#[derive(Debug, Default)]
pub(crate) struct Faults {
    recovery: Option<Recovery>,
    pub reports: Vec<ErrorReport>,
    /// Set while the error state's own entry set is being built.
    resolving: bool,
}

impl Faults {
    pub fn take_reports(&mut self) -> Vec<ErrorReport> {
        std::mem::take(&mut self.reports)
    }
}

/// States a microstep leaves and enters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct StepPlan {
    /// In exit order.
    pub exit: Vec<StateId>,
    /// In entry order.
    pub entry: Vec<StateId>,
}

pub(crate) struct Resolver<'a> {
    pub(crate) chart: &'a StateChart,
    pub(crate) configuration: &'a BTreeSet<StateId>,
    history: &'a HistoryTable,
    pub(crate) cache: &'a mut CalculationCache,
    faults: &'a mut Faults,
}

impl<'a> Resolver<'a> {
    pub fn new(
        chart: &'a StateChart,
        configuration: &'a BTreeSet<StateId>,
        history: &'a HistoryTable,
        cache: &'a mut CalculationCache,
        faults: &'a mut Faults,
    ) -> Self {
        Self {
            chart,
            configuration,
            history,
            cache,
            faults,
        }
    }

    pub(crate) fn source_of(&self, t: &EnabledTransition) -> StateId {
        t.source.unwrap_or_else(|| self.chart.root())
    }

    // =========================================================================
    // Errors
    // =========================================================================

    fn set_error(&mut self, error: MachineError, context: StateId) {
        self.faults.recovery = None;

        let error_state = if self.faults.resolving {
            // Entering the error state failed in turn.
            None
        } else {
            self.find_error_state(context)
                .filter(|e| *e != context)
                .filter(|e| self.chart.is_descendant(*e, self.chart.root()))
        };

        debug!(
            error = %error,
            context = %self.chart.name(context),
            recovered = error_state.is_some(),
            "machine error while resolving transitions"
        );

        if let Some(error_state) = error_state {
            self.faults.recovery = Some(Recovery {
                error_state,
                context,
            });
        }
        // The same failure is usually seen by both the exit and the entry pass.
        let seen = self
            .faults
            .reports
            .iter()
            .any(|r| r.error == error && r.context == context);
        if !seen {
            self.faults.reports.push(ErrorReport {
                error,
                context,
                error_state,
            });
        }
    }

    /// The error state of `context` or of its nearest ancestor declaring one.
    fn find_error_state(&self, context: StateId) -> Option<StateId> {
        let mut current = Some(context);
        while let Some(s) = current {
            if let Some(e) = self.chart.state(s).error_state() {
                return Some(e);
            }
            current = self.chart.parent(s);
        }
        None
    }

    // =========================================================================
    // Per-transition calculations
    // =========================================================================

    /// Targets with history states replaced by what they stand for.
    pub fn effective_targets(&mut self, t: &EnabledTransition) -> Vec<StateId> {
        if let Some(targets) = self.cache.effective_targets(t.key) {
            return targets.clone();
        }

        let mut targets: Vec<StateId> = Vec::new();
        for &s in &t.targets {
            let resolved: Vec<StateId> = if self.chart.is_history(s) {
                if let Some(saved) = self.history.get(s) {
                    saved.to_vec()
                } else if !self.chart.state(s).default_targets().is_empty() {
                    self.chart.state(s).default_targets().to_vec()
                } else {
                    self.set_error(MachineError::NoDefaultStateInHistoryState, s);
                    Vec::new()
                }
            } else {
                vec![s]
            };
            for r in resolved {
                if !targets.contains(&r) {
                    targets.push(r);
                }
            }
        }

        self.cache.insert_effective_targets(t.key, targets.clone());
        targets
    }

    /// The state whose active descendants the transition exits.
    pub fn transition_domain(&mut self, t: &EnabledTransition) -> Option<StateId> {
        if let Some(domain) = self.cache.domain(t.key) {
            return domain;
        }

        let effective = self.effective_targets(t);
        let root = self.chart.root();
        let domain = if effective.is_empty() {
            None
        } else {
            match t.source {
                Some(src)
                    if t.kind == TransitionType::Internal
                        && self.chart.is_compound(src)
                        && effective.iter().all(|s| self.chart.is_descendant(*s, src)) =>
                {
                    Some(src)
                }
                Some(src) if src == root => effective
                    .iter()
                    .all(|s| self.chart.is_descendant(*s, root))
                    .then_some(root),
                Some(src) => {
                    let mut states = Vec::with_capacity(effective.len() + 1);
                    states.push(src);
                    states.extend(effective.iter().copied());
                    self.chart.find_lcca(&states)
                }
                None => self.chart.find_lcca(&effective),
            }
        };

        self.cache.insert_domain(t.key, domain);
        domain
    }

    /// Active states the transition exits, unordered.
    pub fn exit_set(&mut self, t: &EnabledTransition) -> BTreeSet<StateId> {
        if let Some(set) = self.cache.exit_set(t.key) {
            return set.clone();
        }

        let effective = self.effective_targets(t);
        let domain = self.transition_domain(t);
        if domain.is_none() && !effective.is_empty() {
            let source = self.source_of(t);
            self.set_error(MachineError::NoCommonAncestorForTransition, source);
        }

        let set: BTreeSet<StateId> = match domain {
            Some(d) => self
                .configuration
                .iter()
                .copied()
                .filter(|s| self.chart.is_descendant(*s, d))
                .collect(),
            None => BTreeSet::new(),
        };

        self.cache.insert_exit_set(t.key, set.clone());
        set
    }

    // =========================================================================
    // Microstep sets
    // =========================================================================

    pub fn compute_exit_set(&mut self, enabled: &[EnabledTransition]) -> BTreeSet<StateId> {
        let mut exit = BTreeSet::new();
        for t in enabled {
            exit.extend(self.exit_set(t));
        }
        exit
    }

    pub fn compute_entry_set(&mut self, enabled: &[EnabledTransition]) -> BTreeSet<StateId> {
        let mut to_enter = BTreeSet::new();
        for t in enabled {
            for &s in &t.targets {
                self.add_descendant_states_to_enter(s, &mut to_enter);
            }
            let effective = self.effective_targets(t);
            let domain = self.transition_domain(t);
            for &s in &effective {
                self.add_ancestor_states_to_enter(s, domain, &mut to_enter);
            }
            if let Some(d) = domain.filter(|d| self.chart.is_parallel(*d)) {
                self.add_missing_regions(d, &mut to_enter);
            }
        }
        to_enter
    }

    /// Computes the ordered exit and entry sets for a batch of transitions.
    ///
    /// When an error state has to be entered, everything below the nearest
    /// ancestor that stays active is exited, and the error state's path from
    /// that ancestor replaces the entry set.
    pub fn plan(&mut self, enabled: &[EnabledTransition]) -> StepPlan {
        let mut exit = self.compute_exit_set(enabled);
        let mut entry = self.compute_entry_set(enabled);

        if let Some(recovery) = self.faults.recovery.take() {
            let domain = self.recovery_domain(recovery, &exit);
            exit.extend(
                self.configuration
                    .iter()
                    .copied()
                    .filter(|s| self.chart.is_descendant(*s, domain)),
            );
            entry = self.recovery_entry_set(recovery.error_state, domain);
        }

        let mut exit: Vec<StateId> = exit.into_iter().collect();
        exit.sort_by(|a, b| self.chart.exit_order(*a, *b));
        let mut entry: Vec<StateId> = entry.into_iter().collect();
        entry.sort_by(|a, b| self.chart.entry_order(*a, *b));
        StepPlan { exit, entry }
    }

    fn recovery_domain(&self, recovery: Recovery, exit: &BTreeSet<StateId>) -> StateId {
        let root = self.chart.root();
        let mut domain = self
            .chart
            .find_lcca(&[recovery.error_state, recovery.context])
            .unwrap_or(root);
        while domain != root
            && !(self.configuration.contains(&domain)
                && !exit.contains(&domain)
                && exit.iter().all(|s| self.chart.is_descendant(*s, domain)))
        {
            domain = self.chart.parent(domain).unwrap_or(root);
        }
        domain
    }

    fn recovery_entry_set(&mut self, error_state: StateId, domain: StateId) -> BTreeSet<StateId> {
        let mut to_enter = BTreeSet::new();
        self.faults.resolving = true;
        self.add_descendant_states_to_enter(error_state, &mut to_enter);
        self.add_ancestor_states_to_enter(error_state, Some(domain), &mut to_enter);
        if self.chart.is_parallel(domain) {
            self.add_missing_regions(domain, &mut to_enter);
        }
        self.faults.resolving = false;
        to_enter
    }

    fn add_descendant_states_to_enter(&mut self, s: StateId, to_enter: &mut BTreeSet<StateId>) {
        if self.chart.is_history(s) {
            let chart = self.chart;
            let content: Vec<StateId> = if let Some(saved) = self.history.get(s) {
                debug!(history = %chart.name(s), states = saved.len(), "restoring history");
                saved.to_vec()
            } else {
                let defaults = chart.state(s).default_targets();
                if defaults.is_empty() {
                    self.set_error(MachineError::NoDefaultStateInHistoryState, s);
                    return;
                }
                defaults.iter().copied().filter(|d| *d != s).collect()
            };
            let parent = self.chart.parent(s);
            for &c in &content {
                self.add_descendant_states_to_enter(c, to_enter);
            }
            for &c in &content {
                self.add_ancestor_states_to_enter(c, parent, to_enter);
            }
            return;
        }

        if s == self.chart.root() {
            return;
        }
        to_enter.insert(s);

        if self.chart.is_compound(s) {
            match self.chart.state(s).initial_state() {
                Some(initial) => {
                    self.add_descendant_states_to_enter(initial, to_enter);
                    self.add_ancestor_states_to_enter(initial, Some(s), to_enter);
                }
                None => self.set_error(MachineError::NoInitialState, s),
            }
        } else if self.chart.is_parallel(s) {
            self.add_missing_regions(s, to_enter);
        }
    }

    fn add_ancestor_states_to_enter(
        &mut self,
        s: StateId,
        upper_bound: Option<StateId>,
        to_enter: &mut BTreeSet<StateId>,
    ) {
        for anc in self.chart.proper_ancestors(s, upper_bound) {
            if self.chart.parent(anc).is_none() {
                continue;
            }
            to_enter.insert(anc);
            if self.chart.is_parallel(anc) {
                self.add_missing_regions(anc, to_enter);
            }
        }
    }

    /// Default-enters every region of `parallel` with nothing entered yet.
    fn add_missing_regions(&mut self, parallel: StateId, to_enter: &mut BTreeSet<StateId>) {
        let chart = self.chart;
        for &region in chart.state(parallel).children() {
            let covered = to_enter
                .iter()
                .any(|s| *s == region || chart.is_descendant(*s, region));
            if !covered {
                self.add_descendant_states_to_enter(region, to_enter);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventTest, HistoryType, StateKind};

    struct Fixture {
        chart: StateChart,
        configuration: BTreeSet<StateId>,
        history: HistoryTable,
    }

    impl Fixture {
        fn plan(&self, enabled: &[EnabledTransition]) -> (StepPlan, Vec<ErrorReport>) {
            let mut cache = CalculationCache::new();
            let mut faults = Faults::default();
            let plan = Resolver::new(
                &self.chart,
                &self.configuration,
                &self.history,
                &mut cache,
                &mut faults,
            )
            .plan(enabled);
            (plan, faults.take_reports())
        }
    }

    #[test]
    fn test_initial_transition_enters_defaults() {
        let mut chart = StateChart::new();
        let root = chart.root();
        let a = chart
            .add_initial_state(root, StateKind::Compound, "a")
            .unwrap();
        let p = chart.add_initial_state(a, StateKind::Parallel, "p").unwrap();
        let r1 = chart.add_state(Some(p), StateKind::Compound, "r1").unwrap();
        let x = chart.add_initial_state(r1, StateKind::Atomic, "x").unwrap();
        let r2 = chart.add_state(Some(p), StateKind::Atomic, "r2").unwrap();

        let fixture = Fixture {
            chart,
            configuration: BTreeSet::new(),
            history: HistoryTable::new(),
        };
        let (plan, reports) = fixture.plan(&[EnabledTransition::initial(vec![a])]);
        assert!(reports.is_empty());
        assert!(plan.exit.is_empty());
        assert_eq!(plan.entry, vec![a, p, r1, x, r2]);
    }

    #[test]
    fn test_internal_transition_keeps_source() {
        let mut chart = StateChart::new();
        let root = chart.root();
        let a = chart
            .add_initial_state(root, StateKind::Compound, "a")
            .unwrap();
        let a1 = chart.add_initial_state(a, StateKind::Atomic, "a1").unwrap();
        let a2 = chart.add_state(Some(a), StateKind::Atomic, "a2").unwrap();
        let internal = chart
            .add_transition(a, &[a2], EventTest::named("in"), TransitionType::Internal)
            .unwrap();
        let external = chart
            .add_transition(a, &[a2], EventTest::named("ex"), TransitionType::External)
            .unwrap();

        let fixture = Fixture {
            configuration: [a, a1].into_iter().collect(),
            history: HistoryTable::new(),
            chart,
        };
        let (plan, _) = fixture.plan(&[EnabledTransition::declared(&fixture.chart, internal)]);
        assert_eq!(plan.exit, vec![a1]);
        assert_eq!(plan.entry, vec![a2]);

        let (plan, _) = fixture.plan(&[EnabledTransition::declared(&fixture.chart, external)]);
        assert_eq!(plan.exit, vec![a1, a]);
        assert_eq!(plan.entry, vec![a, a2]);
    }

    #[test]
    fn test_transition_between_regions_reenters_other_regions() {
        let mut chart = StateChart::new();
        let root = chart.root();
        let p = chart
            .add_initial_state(root, StateKind::Parallel, "p")
            .unwrap();
        let r1 = chart.add_state(Some(p), StateKind::Compound, "r1").unwrap();
        let x1 = chart.add_initial_state(r1, StateKind::Atomic, "x1").unwrap();
        let r2 = chart.add_state(Some(p), StateKind::Compound, "r2").unwrap();
        let y1 = chart.add_initial_state(r2, StateKind::Atomic, "y1").unwrap();
        let y2 = chart.add_state(Some(r2), StateKind::Atomic, "y2").unwrap();
        let t = chart
            .add_transition(x1, &[y2], EventTest::named("cross"), TransitionType::External)
            .unwrap();

        let fixture = Fixture {
            configuration: [p, r1, x1, r2, y1].into_iter().collect(),
            history: HistoryTable::new(),
            chart,
        };
        let (plan, _) = fixture.plan(&[EnabledTransition::declared(&fixture.chart, t)]);
        assert_eq!(plan.exit, vec![y1, r2, x1, r1]);
        assert_eq!(plan.entry, vec![r1, x1, r2, y2]);
    }

    #[test]
    fn test_history_without_default_redirects_to_error_state() {
        let mut chart = StateChart::new();
        let root = chart.root();
        let idle = chart
            .add_initial_state(root, StateKind::Atomic, "idle")
            .unwrap();
        let a = chart.add_state(Some(root), StateKind::Compound, "a").unwrap();
        chart.add_initial_state(a, StateKind::Atomic, "a1").unwrap();
        let h = chart
            .add_state(Some(a), StateKind::History(HistoryType::Shallow), "h")
            .unwrap();
        let failed = chart.add_state(Some(root), StateKind::Atomic, "failed").unwrap();
        chart.set_error_state(root, failed).unwrap();
        let t = chart
            .add_transition(idle, &[h], EventTest::named("resume"), TransitionType::External)
            .unwrap();

        let fixture = Fixture {
            configuration: [idle].into_iter().collect(),
            history: HistoryTable::new(),
            chart,
        };
        let (plan, reports) = fixture.plan(&[EnabledTransition::declared(&fixture.chart, t)]);
        assert_eq!(plan.exit, vec![idle]);
        assert_eq!(plan.entry, vec![failed]);
        assert_eq!(
            reports,
            vec![ErrorReport {
                error: MachineError::NoDefaultStateInHistoryState,
                context: h,
                error_state: Some(failed),
            }]
        );
    }

    #[test]
    fn test_missing_initial_state_without_error_state_is_unrecoverable() {
        let mut chart = StateChart::new();
        let root = chart.root();
        let idle = chart
            .add_initial_state(root, StateKind::Atomic, "idle")
            .unwrap();
        let broken = chart
            .add_state(Some(root), StateKind::Compound, "broken")
            .unwrap();
        chart
            .add_state(Some(broken), StateKind::Atomic, "inner")
            .unwrap();
        let t = chart
            .add_transition(idle, &[broken], EventTest::named("go"), TransitionType::External)
            .unwrap();

        let fixture = Fixture {
            configuration: [idle].into_iter().collect(),
            history: HistoryTable::new(),
            chart,
        };
        let (_, reports) = fixture.plan(&[EnabledTransition::declared(&fixture.chart, t)]);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].error, MachineError::NoInitialState);
        assert_eq!(reports[0].context, broken);
        assert_eq!(reports[0].error_state, None);
    }
}
