//! Per-iteration memo of transition calculations.

use crate::model::{StateChart, StateId, TransitionId, TransitionType};
use std::collections::{BTreeSet, HashMap};

/// Identity of a transition taking part in a microstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKey {
    /// A transition declared on the chart.
    Declared(TransitionId),
    /// The synthetic transition that enters the initial configuration.
    Initial,
    /// The one-shot transition built by an imperative jump.
    GoTo,
}

/// A transition selected for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct EnabledTransition {
    pub key: TransitionKey,
    /// `None` only for the initial transition.
    pub source: Option<StateId>,
    pub targets: Vec<StateId>,
    pub kind: TransitionType,
}

impl EnabledTransition {
    pub(crate) fn declared(chart: &StateChart, id: TransitionId) -> Self {
        let t = chart.transition(id);
        Self {
            key: TransitionKey::Declared(id),
            source: Some(t.source()),
            targets: t.targets().to_vec(),
            kind: t.transition_type(),
        }
    }

    pub(crate) fn initial(targets: Vec<StateId>) -> Self {
        Self {
            key: TransitionKey::Initial,
            source: None,
            targets,
            kind: TransitionType::External,
        }
    }

    pub(crate) fn go_to(source: StateId, target: StateId) -> Self {
        Self {
            key: TransitionKey::GoTo,
            source: Some(source),
            targets: vec![target],
            kind: TransitionType::External,
        }
    }

    pub fn id(&self) -> Option<TransitionId> {
        match self.key {
            TransitionKey::Declared(id) => Some(id),
            _ => None,
        }
    }
}

/// Effective targets, transition domains and exit sets computed during one
/// loop iteration. A fresh cache is built for every iteration, so nothing
/// computed against one configuration is reused against another.
#[derive(Debug, Default)]
pub struct CalculationCache {
    effective_targets: HashMap<TransitionKey, Vec<StateId>>,
    domains: HashMap<TransitionKey, Option<StateId>>,
    exit_sets: HashMap<TransitionKey, BTreeSet<StateId>>,
}

impl CalculationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effective_targets(&self, key: TransitionKey) -> Option<&Vec<StateId>> {
        self.effective_targets.get(&key)
    }

    pub fn insert_effective_targets(&mut self, key: TransitionKey, targets: Vec<StateId>) {
        self.effective_targets.insert(key, targets);
    }

    pub fn domain(&self, key: TransitionKey) -> Option<Option<StateId>> {
        self.domains.get(&key).copied()
    }

    pub fn insert_domain(&mut self, key: TransitionKey, domain: Option<StateId>) {
        self.domains.insert(key, domain);
    }

    pub fn exit_set(&self, key: TransitionKey) -> Option<&BTreeSet<StateId>> {
        self.exit_sets.get(&key)
    }

    pub fn insert_exit_set(&mut self, key: TransitionKey, exit_set: BTreeSet<StateId>) {
        self.exit_sets.insert(key, exit_set);
    }

    pub fn is_empty(&self) -> bool {
        self.effective_targets.is_empty() && self.domains.is_empty() && self.exit_sets.is_empty()
    }
}
