//! State/transition graph.
//!
//! States live in an arena owned by [`StateChart`] and are addressed by
//! [`StateId`]. Each state stores its parent's id (lookup only) and the ordered
//! ids of the children it owns. Transitions are owned by the chart as well and
//! listed, in declaration order, on their source state.

use crate::error::CoreError;
use crate::event::{Event, ObjectId};
use crate::machine::ActionContext;
use crate::property::PropertyAssignment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Index of a state in the chart arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub(crate) u32);

impl StateId {
    fn index(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Index of a transition in the chart arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionId(pub(crate) u32);

impl TransitionId {
    fn index(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// What a history pseudo-state remembers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryType {
    /// The direct children active when the parent last exited.
    Shallow,
    /// Every atomic descendant active when the parent last exited.
    Deep,
}

/// Closed set of state kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Atomic,
    /// Children are exclusive; exactly one designated initial child.
    Compound,
    /// Children are concurrent regions.
    Parallel,
    Final,
    History(HistoryType),
}

impl StateKind {
    fn can_own_children(self) -> bool {
        matches!(self, StateKind::Compound | StateKind::Parallel)
    }
}

/// Whether a transition's domain may include the source itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionType {
    #[default]
    External,
    /// Does not exit a compound source when every target is its descendant.
    Internal,
}

/// Callback invoked on entry, on exit, or when a transition is taken.
pub type Action = Arc<dyn Fn(&mut ActionContext<'_>) + Send + Sync>;

/// Predicate evaluated against a candidate event.
pub type Guard = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// The test deciding whether a transition is enabled by an event.
#[derive(Clone)]
pub enum EventTest {
    /// Enabled by any event, including the null event.
    Eventless,
    /// Enabled by a named event.
    Named(String),
    /// Enabled when the predicate accepts the event.
    Guard(Guard),
    /// Enabled by a signal of a host object. Registered when the source is entered.
    Signal { sender: ObjectId, signal: String },
    /// Enabled by a filtered host event. Registered when the source is entered.
    Filtered { object: ObjectId, kind: String },
    /// Enabled when the given state reports completion.
    Finished(StateId),
}

impl EventTest {
    /// Creates a named-event test.
    pub fn named(name: impl Into<String>) -> Self {
        EventTest::Named(name.into())
    }

    /// Creates a guard test from a closure.
    pub fn guard(f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        EventTest::Guard(Arc::new(f))
    }

    /// Creates a signal-bound test.
    pub fn signal(sender: ObjectId, signal: impl Into<String>) -> Self {
        EventTest::Signal {
            sender,
            signal: signal.into(),
        }
    }

    /// Creates an event-filter test.
    pub fn filtered(object: ObjectId, kind: impl Into<String>) -> Self {
        EventTest::Filtered {
            object,
            kind: kind.into(),
        }
    }

    /// Returns true if the event enables the transition.
    pub fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (EventTest::Eventless, _) => true,
            (EventTest::Guard(f), e) => f(e),
            (EventTest::Named(expected), Event::Named { name, .. }) => expected == name,
            (
                EventTest::Signal { sender, signal },
                Event::Signal {
                    sender: s,
                    signal: sig,
                    ..
                },
            ) => sender == s && signal == sig,
            (
                EventTest::Filtered { object, kind },
                Event::Wrapped {
                    object: o, kind: k, ..
                },
            ) => object == o && kind == k,
            (EventTest::Finished(expected), Event::Finished(state)) => expected == state,
            _ => false,
        }
    }
}

impl fmt::Debug for EventTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTest::Eventless => f.write_str("Eventless"),
            EventTest::Named(name) => f.debug_tuple("Named").field(name).finish(),
            EventTest::Guard(_) => f.write_str("Guard(..)"),
            EventTest::Signal { sender, signal } => f
                .debug_struct("Signal")
                .field("sender", sender)
                .field("signal", signal)
                .finish(),
            EventTest::Filtered { object, kind } => f
                .debug_struct("Filtered")
                .field("object", object)
                .field("kind", kind)
                .finish(),
            EventTest::Finished(state) => f.debug_tuple("Finished").field(state).finish(),
        }
    }
}

/// A node in the state tree.
pub struct State {
    name: String,
    kind: StateKind,
    parent: Option<StateId>,
    /// Owned non-history children, in declaration order.
    children: Vec<StateId>,
    /// Owned history pseudo-states.
    history: Vec<StateId>,
    transitions: Vec<TransitionId>,
    initial: Option<StateId>,
    error_state: Option<StateId>,
    /// Targets used by a history state that has nothing recorded yet.
    default_targets: Vec<StateId>,
    assignments: Vec<PropertyAssignment>,
    on_entry: Option<Action>,
    on_exit: Option<Action>,
    removed: bool,
}

impl State {
    fn new(name: String, kind: StateKind, parent: Option<StateId>) -> Self {
        Self {
            name,
            kind,
            parent,
            children: Vec::new(),
            history: Vec::new(),
            transitions: Vec::new(),
            initial: None,
            error_state: None,
            default_targets: Vec::new(),
            assignments: Vec::new(),
            on_entry: None,
            on_exit: None,
            removed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    pub fn parent(&self) -> Option<StateId> {
        self.parent
    }

    pub fn children(&self) -> &[StateId] {
        &self.children
    }

    pub fn history_states(&self) -> &[StateId] {
        &self.history
    }

    pub fn transitions(&self) -> &[TransitionId] {
        &self.transitions
    }

    pub fn initial_state(&self) -> Option<StateId> {
        self.initial
    }

    pub fn error_state(&self) -> Option<StateId> {
        self.error_state
    }

    pub fn default_targets(&self) -> &[StateId] {
        &self.default_targets
    }

    pub fn property_assignments(&self) -> &[PropertyAssignment] {
        &self.assignments
    }

    pub(crate) fn on_entry(&self) -> Option<&Action> {
        self.on_entry.as_ref()
    }

    pub(crate) fn on_exit(&self) -> Option<&Action> {
        self.on_exit.as_ref()
    }

    /// True for kinds that take part in transitions (not final, not history).
    pub fn is_standard(&self) -> bool {
        matches!(
            self.kind,
            StateKind::Atomic | StateKind::Compound | StateKind::Parallel
        )
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("history", &self.history)
            .field("transitions", &self.transitions)
            .field("initial", &self.initial)
            .field("error_state", &self.error_state)
            .finish()
    }
}

/// A transition owned by exactly one source state.
pub struct Transition {
    source: StateId,
    targets: Vec<StateId>,
    test: EventTest,
    kind: TransitionType,
    action: Option<Action>,
    removed: bool,
}

impl Transition {
    pub fn source(&self) -> StateId {
        self.source
    }

    pub fn targets(&self) -> &[StateId] {
        &self.targets
    }

    pub fn event_test(&self) -> &EventTest {
        &self.test
    }

    pub fn transition_type(&self) -> TransitionType {
        self.kind
    }

    pub(crate) fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("source", &self.source)
            .field("targets", &self.targets)
            .field("test", &self.test)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The state tree plus every transition declared on it.
#[derive(Debug)]
pub struct StateChart {
    states: Vec<State>,
    transitions: Vec<Transition>,
}

impl Default for StateChart {
    fn default() -> Self {
        Self::new()
    }
}

impl StateChart {
    /// Creates a chart whose root is a compound state.
    pub fn new() -> Self {
        Self::with_root(StateKind::Compound)
    }

    /// Creates a chart whose root regions run in parallel.
    pub fn parallel() -> Self {
        Self::with_root(StateKind::Parallel)
    }

    fn with_root(kind: StateKind) -> Self {
        Self {
            states: vec![State::new("root".to_string(), kind, None)],
            transitions: Vec::new(),
        }
    }

    /// The root state. It owns every other attached state.
    pub fn root(&self) -> StateId {
        StateId(0)
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Adds a state. A state without parent is detached from the tree; any
    /// transition into it fails with a missing common ancestor at run time.
    pub fn add_state(
        &mut self,
        parent: Option<StateId>,
        kind: StateKind,
        name: impl Into<String>,
    ) -> Result<StateId, CoreError> {
        if let Some(p) = parent {
            let parent_kind = self.check_state(p)?.kind;
            if !parent_kind.can_own_children() {
                return Err(CoreError::InvalidParent {
                    parent: p,
                    reason: format!("{:?} states cannot own children", parent_kind),
                });
            }
        }

        let id = StateId(self.states.len() as u32);
        self.states.push(State::new(name.into(), kind, parent));
        if let Some(p) = parent {
            let node = &mut self.states[p.index()];
            match kind {
                StateKind::History(_) => node.history.push(id),
                _ => node.children.push(id),
            }
        }
        Ok(id)
    }

    /// Adds a state and designates it as the initial child of `parent`.
    pub fn add_initial_state(
        &mut self,
        parent: StateId,
        kind: StateKind,
        name: impl Into<String>,
    ) -> Result<StateId, CoreError> {
        let id = self.add_state(Some(parent), kind, name)?;
        self.set_initial_state(parent, id)?;
        Ok(id)
    }

    /// Adds a transition to `source`, after the ones already declared there.
    pub fn add_transition(
        &mut self,
        source: StateId,
        targets: &[StateId],
        test: EventTest,
        kind: TransitionType,
    ) -> Result<TransitionId, CoreError> {
        if !self.check_state(source)?.is_standard() {
            return Err(CoreError::InvalidSource { state: source });
        }
        for target in targets {
            self.check_state(*target)?;
        }

        let id = TransitionId(self.transitions.len() as u32);
        self.transitions.push(Transition {
            source,
            targets: targets.to_vec(),
            test,
            kind,
            action: None,
            removed: false,
        });
        self.states[source.index()].transitions.push(id);
        Ok(id)
    }

    /// Designates `child` as the initial state of a compound state.
    pub fn set_initial_state(&mut self, state: StateId, child: StateId) -> Result<(), CoreError> {
        let node = self.check_state(state)?;
        if node.kind != StateKind::Compound {
            return Err(CoreError::NotCompound { state });
        }
        if self.check_state(child)?.parent != Some(state) {
            return Err(CoreError::NotAChild { state, child });
        }
        self.states[state.index()].initial = Some(child);
        Ok(())
    }

    /// Sets the state entered when a run-time error occurs inside `state`.
    pub fn set_error_state(&mut self, state: StateId, target: StateId) -> Result<(), CoreError> {
        if !self.check_state(state)?.is_standard() {
            return Err(CoreError::InvalidSource { state });
        }
        self.check_state(target)?;
        self.states[state.index()].error_state = Some(target);
        Ok(())
    }

    /// Sets the targets a history state resolves to before anything was recorded.
    pub fn set_default_transition(
        &mut self,
        history: StateId,
        targets: &[StateId],
    ) -> Result<(), CoreError> {
        if !matches!(self.check_state(history)?.kind, StateKind::History(_)) {
            return Err(CoreError::NotHistory { state: history });
        }
        for target in targets {
            self.check_state(*target)?;
        }
        self.states[history.index()].default_targets = targets.to_vec();
        Ok(())
    }

    pub fn on_entry(
        &mut self,
        state: StateId,
        action: impl Fn(&mut ActionContext<'_>) + Send + Sync + 'static,
    ) -> Result<(), CoreError> {
        self.check_state(state)?;
        self.states[state.index()].on_entry = Some(Arc::new(action));
        Ok(())
    }

    pub fn on_exit(
        &mut self,
        state: StateId,
        action: impl Fn(&mut ActionContext<'_>) + Send + Sync + 'static,
    ) -> Result<(), CoreError> {
        self.check_state(state)?;
        self.states[state.index()].on_exit = Some(Arc::new(action));
        Ok(())
    }

    pub fn on_transition(
        &mut self,
        transition: TransitionId,
        action: impl Fn(&mut ActionContext<'_>) + Send + Sync + 'static,
    ) -> Result<(), CoreError> {
        self.check_transition(transition)?;
        self.transitions[transition.index()].action = Some(Arc::new(action));
        Ok(())
    }

    /// Registers a property write applied whenever `state` is entered.
    pub fn assign_property(
        &mut self,
        state: StateId,
        object: ObjectId,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), CoreError> {
        if !self.check_state(state)?.is_standard() {
            return Err(CoreError::InvalidSource { state });
        }
        let name = name.into();
        let assignments = &mut self.states[state.index()].assignments;
        // A later assignment of the same property replaces the earlier one.
        assignments.retain(|a| !(a.object == object && a.name == name));
        assignments.push(PropertyAssignment::explicit(object, name, value));
        Ok(())
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Detaches a transition from its source.
    pub fn remove_transition(&mut self, transition: TransitionId) -> Result<(), CoreError> {
        let source = self.check_transition(transition)?.source;
        self.transitions[transition.index()].removed = true;
        self.states[source.index()]
            .transitions
            .retain(|t| *t != transition);
        Ok(())
    }

    /// Detaches `state` and its whole subtree, dropping every reference to them.
    pub fn remove_state(&mut self, state: StateId) -> Result<(), CoreError> {
        if state == self.root() {
            return Err(CoreError::RootRemoval);
        }
        self.check_state(state)?;

        let mut subtree = BTreeSet::new();
        let mut stack = vec![state];
        while let Some(s) = stack.pop() {
            subtree.insert(s);
            let node = &self.states[s.index()];
            stack.extend(node.children.iter().copied());
            stack.extend(node.history.iter().copied());
        }

        if let Some(parent) = self.states[state.index()].parent {
            let node = &mut self.states[parent.index()];
            node.children.retain(|c| *c != state);
            node.history.retain(|c| *c != state);
        }

        for s in &subtree {
            let node = &mut self.states[s.index()];
            node.removed = true;
            for t in std::mem::take(&mut node.transitions) {
                self.transitions[t.index()].removed = true;
            }
        }

        for node in self.states.iter_mut().filter(|n| !n.removed) {
            if node.initial.map_or(false, |i| subtree.contains(&i)) {
                node.initial = None;
            }
            if node.error_state.map_or(false, |e| subtree.contains(&e)) {
                node.error_state = None;
            }
            node.default_targets.retain(|t| !subtree.contains(t));
        }
        for t in self.transitions.iter_mut().filter(|t| !t.removed) {
            t.targets.retain(|target| !subtree.contains(target));
        }
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Returns the state, or an error for unknown or removed ids.
    pub fn check_state(&self, id: StateId) -> Result<&State, CoreError> {
        self.states
            .get(id.index())
            .filter(|s| !s.removed)
            .ok_or(CoreError::StateNotFound { state: id })
    }

    /// Returns the transition, or an error for unknown or removed ids.
    pub fn check_transition(&self, id: TransitionId) -> Result<&Transition, CoreError> {
        self.transitions
            .get(id.index())
            .filter(|t| !t.removed)
            .ok_or(CoreError::TransitionNotFound { transition: id })
    }

    /// Returns a state issued by this chart.
    ///
    /// # Panics
    ///
    /// Panics if the id was not issued by this chart.
    pub fn state(&self, id: StateId) -> &State {
        &self.states[id.index()]
    }

    /// Returns a transition issued by this chart.
    ///
    /// # Panics
    ///
    /// Panics if the id was not issued by this chart.
    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id.index()]
    }

    /// Finds the first live state with the given name.
    pub fn find_state(&self, name: &str) -> Option<StateId> {
        self.states
            .iter()
            .position(|s| !s.removed && s.name == name)
            .map(|i| StateId(i as u32))
    }

    pub fn name(&self, id: StateId) -> &str {
        &self.state(id).name
    }

    /// Iterates over every live state id, in creation order.
    pub fn state_ids(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.removed)
            .map(|(i, _)| StateId(i as u32))
    }

    // =========================================================================
    // Tree queries
    // =========================================================================

    pub fn parent(&self, id: StateId) -> Option<StateId> {
        self.state(id).parent
    }

    pub fn is_final(&self, id: StateId) -> bool {
        self.state(id).kind == StateKind::Final
    }

    pub fn is_parallel(&self, id: StateId) -> bool {
        self.state(id).kind == StateKind::Parallel
    }

    pub fn is_history(&self, id: StateId) -> bool {
        matches!(self.state(id).kind, StateKind::History(_))
    }

    /// A compound state with children. A compound root counts even when empty.
    pub fn is_compound(&self, id: StateId) -> bool {
        if id == self.root() {
            return !self.is_parallel(id);
        }
        let s = self.state(id);
        s.kind == StateKind::Compound && !s.children.is_empty()
    }

    /// A state with no children to enter.
    pub fn is_atomic(&self, id: StateId) -> bool {
        let s = self.state(id);
        match s.kind {
            StateKind::Atomic | StateKind::Final => true,
            StateKind::Compound | StateKind::Parallel => s.children.is_empty(),
            StateKind::History(_) => false,
        }
    }

    /// True if `state` is a proper descendant of `ancestor`.
    pub fn is_descendant(&self, state: StateId, ancestor: StateId) -> bool {
        let mut current = self.parent(state);
        while let Some(s) = current {
            if s == ancestor {
                return true;
            }
            current = self.parent(s);
        }
        false
    }

    /// Proper ancestors of `state`, innermost first, stopping before
    /// `upper_bound` (or at the top of the tree when `None`).
    pub fn proper_ancestors(&self, state: StateId, upper_bound: Option<StateId>) -> Vec<StateId> {
        let mut result = Vec::new();
        let mut current = self.parent(state);
        while let Some(s) = current {
            if Some(s) == upper_bound {
                break;
            }
            result.push(s);
            current = self.parent(s);
        }
        result
    }

    /// Number of proper ancestors.
    pub fn depth(&self, state: StateId) -> usize {
        self.proper_ancestors(state, None).len()
    }

    /// Nearest proper ancestor of `states[0]` that contains every other state.
    pub fn find_lca(&self, states: &[StateId]) -> Option<StateId> {
        self.find_common_ancestor(states, |_| true)
    }

    /// Like [`find_lca`](Self::find_lca) but only accepts states that own
    /// regions or exclusive children (compound, parallel, root).
    pub fn find_lcca(&self, states: &[StateId]) -> Option<StateId> {
        self.find_common_ancestor(states, |s| self.is_compound(s) || self.is_parallel(s))
    }

    fn find_common_ancestor(
        &self,
        states: &[StateId],
        accept: impl Fn(StateId) -> bool,
    ) -> Option<StateId> {
        let (first, rest) = states.split_first()?;
        self.proper_ancestors(*first, None)
            .into_iter()
            .filter(|anc| accept(*anc))
            .find(|anc| rest.iter().all(|s| self.is_descendant(*s, *anc)))
    }

    /// Index of the child of `ancestor` that is `state` or contains it.
    pub fn index_of_descendant(&self, ancestor: StateId, state: StateId) -> Option<usize> {
        self.state(ancestor)
            .children
            .iter()
            .position(|c| *c == state || self.is_descendant(state, *c))
    }

    fn sibling_index(&self, state: StateId) -> Option<usize> {
        let parent = self.parent(state)?;
        self.state(parent).children.iter().position(|c| *c == state)
    }

    /// Entry order: ancestors before descendants, siblings in declaration order.
    pub fn entry_order(&self, s1: StateId, s2: StateId) -> Ordering {
        if s1 == s2 {
            return Ordering::Equal;
        }
        if self.parent(s1).is_some() && self.parent(s1) == self.parent(s2) {
            return self.sibling_index(s1).cmp(&self.sibling_index(s2));
        }
        if self.is_descendant(s1, s2) {
            return Ordering::Greater;
        }
        if self.is_descendant(s2, s1) {
            return Ordering::Less;
        }
        match self.find_lca(&[s1, s2]) {
            Some(lca) => self
                .index_of_descendant(lca, s1)
                .cmp(&self.index_of_descendant(lca, s2)),
            None => s1.cmp(&s2),
        }
    }

    /// Exit order: descendants before ancestors, siblings in reverse
    /// declaration order. The mirror image of [`entry_order`](Self::entry_order).
    pub fn exit_order(&self, s1: StateId, s2: StateId) -> Ordering {
        self.entry_order(s2, s1)
    }

    /// Position of a transition among those declared on its source.
    pub(crate) fn transition_index(&self, transition: TransitionId) -> Option<usize> {
        let source = self.transition(transition).source;
        self.state(source)
            .transitions
            .iter()
            .position(|t| *t == transition)
    }
}
