//! The statechart interpreter.
//!
//! A [`StateMachine`] owns its chart, configuration, history and property
//! store, and is driven by exactly one thread through an [`EventLoop`]. Each
//! processing turn (macrostep) repeatedly selects enabled transitions (first
//! eventless ones, then the internal queue, then the external queue) and
//! applies them as one microstep until nothing is enabled and both queues
//! are empty.

use crate::cache::{CalculationCache, EnabledTransition};
use crate::entry_exit::{ErrorReport, Faults, Resolver};
use crate::error::{CoreError, MachineError};
use crate::event::{Event, EventPriority, ObjectId};
use crate::history::HistoryTable;
use crate::host::{EventLoop, LoopTask, TimerId};
use crate::model::{Action, EventTest, StateChart, StateId, TransitionId};
use crate::notify::{Notification, Observer};
use crate::property::{
    PropertyAssignment, PropertyKey, PropertyStore, RestorableRegistry, RestorePolicy,
};
use crate::queue::{DelayedEventId, EventPoster, RunState, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Why a processing turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing enabled and both queues drained; the run continues.
    EventQueueEmpty,
    /// The root reached a final state; the run is over.
    Finished,
    /// A stop was requested or an unrecoverable error occurred.
    Stopped,
}

/// What an entry, exit or transition callback can see and do.
pub struct ActionContext<'a> {
    event: &'a Event,
    state: Option<StateId>,
    transition: Option<TransitionId>,
    chart: &'a StateChart,
    properties: &'a mut PropertyStore,
    poster: &'a EventPoster,
}

impl ActionContext<'_> {
    /// The event being processed. `Event::Null` for eventless steps.
    pub fn event(&self) -> &Event {
        self.event
    }

    /// The state being entered or exited.
    pub fn state(&self) -> Option<StateId> {
        self.state
    }

    /// The transition being taken.
    pub fn transition(&self) -> Option<TransitionId> {
        self.transition
    }

    pub fn state_name(&self) -> Option<&str> {
        self.state.map(|s| self.chart.name(s))
    }

    pub fn chart(&self) -> &StateChart {
        self.chart
    }

    pub fn properties(&self) -> &PropertyStore {
        self.properties
    }

    pub fn properties_mut(&mut self) -> &mut PropertyStore {
        self.properties
    }

    pub fn poster(&self) -> &EventPoster {
        self.poster
    }

    /// Queues an internal event, handled before anything in the external queue.
    pub fn raise(&self, event: Event) {
        self.poster.raise(event);
    }
}

/// A statechart interpreter bound to a host event loop.
pub struct StateMachine {
    chart: StateChart,
    shared: Arc<Shared>,
    poster: EventPoster,
    configuration: BTreeSet<StateId>,
    history: HistoryTable,
    properties: PropertyStore,
    restorables: RestorableRegistry,
    restore_policy: RestorePolicy,
    observers: Vec<Box<dyn Observer>>,
    error: Option<(MachineError, StateId)>,
    error_string: String,
    last_outcome: Option<StopReason>,
}

impl StateMachine {
    pub fn new(chart: StateChart, event_loop: Arc<dyn EventLoop>) -> Self {
        let shared = Arc::new(Shared::new(event_loop));
        let poster = EventPoster::new(Arc::clone(&shared));
        Self {
            chart,
            shared,
            poster,
            configuration: BTreeSet::new(),
            history: HistoryTable::new(),
            properties: PropertyStore::new(),
            restorables: RestorableRegistry::default(),
            restore_policy: RestorePolicy::default(),
            observers: Vec::new(),
            error: None,
            error_string: String::new(),
            last_outcome: None,
        }
    }

    // =========================================================================
    // Chart access
    // =========================================================================

    pub fn chart(&self) -> &StateChart {
        &self.chart
    }

    /// Mutable chart access, only while not running.
    pub fn chart_mut(&mut self) -> Result<&mut StateChart, CoreError> {
        if self.run_state() != RunState::NotRunning {
            return Err(CoreError::Running);
        }
        Ok(&mut self.chart)
    }

    /// Removes a subtree and forgets any history or configuration entry
    /// that refers to it.
    pub fn remove_state(&mut self, state: StateId) -> Result<(), CoreError> {
        self.chart_mut()?.remove_state(state)?;
        self.history.retain_live(&self.chart);
        self.configuration
            .retain(|s| self.chart.check_state(*s).is_ok());
        Ok(())
    }

    pub fn remove_transition(&mut self, transition: TransitionId) -> Result<(), CoreError> {
        self.chart_mut()?.remove_transition(transition)
    }

    // =========================================================================
    // Control surface
    // =========================================================================

    /// A handle other threads and callbacks use to feed this machine.
    pub fn poster(&self) -> EventPoster {
        self.poster.clone()
    }

    /// Queues the kickoff. Fails if the root has nothing to enter.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.initial_targets().is_none() {
            warn!("start refused: no initial state set for the root state");
            return Err(CoreError::NoInitialState);
        }
        self.shared.request_start();
        Ok(())
    }

    /// Requests the run to end at the next loop checkpoint.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn post_event(&self, event: Event, priority: EventPriority) -> Result<(), CoreError> {
        self.shared.post_event(event, priority)
    }

    pub fn post_delayed_event(
        &self,
        event: Event,
        delay: Duration,
    ) -> Result<DelayedEventId, CoreError> {
        self.shared.post_delayed_event(event, delay)
    }

    pub fn cancel_delayed_event(&self, id: DelayedEventId) -> bool {
        self.shared.cancel_delayed_event(id)
    }

    pub fn emit_signal(&self, sender: ObjectId, signal: &str, args: Vec<Value>) -> bool {
        self.shared.emit_signal(sender, signal, args)
    }

    pub fn filter_event(&self, object: ObjectId, kind: &str, payload: Value) -> bool {
        self.shared.filter_event(object, kind, payload)
    }

    /// Jumps to `target` on the next processing turn, unless it is active by then.
    pub fn go_to_state(&self, target: StateId) {
        self.shared.request_go_to(target);
    }

    /// Runs a task queued on the host loop. Called by the host on the owning thread.
    pub fn run_task(&mut self, task: LoopTask) {
        match task {
            LoopTask::Start => self.kickoff(),
            LoopTask::Process => {
                if self.shared.begin_scheduled_processing() {
                    self.macrostep(None);
                }
            }
            LoopTask::StartDelayedTimer { id, delay } => {
                self.shared.start_delayed_timer(id, delay)
            }
            LoopTask::KillDelayedTimer { id, timer } => self.shared.kill_delayed_timer(id, timer),
        }
    }

    /// Handles an expired host timer. Called by the host on the owning thread.
    pub fn timer_fired(&mut self, timer: TimerId) {
        let Some((id, event)) = self.shared.take_fired(timer) else {
            return;
        };
        debug!(%id, event = %event, "delayed event fired");
        self.shared.push_external(event);
        if self.shared.begin_direct_processing() {
            self.macrostep(None);
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn run_state(&self) -> RunState {
        self.shared.run_state()
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    /// The active states. The root is never listed.
    pub fn configuration(&self) -> &BTreeSet<StateId> {
        &self.configuration
    }

    pub fn is_active(&self, state: StateId) -> bool {
        self.configuration.contains(&state)
    }

    /// Names of the active states, in entry order.
    pub fn active_state_names(&self) -> Vec<&str> {
        let mut states: Vec<StateId> = self.configuration.iter().copied().collect();
        states.sort_by(|a, b| self.chart.entry_order(*a, *b));
        states.into_iter().map(|s| self.chart.name(s)).collect()
    }

    /// A compound state with an active final child, or a parallel state
    /// whose every region is in a final state.
    pub fn is_in_final_state(&self, state: StateId) -> bool {
        if self.chart.is_parallel(state) {
            self.chart
                .state(state)
                .children()
                .iter()
                .all(|c| self.is_in_final_state(*c))
        } else if self.chart.is_compound(state) {
            self.chart
                .state(state)
                .children()
                .iter()
                .any(|c| self.chart.is_final(*c) && self.configuration.contains(c))
        } else {
            false
        }
    }

    /// The configuration a history state would restore.
    pub fn saved_history(&self, history: StateId) -> Option<&[StateId]> {
        self.history.get(history)
    }

    pub fn error(&self) -> Option<MachineError> {
        self.error.map(|(e, _)| e)
    }

    /// The state in which the last error was detected.
    pub fn error_context(&self) -> Option<StateId> {
        self.error.map(|(_, s)| s)
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    pub fn clear_error(&mut self) {
        self.error = None;
        self.error_string.clear();
    }

    /// How the last processing turn ended.
    pub fn last_outcome(&self) -> Option<StopReason> {
        self.last_outcome
    }

    pub fn queued_events(&self) -> usize {
        self.shared.queued_events()
    }

    pub fn pending_delayed_events(&self) -> usize {
        self.shared.pending_delayed()
    }

    // =========================================================================
    // Properties and observers
    // =========================================================================

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut PropertyStore {
        &mut self.properties
    }

    pub fn restore_policy(&self) -> RestorePolicy {
        self.restore_policy
    }

    pub fn set_restore_policy(&mut self, policy: RestorePolicy) {
        self.restore_policy = policy;
    }

    pub fn add_observer(&mut self, observer: impl Observer + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn emit(&mut self, notification: Notification) {
        for observer in &mut self.observers {
            observer.notify(&notification);
        }
    }

    // =========================================================================
    // Run loop
    // =========================================================================

    fn initial_targets(&self) -> Option<Vec<StateId>> {
        let root = self.chart.root();
        if self.chart.is_parallel(root) {
            let regions = self.chart.state(root).children();
            (!regions.is_empty()).then(|| regions.to_vec())
        } else {
            self.chart.state(root).initial_state().map(|s| vec![s])
        }
    }

    fn kickoff(&mut self) {
        let Some(targets) = self.initial_targets() else {
            warn!("start aborted: no initial state set for the root state");
            self.shared.abort_start();
            return;
        };
        if !self.shared.begin_run() {
            return;
        }

        for s in std::mem::take(&mut self.configuration) {
            self.emit(Notification::ActiveChanged {
                state: s,
                active: false,
            });
        }
        self.history.clear();
        self.restorables.clear();

        info!(states = self.chart.state_ids().count(), "state machine started");
        self.emit(Notification::Started);
        self.emit(Notification::RunningChanged(true));

        self.macrostep(Some(EnabledTransition::initial(targets)));
    }

    fn macrostep(&mut self, mut initial: Option<EnabledTransition>) {
        let mut changed = false;
        let mut reason = StopReason::EventQueueEmpty;

        loop {
            if self.shared.stop_requested() {
                reason = StopReason::Stopped;
                break;
            }

            let mut cache = CalculationCache::new();
            let mut faults = Faults::default();
            let step = match initial.take() {
                Some(t) => Some((Event::Null, vec![t])),
                None => self.select_step(&mut cache, &mut faults),
            };

            match step {
                Some((event, enabled)) => {
                    changed = true;
                    if self.microstep(&event, &enabled, &mut cache, &mut faults) {
                        reason = StopReason::Finished;
                        break;
                    }
                }
                None => {
                    self.report_errors(faults.take_reports());
                    if self.shared.finish_if_quiescent() {
                        break;
                    }
                }
            }
        }

        if self.shared.stop_requested() {
            reason = StopReason::Stopped;
        }
        if reason != StopReason::EventQueueEmpty {
            self.end_run(reason);
        }
        self.last_outcome = Some(reason);
        self.emit(Notification::MacrostepEnd { changed });
    }

    /// Picks the next batch: a pending jump, then eventless transitions,
    /// then the internal queue, then the external queue.
    fn select_step(
        &mut self,
        cache: &mut CalculationCache,
        faults: &mut Faults,
    ) -> Option<(Event, Vec<EnabledTransition>)> {
        if let Some(target) = self.shared.take_go_to() {
            if let Some(t) = self.go_to_transition(target) {
                return Some((Event::Null, vec![t]));
            }
        }

        let mut resolver = Resolver::new(
            &self.chart,
            &self.configuration,
            &self.history,
            cache,
            faults,
        );

        let null = Event::Null;
        let enabled = resolver.select_transitions(&null);
        if !enabled.is_empty() {
            return Some((null, enabled));
        }

        while let Some(event) = self.shared.dequeue_internal() {
            let enabled = resolver.select_transitions(&event);
            if !enabled.is_empty() {
                return Some((event, enabled));
            }
            debug!(event = %event, "no transition enabled by internal event");
        }

        while let Some(event) = self.shared.dequeue_external() {
            let enabled = resolver.select_transitions(&event);
            if !enabled.is_empty() {
                return Some((event, enabled));
            }
            debug!(event = %event, "no transition enabled by event");
        }

        None
    }

    fn go_to_transition(&self, target: StateId) -> Option<EnabledTransition> {
        if self.chart.check_state(target).is_err() {
            warn!(%target, "go to state ignored: unknown state");
            return None;
        }
        if self.configuration.contains(&target) {
            return None;
        }
        let source = self
            .configuration
            .iter()
            .copied()
            .filter(|s| self.chart.state(*s).is_standard())
            .min_by(|a, b| self.chart.entry_order(*a, *b))
            .unwrap_or_else(|| self.chart.root());
        debug!(target = %self.chart.name(target), "going to state");
        Some(EnabledTransition::go_to(source, target))
    }

    // =========================================================================
    // Microstep
    // =========================================================================

    /// Applies one conflict-free batch. Returns true once the root has
    /// reached a final state.
    fn microstep(
        &mut self,
        event: &Event,
        enabled: &[EnabledTransition],
        cache: &mut CalculationCache,
        faults: &mut Faults,
    ) -> bool {
        self.emit(Notification::MicrostepBegin);
        debug!(event = %event, transitions = enabled.len(), "begin microstep");

        let plan = Resolver::new(
            &self.chart,
            &self.configuration,
            &self.history,
            cache,
            faults,
        )
        .plan(enabled);
        self.report_errors(faults.take_reports());

        let pending = match self.restore_policy {
            RestorePolicy::RestoreProperties => self.restorables.pending_for(&plan.exit),
            RestorePolicy::DontRestoreProperties => HashMap::new(),
        };
        let mut assignments = self.compute_property_assignments(&plan.entry, pending);

        self.exit_states(event, &plan.exit);
        self.execute_transition_content(event, enabled);
        self.enter_states(event, &plan.exit, &plan.entry, &mut assignments);

        debug!(configuration = ?self.active_state_names(), "end microstep");
        self.emit(Notification::MicrostepEnd);
        self.is_in_final_state(self.chart.root())
    }

    /// Entry-time writes per entered state. Saved values of exited states
    /// that nothing re-assigns are restored through the first entered state.
    fn compute_property_assignments(
        &self,
        entry: &[StateId],
        mut pending: HashMap<PropertyKey, Value>,
    ) -> HashMap<StateId, Vec<PropertyAssignment>> {
        let mut assignments: HashMap<StateId, Vec<PropertyAssignment>> = HashMap::new();
        for &s in entry {
            let declared = self.chart.state(s).property_assignments();
            if declared.is_empty() {
                continue;
            }
            if self.restore_policy == RestorePolicy::RestoreProperties {
                for a in declared {
                    pending.remove(&a.key());
                }
            }
            assignments.insert(s, declared.to_vec());
        }

        if !pending.is_empty() {
            let target = entry.first().copied().unwrap_or_else(|| self.chart.root());
            let mut restores: Vec<(PropertyKey, Value)> = pending.into_iter().collect();
            restores.sort_by(|a, b| a.0.cmp(&b.0));
            assignments.entry(target).or_default().extend(
                restores
                    .into_iter()
                    .map(|(key, value)| PropertyAssignment::restore(key, value)),
            );
        }
        assignments
    }

    fn exit_states(&mut self, event: &Event, exit: &[StateId]) {
        self.history.record(&self.chart, exit, &self.configuration);

        for &s in exit {
            debug!(state = %self.chart.name(s), "exiting state");
            if let Some(action) = self.chart.state(s).on_exit().cloned() {
                self.run_action(&action, event, Some(s), None);
            }
            self.configuration.remove(&s);
            self.unregister_transitions(s);
            self.emit(Notification::Exited(s));
            self.emit(Notification::ActiveChanged {
                state: s,
                active: false,
            });
        }
    }

    fn execute_transition_content(&mut self, event: &Event, enabled: &[EnabledTransition]) {
        for t in enabled {
            let Some(id) = t.id() else {
                continue;
            };
            debug!(transition = %id, "triggering transition");
            if let Some(action) = self.chart.transition(id).action().cloned() {
                self.run_action(&action, event, None, Some(id));
            }
            self.emit(Notification::Triggered(id));
        }
    }

    fn enter_states(
        &mut self,
        event: &Event,
        exited: &[StateId],
        entry: &[StateId],
        assignments: &mut HashMap<StateId, Vec<PropertyAssignment>>,
    ) {
        for &s in entry {
            debug!(state = %self.chart.name(s), "entering state");
            self.configuration.insert(s);
            self.register_transitions(s);

            let assigned = assignments.remove(&s).unwrap_or_default();
            self.apply_assignments(s, exited, &assigned);

            if let Some(action) = self.chart.state(s).on_entry().cloned() {
                self.run_action(&action, event, Some(s), None);
            }
            self.emit(Notification::Entered(s));
            self.emit(Notification::ActiveChanged {
                state: s,
                active: true,
            });
            if self.chart.state(s).is_standard() {
                self.emit(Notification::PropertiesAssigned(s));
            }

            if self.chart.is_final(s) {
                self.report_completion(s);
            }
        }

        // Restores with no entered state to carry them.
        let root = self.chart.root();
        if let Some(leftover) = assignments.remove(&root) {
            self.apply_assignments(root, exited, &leftover);
        }
    }

    fn apply_assignments(
        &mut self,
        state: StateId,
        exited: &[StateId],
        assigned: &[PropertyAssignment],
    ) {
        if self.restore_policy == RestorePolicy::RestoreProperties {
            for a in assigned {
                let key = a.key();
                if a.explicitly_set {
                    if !self.restorables.has_restorable(state, &key) {
                        let value = self.restorables.saved_value(exited, &key, &self.properties);
                        self.restorables.unregister(exited, &key);
                        self.restorables.register(state, key, value);
                    }
                } else {
                    self.restorables.unregister(exited, &key);
                }
            }
        }
        for a in assigned {
            self.properties.apply(a);
        }
    }

    /// A final state was entered: its parent is done, and so is a parallel
    /// grandparent whose every region is now done.
    fn report_completion(&mut self, final_state: StateId) {
        let root = self.chart.root();
        let Some(parent) = self.chart.parent(final_state) else {
            return;
        };
        if parent != root {
            self.state_finished(parent);
        }
        if let Some(grandparent) = self.chart.parent(parent) {
            if grandparent != root
                && self.chart.is_parallel(grandparent)
                && self.is_in_final_state(grandparent)
            {
                self.state_finished(grandparent);
            }
        }
    }

    fn state_finished(&mut self, state: StateId) {
        debug!(state = %self.chart.name(state), "state finished");
        self.shared.push_internal(Event::Finished(state));
        self.emit(Notification::StateFinished(state));
    }

    fn run_action(
        &mut self,
        action: &Action,
        event: &Event,
        state: Option<StateId>,
        transition: Option<TransitionId>,
    ) {
        let mut ctx = ActionContext {
            event,
            state,
            transition,
            chart: &self.chart,
            properties: &mut self.properties,
            poster: &self.poster,
        };
        action(&mut ctx);
    }

    fn register_transitions(&self, state: StateId) {
        for &t in self.chart.state(state).transitions() {
            match self.chart.transition(t).event_test() {
                EventTest::Signal { sender, signal } => {
                    self.shared.register_signal(*sender, signal, t)
                }
                EventTest::Filtered { object, kind } => {
                    self.shared.register_filter(*object, kind, t)
                }
                _ => {}
            }
        }
    }

    fn unregister_transitions(&self, state: StateId) {
        for &t in self.chart.state(state).transitions() {
            match self.chart.transition(t).event_test() {
                EventTest::Signal { sender, signal } => {
                    self.shared.unregister_signal(*sender, signal, t)
                }
                EventTest::Filtered { object, kind } => {
                    self.shared.unregister_filter(*object, kind, t)
                }
                _ => {}
            }
        }
    }

    fn report_errors(&mut self, reports: Vec<ErrorReport>) {
        for report in reports {
            let context = self.chart.name(report.context).to_string();
            self.error_string = match report.error {
                MachineError::NoInitialState => {
                    format!("Missing initial state in compound state '{}'", context)
                }
                MachineError::NoDefaultStateInHistoryState => {
                    format!("Missing default state in history state '{}'", context)
                }
                MachineError::NoCommonAncestorForTransition => format!(
                    "No common ancestor for targets and source of transition from state '{}'",
                    context
                ),
            };
            self.error = Some((report.error, report.context));
            self.emit(Notification::Error {
                error: report.error,
                context: report.context,
            });

            match report.error_state {
                Some(error_state) => warn!(
                    error = %self.error_string,
                    error_state = %self.chart.name(error_state),
                    "entering error state"
                ),
                None => {
                    error!(
                        error = %self.error_string,
                        "unrecoverable error detected in running state machine"
                    );
                    self.shared.request_stop();
                }
            }
        }
    }

    fn end_run(&mut self, reason: StopReason) {
        self.shared.cancel_all_delayed();
        self.shared.end_run();
        match reason {
            StopReason::Finished => {
                info!("state machine finished");
                self.emit(Notification::Finished);
            }
            StopReason::Stopped => {
                info!("state machine stopped");
                self.emit(Notification::Stopped);
            }
            StopReason::EventQueueEmpty => {}
        }
        self.emit(Notification::RunningChanged(false));
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("run_state", &self.run_state())
            .field("configuration", &self.configuration)
            .field("error", &self.error)
            .field("last_outcome", &self.last_outcome)
            .finish()
    }
}
