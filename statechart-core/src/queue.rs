//! State shared with foreign threads.
//!
//! Event queues, the delayed-event table, transition registrations and the
//! run-state flags each sit behind their own lock. Everything else the
//! interpreter owns is only touched on the owning thread.

use crate::error::CoreError;
use crate::event::{Event, EventPriority, ObjectId};
use crate::host::{EventLoop, LoopTask, TimerId};
use crate::model::{StateId, TransitionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Run state of an interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    NotRunning,
    /// `start` was called; the kickoff task has not run yet.
    Starting,
    Running,
}

/// Handle returned for a delayed event; valid until it fires or is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelayedEventId(pub u32);

impl fmt::Display for DelayedEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delayed#{}", self.0)
    }
}

/// Hands out the smallest free id.
#[derive(Debug, Default)]
struct IdAllocator {
    next: u32,
    free: BTreeSet<u32>,
}

impl IdAllocator {
    fn next(&mut self) -> u32 {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    fn release(&mut self, id: u32) {
        self.free.insert(id);
    }
}

#[derive(Debug)]
struct DelayedEntry {
    event: Event,
    /// `None` until the owning thread has started the timer.
    timer: Option<TimerId>,
}

#[derive(Debug, Default)]
struct DelayedEvents {
    ids: IdAllocator,
    entries: HashMap<DelayedEventId, DelayedEntry>,
    by_timer: HashMap<TimerId, DelayedEventId>,
}

#[derive(Debug, Default)]
struct Lifecycle {
    run_state: RunState,
    stop_requested: bool,
    processing: bool,
    processing_scheduled: bool,
}

type Registrations = HashMap<(ObjectId, String), BTreeSet<TransitionId>>;

pub(crate) struct Shared {
    event_loop: Arc<dyn EventLoop>,
    lifecycle: Mutex<Lifecycle>,
    internal: Mutex<VecDeque<Event>>,
    external: Mutex<VecDeque<Event>>,
    delayed: Mutex<DelayedEvents>,
    signals: Mutex<Registrations>,
    filters: Mutex<Registrations>,
    go_to: Mutex<Option<StateId>>,
}

impl Shared {
    pub fn new(event_loop: Arc<dyn EventLoop>) -> Self {
        Self {
            event_loop,
            lifecycle: Mutex::new(Lifecycle::default()),
            internal: Mutex::new(VecDeque::new()),
            external: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(DelayedEvents::default()),
            signals: Mutex::new(HashMap::new()),
            filters: Mutex::new(HashMap::new()),
            go_to: Mutex::new(None),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn run_state(&self) -> RunState {
        self.lifecycle.lock().run_state
    }

    /// Moves `NotRunning` to `Starting` and queues the kickoff.
    pub fn request_start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.run_state {
            RunState::NotRunning => {
                lifecycle.run_state = RunState::Starting;
                drop(lifecycle);
                debug!("state machine starting");
                self.event_loop.post_task(LoopTask::Start);
            }
            RunState::Starting => {}
            RunState::Running => warn!("start ignored: state machine already running"),
        }
    }

    /// Asks a run to end at the next loop checkpoint.
    pub fn request_stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.run_state {
            RunState::NotRunning => {}
            RunState::Starting => lifecycle.stop_requested = true,
            RunState::Running => {
                lifecycle.stop_requested = true;
                drop(lifecycle);
                self.schedule_processing();
            }
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.lifecycle.lock().stop_requested
    }

    /// Kickoff: `Starting` becomes `Running` with processing in progress.
    pub fn begin_run(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.run_state != RunState::Starting {
            return false;
        }
        lifecycle.run_state = RunState::Running;
        lifecycle.processing = true;
        true
    }

    /// Abandons a kickoff that cannot enter an initial configuration.
    pub fn abort_start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.run_state = RunState::NotRunning;
        lifecycle.stop_requested = false;
    }

    /// Ends the run: back to `NotRunning`, with queues, registrations and the
    /// pending jump dropped.
    pub fn end_run(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.run_state = RunState::NotRunning;
            lifecycle.stop_requested = false;
            lifecycle.processing = false;
            lifecycle.processing_scheduled = false;
        }
        self.internal.lock().clear();
        self.external.lock().clear();
        self.signals.lock().clear();
        self.filters.lock().clear();
        *self.go_to.lock() = None;
    }

    /// Queues a processing turn unless one is running or already queued.
    pub fn schedule_processing(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.run_state != RunState::Running
                || lifecycle.processing
                || lifecycle.processing_scheduled
            {
                return;
            }
            lifecycle.processing_scheduled = true;
        }
        self.event_loop.post_task(LoopTask::Process);
    }

    /// Claims the processing turn for a queued `Process` task.
    pub fn begin_scheduled_processing(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.processing_scheduled = false;
        if lifecycle.run_state != RunState::Running || lifecycle.processing {
            return false;
        }
        lifecycle.processing = true;
        true
    }

    /// Claims the processing turn for direct processing on the owning
    /// thread. Defers to an already queued turn.
    pub fn begin_direct_processing(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.run_state != RunState::Running
            || lifecycle.processing
            || lifecycle.processing_scheduled
        {
            return false;
        }
        lifecycle.processing = true;
        true
    }

    /// Releases the processing turn if nothing is left to do. Checked under
    /// the lifecycle lock so a concurrent post either lands before the check
    /// or sees processing released and schedules a new turn.
    pub fn finish_if_quiescent(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let idle = self.internal.lock().is_empty()
            && self.external.lock().is_empty()
            && self.go_to.lock().is_none();
        if idle {
            lifecycle.processing = false;
        }
        idle
    }

    // =========================================================================
    // Queues
    // =========================================================================

    pub fn post_event(&self, event: Event, priority: EventPriority) -> Result<(), CoreError> {
        match self.run_state() {
            RunState::Running | RunState::Starting => {}
            RunState::NotRunning => {
                warn!(event = %event, "cannot post event when the state machine is not running");
                return Err(CoreError::NotRunning);
            }
        }
        debug!(event = %event, ?priority, "posting event");
        match priority {
            EventPriority::Normal => self.external.lock().push_back(event),
            EventPriority::High => self.internal.lock().push_back(event),
        }
        self.schedule_processing();
        Ok(())
    }

    pub fn push_internal(&self, event: Event) {
        self.internal.lock().push_back(event);
    }

    pub fn push_external(&self, event: Event) {
        self.external.lock().push_back(event);
    }

    pub fn dequeue_internal(&self) -> Option<Event> {
        self.internal.lock().pop_front()
    }

    pub fn dequeue_external(&self) -> Option<Event> {
        self.external.lock().pop_front()
    }

    pub fn queued_events(&self) -> usize {
        self.internal.lock().len() + self.external.lock().len()
    }

    // =========================================================================
    // Delayed events
    // =========================================================================

    pub fn post_delayed_event(
        &self,
        event: Event,
        delay: Duration,
    ) -> Result<DelayedEventId, CoreError> {
        if self.run_state() != RunState::Running {
            warn!(event = %event, "cannot post delayed event when the state machine is not running");
            return Err(CoreError::NotRunning);
        }

        let mut delayed = self.delayed.lock();
        let id = DelayedEventId(delayed.ids.next());
        let timer = if self.event_loop.is_owner_thread() {
            let timer = self.event_loop.start_timer(delay);
            delayed.by_timer.insert(timer, id);
            Some(timer)
        } else {
            self.event_loop
                .post_task(LoopTask::StartDelayedTimer { id, delay });
            None
        };
        debug!(event = %event, %id, delay_ms = delay.as_millis() as u64, "posting delayed event");
        delayed.entries.insert(id, DelayedEntry { event, timer });
        Ok(id)
    }

    /// Returns false if the event already fired, was cancelled, or was never posted.
    pub fn cancel_delayed_event(&self, id: DelayedEventId) -> bool {
        if self.run_state() != RunState::Running {
            warn!(%id, "cannot cancel delayed event when the state machine is not running");
            return false;
        }

        let mut delayed = self.delayed.lock();
        let Some(entry) = delayed.entries.remove(&id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            delayed.by_timer.remove(&timer);
            if self.event_loop.is_owner_thread() {
                self.event_loop.kill_timer(timer);
                delayed.ids.release(id.0);
            } else {
                self.event_loop
                    .post_task(LoopTask::KillDelayedTimer { id, timer });
            }
        }
        // Without a timer, the pending start task notices the cancellation
        // and releases the id.
        debug!(%id, "cancelled delayed event");
        true
    }

    /// Owning thread: starts the timer of an event posted from elsewhere.
    pub fn start_delayed_timer(&self, id: DelayedEventId, delay: Duration) {
        let mut delayed = self.delayed.lock();
        if delayed.entries.contains_key(&id) {
            let timer = self.event_loop.start_timer(delay);
            delayed.by_timer.insert(timer, id);
            if let Some(entry) = delayed.entries.get_mut(&id) {
                entry.timer = Some(timer);
            }
        } else {
            delayed.ids.release(id.0);
        }
    }

    /// Owning thread: kills the timer of an event cancelled from elsewhere.
    pub fn kill_delayed_timer(&self, id: DelayedEventId, timer: TimerId) {
        self.event_loop.kill_timer(timer);
        self.delayed.lock().ids.release(id.0);
    }

    /// Owning thread: takes the event behind an expired timer.
    pub fn take_fired(&self, timer: TimerId) -> Option<(DelayedEventId, Event)> {
        let mut delayed = self.delayed.lock();
        let id = delayed.by_timer.remove(&timer)?;
        let entry = delayed.entries.remove(&id)?;
        delayed.ids.release(id.0);
        Some((id, entry.event))
    }

    /// Owning thread: drops every delayed event when a run ends.
    pub fn cancel_all_delayed(&self) {
        let mut delayed = self.delayed.lock();
        let entries: Vec<(DelayedEventId, DelayedEntry)> = delayed.entries.drain().collect();
        for (id, entry) in entries {
            if let Some(timer) = entry.timer {
                delayed.by_timer.remove(&timer);
                self.event_loop.kill_timer(timer);
                delayed.ids.release(id.0);
            }
        }
    }

    pub fn pending_delayed(&self) -> usize {
        self.delayed.lock().entries.len()
    }

    // =========================================================================
    // Signal and event-filter registrations
    // =========================================================================

    pub fn register_signal(&self, sender: ObjectId, signal: &str, transition: TransitionId) {
        self.signals
            .lock()
            .entry((sender, signal.to_string()))
            .or_default()
            .insert(transition);
    }

    pub fn unregister_signal(&self, sender: ObjectId, signal: &str, transition: TransitionId) {
        unregister(&mut self.signals.lock(), (sender, signal.to_string()), transition);
    }

    pub fn register_filter(&self, object: ObjectId, kind: &str, transition: TransitionId) {
        self.filters
            .lock()
            .entry((object, kind.to_string()))
            .or_default()
            .insert(transition);
    }

    pub fn unregister_filter(&self, object: ObjectId, kind: &str, transition: TransitionId) {
        unregister(&mut self.filters.lock(), (object, kind.to_string()), transition);
    }

    fn is_registered(registrations: &Mutex<Registrations>, object: ObjectId, name: &str) -> bool {
        registrations
            .lock()
            .get(&(object, name.to_string()))
            .map_or(false, |transitions| !transitions.is_empty())
    }

    pub fn emit_signal(&self, sender: ObjectId, signal: &str, args: Vec<Value>) -> bool {
        if self.run_state() != RunState::Running
            || !Self::is_registered(&self.signals, sender, signal)
        {
            return false;
        }
        self.push_internal(Event::Signal {
            sender,
            signal: signal.to_string(),
            args,
        });
        self.schedule_processing();
        true
    }

    pub fn filter_event(&self, object: ObjectId, kind: &str, payload: Value) -> bool {
        if self.run_state() != RunState::Running
            || !Self::is_registered(&self.filters, object, kind)
        {
            return false;
        }
        self.push_internal(Event::Wrapped {
            object,
            kind: kind.to_string(),
            payload,
        });
        self.schedule_processing();
        true
    }

    // =========================================================================
    // Imperative jumps
    // =========================================================================

    pub fn request_go_to(&self, target: StateId) {
        if self.run_state() != RunState::Running {
            warn!(%target, "cannot go to state when the state machine is not running");
            return;
        }
        *self.go_to.lock() = Some(target);
        self.schedule_processing();
    }

    pub fn take_go_to(&self) -> Option<StateId> {
        self.go_to.lock().take()
    }
}

fn unregister(registrations: &mut Registrations, key: (ObjectId, String), transition: TransitionId) {
    if let Some(transitions) = registrations.get_mut(&key) {
        transitions.remove(&transition);
        if transitions.is_empty() {
            registrations.remove(&key);
        }
    }
}

/// Cloneable, thread-safe handle for feeding an interpreter.
///
/// Every method may be called from any thread. Work is queued and picked up
/// by the owning thread on its next processing turn.
#[derive(Clone)]
pub struct EventPoster {
    shared: Arc<Shared>,
}

impl EventPoster {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn run_state(&self) -> RunState {
        self.shared.run_state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.run_state() == RunState::Running
    }

    pub fn start(&self) {
        self.shared.request_start();
    }

    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Queues an event: `High` goes to the internal queue, `Normal` to the
    /// external one.
    pub fn post_event(&self, event: Event, priority: EventPriority) -> Result<(), CoreError> {
        self.shared.post_event(event, priority)
    }

    /// Posts `event` to the external queue once `delay` has elapsed.
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

    /// Emits a host signal. Returns false unless an active state has a
    /// transition bound to it.
    pub fn emit_signal(&self, sender: ObjectId, signal: &str, args: Vec<Value>) -> bool {
        self.shared.emit_signal(sender, signal, args)
    }

    /// Offers a host event to the registered filters. Returns false unless
    /// an active state has a transition bound to it.
    pub fn filter_event(&self, object: ObjectId, kind: &str, payload: Value) -> bool {
        self.shared.filter_event(object, kind, payload)
    }

    /// Requests a jump to `target`; the latest request wins.
    pub fn go_to_state(&self, target: StateId) {
        self.shared.request_go_to(target);
    }

    /// Internal event from a callback; the running turn picks it up.
    pub(crate) fn raise(&self, event: Event) {
        self.shared.push_internal(event);
    }
}

impl fmt::Debug for EventPoster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPoster")
            .field("run_state", &self.run_state())
            .finish()
    }
}
