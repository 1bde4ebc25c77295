//! Host event loop abstraction.
//!
//! The interpreter never blocks and never spawns threads. Whatever drives it
//! implements [`EventLoop`]: it runs queued [`LoopTask`]s on the owning
//! thread by calling [`StateMachine::run_task`], and reports expired timers
//! through [`StateMachine::timer_fired`].

use crate::machine::StateMachine;
use crate::queue::DelayedEventId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Handle of a host timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Work the interpreter asks to run later on the owning thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopTask {
    /// Enter the initial configuration and begin processing.
    Start,
    /// Run one processing turn.
    Process,
    /// Start the timer of a delayed event posted from another thread.
    StartDelayedTimer { id: DelayedEventId, delay: Duration },
    /// Kill the timer of a delayed event cancelled from another thread.
    KillDelayedTimer { id: DelayedEventId, timer: TimerId },
}

/// The host loop an interpreter is bound to.
pub trait EventLoop: Send + Sync {
    /// Queues a task for the owning thread.
    fn post_task(&self, task: LoopTask);

    /// Starts a one-shot timer. When it expires the host calls
    /// [`StateMachine::timer_fired`] on the owning thread.
    fn start_timer(&self, delay: Duration) -> TimerId;

    /// Stops a timer. Unknown or expired timers are ignored.
    fn kill_timer(&self, timer: TimerId);

    /// True when called from the thread that runs the interpreter.
    fn is_owner_thread(&self) -> bool;
}

#[derive(Debug, Default)]
struct ManualState {
    tasks: VecDeque<LoopTask>,
    timers: BTreeMap<TimerId, Duration>,
    now: Duration,
    next_timer: u64,
}

/// Deterministic single-threaded loop with a virtual clock.
///
/// Nothing happens until the embedder calls [`run_pending`](Self::run_pending)
/// or [`advance`](Self::advance).
#[derive(Debug)]
pub struct ManualEventLoop {
    owner: ThreadId,
    state: Mutex<ManualState>,
}

impl ManualEventLoop {
    /// Creates a loop owned by the calling thread.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            state: Mutex::new(ManualState::default()),
        })
    }

    /// Runs queued tasks, including tasks queued while running, until none
    /// are left. Returns the number of tasks run.
    pub fn run_pending(&self, machine: &mut StateMachine) -> usize {
        let mut count = 0;
        loop {
            let task = self.state.lock().tasks.pop_front();
            match task {
                Some(task) => {
                    machine.run_task(task);
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Moves the virtual clock forward, firing every timer that expires on
    /// the way in deadline order and running the tasks each one queues.
    pub fn advance(&self, by: Duration, machine: &mut StateMachine) {
        self.run_pending(machine);
        let target = self.state.lock().now + by;
        loop {
            let due = {
                let mut state = self.state.lock();
                let next = state
                    .timers
                    .iter()
                    .filter(|(_, deadline)| **deadline <= target)
                    .min_by_key(|(id, deadline)| (**deadline, **id))
                    .map(|(id, deadline)| (*id, *deadline));
                if let Some((id, deadline)) = next {
                    state.timers.remove(&id);
                    state.now = deadline;
                }
                next
            };
            match due {
                Some((timer, _)) => {
                    machine.timer_fired(timer);
                    self.run_pending(machine);
                }
                None => break,
            }
        }
        self.state.lock().now = target;
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    pub fn pending_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn active_timers(&self) -> usize {
        self.state.lock().timers.len()
    }
}

impl EventLoop for ManualEventLoop {
    fn post_task(&self, task: LoopTask) {
        self.state.lock().tasks.push_back(task);
    }

    fn start_timer(&self, delay: Duration) -> TimerId {
        let mut state = self.state.lock();
        state.next_timer += 1;
        let id = TimerId(state.next_timer);
        let deadline = state.now + delay;
        state.timers.insert(id, deadline);
        id
    }

    fn kill_timer(&self, timer: TimerId) {
        self.state.lock().timers.remove(&timer);
    }

    fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}
