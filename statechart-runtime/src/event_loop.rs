//! Tokio-backed host loop.
//!
//! Tasks and timer expiries travel over an unbounded channel to the owning
//! task, which is the only place the interpreter runs. Tokio may move that
//! task between worker threads, so "owner thread" means "inside a message
//! handler of the owning task", tracked with a thread-local scope marker.

use parking_lot::Mutex;
use statechart_core::{EventLoop, LoopTask, StateMachine, TimerId};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

thread_local! {
    static OWNER_SCOPE: Cell<Option<Uuid>> = const { Cell::new(None) };
}

/// Work delivered to the owning task.
pub(crate) enum HostMessage {
    Task(LoopTask),
    TimerFired(TimerId),
    /// Runs a closure against the machine between processing turns.
    Inspect(Box<dyn FnOnce(&mut StateMachine) + Send>),
    Shutdown,
}

/// [`EventLoop`] implementation for a tokio owning task.
pub struct TokioEventLoop {
    id: Uuid,
    sender: mpsc::UnboundedSender<HostMessage>,
    timers: Arc<Mutex<HashMap<TimerId, AbortHandle>>>,
    next_timer: AtomicU64,
    handle: Handle,
}

impl TokioEventLoop {
    pub(crate) fn new(handle: Handle) -> (Arc<Self>, mpsc::UnboundedReceiver<HostMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let event_loop = Arc::new(Self {
            id: Uuid::new_v4(),
            sender,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_timer: AtomicU64::new(0),
            handle,
        });
        (event_loop, receiver)
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<HostMessage> {
        self.sender.clone()
    }

    /// Marks the current thread as the owner until the guard drops.
    pub(crate) fn enter_owner(&self) -> OwnerScope {
        let previous = OWNER_SCOPE.with(|scope| scope.replace(Some(self.id)));
        OwnerScope { previous }
    }

    pub(crate) fn kill_all_timers(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }

    pub fn active_timers(&self) -> usize {
        self.timers.lock().len()
    }
}

impl EventLoop for TokioEventLoop {
    fn post_task(&self, task: LoopTask) {
        if self.sender.send(HostMessage::Task(task)).is_err() {
            debug!("task dropped: owning task has ended");
        }
    }

    fn start_timer(&self, delay: Duration) -> TimerId {
        let id = TimerId(self.next_timer.fetch_add(1, Ordering::Relaxed) + 1);
        let sender = self.sender.clone();
        let timers = Arc::clone(&self.timers);

        // Held across the spawn so the expiry cannot remove the entry first.
        let mut pending = self.timers.lock();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            timers.lock().remove(&id);
            let _ = sender.send(HostMessage::TimerFired(id));
        });
        pending.insert(id, task.abort_handle());
        id
    }

    fn kill_timer(&self, timer: TimerId) {
        if let Some(handle) = self.timers.lock().remove(&timer) {
            handle.abort();
        }
    }

    fn is_owner_thread(&self) -> bool {
        OWNER_SCOPE.with(|scope| scope.get() == Some(self.id))
    }
}

/// Restores the previous owner marker on drop.
pub(crate) struct OwnerScope {
    previous: Option<Uuid>,
}

impl Drop for OwnerScope {
    fn drop(&mut self) {
        OWNER_SCOPE.with(|scope| scope.set(self.previous));
    }
}
