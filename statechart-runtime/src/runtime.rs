//! The owning task and its handle.

use crate::broadcast::{NotificationBroadcaster, NotificationFilter, NotificationSubscription};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::event_loop::{HostMessage, TokioEventLoop};
use parking_lot::Mutex;
use serde_json::Value;
use statechart_core::{
    DelayedEventId, Event, EventPoster, EventPriority, ObjectId, RunState, StateChart,
    StateId, StateMachine, StopReason,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Hosts one interpreter on a dedicated tokio task.
pub struct MachineRuntime {
    config: Config,
    event_loop: Arc<TokioEventLoop>,
    receiver: mpsc::UnboundedReceiver<HostMessage>,
    broadcaster: Arc<NotificationBroadcaster>,
}

impl MachineRuntime {
    /// Creates a runtime bound to the current tokio runtime.
    pub fn new(config: Config) -> Result<Self, RuntimeError> {
        config.validate()?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| RuntimeError::NoReactor(e.to_string()))?;
        let (event_loop, receiver) = TokioEventLoop::new(handle);
        let broadcaster = NotificationBroadcaster::new(config.runtime.notification_capacity);
        Ok(Self {
            config,
            event_loop,
            receiver,
            broadcaster,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The host loop machines spawned on this runtime must be created with.
    pub fn event_loop(&self) -> Arc<TokioEventLoop> {
        Arc::clone(&self.event_loop)
    }

    pub fn broadcaster(&self) -> Arc<NotificationBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    /// Creates an interpreter for `chart`, configured from this runtime.
    pub fn machine(&self, chart: StateChart) -> StateMachine {
        let mut machine = StateMachine::new(chart, self.event_loop());
        machine.set_restore_policy(self.config.machine.restore_policy);
        machine
    }

    /// Moves the machine onto its owning task.
    ///
    /// The machine must have been created with [`event_loop`](Self::event_loop),
    /// for instance through [`machine`](Self::machine).
    pub fn spawn(self, mut machine: StateMachine) -> MachineHandle {
        machine.add_observer(self.broadcaster.observer(machine.chart()));

        let poster = machine.poster();
        let sender = self.event_loop.sender();
        let exit_on_finish = self.config.runtime.exit_on_finish;
        let task = tokio::spawn(run_owner(
            machine,
            self.receiver,
            Arc::clone(&self.event_loop),
            exit_on_finish,
        ));

        MachineHandle {
            poster,
            sender,
            broadcaster: self.broadcaster,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

async fn run_owner(
    mut machine: StateMachine,
    mut receiver: mpsc::UnboundedReceiver<HostMessage>,
    event_loop: Arc<TokioEventLoop>,
    exit_on_finish: bool,
) -> StateMachine {
    info!("machine runtime started");
    while let Some(message) = receiver.recv().await {
        let scope = event_loop.enter_owner();
        match message {
            HostMessage::Task(task) => machine.run_task(task),
            HostMessage::TimerFired(timer) => machine.timer_fired(timer),
            HostMessage::Inspect(f) => f(&mut machine),
            HostMessage::Shutdown => {
                debug!("shutdown requested");
                break;
            }
        }
        drop(scope);

        if exit_on_finish
            && machine.run_state() == RunState::NotRunning
            && matches!(
                machine.last_outcome(),
                Some(StopReason::Finished | StopReason::Stopped)
            )
        {
            debug!(outcome = ?machine.last_outcome(), "run ended, leaving owning task");
            break;
        }
    }

    event_loop.kill_all_timers();
    info!("machine runtime stopped");
    machine
}

/// Cloneable handle to a spawned machine. Usable from any task or thread.
#[derive(Clone)]
pub struct MachineHandle {
    poster: EventPoster,
    sender: mpsc::UnboundedSender<HostMessage>,
    broadcaster: Arc<NotificationBroadcaster>,
    task: Arc<Mutex<Option<JoinHandle<StateMachine>>>>,
}

impl MachineHandle {
    /// Starts the machine and waits until the initial configuration is entered.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.query(|m| m.start()).await??;
        // The kickoff was queued behind the start; this query runs after it.
        self.query(|_| ()).await
    }

    pub fn stop(&self) {
        self.poster.stop();
    }

    pub fn run_state(&self) -> RunState {
        self.poster.run_state()
    }

    pub fn is_running(&self) -> bool {
        self.poster.is_running()
    }

    pub fn post_event(&self, event: Event, priority: EventPriority) -> Result<(), RuntimeError> {
        Ok(self.poster.post_event(event, priority)?)
    }

    pub fn post_delayed_event(
        &self,
        event: Event,
        delay: Duration,
    ) -> Result<DelayedEventId, RuntimeError> {
        Ok(self.poster.post_delayed_event(event, delay)?)
    }

    pub fn cancel_delayed_event(&self, id: DelayedEventId) -> bool {
        self.poster.cancel_delayed_event(id)
    }

    pub fn emit_signal(&self, sender: ObjectId, signal: &str, args: Vec<Value>) -> bool {
        self.poster.emit_signal(sender, signal, args)
    }

    pub fn filter_event(&self, object: ObjectId, kind: &str, payload: Value) -> bool {
        self.poster.filter_event(object, kind, payload)
    }

    pub fn go_to_state(&self, target: StateId) {
        self.poster.go_to_state(target);
    }

    /// The event-posting handle, for embedding in callbacks.
    pub fn poster(&self) -> EventPoster {
        self.poster.clone()
    }

    /// Runs `f` on the owning task between processing turns.
    pub async fn query<T, F>(&self, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce(&mut StateMachine) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HostMessage::Inspect(Box::new(move |machine| {
                let _ = tx.send(f(machine));
            })))
            .map_err(|_| RuntimeError::ShutDown)?;
        rx.await.map_err(|_| RuntimeError::ShutDown)
    }

    /// Active states.
    pub async fn configuration(&self) -> Result<BTreeSet<StateId>, RuntimeError> {
        self.query(|m| m.configuration().clone()).await
    }

    /// Active state names in entry order.
    pub async fn active_state_names(&self) -> Result<Vec<String>, RuntimeError> {
        self.query(|m| {
            m.active_state_names()
                .into_iter()
                .map(str::to_string)
                .collect()
        })
        .await
    }

    /// The last run-time error and its message, if any.
    pub async fn last_error(&self) -> Result<Option<(String, String)>, RuntimeError> {
        self.query(|m| {
            m.error()
                .map(|e| (e.error_code().to_string(), m.error_string().to_string()))
        })
        .await
    }

    pub fn subscribe(&self, filter: NotificationFilter) -> NotificationSubscription {
        self.broadcaster.subscribe(filter)
    }

    /// Asks the owning task to end after the message it is handling.
    pub fn shutdown(&self) {
        let _ = self.sender.send(HostMessage::Shutdown);
    }

    /// Waits for the owning task to end and takes the machine back.
    pub async fn join(&self) -> Result<StateMachine, RuntimeError> {
        let task = self.task.lock().take().ok_or(RuntimeError::ShutDown)?;
        task.await.map_err(|_| RuntimeError::ShutDown)
    }
}

impl std::fmt::Debug for MachineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineHandle")
            .field("run_state", &self.run_state())
            .field("subscriptions", &self.broadcaster.subscription_count())
            .finish()
    }
}
