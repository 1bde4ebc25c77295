//! Notifications emitted by the interpreter.

use crate::error::MachineError;
use crate::model::{StateId, TransitionId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Everything the interpreter reports to its observers, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The initial configuration is about to be entered.
    Started,
    /// A run ended because of a stop request or an unrecoverable error.
    Stopped,
    /// A run ended because the root reached a final state.
    Finished,
    RunningChanged(bool),
    Entered(StateId),
    Exited(StateId),
    ActiveChanged { state: StateId, active: bool },
    Triggered(TransitionId),
    /// A compound state's final child, or all of a parallel state's
    /// regions, became active.
    StateFinished(StateId),
    /// A standard state finished writing its entry-time properties.
    PropertiesAssigned(StateId),
    MicrostepBegin,
    MicrostepEnd,
    /// A processing turn reached quiescence or ended the run.
    MacrostepEnd { changed: bool },
    Error { error: MachineError, context: StateId },
}

impl Notification {
    /// The state a notification is about, if any.
    pub fn state(&self) -> Option<StateId> {
        match self {
            Notification::Entered(s)
            | Notification::Exited(s)
            | Notification::StateFinished(s)
            | Notification::PropertiesAssigned(s)
            | Notification::ActiveChanged { state: s, .. }
            | Notification::Error { context: s, .. } => Some(*s),
            _ => None,
        }
    }

    /// Short name used in logs and subscription filters.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Started => "started",
            Notification::Stopped => "stopped",
            Notification::Finished => "finished",
            Notification::RunningChanged(_) => "running_changed",
            Notification::Entered(_) => "entered",
            Notification::Exited(_) => "exited",
            Notification::ActiveChanged { .. } => "active_changed",
            Notification::Triggered(_) => "triggered",
            Notification::StateFinished(_) => "state_finished",
            Notification::PropertiesAssigned(_) => "properties_assigned",
            Notification::MicrostepBegin => "microstep_begin",
            Notification::MicrostepEnd => "microstep_end",
            Notification::MacrostepEnd { .. } => "macrostep_end",
            Notification::Error { .. } => "error",
        }
    }
}

/// Receives notifications on the thread running the interpreter.
pub trait Observer: Send {
    fn notify(&mut self, notification: &Notification);
}

impl<F> Observer for F
where
    F: FnMut(&Notification) + Send,
{
    fn notify(&mut self, notification: &Notification) {
        self(notification)
    }
}

/// Observer that keeps every notification, shareable across threads.
#[derive(Debug, Clone, Default)]
pub struct NotificationLog {
    entries: Arc<Mutex<Vec<Notification>>>,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything recorded so far.
    pub fn entries(&self) -> Vec<Notification> {
        self.entries.lock().clone()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Recorded notifications other than step markers.
    pub fn significant(&self) -> Vec<Notification> {
        self.entries
            .lock()
            .iter()
            .filter(|n| {
                !matches!(
                    n,
                    Notification::MicrostepBegin
                        | Notification::MicrostepEnd
                        | Notification::MacrostepEnd { .. }
                )
            })
            .cloned()
            .collect()
    }
}

impl Observer for NotificationLog {
    fn notify(&mut self, notification: &Notification) {
        self.entries.lock().push(notification.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_records_in_order() {
        let log = NotificationLog::new();
        let mut observer = log.clone();
        observer.notify(&Notification::Started);
        observer.notify(&Notification::MicrostepBegin);
        observer.notify(&Notification::Entered(StateId(1)));

        assert_eq!(log.entries().len(), 3);
        assert_eq!(
            log.significant(),
            vec![Notification::Started, Notification::Entered(StateId(1))]
        );
        assert_eq!(log.take().len(), 3);
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_closure_observer() {
        let mut count = 0;
        {
            let mut observer = |n: &Notification| {
                if n.kind() == "entered" {
                    count += 1;
                }
            };
            observer.notify(&Notification::Entered(StateId(2)));
            observer.notify(&Notification::Started);
        }
        assert_eq!(count, 1);
        assert_eq!(Notification::Exited(StateId(4)).state(), Some(StateId(4)));
    }
}
