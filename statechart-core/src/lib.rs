//! # statechart-core
//!
//! Hierarchical state machine interpreter.
//!
//! This crate provides:
//! - The state graph (atomic, compound, parallel, final and history states)
//! - Transition selection with conflict removal
//! - Exit and entry set computation, history and error-state recovery
//! - Event queues, delayed events and the run loop, driven by a host [`EventLoop`]
//! - Entry-time property assignments with optional restore on exit

pub mod cache;
mod entry_exit;
pub mod error;
pub mod event;
pub mod history;
pub mod host;
pub mod machine;
pub mod model;
pub mod notify;
pub mod property;
pub mod queue;
mod select;

pub use cache::{CalculationCache, EnabledTransition, TransitionKey};
pub use error::{CoreError, MachineError};
pub use event::{Event, EventPriority, ObjectId};
pub use history::HistoryTable;
pub use host::{EventLoop, LoopTask, ManualEventLoop, TimerId};
pub use machine::{ActionContext, StateMachine, StopReason};
pub use model::{
    Action, EventTest, Guard, HistoryType, State, StateChart, StateId, StateKind, Transition,
    TransitionId, TransitionType,
};
pub use notify::{Notification, NotificationLog, Observer};
pub use property::{PropertyAssignment, PropertyKey, PropertyStore, RestorePolicy};
pub use queue::{DelayedEventId, EventPoster, RunState};
