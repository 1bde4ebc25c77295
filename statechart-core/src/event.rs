//! Events consumed by the interpreter.

use crate::model::StateId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identity of a host object: a property holder, a signal sender or an
/// event-filter target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Queue selection for posted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Appended to the external queue.
    #[default]
    Normal,
    /// Appended to the internal queue, drained before the external one.
    High,
}

/// An event. Immutable once constructed; the queue owns it until dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Synthetic event used to test eventless transitions.
    Null,
    /// A caller-defined event.
    Named { name: String, payload: Value },
    /// A registered signal emitted by a host object.
    Signal {
        sender: ObjectId,
        signal: String,
        args: Vec<Value>,
    },
    /// A host event captured by a registered event filter.
    Wrapped {
        object: ObjectId,
        kind: String,
        payload: Value,
    },
    /// Raised internally when a compound or parallel state completes.
    Finished(StateId),
}

impl Event {
    /// Creates a named event without payload.
    pub fn named(name: impl Into<String>) -> Self {
        Event::Named {
            name: name.into(),
            payload: Value::Null,
        }
    }

    /// Creates a named event carrying a payload.
    pub fn with_payload(name: impl Into<String>, payload: Value) -> Self {
        Event::Named {
            name: name.into(),
            payload,
        }
    }

    /// Returns the name of a named event.
    pub fn name(&self) -> Option<&str> {
        match self {
            Event::Named { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns the payload attached to the event, if any.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Event::Named { payload, .. } | Event::Wrapped { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Event::Null)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Null => f.write_str("<null>"),
            Event::Named { name, .. } => write!(f, "{}", name),
            Event::Signal { sender, signal, .. } => write!(f, "{}::{}", sender, signal),
            Event::Wrapped { object, kind, .. } => write!(f, "{}[{}]", object, kind),
            Event::Finished(state) => write!(f, "finished({})", state),
        }
    }
}
