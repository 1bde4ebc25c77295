//! Host property store and restore bookkeeping.
//!
//! States may carry property assignments that are written when the state is
//! entered. Under [`RestorePolicy::RestoreProperties`] the value a property had
//! before its first assignment is saved against the assigning state and
//! written back once that state exits without another state taking the
//! property over.

use crate::event::ObjectId;
use crate::model::StateId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Key of a single property on a host object.
pub type PropertyKey = (ObjectId, String);

/// Global policy for properties assigned on state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestorePolicy {
    /// Assigned values stay in place when the assigning state exits.
    #[default]
    #[serde(rename = "dont_restore")]
    DontRestoreProperties,
    /// Previous values are written back when the assigning state exits.
    #[serde(rename = "restore")]
    RestoreProperties,
}

/// One property write performed when a state is entered.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyAssignment {
    pub object: ObjectId,
    pub name: String,
    pub value: Value,
    /// False for writes that restore a previously saved value.
    pub explicitly_set: bool,
}

impl PropertyAssignment {
    pub fn explicit(object: ObjectId, name: impl Into<String>, value: Value) -> Self {
        Self {
            object,
            name: name.into(),
            value,
            explicitly_set: true,
        }
    }

    pub(crate) fn restore(key: PropertyKey, value: Value) -> Self {
        Self {
            object: key.0,
            name: key.1,
            value,
            explicitly_set: false,
        }
    }

    pub fn key(&self) -> PropertyKey {
        (self.object, self.name.clone())
    }
}

/// Property values attached to host objects.
#[derive(Debug, Clone, Default)]
pub struct PropertyStore {
    values: HashMap<PropertyKey, Value>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, object: ObjectId, name: &str) -> Option<&Value> {
        self.values.get(&(object, name.to_string()))
    }

    /// Writes a property, returning the previous value.
    pub fn set(&mut self, object: ObjectId, name: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert((object, name.into()), value)
    }

    pub fn remove(&mut self, object: ObjectId, name: &str) -> Option<Value> {
        self.values.remove(&(object, name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PropertyKey, &Value)> {
        self.values.iter()
    }

    /// Current value of a property. Unset properties read as `null`.
    pub(crate) fn current(&self, key: &PropertyKey) -> Value {
        self.values.get(key).cloned().unwrap_or(Value::Null)
    }

    pub(crate) fn apply(&mut self, assignment: &PropertyAssignment) {
        self.values
            .insert(assignment.key(), assignment.value.clone());
    }
}

/// Saved pre-assignment values, attributed to the state whose entry saved them.
#[derive(Debug, Default)]
pub(crate) struct RestorableRegistry {
    by_state: HashMap<StateId, HashMap<PropertyKey, Value>>,
}

impl RestorableRegistry {
    pub fn has_restorable(&self, state: StateId, key: &PropertyKey) -> bool {
        self.by_state
            .get(&state)
            .map_or(false, |saved| saved.contains_key(key))
    }

    /// Saves `value` for `state` unless one is already saved.
    pub fn register(&mut self, state: StateId, key: PropertyKey, value: Value) {
        self.by_state
            .entry(state)
            .or_default()
            .entry(key)
            .or_insert(value);
    }

    /// Drops the saved value for `key` from every state in `states`.
    pub fn unregister(&mut self, states: &[StateId], key: &PropertyKey) {
        for state in states {
            if let Some(saved) = self.by_state.get_mut(state) {
                saved.remove(key);
                if saved.is_empty() {
                    self.by_state.remove(state);
                }
            }
        }
    }

    /// The value to save for `key`: whatever one of the exited states saved
    /// (outermost first), otherwise the current store value.
    pub fn saved_value(
        &self,
        exited_in_exit_order: &[StateId],
        key: &PropertyKey,
        store: &PropertyStore,
    ) -> Value {
        exited_in_exit_order
            .iter()
            .rev()
            .find_map(|s| self.by_state.get(s).and_then(|saved| saved.get(key)))
            .cloned()
            .unwrap_or_else(|| store.current(key))
    }

    /// Saved values of the states about to exit. When several states saved
    /// the same property, the outermost one wins.
    pub fn pending_for(&self, exiting_in_exit_order: &[StateId]) -> HashMap<PropertyKey, Value> {
        let mut pending = HashMap::new();
        for state in exiting_in_exit_order.iter().rev() {
            if let Some(saved) = self.by_state.get(state) {
                for (key, value) in saved {
                    pending.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        pending
    }

    pub fn clear(&mut self) {
        self.by_state.clear();
    }
}
