//! Core error types.

use crate::model::{StateId, TransitionId};
use thiserror::Error;

/// Errors from the chart construction API and the machine's control surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("state not found: {state}")]
    StateNotFound { state: StateId },

    #[error("transition not found: {transition}")]
    TransitionNotFound { transition: TransitionId },

    #[error("invalid parent {parent}: {reason}")]
    InvalidParent { parent: StateId, reason: String },

    #[error("state {child} is not a child of {state}")]
    NotAChild { state: StateId, child: StateId },

    #[error("state {state} is not a compound state")]
    NotCompound { state: StateId },

    #[error("state {state} is not a history state")]
    NotHistory { state: StateId },

    #[error("state {state} cannot own transitions")]
    InvalidSource { state: StateId },

    #[error("the root state cannot be removed")]
    RootRemoval,

    #[error("no initial state set for the root state")]
    NoInitialState,

    #[error("state machine is not running")]
    NotRunning,

    #[error("state machine is running; the chart cannot be modified")]
    Running,
}

impl CoreError {
    /// Returns an error code suitable for host-facing reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::StateNotFound { .. } => "STATE_NOT_FOUND",
            CoreError::TransitionNotFound { .. } => "TRANSITION_NOT_FOUND",
            CoreError::InvalidParent { .. } => "BAD_REQUEST",
            CoreError::NotAChild { .. } => "BAD_REQUEST",
            CoreError::NotCompound { .. } => "BAD_REQUEST",
            CoreError::NotHistory { .. } => "BAD_REQUEST",
            CoreError::InvalidSource { .. } => "BAD_REQUEST",
            CoreError::RootRemoval => "BAD_REQUEST",
            CoreError::NoInitialState => "NO_INITIAL_STATE",
            CoreError::NotRunning => "NOT_RUNNING",
            CoreError::Running => "CONFLICT",
        }
    }
}

/// Errors raised by the interpreter while a run is in progress.
///
/// Each one is recoverable when an ancestor of the failing context declares an
/// error state; otherwise the machine stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum MachineError {
    #[error("missing initial state in compound state")]
    NoInitialState,

    #[error("missing default state in history state")]
    NoDefaultStateInHistoryState,

    #[error("no common ancestor for targets and source of transition")]
    NoCommonAncestorForTransition,
}

impl MachineError {
    /// Returns a stable code for the error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            MachineError::NoInitialState => "NO_INITIAL_STATE",
            MachineError::NoDefaultStateInHistoryState => "NO_DEFAULT_STATE_IN_HISTORY_STATE",
            MachineError::NoCommonAncestorForTransition => "NO_COMMON_ANCESTOR_FOR_TRANSITION",
        }
    }
}
