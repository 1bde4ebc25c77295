//! # statechart-runtime
//!
//! Tokio host for the statechart interpreter.
//!
//! This crate provides:
//! - [`TokioEventLoop`], the host loop backing a machine's queues and timers
//! - [`MachineRuntime`] and [`MachineHandle`] for running a machine on its own task
//! - Notification fan-out to subscribers with per-subscription filters
//! - YAML + environment configuration

pub mod broadcast;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod runtime;

pub use broadcast::{
    MachineNotification, NotificationBroadcaster, NotificationFilter, NotificationSubscription,
};
pub use config::{Config, ConfigError, LoggingConfig, MachineConfig, RuntimeConfig};
pub use error::RuntimeError;
pub use event_loop::TokioEventLoop;
pub use runtime::{MachineHandle, MachineRuntime};
