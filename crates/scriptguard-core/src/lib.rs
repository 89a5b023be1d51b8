//! # ScriptGuard Core
//!
//! Shared building blocks for the ScriptGuard engine:
//! - [`error`]: the error taxonomy every crate returns
//! - [`config`]: the TOML application config (paths, gateway, discovery)
//! - [`types`]: environments, tasks, executions, and log records

pub mod config;
pub mod error;
pub mod types;

pub use config::ScriptGuardConfig;
pub use error::{Result, ScriptGuardError};
pub use types::{
    ChannelKind, Environment, EnvironmentKind, EnvironmentStatus, Execution, ExecutionStatus,
    LogRecord, LogStream, Task, TaskDraft, Trigger,
};
