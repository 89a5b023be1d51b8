//! # ScriptGuard Scheduler
//!
//! Runs user scripts on cron schedules or on demand, keeps their history, and
//! raises webhook alerts when they fail.
//!
//! ## Design
//! - SQLite persistence: tasks, history, and settings survive restarts
//! - One clock loop, fed by messages, fires due tasks (no catch-up)
//! - A FIFO concurrency gate caps running processes; excess waits in line
//! - Two stream readers per process, one log writer numbering lines 1..n
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval + command channel)
//!   └── due task → ExecutionEngine::submit(Scheduled)
//!                    ├── ConcurrencyGate (FIFO)
//!                    ├── child process (interpreter + script)
//!                    │     ├── stdout reader ─┐
//!                    │     └── stderr reader ─┴→ log writer → ExecutionStore
//!                    └── Failed / Timeout → Notifier
//!                                            ├── DingTalk robot
//!                                            ├── WeCom robot
//!                                            └── Webhook (JSON)
//! ```

pub mod cron;
pub mod engine;
pub mod environments;
pub mod executor;
pub mod history;
pub mod limiter;
pub mod notify;
pub mod persistence;
pub mod retention;
pub mod service;
pub mod settings;
pub mod store;

pub use engine::{Clock, ScheduledTask, SchedulerEngine, SchedulerHandle, SystemClock};
pub use environments::{EnvironmentRegistry, EnvironmentSource};
pub use executor::{EngineEvent, ExecutionEngine, ExecutionTicket};
pub use history::{ExecutionQuery, ExecutionStore, LogQuery};
pub use limiter::{ConcurrencyGate, GateStats};
pub use notify::{DeliveryResult, FailureNotifier, Notifier};
pub use persistence::SchedulerDb;
pub use service::ScriptGuard;
pub use settings::{SettingKey, SettingValue, Settings};
pub use store::TaskStore;
