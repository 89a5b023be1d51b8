//! # ScriptGuard Gateway
//!
//! JSON-over-HTTP surface for the desktop UI: environments, tasks, history,
//! settings, notification tests, and a Server-Sent Events feed of execution
//! status and log lines.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, serve};
