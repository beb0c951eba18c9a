//! Student code execution.
//!
//! Two executors cooperate inside the executor process:
//!
//! * [`SyncExecutor`] — a blocking loop on a dedicated OS thread running the
//!   `*_setup`/`*_main` style functions. Every invocation gets a worker
//!   thread and a watchdog deadline; when the deadline passes, a cancel
//!   token trips and the timeout error surfaces inside the student call at
//!   its next API use.
//! * [`AsyncExecutor`] — a cooperative loop on its own thread running
//!   student "actions" as cancellable tasks.
//!
//! The [`Dispatcher`] bridges both to the `executor-service` remote-call
//! surface, reloading the student module, assigning per-function timeouts by
//! pattern, and turning `estop()` into the process-fatal emergency stop.

mod api;
mod async_exec;
mod dispatcher;
mod request;
mod sync_exec;

pub use api::{Alliance, Api, Field, Gamepad, ModuleFactory, Robot, StudentModule};
pub use async_exec::{Action, Actions, AsyncExecutor};
pub use dispatcher::{Dispatcher, RequestSpec, TimeoutTable};
pub use request::{BoundCall, CancelToken, ExecutionRequest, Reply, Request};
pub use sync_exec::SyncExecutor;

use std::time::Duration;

use thiserror::Error;

/// Exit code distinguishing an emergency stop from ordinary failure.
pub const ESTOP_EXIT_CODE: i32 = 69;

/// Execution failures. Everything except [`ExecutionError::EmergencyStop`]
/// is contained; the emergency stop alone unwinds the process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("function timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("emergency stop")]
    EmergencyStop,
    #[error("student code panicked")]
    Panicked,
    #[error("student code produced an error: {0}")]
    Student(String),
    #[error("student module failed to load: {0}")]
    LoadFailed(String),
    #[error("executor is not accepting requests")]
    NotRunning,
    #[error("gamepad is not enabled in autonomous")]
    GamepadDisabled,
    #[error("request was dropped before completing")]
    Abandoned,
}
