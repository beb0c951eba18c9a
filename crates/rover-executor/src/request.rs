//! Execution requests and the per-invocation cancel token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::oneshot;

use crate::ExecutionError;

/// Signals a running student call that its deadline passed.
///
/// Every student API entry point is a cancellation point: once the watchdog
/// trips the token, the next API call inside the abandoned worker returns
/// [`ExecutionError::Timeout`] and the call unwinds.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    timeout: Arc<std::sync::Mutex<Duration>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fail fast once the deadline has passed.
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        if self.is_cancelled() {
            return Err(ExecutionError::Timeout {
                timeout: *self.timeout.lock().unwrap(),
            });
        }
        Ok(())
    }
}

/// A student function bound to its API context, awaiting only the
/// per-invocation token and arguments.
pub type BoundCall =
    Arc<dyn Fn(CancelToken, Vec<Json>) -> Result<Json, ExecutionError> + Send + Sync>;

pub type Reply = oneshot::Sender<Result<Json, ExecutionError>>;

/// One callable to run on the synchronous executor.
pub struct ExecutionRequest {
    pub name: String,
    pub func: BoundCall,
    pub args: Vec<Json>,
    /// Deadline for a one-shot call; tick interval for a periodic one.
    pub timeout: Duration,
    pub periodic: bool,
    pub reply: Option<Reply>,
}

/// What the executor loop pulls off its queue. `Cancel`, `Stop` and `Estop`
/// are control sentinels.
pub enum Request {
    Run(ExecutionRequest),
    Cancel,
    Stop,
    Estop,
}
