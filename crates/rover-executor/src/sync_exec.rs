//! The synchronous executor.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde_json::Value as Json;
use tracing::{error, info, warn};

use crate::request::{BoundCall, CancelToken, ExecutionRequest, Request};
use crate::ExecutionError;

const QUEUE_SIZE: usize = 128;

/// Runs student `*_setup`/`*_main` functions on a dedicated thread.
///
/// Each invocation executes on a worker thread while this thread plays
/// watchdog. A blown deadline trips the invocation's [`CancelToken`] and
/// reports the timeout immediately; the abandoned worker unwinds at its next
/// API call. Periodic requests tick at their interval until another request
/// arrives (back-pressure cancellation).
pub struct SyncExecutor {
    tx: Sender<Request>,
    rx: Receiver<Request>,
}

impl Default for SyncExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncExecutor {
    pub fn new() -> Self {
        let (tx, rx) = bounded(QUEUE_SIZE);
        Self { tx, rx }
    }

    /// Thread-safe; may block when the queue is full.
    pub fn schedule(&self, request: Request) {
        if self.tx.send(request).is_err() {
            warn!("sync executor queue is gone");
        }
    }

    pub fn cancel(&self) {
        self.schedule(Request::Cancel);
    }

    pub fn stop(&self) {
        self.schedule(Request::Stop);
    }

    /// Process requests until stopped.
    ///
    /// Returns [`ExecutionError::EmergencyStop`] when an `estop` sentinel is
    /// pulled; the caller exits the process with the distinguished code.
    pub fn execute_forever(&self) -> Result<(), ExecutionError> {
        info!(thread = ?std::thread::current().id(), "sync executor started");
        loop {
            match self.rx.recv() {
                Err(_) => return Ok(()),
                Ok(Request::Stop) => {
                    info!("sync executor stopped");
                    return Ok(());
                }
                Ok(Request::Cancel) => info!("sync executor cancelled, idling"),
                Ok(Request::Estop) => {
                    error!("emergency stop requested");
                    return Err(ExecutionError::EmergencyStop);
                }
                Ok(Request::Run(request)) => self.execute(request),
            }
        }
    }

    fn execute(&self, request: ExecutionRequest) {
        info!(
            func = %request.name,
            timeout = ?request.timeout,
            periodic = request.periodic,
            "executing function"
        );
        if request.periodic {
            self.run_periodically(&request);
            return;
        }
        let result = invoke_once(
            &request.func,
            request.args.clone(),
            request.timeout,
            &request.name,
        );
        if let Err(err) = &result {
            error!(func = %request.name, %err, "unable to execute function");
        }
        if let Some(reply) = request.reply {
            let _ = reply.send(result);
        }
    }

    /// Tick the callable until the request queue becomes non-empty. Per-tick
    /// timeouts are expected and swallowed.
    fn run_periodically(&self, request: &ExecutionRequest) {
        let mut next_tick = Instant::now();
        while self.rx.is_empty() {
            match invoke_once(
                &request.func,
                request.args.clone(),
                request.timeout,
                &request.name,
            ) {
                Ok(_) | Err(ExecutionError::Timeout { .. }) => {}
                Err(err) => error!(func = %request.name, %err, "periodic function failed"),
            }
            next_tick += request.timeout;
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            } else {
                // The call overran its slot; realign rather than burst.
                next_tick = now;
            }
        }
    }
}

/// Run one invocation on a worker thread under a watchdog deadline.
fn invoke_once(
    func: &BoundCall,
    args: Vec<Json>,
    timeout: Duration,
    name: &str,
) -> Result<Json, ExecutionError> {
    let token = CancelToken::new();
    let worker_token = token.clone();
    let func = func.clone();
    let (done_tx, done_rx) = bounded(1);
    let spawned = std::thread::Builder::new()
        .name(format!("student-{name}"))
        .spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| func(worker_token, args)));
            let _ = done_tx.send(match outcome {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::Panicked),
            });
        });
    if spawned.is_err() {
        return Err(ExecutionError::NotRunning);
    }
    match done_rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            // Let the worker observe the timeout at its next API call; do
            // not wait for it.
            token.cancel(timeout);
            Err(ExecutionError::Timeout { timeout })
        }
        Err(RecvTimeoutError::Disconnected) => Err(ExecutionError::Abandoned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn call(f: impl Fn(CancelToken) -> Result<Json, ExecutionError> + Send + Sync + 'static) -> BoundCall {
        Arc::new(move |token, _args| f(token))
    }

    #[test]
    fn one_shot_requests_reply() {
        let executor = SyncExecutor::new();
        let (reply_tx, mut reply_rx) = tokio::sync::oneshot::channel();
        executor.schedule(Request::Run(ExecutionRequest {
            name: "answer".into(),
            func: call(|_| Ok(Json::from(41))),
            args: vec![],
            timeout: Duration::from_secs(1),
            periodic: false,
            reply: Some(reply_tx),
        }));
        executor.stop();
        executor.execute_forever().unwrap();
        assert_eq!(reply_rx.try_recv().unwrap().unwrap(), Json::from(41));
    }

    #[test]
    fn blown_deadline_reports_within_twice_the_timeout() {
        let executor = SyncExecutor::new();
        let timeout = Duration::from_millis(100);
        let (reply_tx, mut reply_rx) = tokio::sync::oneshot::channel();
        executor.schedule(Request::Run(ExecutionRequest {
            name: "sleepy".into(),
            func: call(move |token| {
                // A student body that sleeps in small steps, checking in
                // with the API (the cancellation point) between steps.
                for _ in 0..100 {
                    std::thread::sleep(Duration::from_millis(20));
                    token.checkpoint()?;
                }
                Ok(Json::Null)
            }),
            args: vec![],
            timeout,
            periodic: false,
            reply: Some(reply_tx),
        }));
        executor.stop();
        let start = Instant::now();
        executor.execute_forever().unwrap();
        assert!(start.elapsed() < timeout * 2);
        assert_eq!(
            reply_rx.try_recv().unwrap(),
            Err(ExecutionError::Timeout { timeout })
        );
    }

    #[test]
    fn periodic_requests_tick_until_backpressure() {
        let executor = SyncExecutor::new();
        let count = Arc::new(AtomicU32::new(0));
        let ticks = Arc::clone(&count);
        executor.schedule(Request::Run(ExecutionRequest {
            name: "ticker".into(),
            func: call(move |_| {
                ticks.fetch_add(1, Ordering::SeqCst);
                Ok(Json::Null)
            }),
            args: vec![],
            timeout: Duration::from_millis(50),
            periodic: true,
            reply: None,
        }));
        let tx = executor.tx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(270));
            let _ = tx.send(Request::Stop);
        });
        executor.execute_forever().unwrap();
        let total = count.load(Ordering::SeqCst);
        assert!((4..=7).contains(&total), "ticked {total} times");
    }

    #[test]
    fn estop_unwinds_the_loop() {
        let executor = SyncExecutor::new();
        executor.schedule(Request::Run(ExecutionRequest {
            name: "spin".into(),
            func: call(|_| Ok(Json::Null)),
            args: vec![],
            timeout: Duration::from_millis(20),
            periodic: true,
            reply: None,
        }));
        executor.schedule(Request::Estop);
        assert_eq!(
            executor.execute_forever(),
            Err(ExecutionError::EmergencyStop)
        );
    }

    #[test]
    fn panics_are_contained() {
        let executor = SyncExecutor::new();
        let (reply_tx, mut reply_rx) = tokio::sync::oneshot::channel();
        executor.schedule(Request::Run(ExecutionRequest {
            name: "boom".into(),
            func: call(|_| panic!("student bug")),
            args: vec![],
            timeout: Duration::from_secs(1),
            periodic: false,
            reply: Some(reply_tx),
        }));
        executor.stop();
        executor.execute_forever().unwrap();
        assert_eq!(reply_rx.try_recv().unwrap(), Err(ExecutionError::Panicked));
    }
}
