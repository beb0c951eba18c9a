//! The asynchronous executor: student actions as cancellable tasks.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::request::Reply;
use crate::ExecutionError;

const QUEUE_SIZE: usize = 128;
const DEFAULT_MAX_ACTIONS: usize = 128;

type ActionFuture = Pin<Box<dyn Future<Output = Result<Json, ExecutionError>> + Send>>;

/// A named, re-invocable student coroutine. Identity is the name: only one
/// instance of an action runs at a time.
#[derive(Clone)]
pub struct Action {
    name: Arc<str>,
    body: Arc<dyn Fn() -> ActionFuture + Send + Sync>,
}

impl Action {
    pub fn new<F, Fut>(name: &str, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Json, ExecutionError>> + Send + 'static,
    {
        Self {
            name: Arc::from(name),
            body: Arc::new(move || Box::pin(body()) as ActionFuture),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One queued action request.
pub struct ActionRun {
    pub action: Action,
    /// Deadline for a one-shot action; invocation interval for a periodic one.
    pub timeout: Duration,
    pub periodic: bool,
    pub reply: Option<Reply>,
}

enum ActionRequest {
    Run(ActionRun),
    Cancel,
    Stop,
}

type Running = Arc<StdMutex<HashMap<String, AbortHandle>>>;

/// The student-facing actions API (`run`, `is_running`, `sleep`).
#[derive(Clone)]
pub struct Actions {
    tx: mpsc::Sender<ActionRequest>,
    running: Running,
}

impl Actions {
    /// Schedule an action. Thread-safe and non-blocking; a full queue drops
    /// the request with a warning.
    pub fn run(&self, action: Action, timeout: Duration, periodic: bool) {
        let request = ActionRequest::Run(ActionRun {
            action,
            timeout,
            periodic,
            reply: None,
        });
        if self.tx.try_send(request).is_err() {
            warn!("action queue is full; request dropped");
        }
    }

    pub fn is_running(&self, action: &Action) -> bool {
        self.running.lock().unwrap().contains_key(action.name())
    }

    /// Pause the current action. This is a cancellation point.
    pub async fn sleep(seconds: f64) {
        tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
    }
}

/// Dispatches action requests on its own cooperative loop.
pub struct AsyncExecutor {
    tx: mpsc::Sender<ActionRequest>,
    rx: tokio::sync::Mutex<mpsc::Receiver<ActionRequest>>,
    running: Running,
    max_actions: usize,
    cooldown: Duration,
}

impl AsyncExecutor {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ACTIONS, Duration::from_secs(1))
    }

    pub fn with_limits(max_actions: usize, cooldown: Duration) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            running: Arc::new(StdMutex::new(HashMap::new())),
            max_actions,
            cooldown,
        }
    }

    pub fn actions(&self) -> Actions {
        Actions {
            tx: self.tx.clone(),
            running: Arc::clone(&self.running),
        }
    }

    /// Schedule a request with a reply channel (the dispatcher's path).
    pub fn schedule(&self, run: ActionRun) {
        if self.tx.try_send(ActionRequest::Run(run)).is_err() {
            warn!("action queue is full; request dropped");
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.try_send(ActionRequest::Cancel);
    }

    pub fn stop(&self) {
        let _ = self.tx.try_send(ActionRequest::Stop);
    }

    fn cancel_all(&self) {
        for (name, handle) in self.running.lock().unwrap().iter() {
            debug!(action = %name, "cancelling action");
            handle.abort();
        }
    }

    /// Run the dispatch loop on a fresh single-threaded runtime. This is the
    /// async-executor thread's entry point.
    pub fn execute_forever(&self) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("async executor runtime");
        runtime.block_on(self.dispatch());
    }

    /// Receive and handle requests until stopped.
    pub async fn dispatch(&self) {
        info!(thread = ?std::thread::current().id(), "async executor started");
        let mut rx = self.rx.lock().await;
        loop {
            let Some(request) = rx.recv().await else {
                return;
            };
            match request {
                ActionRequest::Stop => {
                    self.cancel_all();
                    info!("async executor stopped");
                    return;
                }
                ActionRequest::Cancel => {
                    self.cancel_all();
                    info!("async executor cancelled, idling");
                }
                ActionRequest::Run(run) => {
                    let name = run.action.name().to_owned();
                    let overflowed = {
                        let mut running = self.running.lock().unwrap();
                        if running.contains_key(&name) {
                            warn!(action = %name, "action already running");
                            None
                        } else if running.len() >= self.max_actions {
                            Some(run)
                        } else {
                            let handle = self.register(run, &name);
                            running.insert(name, handle);
                            None
                        }
                    };
                    if let Some(run) = overflowed {
                        warn!(
                            max_actions = self.max_actions,
                            "max number of actions running; requeueing"
                        );
                        tokio::time::sleep(self.cooldown).await;
                        if self.tx.try_send(ActionRequest::Run(run)).is_err() {
                            warn!("action queue is full; request dropped");
                        }
                    }
                }
            }
        }
    }

    /// Spawn the action plus a completion watcher that deregisters it and
    /// forwards its result.
    fn register(&self, run: ActionRun, name: &str) -> AbortHandle {
        let ActionRun {
            action,
            timeout,
            periodic,
            reply,
        } = run;
        let task = tokio::spawn(async move {
            if !periodic {
                return match tokio::time::timeout(timeout, (action.body)()).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::Timeout { timeout }),
                };
            }
            loop {
                (action.body)().await?;
                tokio::time::sleep(timeout).await;
            }
        });
        let handle = task.abort_handle();
        let running = Arc::clone(&self.running);
        let name = name.to_owned();
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_cancelled() => {
                    debug!(action = %name, "action cancelled");
                    Err(ExecutionError::Abandoned)
                }
                Err(_) => Err(ExecutionError::Panicked),
            };
            running.lock().unwrap().remove(&name);
            match &outcome {
                Ok(_) => debug!(action = %name, "action finished"),
                Err(err) => error!(action = %name, %err, "action produced an error"),
            }
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        });
        handle
    }
}

impl Default for AsyncExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn waiter(name: &str, go: Arc<tokio::sync::Notify>) -> Action {
        Action::new(name, move || {
            let go = Arc::clone(&go);
            async move {
                go.notified().await;
                Ok(Json::Null)
            }
        })
    }

    async fn with_executor<F, Fut>(max_actions: usize, f: F)
    where
        F: FnOnce(Arc<AsyncExecutor>, Actions) -> Fut,
        Fut: Future<Output = ()>,
    {
        let executor = Arc::new(AsyncExecutor::with_limits(
            max_actions,
            Duration::from_millis(100),
        ));
        let actions = executor.actions();
        let loop_handle = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.dispatch().await })
        };
        f(Arc::clone(&executor), actions).await;
        executor.stop();
        let _ = loop_handle.await;
    }

    #[tokio::test]
    async fn results_are_forwarded() {
        with_executor(8, |executor, _actions| async move {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            executor.schedule(ActionRun {
                action: Action::new("answer", || async { Ok(Json::from(0xBEEF)) }),
                timeout: Duration::from_secs(1),
                periodic: false,
                reply: Some(reply_tx),
            });
            assert_eq!(reply_rx.await.unwrap().unwrap(), Json::from(0xBEEF));
        })
        .await;
    }

    #[tokio::test]
    async fn duplicate_actions_are_dropped() {
        with_executor(8, |_executor, actions| async move {
            let go = Arc::new(tokio::sync::Notify::new());
            let action = waiter("wave", Arc::clone(&go));
            actions.run(action.clone(), Duration::from_secs(5), false);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(actions.is_running(&action));
            actions.run(action.clone(), Duration::from_secs(5), false);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(actions.is_running(&action));
            go.notify_waiters();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!actions.is_running(&action));
        })
        .await;
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        with_executor(2, |_executor, actions| async move {
            let go = Arc::new(tokio::sync::Notify::new());
            let first = waiter("one", Arc::clone(&go));
            let second = waiter("two", Arc::clone(&go));
            let third = waiter("three", Arc::clone(&go));
            actions.run(first.clone(), Duration::from_secs(5), false);
            actions.run(second.clone(), Duration::from_secs(5), false);
            actions.run(third.clone(), Duration::from_secs(5), false);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(actions.is_running(&first));
            assert!(actions.is_running(&second));
            assert!(!actions.is_running(&third));
            go.notify_waiters();
        })
        .await;
    }

    #[tokio::test]
    async fn one_shot_actions_time_out() {
        with_executor(8, |_executor, actions| async move {
            let go = Arc::new(tokio::sync::Notify::new());
            let action = waiter("slow", go);
            actions.run(action.clone(), Duration::from_millis(100), false);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(actions.is_running(&action));
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert!(!actions.is_running(&action));
        })
        .await;
    }

    #[tokio::test]
    async fn periodic_actions_repeat_without_overlap() {
        with_executor(8, |_executor, actions| async move {
            let count = Arc::new(AtomicU32::new(0));
            let ticks = Arc::clone(&count);
            let action = Action::new("tick", move || {
                let ticks = Arc::clone(&ticks);
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    Ok(Json::Null)
                }
            });
            actions.run(action.clone(), Duration::from_millis(100), true);
            tokio::time::sleep(Duration::from_millis(350)).await;
            assert!(actions.is_running(&action));
            let total = count.load(Ordering::SeqCst);
            assert!((3..=5).contains(&total), "ticked {total} times");
        })
        .await;
    }

    #[tokio::test]
    async fn cancel_clears_and_allows_rerun() {
        with_executor(8, |executor, actions| async move {
            let go = Arc::new(tokio::sync::Notify::new());
            let first = waiter("one", Arc::clone(&go));
            let second = waiter("two", Arc::clone(&go));
            actions.run(first.clone(), Duration::from_secs(5), false);
            actions.run(second.clone(), Duration::from_secs(5), false);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(actions.is_running(&first));
            assert!(actions.is_running(&second));

            executor.cancel();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!actions.is_running(&first));
            assert!(!actions.is_running(&second));

            actions.run(first.clone(), Duration::from_secs(5), false);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(actions.is_running(&first));
            go.notify_waiters();
        })
        .await;
    }
}
