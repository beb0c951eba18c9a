//! Method tables for service handlers.
//!
//! A handler registers its remotely callable methods into a [`MethodMap`] at
//! construction time; dispatch is a name lookup plus an invocation, never
//! reflection. Synchronous (possibly blocking) methods register through
//! [`MethodMap::route_blocking`], which runs them on the blocking pool.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::time::timeout;

use crate::envelope::RemoteError;

type MethodFuture = Pin<Box<dyn Future<Output = Result<Json, RemoteError>> + Send>>;
type Method = Arc<dyn Fn(Vec<Json>) -> MethodFuture + Send + Sync>;

/// `{remote_name: bound method}`, fixed after construction.
#[derive(Clone, Default)]
pub struct MethodMap {
    methods: HashMap<String, Method>,
}

impl MethodMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async method under `name` (which need not be an
    /// identifier).
    pub fn route<F, Fut>(mut self, name: &str, method: F) -> Self
    where
        F: Fn(Vec<Json>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Json, RemoteError>> + Send + 'static,
    {
        self.methods.insert(
            name.to_owned(),
            Arc::new(move |args| Box::pin(method(args)) as MethodFuture),
        );
        self
    }

    /// Register a synchronous method; calls run on the blocking pool.
    pub fn route_blocking<F>(self, name: &str, method: F) -> Self
    where
        F: Fn(Vec<Json>) -> Result<Json, RemoteError> + Send + Sync + Clone + 'static,
    {
        self.route(name, move |args| {
            let method = method.clone();
            async move {
                tokio::task::spawn_blocking(move || method(args))
                    .await
                    .map_err(|err| RemoteError::new("method panicked").with("detail", err.to_string()))?
            }
        })
    }

    /// Invoke `method` with a deadline.
    pub async fn dispatch(
        &self,
        method: &str,
        args: Vec<Json>,
        deadline: Duration,
    ) -> Result<Json, RemoteError> {
        let Some(bound) = self.methods.get(method) else {
            return Err(RemoteError::new("no such method exists").with("method", method));
        };
        match timeout(deadline, bound(args)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::new("method timed out")
                .with("method", method)
                .with("timeout", deadline.as_secs_f64())),
        }
    }
}

/// Anything that exposes a method table.
pub trait Handler {
    /// Build the method map. Called once, at service construction.
    fn method_map(self: &Arc<Self>) -> MethodMap;
}
