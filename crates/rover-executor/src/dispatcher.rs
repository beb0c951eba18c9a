//! The `executor-service` handler: remote calls in, execution requests out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use rover_buffer::BufferStore;
use rover_proto::DeviceUid;
use rover_rpc::{Client, Handler, MethodMap, RemoteError};

use crate::api::{Api, ModuleFactory, StudentModule};
use crate::async_exec::AsyncExecutor;
use crate::request::{ExecutionRequest, Request};
use crate::sync_exec::SyncExecutor;
use crate::ExecutionError;

/// Maps function-name patterns to execution deadlines, resolved first match
/// wins in configured order.
pub struct TimeoutTable {
    entries: Vec<(Regex, Duration)>,
    fallback: Duration,
}

impl TimeoutTable {
    pub fn new(entries: Vec<(Regex, Duration)>) -> Self {
        Self {
            entries,
            fallback: Duration::from_secs(1),
        }
    }

    /// `pattern:seconds` specs, as given on the command line.
    pub fn parse(specs: &[String]) -> Result<Self, String> {
        let mut entries = Vec::new();
        for spec in specs {
            let (pattern, seconds) = spec
                .rsplit_once(':')
                .ok_or_else(|| format!("expected PATTERN:SECONDS, got {spec:?}"))?;
            let regex = Regex::new(pattern).map_err(|err| err.to_string())?;
            let seconds: f64 = seconds.parse().map_err(|_| format!("bad timeout in {spec:?}"))?;
            if seconds <= 0.0 {
                return Err(format!("timeout must be positive in {spec:?}"));
            }
            entries.push((regex, Duration::from_secs_f64(seconds)));
        }
        Ok(Self::new(entries))
    }

    pub fn resolve(&self, func: &str) -> Duration {
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.is_match(func))
            .map(|(_, timeout)| *timeout)
            .unwrap_or(self.fallback)
    }
}

/// One entry of an `execute` call.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestSpec {
    pub func: String,
    #[serde(default)]
    pub args: Vec<Json>,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub periodic: bool,
}

impl RequestSpec {
    pub fn once(func: &str) -> Self {
        Self {
            func: func.to_owned(),
            args: Vec::new(),
            timeout: None,
            periodic: false,
        }
    }

    pub fn periodic(func: &str) -> Self {
        Self {
            periodic: true,
            ..Self::once(func)
        }
    }
}

/// Forwards execution requests to the two executors.
pub struct Dispatcher {
    buffers: Arc<BufferStore>,
    names: Arc<HashMap<String, DeviceUid>>,
    factory: ModuleFactory,
    timeouts: TimeoutTable,
    module: StdMutex<Option<Arc<dyn StudentModule>>>,
    sync_exec: Arc<SyncExecutor>,
    async_exec: Arc<AsyncExecutor>,
    device_client: StdMutex<Option<Arc<Client>>>,
}

impl Dispatcher {
    pub fn new(
        buffers: Arc<BufferStore>,
        names: HashMap<String, DeviceUid>,
        factory: ModuleFactory,
        timeouts: TimeoutTable,
    ) -> Self {
        Self {
            buffers,
            names: Arc::new(names),
            factory,
            timeouts,
            module: StdMutex::new(None),
            sync_exec: Arc::new(SyncExecutor::new()),
            async_exec: Arc::new(AsyncExecutor::new()),
            device_client: StdMutex::new(None),
        }
    }

    pub fn sync_exec(&self) -> &Arc<SyncExecutor> {
        &self.sync_exec
    }

    pub fn async_exec(&self) -> &Arc<AsyncExecutor> {
        &self.async_exec
    }

    /// The client used to disable devices on `idle`.
    pub fn set_device_client(&self, client: Arc<Client>) {
        *self.device_client.lock().unwrap() = Some(client);
    }

    /// Load the student module afresh.
    pub fn reload(&self) -> Result<Arc<dyn StudentModule>, ExecutionError> {
        let module = (self.factory)()?;
        *self.module.lock().unwrap() = Some(Arc::clone(&module));
        info!("student code reloaded");
        Ok(module)
    }

    fn bind(
        &self,
        func: Arc<dyn Fn(&Api, &[Json]) -> Result<Json, ExecutionError> + Send + Sync>,
        enable_gamepads: bool,
    ) -> crate::request::BoundCall {
        let buffers = Arc::clone(&self.buffers);
        let names = Arc::clone(&self.names);
        let actions = self.async_exec.actions();
        Arc::new(move |token, args| {
            let api = Api::new(
                Arc::clone(&buffers),
                Arc::clone(&names),
                actions.clone(),
                enable_gamepads,
                token,
            );
            func(&api, &args)
        })
    }

    /// Reload student code and enqueue the named functions on the sync
    /// executor. With `block`, wait for every one-shot result.
    pub async fn execute(
        &self,
        specs: Vec<RequestSpec>,
        block: bool,
        enable_gamepads: bool,
    ) -> Result<Vec<Json>, ExecutionError> {
        let module = self.reload()?;
        let mut pending = Vec::new();
        for spec in specs {
            let Some(func) = module.function(&spec.func) else {
                error!(func = %spec.func, "must provide a known function");
                continue;
            };
            let timeout = spec
                .timeout
                .map(Duration::from_secs_f64)
                .unwrap_or_else(|| self.timeouts.resolve(&spec.func));
            let reply = if block && !spec.periodic {
                let (tx, rx) = oneshot::channel();
                pending.push(rx);
                Some(tx)
            } else {
                None
            };
            let request = ExecutionRequest {
                name: spec.func,
                func: self.bind(func, enable_gamepads),
                args: spec.args,
                timeout,
                periodic: spec.periodic,
                reply,
            };
            self.sync_exec.schedule(Request::Run(request));
        }
        let mut results = Vec::new();
        for reply in pending {
            results.push(reply.await.map_err(|_| ExecutionError::Abandoned)??);
        }
        Ok(results)
    }

    /// Suspend all execution and disable every device.
    pub async fn idle(&self) {
        self.sync_exec.cancel();
        self.async_exec.cancel();
        let client = self.device_client.lock().unwrap().clone();
        if let Some(client) = client {
            if let Err(err) = client.call("disable", vec![], Some(b"device-service")).await {
                warn!(%err, "idle could not disable devices");
            }
        }
    }

    pub async fn auto(&self) -> Result<(), ExecutionError> {
        self.execute(
            vec![
                RequestSpec::once("autonomous_setup"),
                RequestSpec::periodic("autonomous_main"),
            ],
            false,
            false,
        )
        .await
        .map(drop)
    }

    pub async fn teleop(&self) -> Result<(), ExecutionError> {
        self.execute(
            vec![
                RequestSpec::once("teleop_setup"),
                RequestSpec::periodic("teleop_main"),
            ],
            false,
            true,
        )
        .await
        .map(drop)
    }

    /// Enqueue the emergency-stop sentinel; the sync loop exits with the
    /// distinguished error and the process with the distinguished code.
    pub fn estop(&self) {
        self.sync_exec.schedule(Request::Estop);
    }
}

fn remote(err: ExecutionError) -> RemoteError {
    RemoteError::new(err.to_string())
}

impl Handler for Dispatcher {
    fn method_map(self: &Arc<Self>) -> MethodMap {
        let execute = Arc::clone(self);
        let idle = Arc::clone(self);
        let auto = Arc::clone(self);
        let teleop = Arc::clone(self);
        let estop = Arc::clone(self);
        MethodMap::new()
            .route("execute", move |args: Vec<Json>| {
                let dispatcher = Arc::clone(&execute);
                async move {
                    let specs: Vec<RequestSpec> = args
                        .first()
                        .cloned()
                        .map(serde_json::from_value)
                        .transpose()
                        .map_err(|err| RemoteError::new(format!("bad requests: {err}")))?
                        .unwrap_or_default();
                    let block = args.get(1).and_then(Json::as_bool).unwrap_or(false);
                    let enable_gamepads = args.get(2).and_then(Json::as_bool).unwrap_or(true);
                    let results = dispatcher
                        .execute(specs, block, enable_gamepads)
                        .await
                        .map_err(remote)?;
                    Ok(Json::Array(results))
                }
            })
            .route("idle", move |_args| {
                let dispatcher = Arc::clone(&idle);
                async move {
                    dispatcher.idle().await;
                    Ok(Json::Null)
                }
            })
            .route("auto", move |_args| {
                let dispatcher = Arc::clone(&auto);
                async move {
                    dispatcher.auto().await.map_err(remote)?;
                    Ok(Json::Null)
                }
            })
            .route("teleop", move |_args| {
                let dispatcher = Arc::clone(&teleop);
                async move {
                    dispatcher.teleop().await.map_err(remote)?;
                    Ok(Json::Null)
                }
            })
            .route("estop", move |_args| {
                let dispatcher = Arc::clone(&estop);
                async move {
                    dispatcher.estop();
                    Ok(Json::Null)
                }
            })
    }
}
