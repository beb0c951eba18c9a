//! The broker: options, lint, gamepad ingestion, telemetry publication.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{Map, Value as Json};
use tokio::process::Command;
use tracing::{info, warn};

use rover_buffer::{BufferError, BufferKey, BufferStore, ParamType, Value};
use rover_rpc::{Client, Handler, MethodMap, RemoteError};

/// The joystick axes a control update may carry, and the parameters they
/// feed.
const JOYSTICKS: [(&str, &str); 4] = [
    ("lx", "joystick_left_x"),
    ("ly", "joystick_left_y"),
    ("rx", "joystick_right_x"),
    ("ry", "joystick_right_y"),
];

pub struct Broker {
    buffers: Arc<BufferStore>,
    options: StdMutex<Json>,
    lint_command: Option<String>,
    exec_module: String,
    uids: StdMutex<HashSet<String>>,
    update_client: StdMutex<Option<Arc<Client>>>,
    client: StdMutex<Option<Arc<Client>>>,
}

impl Broker {
    pub fn new(
        buffers: Arc<BufferStore>,
        options: Json,
        lint_command: Option<String>,
        exec_module: String,
    ) -> Self {
        Self {
            buffers,
            options: StdMutex::new(options),
            lint_command,
            exec_module,
            uids: StdMutex::new(HashSet::new()),
            update_client: StdMutex::new(None),
            client: StdMutex::new(None),
        }
    }

    pub fn set_update_client(&self, client: Arc<Client>) {
        *self.update_client.lock().unwrap() = Some(client);
    }

    pub fn set_client(&self, client: Arc<Client>) {
        *self.client.lock().unwrap() = Some(client);
    }

    fn get_option(&self, name: Option<&str>) -> Result<Json, RemoteError> {
        let options = self.options.lock().unwrap();
        match name {
            None => Ok(options.clone()),
            Some(name) => options
                .get(name)
                .cloned()
                .ok_or_else(|| RemoteError::new("no such option").with("option", name)),
        }
    }

    fn set_option(&self, updates: &Map<String, Json>) -> Result<(), RemoteError> {
        let mut options = self.options.lock().unwrap();
        let Some(table) = options.as_object_mut() else {
            return Err(RemoteError::new("options are not a table"));
        };
        for (name, value) in updates {
            if !table.contains_key(name) {
                return Err(RemoteError::new("no such option").with("option", name.as_str()));
            }
            table.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    /// Apply one control-plane update to the gamepad buffers.
    ///
    /// Joystick axes land in their named parameters; the `btn` bitmask fans
    /// out over the gamepad type's boolean parameters in catalog order.
    pub fn update_gamepads(&self, update: &Map<String, Json>) -> Result<(), BufferError> {
        for (index, params) in update {
            let Ok(index) = index.parse::<usize>() else {
                warn!(slot = %index, "ignoring non-numeric gamepad slot");
                continue;
            };
            let buffer = self.buffers.get_or_create(BufferKey::Gamepad(index))?;
            for (key, param) in JOYSTICKS {
                if let Some(value) = params.get(key).and_then(Json::as_f64) {
                    buffer.set_data(param, Value::Float(value))?;
                }
            }
            let bitmap = params.get("btn").and_then(Json::as_u64).unwrap_or(0);
            let buttons: Vec<String> = buffer
                .device_type()
                .params
                .iter()
                .filter(|p| p.ty == ParamType::Bool)
                .map(|p| p.name.clone())
                .collect();
            for (bit, button) in buttons.iter().enumerate() {
                buffer.set_data(button, Value::Bool(bitmap >> bit & 1 == 1))?;
            }
        }
        Ok(())
    }

    /// Snapshot recently updated parameters of every known device.
    pub fn make_update(&self) -> Json {
        let mut payload = Map::new();
        for uid in self.uids.lock().unwrap().iter() {
            let Ok(parsed) = uid.parse() else { continue };
            let update = self
                .buffers
                .attach(BufferKey::Device(parsed))
                .and_then(|buffer| buffer.get_update());
            match update {
                Ok(update) if !update.is_empty() => {
                    let fields: Map<String, Json> = update
                        .into_iter()
                        .map(|(param, value)| (param, value.to_json()))
                        .collect();
                    payload.insert(uid.clone(), Json::Object(fields));
                }
                Ok(_) => {}
                Err(err) => warn!(%uid, %err, "could not snapshot device"),
            }
        }
        Json::Object(payload)
    }

    /// Publish one update snapshot over the telemetry plane.
    pub async fn send_update(&self) {
        let client = self.update_client.lock().unwrap().clone();
        let Some(client) = client else { return };
        let buffers = self.make_update();
        if let Err(err) = client.notify("update", vec![buffers], None).await {
            warn!(%err, "failed to publish update");
        }
    }

    /// Refresh the UID set from the device service.
    pub async fn update_uids(&self) {
        let client = self.client.lock().unwrap().clone();
        let Some(client) = client else { return };
        match client.call("list_uids", vec![], Some(b"device-service")).await {
            Ok(Json::Array(uids)) => {
                let mut set = self.uids.lock().unwrap();
                set.clear();
                set.extend(uids.iter().filter_map(Json::as_str).map(str::to_owned));
            }
            Ok(other) => warn!(?other, "unexpected list_uids result"),
            Err(err) => warn!(%err, "broker could not refresh UIDs"),
        }
    }

    /// Lint the student module with the configured external analyzer,
    /// relaying its JSON-lines diagnostics.
    pub async fn lint(&self) -> Result<Vec<Json>, RemoteError> {
        let Some(command) = &self.lint_command else {
            return Ok(Vec::new());
        };
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("{command} {}", self.exec_module))
            .output();
        let output = tokio::time::timeout(Duration::from_secs(5), output)
            .await
            .map_err(|_| RemoteError::new("lint timed out"))?
            .map_err(|err| RemoteError::new("lint failed to run").with("detail", err.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut messages = Vec::new();
        for line in stdout.lines() {
            if let Ok(message) = serde_json::from_str::<Json>(line) {
                messages.push(message);
            }
        }
        info!(module = %self.exec_module, issues = messages.len(), "linted student code");
        Ok(messages)
    }
}

impl Handler for Broker {
    fn method_map(self: &Arc<Self>) -> MethodMap {
        let get = Arc::clone(self);
        let set = Arc::clone(self);
        let lint = Arc::clone(self);
        let gamepads = Arc::clone(self);
        MethodMap::new()
            .route("get_option", move |args: Vec<Json>| {
                let broker = Arc::clone(&get);
                async move { broker.get_option(args.first().and_then(Json::as_str)) }
            })
            .route("set_option", move |args: Vec<Json>| {
                let broker = Arc::clone(&set);
                async move {
                    let Some(Json::Object(updates)) = args.first() else {
                        return Err(RemoteError::new("expected an option table"));
                    };
                    broker.set_option(updates)?;
                    Ok(Json::Null)
                }
            })
            .route("lint", move |_args| {
                let broker = Arc::clone(&lint);
                async move { broker.lint().await.map(Json::Array) }
            })
            .route("update_gamepads", move |args: Vec<Json>| {
                let broker = Arc::clone(&gamepads);
                async move {
                    let Some(Json::Object(update)) = args.first() else {
                        return Err(RemoteError::new("expected a gamepad update table"));
                    };
                    let update = update.clone();
                    tokio::task::spawn_blocking(move || broker.update_gamepads(&update))
                        .await
                        .map_err(|_| RemoteError::new("gamepad update panicked"))?
                        .map_err(|err| {
                            RemoteError::new("gamepad update failed").with("detail", err.to_string())
                        })?;
                    Ok(Json::Null)
                }
            })
    }
}
