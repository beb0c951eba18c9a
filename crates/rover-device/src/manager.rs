//! Device lifecycle management and the `device-service` handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value as Json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info, warn};

use rover_buffer::BufferStore;
use rover_proto::DeviceUid;
use rover_rpc::{Handler, MethodMap, RemoteError};

use crate::observer::DeviceObserver;
use crate::session::DeviceSession;
use crate::DeviceError;

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub baud_rate: u32,
    pub poll_interval: Duration,
    pub discovery_timeout: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            poll_interval: Duration::from_millis(40),
            discovery_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns every live [`DeviceSession`], keyed by UID.
pub struct DeviceManager {
    buffers: Arc<BufferStore>,
    options: DeviceOptions,
    devices: StdMutex<HashMap<u128, Arc<DeviceSession>>>,
}

impl DeviceManager {
    pub fn new(buffers: Arc<BufferStore>, options: DeviceOptions) -> Self {
        Self {
            buffers,
            options,
            devices: StdMutex::new(HashMap::new()),
        }
    }

    pub fn buffers(&self) -> &Arc<BufferStore> {
        &self.buffers
    }

    pub fn uids(&self) -> Vec<String> {
        self.devices
            .lock()
            .unwrap()
            .keys()
            .map(|uid| uid.to_string())
            .collect()
    }

    pub fn session(&self, uid: &str) -> Result<Arc<DeviceSession>, DeviceError> {
        let parsed: DeviceUid = uid.parse().map_err(|_| DeviceError::NoSuchDevice {
            uid: uid.to_owned(),
        })?;
        self.devices
            .lock()
            .unwrap()
            .get(&parsed.as_u128())
            .cloned()
            .ok_or_else(|| DeviceError::NoSuchDevice {
                uid: uid.to_owned(),
            })
    }

    fn sessions(&self, uids: Option<Vec<String>>) -> Result<Vec<Arc<DeviceSession>>, DeviceError> {
        match uids {
            None => Ok(self.devices.lock().unwrap().values().cloned().collect()),
            Some(uids) => uids.iter().map(|uid| self.session(uid)).collect(),
        }
    }

    /// Drive one device connection until it fails, then tear it down.
    pub async fn run_device<R, W>(self: Arc<Self>, reader: R, writer: W, port: String)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session = Arc::new(DeviceSession::new(Arc::clone(&self.buffers), port.clone()));
        info!(%port, "device opened");
        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(&session).read_messages(reader));
        tasks.spawn(Arc::clone(&session).write_messages(writer));

        let discovery = tokio::time::timeout(self.options.discovery_timeout, session.discover());
        let uid = tokio::select! {
            outcome = discovery => match outcome {
                Ok(Ok(uid)) => uid,
                Ok(Err(err)) => {
                    error!(%port, %err, "device discovery failed");
                    tasks.shutdown().await;
                    return;
                }
                Err(_) => {
                    error!(%port, "device type not discovered");
                    tasks.shutdown().await;
                    return;
                }
            },
            _ = tasks.join_next() => {
                error!(%port, "device disconnected during discovery");
                tasks.shutdown().await;
                return;
            }
        };

        self.devices
            .lock()
            .unwrap()
            .insert(uid.as_u128(), Arc::clone(&session));
        if let Err(err) = session.subscribe(None, None).await {
            warn!(%port, %err, "initial subscription failed");
        }
        tasks.spawn(Arc::clone(&session).handle_messages());
        tasks.spawn(Arc::clone(&session).poll_forever(self.options.poll_interval));

        // The first task to exit signals a dead connection.
        tasks.join_next().await;
        tasks.shutdown().await;

        self.devices.lock().unwrap().remove(&uid.as_u128());
        if let Ok(buffer) = session.buffer() {
            let _ = tokio::task::spawn_blocking(move || buffer.set_valid(false)).await;
        }
        info!(%port, %uid, "device closed");
    }

    /// Open newly observed serial ports forever.
    pub async fn watch_serial_ports(
        self: Arc<Self>,
        mut observer: Box<dyn DeviceObserver>,
    ) {
        info!("watching for serial devices");
        loop {
            for port in observer.next_ports().await {
                let path = port.to_string_lossy().into_owned();
                let stream = match tokio_serial::new(path.as_str(), self.options.baud_rate)
                    .open_native_async()
                {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(port = %path, %err, "failed to open serial port");
                        continue;
                    }
                };
                let (reader, writer) = tokio::io::split(stream);
                tokio::spawn(Arc::clone(&self).run_device(reader, writer, path));
            }
        }
    }

    /// Accept virtual Smart Devices (the same protocol over TCP).
    pub async fn serve_virtual_devices(self: Arc<Self>, address: &str) -> Result<(), DeviceError> {
        let hostport = address.strip_prefix("tcp://").unwrap_or(address);
        let listener = TcpListener::bind(hostport).await?;
        info!(address = %hostport, "listening for virtual devices");
        loop {
            let (stream, peer) = listener.accept().await?;
            let (reader, writer) = tokio::io::split(stream);
            tokio::spawn(Arc::clone(&self).run_device(reader, writer, format!("vsd:{peer}")));
        }
    }
}

fn remote(err: DeviceError) -> RemoteError {
    RemoteError::new(err.to_string())
}

/// `None`, one UID string, or a list of UID strings.
fn optional_uids(arg: Option<&Json>) -> Result<Option<Vec<String>>, RemoteError> {
    match arg {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(uid)) => Ok(Some(vec![uid.clone()])),
        Some(Json::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| RemoteError::new("UIDs must be strings"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(RemoteError::new("expected a UID or a list of UIDs")),
    }
}

fn required_uid(arg: Option<&Json>) -> Result<String, RemoteError> {
    arg.and_then(Json::as_str)
        .map(str::to_owned)
        .ok_or_else(|| RemoteError::new("expected a UID string"))
}

fn optional_params(arg: Option<&Json>) -> Result<Option<Vec<String>>, RemoteError> {
    match arg {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| RemoteError::new("parameter names must be strings"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(RemoteError::new("expected a list of parameter names")),
    }
}

impl Handler for DeviceManager {
    fn method_map(self: &Arc<Self>) -> MethodMap {
        let manager = Arc::clone(self);
        let mut map = MethodMap::new().route("list_uids", {
            let manager = Arc::clone(&manager);
            move |_args| {
                let manager = Arc::clone(&manager);
                async move { Ok(Json::from(manager.uids())) }
            }
        });

        // ping/disable/unsubscribe share the broadcast-or-subset shape.
        for (name, op) in [
            ("ping", 0u8),
            ("disable", 1u8),
            ("unsubscribe", 2u8),
        ] {
            let manager = Arc::clone(&manager);
            map = map.route(name, move |args: Vec<Json>| {
                let manager = Arc::clone(&manager);
                async move {
                    let uids = optional_uids(args.first())?;
                    for session in manager.sessions(uids).map_err(remote)? {
                        let outcome = match op {
                            0 => session.ping().await,
                            1 => session.disable().await,
                            _ => session.unsubscribe().await,
                        };
                        outcome.map_err(remote)?;
                    }
                    Ok(Json::Null)
                }
            });
        }

        let subscribe_manager = Arc::clone(&manager);
        let read_manager = Arc::clone(&manager);
        let heartbeat_manager = Arc::clone(&manager);
        map.route("subscribe", move |args: Vec<Json>| {
            let manager = Arc::clone(&subscribe_manager);
            async move {
                let uid = required_uid(args.first())?;
                let params = optional_params(args.get(1))?;
                let interval = args.get(2).and_then(Json::as_f64);
                let session = manager.session(&uid).map_err(remote)?;
                session.subscribe(params, interval).await.map_err(remote)?;
                Ok(Json::Null)
            }
        })
        .route("read", move |args: Vec<Json>| {
            let manager = Arc::clone(&read_manager);
            async move {
                let uid = required_uid(args.first())?;
                let params = optional_params(args.get(1))?;
                let session = manager.session(&uid).map_err(remote)?;
                session.read(params).await.map_err(remote)?;
                Ok(Json::Null)
            }
        })
        .route("heartbeat", move |args: Vec<Json>| {
            let manager = Arc::clone(&heartbeat_manager);
            async move {
                let uid = required_uid(args.first())?;
                let id = match args.get(1) {
                    None | Some(Json::Null) => None,
                    Some(value) => Some(
                        value
                            .as_u64()
                            .and_then(|id| u8::try_from(id).ok())
                            .ok_or_else(|| RemoteError::new("heartbeat id must fit one byte"))?,
                    ),
                };
                let timeout = args.get(2).and_then(Json::as_f64).unwrap_or(1.0).max(0.0);
                let block = args.get(3).and_then(Json::as_bool).unwrap_or(true);
                let session = manager.session(&uid).map_err(remote)?;
                let elapsed = session
                    .heartbeat(id, Duration::from_secs_f64(timeout), block)
                    .await
                    .map_err(remote)?;
                Ok(Json::from(elapsed))
            }
        })
    }
}
