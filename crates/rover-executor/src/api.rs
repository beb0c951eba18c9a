//! The student-facing runtime API.
//!
//! Student code receives an [`Api`] per invocation: robot and gamepad
//! handles over the shared-memory buffers, field state, the actions API, and
//! a print that funnels into the log. Every accessor is a cancellation point
//! and never panics on a missing device or parameter; failures are logged
//! and surface as `None`.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value as Json;
use tracing::{error, info, warn};

use rover_buffer::{BufferError, BufferKey, BufferStore, Value};
use rover_proto::DeviceUid;

use crate::async_exec::Actions;
use crate::request::CancelToken;
use crate::ExecutionError;

/// The alliances that compete in a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alliance {
    Blue = 0,
    Gold = 1,
}

impl Alliance {
    pub fn from_u8(value: u8) -> Self {
        if value == 1 {
            Self::Gold
        } else {
            Self::Blue
        }
    }
}

/// Resolve a UID string or a configured human-readable device name.
fn resolve_uid(names: &HashMap<String, DeviceUid>, device: &str) -> Option<DeviceUid> {
    if let Some(uid) = names.get(device) {
        return Some(*uid);
    }
    device.parse().ok()
}

/// Smart Device access.
#[derive(Clone)]
pub struct Robot {
    buffers: Arc<BufferStore>,
    names: Arc<HashMap<String, DeviceUid>>,
    token: CancelToken,
}

impl Robot {
    /// Read a sensor parameter. Missing devices and unreadable parameters
    /// log and yield `None`; they never halt student code.
    pub fn get(&self, device: &str, param: &str) -> Option<Json> {
        if self.token.checkpoint().is_err() {
            return None;
        }
        let Some(uid) = resolve_uid(&self.names, device) else {
            error!(device, "get(...) raised an error: unknown device name");
            return None;
        };
        match self
            .buffers
            .attach(BufferKey::Device(uid))
            .and_then(|buffer| buffer.get_value(param))
        {
            Ok(value) => Some(value.to_json()),
            Err(BufferError::NoSuchRegion { .. }) => {
                warn!(device, param, "device does not exist");
                None
            }
            Err(err) => {
                warn!(device, param, %err, "unable to get parameter");
                None
            }
        }
    }

    /// Write an actuator parameter; the device manager transmits it on its
    /// next poll.
    pub fn write(&self, device: &str, param: &str, value: impl Into<Json>) {
        if self.token.checkpoint().is_err() {
            return;
        }
        let Some(uid) = resolve_uid(&self.names, device) else {
            error!(device, "write(...) raised an error: unknown device name");
            return;
        };
        let value = value.into();
        let Some(value) = Value::from_json(&value) else {
            error!(device, param, "write(...) raised an error: unsupported value");
            return;
        };
        if let Err(err) = self
            .buffers
            .attach(BufferKey::Device(uid))
            .and_then(|buffer| buffer.set_value(param, value))
        {
            error!(device, param, %err, "write(...) raised an error");
        }
    }
}

/// Gamepad input access. Disabled during autonomous.
#[derive(Clone)]
pub struct Gamepad {
    buffers: Arc<BufferStore>,
    enabled: bool,
    token: CancelToken,
}

impl Gamepad {
    pub fn get(&self, param: &str, index: usize) -> Option<Json> {
        if self.token.checkpoint().is_err() {
            return None;
        }
        if !self.enabled {
            error!(param, index, "gamepad is not enabled in autonomous");
            return None;
        }
        match self
            .buffers
            .attach(BufferKey::Gamepad(index))
            .and_then(|buffer| buffer.get_value(param))
        {
            Ok(value) => Some(value.to_json()),
            Err(err) => {
                warn!(param, index, %err, "unable to get gamepad parameter");
                None
            }
        }
    }
}

/// Field and match state.
#[derive(Clone)]
pub struct Field {
    buffers: Arc<BufferStore>,
    start: Instant,
}

impl Field {
    /// The alliance this robot is a member of in this match.
    pub fn alliance(&self) -> Alliance {
        let value = self
            .buffers
            .attach(BufferKey::Field)
            .and_then(|buffer| buffer.get_value("alliance"));
        match value {
            Ok(Value::Uint(raw)) => Alliance::from_u8(raw as u8),
            Ok(Value::Int(raw)) => Alliance::from_u8(raw as u8),
            _ => Alliance::Blue,
        }
    }

    /// Seconds since the current match phase started.
    pub fn clock(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn send(&self, _obj: &Json) {
        // No wire format exists for robot-to-robot messages yet.
        warn!("Field.send is not implemented");
    }

    pub fn recv(&self) -> Option<Json> {
        warn!("Field.recv is not implemented");
        None
    }
}

/// Everything injected into a student invocation.
#[derive(Clone)]
pub struct Api {
    pub robot: Robot,
    pub gamepad: Gamepad,
    pub field: Field,
    pub actions: Actions,
    token: CancelToken,
}

impl Api {
    pub fn new(
        buffers: Arc<BufferStore>,
        names: Arc<HashMap<String, DeviceUid>>,
        actions: Actions,
        enable_gamepads: bool,
        token: CancelToken,
    ) -> Self {
        Self {
            robot: Robot {
                buffers: Arc::clone(&buffers),
                names,
                token: token.clone(),
            },
            gamepad: Gamepad {
                buffers: Arc::clone(&buffers),
                enabled: enable_gamepads,
                token: token.clone(),
            },
            field: Field {
                buffers,
                start: Instant::now(),
            },
            actions,
            token,
        }
    }

    /// The replacement `print`: student output lands in the log stream.
    pub fn print(&self, message: impl Display) {
        info!(student_print = true, "{message}");
    }

    /// Fail fast once this invocation's deadline has passed. Long-running
    /// student loops should call this (directly or through any accessor).
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        self.token.checkpoint()
    }
}

/// One loaded student module: named synchronous functions plus named actions.
pub trait StudentModule: Send + Sync {
    fn function(
        &self,
        name: &str,
    ) -> Option<Arc<dyn Fn(&Api, &[Json]) -> Result<Json, ExecutionError> + Send + Sync>>;

    fn action(&self, _name: &str) -> Option<crate::async_exec::Action> {
        None
    }
}

/// Produces a fresh module instance on every `execute` (the moral
/// equivalent of re-importing student code from disk).
pub type ModuleFactory =
    Arc<dyn Fn() -> Result<Arc<dyn StudentModule>, ExecutionError> + Send + Sync>;
