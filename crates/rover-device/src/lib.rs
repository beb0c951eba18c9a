//! Smart Device management.
//!
//! The device manager watches for hotplugged serial devices, runs a
//! [`DeviceSession`] per connection (reader, writer, handler, and poller
//! tasks), owns the write side of each device's shared-memory buffer, and
//! answers the `device-service` remote calls.

mod manager;
mod observer;
mod session;

pub use manager::{DeviceManager, DeviceOptions};
pub use observer::{DeviceObserver, PollingObserver};
pub use session::DeviceSession;

use thiserror::Error;

/// Device-manager failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no such device: {uid}")]
    NoSuchDevice { uid: String },
    #[error("device type was never discovered")]
    NotDiscovered,
    #[error("message type not handled: {0:?}")]
    UnhandledMessage(rover_proto::MessageType),
    #[error("unknown heartbeat response id {0}")]
    UnknownHeartbeat(u8),
    #[error("device reported an error: {0:?}")]
    DeviceFault(rover_proto::ErrorCode),
    #[error("subscription interval out of range: {0} s")]
    IntervalOverflow(f64),
    #[error("heartbeat timed out")]
    HeartbeatTimeout,
    #[error("unable to allocate a heartbeat id")]
    HeartbeatId,
    #[error("device connection is gone")]
    Disconnected,
    #[error(transparent)]
    Buffer(#[from] rover_buffer::BufferError),
    #[error(transparent)]
    Message(#[from] rover_proto::MessageError),
    #[error("serial i/o failed: {0}")]
    Io(#[from] std::io::Error),
}
