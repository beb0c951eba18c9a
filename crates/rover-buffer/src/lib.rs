//! Shared-memory device buffers.
//!
//! One mutex-protected region exists per connected Smart Device, per gamepad
//! slot, and for the field state. The device manager owns the write side of
//! device data; the executor reads sensor values and flags actuator writes;
//! the broker ingests gamepad input and publishes update snapshots. The
//! region's robust mutex is the only cross-process synchronization in the
//! runtime.

mod buffer;
mod catalog;
mod shm;
mod store;
pub mod sync;
mod value;

pub use buffer::{Buffer, BufferLayout};
pub use catalog::{Catalog, DeviceType, Param, ParamType};
pub use shm::ShmRegion;
pub use store::{BufferKey, BufferStore};
pub use sync::{SharedMutex, SyncError};
pub use value::Value;

pub use rover_proto::DeviceUid;

use thiserror::Error;

/// Buffer-layer failures. None of these are fatal to the process; callers
/// log and carry on (student code sees them as absent values).
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer is marked as invalid")]
    Invalid,
    #[error("no such parameter: {param}")]
    NoSuchParam { param: String },
    #[error("parameter is not readable: {param}")]
    NotReadable { param: String },
    #[error("parameter is not writeable: {param}")]
    NotWriteable { param: String },
    #[error("value does not fit parameter: {param}")]
    BadValue { param: String },
    #[error("buffer has no control block")]
    NoControlBlock,
    #[error("cannot attach to nonexistent shared memory: {name}")]
    NoSuchRegion { name: String },
    #[error("unknown device type: {0}")]
    UnknownDeviceType(String),
    #[error("unknown device id {0:#06x}")]
    UnknownDeviceId(u16),
    #[error("invalid catalog: {0}")]
    Catalog(String),
    #[error("shared memory operation failed: {0}")]
    Os(#[from] std::io::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Message(#[from] rover_proto::MessageError),
}
