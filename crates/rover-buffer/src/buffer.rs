//! Typed, mutex-protected shared-memory buffers.
//!
//! Region layout (offsets from the mapping base):
//!
//! ```text
//! | robust mutex | valid: u8 | read block | write block | control block? |
//! ```
//!
//! Each block starts with an `f64` timestamp followed by the capability's
//! parameters in catalog order at natural alignment, `f64` values stored as
//! `f32`. The control block (device buffers only) holds the UID, the
//! subscription bitmap and delay, and the `read`/`write`/`update` bitmaps
//! that coordinate the device manager and the executor.
//!
//! Every operation other than `set_valid` runs under the region's mutex and
//! fails with [`BufferError::Invalid`] while the valid flag is clear. The
//! layout is a pure function of the catalog entry, so every process computes
//! the identical one.

use std::slice;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::catalog::{DeviceType, Param, ParamType};
use crate::shm::ShmRegion;
use crate::sync::{SharedMutex, SyncError};
use crate::value::Value;
use crate::BufferError;
use rover_proto::{bits, DeviceUid, Message, MessageError};

const TIMESTAMP_WIDTH: usize = 8;

// Control block offsets (natural alignment; the UID's u64 nonce forces the
// 8-byte hole after `year`).
const CTRL_UID_ID: usize = 0;
const CTRL_UID_YEAR: usize = 2;
const CTRL_UID_RANDOM: usize = 8;
const CTRL_SUBSCRIPTION: usize = 16;
const CTRL_DELAY: usize = 18;
const CTRL_READ: usize = 20;
const CTRL_WRITE: usize = 22;
const CTRL_UPDATE: usize = 24;
const CTRL_SIZE: usize = 32;

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) / align * align
}

#[derive(Debug, Clone)]
struct Field {
    index: usize,
    offset: usize,
    ty: ParamType,
}

/// One capability block: timestamp plus the parameters that have the
/// capability, laid out at natural alignment.
#[derive(Debug, Clone)]
struct BlockLayout {
    offset: usize,
    size: usize,
    fields: Vec<Field>,
}

impl BlockLayout {
    fn new(offset: usize, params: &[Param], capability: impl Fn(&Param) -> bool) -> Self {
        let mut cursor = TIMESTAMP_WIDTH;
        let mut fields = Vec::new();
        for (index, param) in params.iter().enumerate() {
            if !capability(param) {
                continue;
            }
            cursor = align_up(cursor, param.ty.align());
            fields.push(Field {
                index,
                offset: cursor,
                ty: param.ty,
            });
            cursor += param.ty.width();
        }
        Self {
            offset,
            size: align_up(cursor, 8),
            fields,
        }
    }

    fn field(&self, index: usize) -> Option<&Field> {
        self.fields.iter().find(|f| f.index == index)
    }
}

/// Deterministic layout of one buffer type.
#[derive(Debug, Clone)]
pub struct BufferLayout {
    read: BlockLayout,
    write: BlockLayout,
    control: Option<usize>,
    size: usize,
}

impl BufferLayout {
    pub fn new(ty: &DeviceType, control: bool) -> Self {
        // The valid byte sits at offset 0; blocks are 8-aligned after it.
        let read = BlockLayout::new(8, &ty.params, |p| p.readable);
        let write = BlockLayout::new(read.offset + read.size, &ty.params, |p| p.writeable);
        let control_offset = control.then_some(write.offset + write.size);
        let size = match control_offset {
            Some(offset) => offset + CTRL_SIZE,
            None => write.offset + write.size,
        };
        Self {
            read,
            write,
            control: control_offset,
            size,
        }
    }

    /// Total region size, mutex included.
    pub fn region_size(&self) -> usize {
        mutex_span() + self.size
    }
}

fn mutex_span() -> usize {
    align_up(SharedMutex::size(), 8)
}

fn timestamp_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// A shared-memory buffer for one device, gamepad slot, or the field.
#[derive(Debug)]
pub struct Buffer {
    ty: Arc<DeviceType>,
    layout: BufferLayout,
    region: ShmRegion,
    mutex: SharedMutex,
    data: *mut u8,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

/// Scoped mutex hold; releases on drop, tolerating a release the caller does
/// not own (the acquire path may have observed `EDEADLK`).
struct Guard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        match self.mutex.release() {
            Ok(()) | Err(SyncError::NotOwner) => {}
            Err(err) => warn!(%err, "buffer mutex release failed"),
        }
    }
}

impl Buffer {
    /// Open (or create) the named region for a device type.
    ///
    /// The creating handle initializes the mutex and marks the buffer valid;
    /// attachers with `create = true` also mark it valid. Passing
    /// `create = false` fails if the region does not exist.
    pub fn open(
        ty: Arc<DeviceType>,
        name: &str,
        create: bool,
        control: bool,
    ) -> Result<Self, BufferError> {
        let layout = BufferLayout::new(&ty, control);
        let region = ShmRegion::open(name, layout.region_size(), create)?;
        let mutex = unsafe { SharedMutex::from_raw(region.base()) };
        let data = unsafe { region.base().add(mutex_span()) };
        if region.created() {
            mutex.initialize()?;
        }
        let buffer = Self {
            ty,
            layout,
            region,
            mutex,
            data,
        };
        if create {
            buffer.set_valid(true)?;
        }
        Ok(buffer)
    }

    pub fn device_type(&self) -> &Arc<DeviceType> {
        &self.ty
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn is_device(&self) -> bool {
        self.layout.control.is_some()
    }

    /// Acquire the region mutex.
    ///
    /// `EINVAL` means we attached during the creation race, before the
    /// creator initialized the mutex; retry briefly. `EDEADLK` means this
    /// thread already holds the lock and may proceed.
    fn lock(&self) -> Result<Guard<'_>, BufferError> {
        let mut attempts = 0;
        loop {
            match self.mutex.acquire(None) {
                Ok(()) | Err(SyncError::Deadlock) => return Ok(Guard { mutex: &self.mutex }),
                Err(SyncError::Uninitialized) if attempts < 100 => {
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn operation<R>(&self, f: impl FnOnce() -> Result<R, BufferError>) -> Result<R, BufferError> {
        let _guard = self.lock()?;
        if !self.raw_valid() {
            return Err(BufferError::Invalid);
        }
        f()
    }

    // -- raw accessors; callers hold the mutex ------------------------------

    fn raw(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.layout.size);
        unsafe { slice::from_raw_parts(self.data.add(offset), len) }
    }

    fn raw_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.layout.size);
        unsafe { slice::from_raw_parts_mut(self.data.add(offset), len) }
    }

    fn raw_valid(&self) -> bool {
        self.raw(0, 1)[0] != 0
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.raw(offset, 2).try_into().unwrap())
    }

    fn write_u16(&self, offset: usize, value: u16) {
        self.raw_mut(offset, 2).copy_from_slice(&value.to_le_bytes());
    }

    fn read_f64(&self, offset: usize) -> f64 {
        f64::from_le_bytes(self.raw(offset, 8).try_into().unwrap())
    }

    fn write_f64(&self, offset: usize, value: f64) {
        self.raw_mut(offset, 8).copy_from_slice(&value.to_le_bytes());
    }

    fn control(&self) -> Result<usize, BufferError> {
        self.layout.control.ok_or(BufferError::NoControlBlock)
    }

    // -- public operations ---------------------------------------------------

    /// The only operation permitted while the buffer is invalid.
    pub fn set_valid(&self, valid: bool) -> Result<(), BufferError> {
        let _guard = self.lock()?;
        self.raw_mut(0, 1)[0] = valid as u8;
        Ok(())
    }

    pub fn valid(&self) -> Result<bool, BufferError> {
        let _guard = self.lock()?;
        Ok(self.raw_valid())
    }

    /// Read a parameter's current value from the read block.
    pub fn get_value(&self, param: &str) -> Result<Value, BufferError> {
        self.operation(|| {
            let (index, descriptor) = self.ty.param(param)?;
            let field = self
                .layout
                .read
                .field(index)
                .ok_or_else(|| BufferError::NotReadable {
                    param: param.to_owned(),
                })?;
            let slot = self.raw(self.layout.read.offset + field.offset, field.ty.width());
            Ok(Value::decode(descriptor.ty, slot))
        })
    }

    fn clamp(&self, descriptor: &Param, value: Value) -> Value {
        let Some(v) = value.as_f64() else {
            return value;
        };
        if v < descriptor.lower {
            warn!(
                param = %descriptor.name,
                value = v,
                lower = descriptor.lower,
                "value exceeded lower bound"
            );
        }
        if v > descriptor.upper {
            warn!(
                param = %descriptor.name,
                value = v,
                upper = descriptor.upper,
                "value exceeded upper bound"
            );
        }
        Value::Float(v.clamp(descriptor.lower, descriptor.upper))
    }

    fn store(
        &self,
        block: &BlockLayout,
        param: &str,
        value: Value,
        missing: impl Fn(String) -> BufferError,
    ) -> Result<(), BufferError> {
        let (index, descriptor) = self.ty.param(param)?;
        let field = block.field(index).ok_or_else(|| missing(param.to_owned()))?;
        let value = if descriptor.ty.is_float() {
            self.clamp(descriptor, value)
        } else {
            value
        };
        let slot = self.raw_mut(block.offset + field.offset, field.ty.width());
        value.encode(param, descriptor.ty, slot)?;
        self.write_f64(block.offset, timestamp_now());
        Ok(())
    }

    /// Write a parameter into the write block, flagging it for transmission.
    /// Out-of-bound floats clamp with a warning; they never fail.
    pub fn set_value(&self, param: &str, value: Value) -> Result<(), BufferError> {
        self.operation(|| {
            self.store(&self.layout.write, param, value, |param| {
                BufferError::NotWriteable { param }
            })?;
            if let Ok(control) = self.control() {
                let index = self.ty.index_of(param).unwrap();
                let pending = self.read_u16(control + CTRL_WRITE);
                self.write_u16(control + CTRL_WRITE, pending | 1 << index);
            }
            Ok(())
        })
    }

    /// Write a parameter into the read block directly. This is the ingestion
    /// path for sources that are not Smart Devices (gamepad and field state),
    /// and for device emulation.
    pub fn set_data(&self, param: &str, value: Value) -> Result<(), BufferError> {
        self.operation(|| {
            self.store(&self.layout.read, param, value, |param| {
                BufferError::NotReadable { param }
            })
        })
    }

    /// Flag parameters for an explicit device read. Unknown names fail;
    /// non-readable parameters are dropped silently.
    pub fn set_read(&self, params: &[&str]) -> Result<(), BufferError> {
        self.operation(|| {
            let bitmap = self.ty.bitmap(params, |p| p.readable)?;
            let control = self.control()?;
            let pending = self.read_u16(control + CTRL_READ);
            self.write_u16(control + CTRL_READ, pending | bitmap);
            Ok(())
        })
    }

    /// Drain pending reads into a `DEV_READ` frame, if any.
    pub fn get_read(&self) -> Result<Option<Message>, BufferError> {
        self.operation(|| {
            let control = self.control()?;
            let bitmap = self.read_u16(control + CTRL_READ);
            if bitmap == 0 {
                return Ok(None);
            }
            self.write_u16(control + CTRL_READ, 0);
            Ok(Some(Message::dev_read(bitmap)))
        })
    }

    /// Drain pending writes into `DEV_WRITE` frames.
    ///
    /// A single frame carrying every flagged parameter is attempted first;
    /// if the values cannot fit one payload, one frame per parameter is
    /// emitted instead. The pending bits clear only when emission succeeds.
    pub fn get_write(&self) -> Result<Vec<Message>, BufferError> {
        self.operation(|| {
            let control = self.control()?;
            let bitmap = self.read_u16(control + CTRL_WRITE);
            if bitmap == 0 {
                return Ok(Vec::new());
            }
            let map = BlockMap {
                buffer: self,
                block: &self.layout.write,
            };
            let messages = match Message::dev_write(bitmap, &map) {
                Ok(message) => vec![message],
                Err(MessageError::PayloadOverflow) => bits(bitmap)
                    .map(|index| Message::dev_write(1 << index, &map))
                    .collect::<Result<_, _>>()?,
                Err(err) => return Err(err.into()),
            };
            self.write_u16(control + CTRL_WRITE, 0);
            Ok(messages)
        })
    }

    /// Snapshot and clear the recently-updated parameter set.
    pub fn get_update(&self) -> Result<Vec<(String, Value)>, BufferError> {
        self.operation(|| {
            let control = self.control()?;
            let bitmap = self.read_u16(control + CTRL_UPDATE);
            let mut update = Vec::new();
            for index in bits(bitmap) {
                let Some(field) = self.layout.read.field(index) else {
                    continue;
                };
                let slot = self.raw(self.layout.read.offset + field.offset, field.ty.width());
                update.push((
                    self.ty.params[index].name.clone(),
                    Value::decode(self.ty.params[index].ty, slot),
                ));
            }
            self.write_u16(control + CTRL_UPDATE, 0);
            Ok(update)
        })
    }

    /// Apply an inbound `DEV_DATA` frame to the read block and remember which
    /// parameters it touched. The read timestamp moves only when the frame
    /// carried at least one mapped parameter.
    pub fn update_data(&self, message: &Message) -> Result<(), BufferError> {
        self.operation(|| {
            let control = self.control()?;
            let mut map = BlockMap {
                buffer: self,
                block: &self.layout.read,
            };
            let bitmap = message.read_values(&mut map)?;
            if bitmap != 0 {
                let updated = self.read_u16(control + CTRL_UPDATE);
                self.write_u16(control + CTRL_UPDATE, updated | bitmap);
                self.write_f64(self.layout.read.offset, timestamp_now());
            }
            Ok(())
        })
    }

    pub fn set_subscription(&self, uid: DeviceUid, params: &[&str]) -> Result<(), BufferError> {
        self.operation(|| {
            let bitmap = self.ty.bitmap(params, |_| true)?;
            let control = self.control()?;
            self.write_uid(control, uid);
            self.write_u16(control + CTRL_SUBSCRIPTION, bitmap);
            Ok(())
        })
    }

    /// Record a device's `SUB_RES`: UID, granted subscription, and delay.
    pub fn apply_sub_res(&self, message: &Message) -> Result<(), BufferError> {
        let (bitmap, delay_ms, uid) = message.read_sub_res()?;
        self.operation(|| {
            let control = self.control()?;
            self.write_uid(control, uid);
            self.write_u16(control + CTRL_SUBSCRIPTION, bitmap);
            self.write_u16(control + CTRL_DELAY, delay_ms);
            Ok(())
        })
    }

    fn write_uid(&self, control: usize, uid: DeviceUid) {
        self.raw_mut(control + CTRL_UID_ID, 2)
            .copy_from_slice(&uid.device_id.to_le_bytes());
        self.raw_mut(control + CTRL_UID_YEAR, 1)[0] = uid.year;
        self.raw_mut(control + CTRL_UID_RANDOM, 8)
            .copy_from_slice(&uid.random.to_le_bytes());
    }

    pub fn uid(&self) -> Result<DeviceUid, BufferError> {
        self.operation(|| {
            let control = self.control()?;
            Ok(DeviceUid {
                device_id: self.read_u16(control + CTRL_UID_ID),
                year: self.raw(control + CTRL_UID_YEAR, 1)[0],
                random: u64::from_le_bytes(
                    self.raw(control + CTRL_UID_RANDOM, 8).try_into().unwrap(),
                ),
            })
        })
    }

    pub fn subscription(&self) -> Result<Vec<String>, BufferError> {
        self.operation(|| {
            let control = self.control()?;
            let bitmap = self.read_u16(control + CTRL_SUBSCRIPTION);
            Ok(bits(bitmap)
                .filter_map(|index| self.ty.params.get(index))
                .map(|p| p.name.clone())
                .collect())
        })
    }

    pub fn delay_ms(&self) -> Result<u16, BufferError> {
        self.operation(|| Ok(self.read_u16(self.control()? + CTRL_DELAY)))
    }

    pub fn last_update(&self) -> Result<f64, BufferError> {
        self.operation(|| Ok(self.read_f64(self.layout.read.offset)))
    }

    pub fn last_write(&self) -> Result<f64, BufferError> {
        self.operation(|| Ok(self.read_f64(self.layout.write.offset)))
    }

    /// Bitmap of readable parameters, restricted to `params` when given.
    pub fn readable_bitmap(&self, params: Option<&[&str]>) -> Result<u16, BufferError> {
        match params {
            Some(params) => self.ty.bitmap(params, |p| p.readable),
            None => Ok(self.ty.bitmap_all(|p| p.readable)),
        }
    }

    /// Build the `SUB_RES` matching this buffer's control block (device
    /// emulation speaks the device side of the protocol).
    pub fn make_sub_res(&self) -> Result<Message, BufferError> {
        self.operation(|| {
            let control = self.control()?;
            Ok(Message::sub_res(
                self.read_u16(control + CTRL_SUBSCRIPTION),
                self.read_u16(control + CTRL_DELAY),
                DeviceUid {
                    device_id: self.read_u16(control + CTRL_UID_ID),
                    year: self.raw(control + CTRL_UID_YEAR, 1)[0],
                    random: u64::from_le_bytes(
                        self.raw(control + CTRL_UID_RANDOM, 8).try_into().unwrap(),
                    ),
                },
            ))
        })
    }

}

/// `ParameterMap` over one capability block; constructed under the mutex.
struct BlockMap<'a> {
    buffer: &'a Buffer,
    block: &'a BlockLayout,
}

impl rover_proto::ParameterMap for BlockMap<'_> {
    fn slot(&self, index: usize) -> Option<&[u8]> {
        let field = self.block.field(index)?;
        Some(
            self.buffer
                .raw(self.block.offset + field.offset, field.ty.width()),
        )
    }

    fn slot_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let field = self.block.field(index)?;
        Some(
            self.buffer
                .raw_mut(self.block.offset + field.offset, field.ty.width()),
        )
    }
}
