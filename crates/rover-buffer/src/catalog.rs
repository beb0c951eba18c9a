//! The device catalog: the configuration-time mapping from device-type names
//! to parameter lists.
//!
//! The catalog is loaded once at startup (a JSON document shared by every
//! process) and immutable afterwards. Parameter order is significant: a
//! parameter's position is its bit in the subscription/read/write/update
//! bitmaps and its slot order inside value-carrying frames.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::BufferError;
use rover_proto::MAX_PARAMS;

/// Scalar parameter types.
///
/// `F64` parameters are declared double-precision but occupy single-precision
/// slots in buffers and frames. `Bytes` is a fixed-width string.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Bytes { width: usize },
}

impl ParamType {
    /// Width of the parameter's slot in buffers and frames.
    pub fn width(self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 | Self::F64 => 4,
            Self::U64 | Self::I64 => 8,
            Self::Bytes { width } => width,
        }
    }

    /// Natural alignment of the slot.
    pub fn align(self) -> usize {
        match self {
            Self::Bytes { .. } => 1,
            other => other.width(),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

fn neg_infinity() -> f64 {
    f64::NEG_INFINITY
}

fn infinity() -> f64 {
    f64::INFINITY
}

fn default_true() -> bool {
    true
}

/// Static description of one device parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default = "neg_infinity")]
    pub lower: f64,
    #[serde(default = "infinity")]
    pub upper: f64,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default)]
    pub writeable: bool,
}

/// One catalog entry: a device model class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceType {
    #[serde(skip)]
    pub name: String,
    pub device_id: u16,
    pub params: Vec<Param>,
}

impl DeviceType {
    pub fn index_of(&self, param: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == param)
    }

    pub fn param(&self, name: &str) -> Result<(usize, &Param), BufferError> {
        self.index_of(name)
            .map(|i| (i, &self.params[i]))
            .ok_or_else(|| BufferError::NoSuchParam {
                param: name.to_owned(),
            })
    }

    /// Bitmap of the named parameters that satisfy `predicate`.
    pub fn bitmap(
        &self,
        params: &[&str],
        predicate: impl Fn(&Param) -> bool,
    ) -> Result<u16, BufferError> {
        let mut bitmap = 0u16;
        for name in params {
            let (index, param) = self.param(name)?;
            if predicate(param) {
                bitmap |= 1 << index;
            }
        }
        Ok(bitmap)
    }

    /// Bitmap of every parameter satisfying `predicate`.
    pub fn bitmap_all(&self, predicate: impl Fn(&Param) -> bool) -> u16 {
        let mut bitmap = 0u16;
        for (index, param) in self.params.iter().enumerate() {
            if predicate(param) {
                bitmap |= 1 << index;
            }
        }
        bitmap
    }

    fn validate(&self) -> Result<(), BufferError> {
        if self.params.len() > MAX_PARAMS {
            return Err(BufferError::Catalog(format!(
                "device type {:?} has {} parameters (max {MAX_PARAMS})",
                self.name,
                self.params.len(),
            )));
        }
        for param in &self.params {
            if let ParamType::Bytes { width } = param.ty {
                if width == 0 || width > rover_proto::MAX_PAYLOAD_SIZE {
                    return Err(BufferError::Catalog(format!(
                        "parameter {:?} has invalid byte width {width}",
                        param.name,
                    )));
                }
            }
            if self
                .params
                .iter()
                .filter(|other| other.name == param.name)
                .count()
                > 1
            {
                return Err(BufferError::Catalog(format!(
                    "duplicate parameter name {:?} in {:?}",
                    param.name, self.name,
                )));
            }
        }
        Ok(())
    }
}

/// The immutable catalog, indexed by type name and by 16-bit device id.
#[derive(Debug, Default)]
pub struct Catalog {
    by_name: HashMap<String, Arc<DeviceType>>,
    by_id: HashMap<u16, Arc<DeviceType>>,
}

impl Catalog {
    pub fn from_json(json: &str) -> Result<Self, BufferError> {
        let raw: HashMap<String, DeviceType> = serde_json::from_str(json)
            .map_err(|err| BufferError::Catalog(err.to_string()))?;
        let mut catalog = Self::default();
        for (name, mut ty) in raw {
            ty.name = name.clone();
            ty.validate()?;
            let ty = Arc::new(ty);
            if let Some(other) = catalog.by_id.insert(ty.device_id, Arc::clone(&ty)) {
                return Err(BufferError::Catalog(format!(
                    "device id {:#06x} claimed by both {:?} and {:?}",
                    ty.device_id, other.name, ty.name,
                )));
            }
            catalog.by_name.insert(name, ty);
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, BufferError> {
        let json = fs::read_to_string(path)
            .map_err(|err| BufferError::Catalog(format!("{}: {err}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<DeviceType>, BufferError> {
        self.by_name
            .get(name)
            .ok_or_else(|| BufferError::UnknownDeviceType(name.to_owned()))
    }

    pub fn by_device_id(&self, device_id: u16) -> Result<&Arc<DeviceType>, BufferError> {
        self.by_id
            .get(&device_id)
            .ok_or(BufferError::UnknownDeviceId(device_id))
    }
}
