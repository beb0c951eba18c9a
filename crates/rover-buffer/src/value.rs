//! Dynamically-typed parameter values.

use serde::ser::{Serialize, Serializer};

use crate::catalog::ParamType;
use crate::BufferError;

/// A parameter value crossing the buffer boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl Value {
    /// Convert from the call-envelope representation.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Some(Self::Uint(u))
                } else if let Some(i) = n.as_i64() {
                    Some(Self::Int(i))
                } else {
                    n.as_f64().map(Self::Float)
                }
            }
            serde_json::Value::String(s) => Some(Self::Bytes(s.clone().into_bytes())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Uint(u) => serde_json::Value::from(*u),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => serde_json::Value::from(s.trim_end_matches('\0')),
                Err(_) => serde_json::Value::from(bytes.clone()),
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Uint(u) => Some(*u as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(i) => u64::try_from(*i).ok(),
            Self::Uint(u) => Some(*u),
            _ => None,
        }
    }

    fn bad(param: &str) -> BufferError {
        BufferError::BadValue {
            param: param.to_owned(),
        }
    }

    /// Encode into a parameter slot; `out` is exactly `ty.width()` bytes.
    pub fn encode(&self, param: &str, ty: ParamType, out: &mut [u8]) -> Result<(), BufferError> {
        debug_assert_eq!(out.len(), ty.width());
        match ty {
            ParamType::Bool => match self {
                Self::Bool(b) => out[0] = *b as u8,
                _ => return Err(Self::bad(param)),
            },
            ParamType::U8 => {
                let v = self.as_u64().ok_or_else(|| Self::bad(param))?;
                out[0] = u8::try_from(v).map_err(|_| Self::bad(param))?;
            }
            ParamType::I8 => {
                let v = self.as_i64().ok_or_else(|| Self::bad(param))?;
                out[0] = i8::try_from(v).map_err(|_| Self::bad(param))? as u8;
            }
            ParamType::U16 => {
                let v = self.as_u64().ok_or_else(|| Self::bad(param))?;
                let v = u16::try_from(v).map_err(|_| Self::bad(param))?;
                out.copy_from_slice(&v.to_le_bytes());
            }
            ParamType::I16 => {
                let v = self.as_i64().ok_or_else(|| Self::bad(param))?;
                let v = i16::try_from(v).map_err(|_| Self::bad(param))?;
                out.copy_from_slice(&v.to_le_bytes());
            }
            ParamType::U32 => {
                let v = self.as_u64().ok_or_else(|| Self::bad(param))?;
                let v = u32::try_from(v).map_err(|_| Self::bad(param))?;
                out.copy_from_slice(&v.to_le_bytes());
            }
            ParamType::I32 => {
                let v = self.as_i64().ok_or_else(|| Self::bad(param))?;
                let v = i32::try_from(v).map_err(|_| Self::bad(param))?;
                out.copy_from_slice(&v.to_le_bytes());
            }
            ParamType::U64 => {
                let v = self.as_u64().ok_or_else(|| Self::bad(param))?;
                out.copy_from_slice(&v.to_le_bytes());
            }
            ParamType::I64 => {
                let v = self.as_i64().ok_or_else(|| Self::bad(param))?;
                out.copy_from_slice(&v.to_le_bytes());
            }
            // Doubles are narrowed to singles in the slot.
            ParamType::F32 | ParamType::F64 => {
                let v = self.as_f64().ok_or_else(|| Self::bad(param))? as f32;
                out.copy_from_slice(&v.to_le_bytes());
            }
            ParamType::Bytes { width } => match self {
                Self::Bytes(bytes) if bytes.len() <= width => {
                    out[..bytes.len()].copy_from_slice(bytes);
                    out[bytes.len()..].fill(0);
                }
                _ => return Err(Self::bad(param)),
            },
        }
        Ok(())
    }

    /// Decode from a parameter slot of exactly `ty.width()` bytes.
    pub fn decode(ty: ParamType, bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), ty.width());
        match ty {
            ParamType::Bool => Self::Bool(bytes[0] != 0),
            ParamType::U8 => Self::Uint(bytes[0].into()),
            ParamType::I8 => Self::Int((bytes[0] as i8).into()),
            ParamType::U16 => Self::Uint(u16::from_le_bytes([bytes[0], bytes[1]]).into()),
            ParamType::I16 => Self::Int(i16::from_le_bytes([bytes[0], bytes[1]]).into()),
            ParamType::U32 => {
                Self::Uint(u32::from_le_bytes(bytes.try_into().unwrap()).into())
            }
            ParamType::I32 => Self::Int(i32::from_le_bytes(bytes.try_into().unwrap()).into()),
            ParamType::U64 => Self::Uint(u64::from_le_bytes(bytes.try_into().unwrap())),
            ParamType::I64 => Self::Int(i64::from_le_bytes(bytes.try_into().unwrap())),
            ParamType::F32 | ParamType::F64 => {
                Self::Float(f32::from_le_bytes(bytes.try_into().unwrap()).into())
            }
            ParamType::Bytes { .. } => Self::Bytes(bytes.to_vec()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
