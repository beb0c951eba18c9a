//! CBOR call envelopes.
//!
//! Every payload is a self-describing array `[type_id, ...]`:
//!
//! * request: `[0, request_id, method, args]`
//! * response: `[1, request_id, error, result]` where `error` is `null` or
//!   `[message, context]`
//! * notification: `[2, method, args]`

use std::collections::BTreeMap;

use ciborium::value::Value as Cbor;
use serde_json::{Map, Value as Json};
use thiserror::Error;

use crate::RpcError;

const REQUEST: u8 = 0;
const RESPONSE: u8 = 1;
const NOTIFICATION: u8 = 2;

/// A structured error produced by the remote side of a call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub context: Map<String, Json>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Json>) -> Self {
        self.context.insert(key.to_owned(), value.into());
        self
    }
}

/// One decoded call payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Request {
        request_id: u32,
        method: String,
        args: Vec<Json>,
    },
    Response {
        request_id: u32,
        error: Option<RemoteError>,
        result: Json,
    },
    Notification {
        method: String,
        args: Vec<Json>,
    },
}

fn json_to_cbor(value: &Json) -> Cbor {
    match value {
        Json::Null => Cbor::Null,
        Json::Bool(b) => Cbor::Bool(*b),
        Json::Number(n) => {
            if let Some(u) = n.as_u64() {
                Cbor::Integer(u.into())
            } else if let Some(i) = n.as_i64() {
                Cbor::Integer(i.into())
            } else {
                Cbor::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Cbor::Text(s.clone()),
        Json::Array(items) => Cbor::Array(items.iter().map(json_to_cbor).collect()),
        Json::Object(map) => Cbor::Map(
            map.iter()
                .map(|(k, v)| (Cbor::Text(k.clone()), json_to_cbor(v)))
                .collect(),
        ),
    }
}

fn cbor_to_json(value: &Cbor) -> Result<Json, RpcError> {
    Ok(match value {
        Cbor::Null => Json::Null,
        Cbor::Bool(b) => Json::Bool(*b),
        Cbor::Integer(n) => {
            let n = i128::from(*n);
            if let Ok(u) = u64::try_from(n) {
                Json::from(u)
            } else if let Ok(i) = i64::try_from(n) {
                Json::from(i)
            } else {
                return Err(RpcError::Malformed("integer out of range".into()));
            }
        }
        Cbor::Float(f) => {
            serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number)
        }
        Cbor::Text(s) => Json::String(s.clone()),
        Cbor::Bytes(bytes) => Json::Array(bytes.iter().map(|&b| Json::from(b)).collect()),
        Cbor::Array(items) => {
            Json::Array(items.iter().map(cbor_to_json).collect::<Result<_, _>>()?)
        }
        Cbor::Map(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                let Cbor::Text(key) = key else {
                    return Err(RpcError::Malformed("non-text map key".into()));
                };
                map.insert(key.clone(), cbor_to_json(value)?);
            }
            Json::Object(map)
        }
        other => {
            return Err(RpcError::Malformed(format!(
                "unsupported CBOR item: {other:?}"
            )))
        }
    })
}

fn error_to_cbor(error: &Option<RemoteError>) -> Cbor {
    match error {
        None => Cbor::Null,
        Some(error) => Cbor::Array(vec![
            Cbor::Text(error.message.clone()),
            json_to_cbor(&Json::Object(error.context.clone())),
        ]),
    }
}

pub fn encode_call(call: &Call) -> Result<Vec<u8>, RpcError> {
    let parts = match call {
        Call::Request {
            request_id,
            method,
            args,
        } => vec![
            Cbor::Integer((REQUEST as u64).into()),
            Cbor::Integer((*request_id as u64).into()),
            Cbor::Text(method.clone()),
            Cbor::Array(args.iter().map(json_to_cbor).collect()),
        ],
        Call::Response {
            request_id,
            error,
            result,
        } => vec![
            Cbor::Integer((RESPONSE as u64).into()),
            Cbor::Integer((*request_id as u64).into()),
            error_to_cbor(error),
            json_to_cbor(result),
        ],
        Call::Notification { method, args } => vec![
            Cbor::Integer((NOTIFICATION as u64).into()),
            Cbor::Text(method.clone()),
            Cbor::Array(args.iter().map(json_to_cbor).collect()),
        ],
    };
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&Cbor::Array(parts), &mut buf)
        .map_err(|err| RpcError::Malformed(err.to_string()))?;
    Ok(buf)
}

fn expect_u32(value: &Cbor, what: &str) -> Result<u32, RpcError> {
    match value {
        Cbor::Integer(n) => u32::try_from(i128::from(*n))
            .map_err(|_| RpcError::Malformed(format!("{what} out of range"))),
        _ => Err(RpcError::Malformed(format!("{what} is not an integer"))),
    }
}

fn expect_text(value: &Cbor, what: &str) -> Result<String, RpcError> {
    match value {
        Cbor::Text(s) => Ok(s.clone()),
        _ => Err(RpcError::Malformed(format!("{what} is not a string"))),
    }
}

fn expect_args(value: &Cbor) -> Result<Vec<Json>, RpcError> {
    match value {
        Cbor::Array(items) => items.iter().map(cbor_to_json).collect(),
        _ => Err(RpcError::Malformed("args is not an array".into())),
    }
}

fn decode_error(value: &Cbor) -> Result<Option<RemoteError>, RpcError> {
    match value {
        Cbor::Null => Ok(None),
        Cbor::Array(parts) if parts.len() == 2 => {
            let message = expect_text(&parts[0], "error message")?;
            let context = match cbor_to_json(&parts[1])? {
                Json::Object(map) => map,
                other => BTreeMap::from([("context".to_owned(), other)])
                    .into_iter()
                    .collect(),
            };
            Ok(Some(RemoteError { message, context }))
        }
        _ => Err(RpcError::Malformed("error is not null or a pair".into())),
    }
}

pub fn decode_call(payload: &[u8]) -> Result<Call, RpcError> {
    let root: Cbor = ciborium::de::from_reader(payload)
        .map_err(|err| RpcError::Malformed(err.to_string()))?;
    let Cbor::Array(parts) = root else {
        return Err(RpcError::Malformed("payload is not an array".into()));
    };
    let type_id = expect_u32(
        parts.first().ok_or_else(|| RpcError::Malformed("empty payload".into()))?,
        "type id",
    )?;
    match (type_id as u8, parts.len()) {
        (REQUEST, 4) => Ok(Call::Request {
            request_id: expect_u32(&parts[1], "request id")?,
            method: expect_text(&parts[2], "method")?,
            args: expect_args(&parts[3])?,
        }),
        (RESPONSE, 4) => Ok(Call::Response {
            request_id: expect_u32(&parts[1], "request id")?,
            error: decode_error(&parts[2])?,
            result: cbor_to_json(&parts[3])?,
        }),
        (NOTIFICATION, 3) => Ok(Call::Notification {
            method: expect_text(&parts[1], "method")?,
            args: expect_args(&parts[2])?,
        }),
        (type_id, len) => Err(RpcError::Malformed(format!(
            "bad envelope: type {type_id}, {len} parts"
        ))),
    }
}
