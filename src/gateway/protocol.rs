//! Multicall wire protocol
//!
//! The daemon answers `system.multicall`: one request carries an ordered
//! array of `{methodName, params}` and the response is a parallel array where
//! each slot is either `[value]` or a fault struct.
//!
//! ```json
//! // request params
//! [[{"methodName": "d.multicall2", "params": ["", "main", "d.hash=", "d.name="]}]]
//! // response result
//! [[[["ABC", "ubuntu.iso"], ["DEF", "debian.iso"]]]]
//! ```
//!
//! List rows decode positionally against a `PropertyMap`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{MirrorError, Result};
use crate::model::{field, Entity};

/// One logical call inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    #[serde(rename = "methodName")]
    pub method: String,
    pub params: Vec<Value>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Ordered calls sent as one request
pub type Batch = Vec<MethodCall>;

/// JSON-RPC envelope for a batch
pub fn encode_multicall(id: u64, batch: &[MethodCall]) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "system.multicall",
        "params": [batch],
    })
}

/// Unwrap a JSON-RPC multicall response into one value per call
pub fn decode_multicall(response: Value, expected: usize) -> Result<Vec<Value>> {
    let mut response = match response {
        Value::Object(map) => map,
        other => {
            return Err(MirrorError::MalformedResponse {
                message: format!("expected object envelope, got {}", type_name(&other)),
            })
        }
    };

    if let Some(error) = response.remove("error").filter(|e| !e.is_null()) {
        return Err(MirrorError::Fault {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }

    let slots = match response.remove("result") {
        Some(Value::Array(slots)) => slots,
        _ => {
            return Err(MirrorError::MalformedResponse {
                message: "multicall result is not an array".to_string(),
            })
        }
    };

    if slots.len() != expected {
        return Err(MirrorError::MalformedResponse {
            message: format!("expected {} results, got {}", expected, slots.len()),
        });
    }

    slots.into_iter().map(unwrap_slot).collect()
}

fn unwrap_slot(slot: Value) -> Result<Value> {
    match slot {
        Value::Array(mut wrapped) if wrapped.len() == 1 => Ok(wrapped.remove(0)),
        Value::Object(fault) if fault.contains_key("faultCode") => Err(MirrorError::Fault {
            code: fault.get("faultCode").and_then(Value::as_i64).unwrap_or(0),
            message: fault
                .get("faultString")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        }),
        other => Err(MirrorError::MalformedResponse {
            message: format!("unexpected multicall slot: {}", type_name(&other)),
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Conversion from a raw wire value to a field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Text,
    Number,
    Flag,
    /// Comma separated list
    Tags,
    /// `|||` separated announce URLs, reduced to unique hostnames
    Trackers,
}

impl Transform {
    /// `None` means the value is malformed for this field
    pub fn apply(self, raw: &Value) -> Option<Value> {
        match self {
            Transform::Text => match raw {
                Value::String(s) => Some(Value::String(s.clone())),
                Value::Number(n) => Some(Value::String(n.to_string())),
                _ => None,
            },
            Transform::Number => match raw {
                Value::Number(n) => Some(Value::Number(n.clone())),
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
                _ => None,
            },
            Transform::Flag => match raw {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::Number(n) => n.as_i64().map(|n| Value::Bool(n != 0)),
                Value::String(s) => match s.trim() {
                    "0" | "" => Some(Value::Bool(false)),
                    "1" => Some(Value::Bool(true)),
                    _ => None,
                },
                _ => None,
            },
            Transform::Tags => raw.as_str().map(|s| {
                Value::Array(
                    s.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(|t| Value::String(t.to_string()))
                        .collect(),
                )
            }),
            Transform::Trackers => raw.as_str().map(|s| {
                let mut hosts: Vec<String> = Vec::new();
                for url in s.split("|||").map(str::trim).filter(|u| !u.is_empty()) {
                    let host = tracker_host(url);
                    if !hosts.contains(&host) {
                        hosts.push(host);
                    }
                }
                Value::Array(hosts.into_iter().map(Value::String).collect())
            }),
        }
    }
}

/// `udp://tracker.example.org:1337/announce` -> `tracker.example.org`
fn tracker_host(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    let host = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    host.to_ascii_lowercase()
}

/// One column of a list response
#[derive(Debug, Clone, Copy)]
pub struct PropertySpec {
    pub field: &'static str,
    pub getter: &'static str,
    pub transform: Transform,
}

/// Ordered columns requested by the list poll
#[derive(Debug, Clone)]
pub struct PropertyMap {
    specs: Vec<PropertySpec>,
}

impl PropertyMap {
    pub fn new(specs: Vec<PropertySpec>) -> Self {
        Self { specs }
    }

    /// Columns for torrent list polling. `hash` must stay first.
    pub fn torrent_list() -> Self {
        use Transform::*;
        let spec = |field, getter, transform| PropertySpec {
            field,
            getter,
            transform,
        };
        Self::new(vec![
            spec(field::HASH, "d.hash=", Text),
            spec(field::NAME, "d.name=", Text),
            spec(field::SIZE_BYTES, "d.size_bytes=", Number),
            spec(field::BYTES_DONE, "d.bytes_done=", Number),
            spec(field::DOWN_RATE, "d.down.rate=", Number),
            spec(field::UP_RATE, "d.up.rate=", Number),
            spec(field::DOWN_TOTAL, "d.down.total=", Number),
            spec(field::UP_TOTAL, "d.up.total=", Number),
            spec(field::DIRECTORY, "d.directory=", Text),
            spec(field::TAGS, "d.custom1=", Tags),
            spec(
                field::TRACKERS,
                "cat=\"$t.multicall=d.hash=,t.url=,cat={|||}\"",
                Trackers,
            ),
            spec(field::IS_ACTIVE, "d.is_active=", Flag),
            spec(field::IS_COMPLETE, "d.complete=", Flag),
            spec(field::IS_HASH_CHECKING, "d.hashing=", Flag),
            spec(field::IS_OPEN, "d.is_open=", Flag),
            spec(field::MESSAGE, "d.message=", Text),
            spec(field::DATE_ADDED, "d.custom=addtime", Number),
            spec(field::PEERS_CONNECTED, "d.peers_connected=", Number),
            spec(field::SEEDS_CONNECTED, "d.peers_complete=", Number),
        ])
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// `d.multicall2` call for the given view
    pub fn list_call(&self, view: &str) -> MethodCall {
        let mut params = vec![json!(""), json!(view)];
        params.extend(self.specs.iter().map(|s| json!(s.getter)));
        MethodCall::new("d.multicall2", params)
    }

    /// Decode one positional row. Raw fields only; reducers run afterwards.
    pub fn decode_row(&self, row: &Value) -> Result<Entity> {
        let cells = row.as_array().ok_or_else(|| MirrorError::MalformedResponse {
            message: format!("row is a {}, not an array", type_name(row)),
        })?;
        if cells.len() != self.specs.len() {
            return Err(MirrorError::MalformedResponse {
                message: format!("row has {} columns, expected {}", cells.len(), self.specs.len()),
            });
        }

        let mut hash = None;
        let mut entity = Entity::new(String::new());
        for (spec, cell) in self.specs.iter().zip(cells) {
            let value = spec
                .transform
                .apply(cell)
                .ok_or_else(|| MirrorError::MalformedResponse {
                    message: format!("bad value for {}: {}", spec.field, cell),
                })?;
            if spec.field == field::HASH {
                hash = value.as_str().map(str::to_string);
            } else {
                entity.set(spec.field, value);
            }
        }

        match hash {
            Some(h) if !h.is_empty() => {
                entity.hash = h;
                Ok(entity)
            }
            _ => Err(MirrorError::MalformedResponse {
                message: "row has no hash".to_string(),
            }),
        }
    }
}
