//! Values held by reactive nodes and values accepted by writes.

use crate::error::{Error, Result};
use crate::tree::NodeId;
use serde::{Deserialize, Serialize};

/// Origin of a change or document transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Produced by a write on this peer
    Local,
    /// Applied from an update received from another peer
    Remote,
}

/// A slot value inside a reactive node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A declared slot with nothing stored in it
    Undefined,
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    /// A nested container owned by the node holding this slot
    Node(NodeId),
}

impl Value {
    /// Build a value from a JSON scalar. Containers map to `Null`; callers
    /// mirror containers before reaching this.
    pub(crate) fn from_scalar(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            _ => Value::Null,
        }
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Value::Node(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// JSON form of a scalar. `None` for `Undefined` and nodes.
    pub fn scalar_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Undefined | Value::Node(_) => None,
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Number(n) => Some(serde_json::Value::Number(n.clone())),
            Value::String(s) => Some(serde_json::Value::String(s.clone())),
        }
    }
}

/// A value handed to a write. Containers are mirrored into fresh nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Undefined,
    Json(serde_json::Value),
}

impl Input {
    /// Convert any serializable Rust value.
    ///
    /// Values serde cannot express as JSON (maps with non-string keys,
    /// non-finite floats inside custom serializers, ...) are rejected with
    /// an error naming the offending type.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value).map(Input::Json).map_err(|e| {
            Error::UnsupportedValue(format!("{} ({})", std::any::type_name::<T>(), e))
        })
    }
}

impl From<serde_json::Value> for Input {
    fn from(value: serde_json::Value) -> Self {
        Input::Json(value)
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Input::Json(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Input::Json(serde_json::Value::String(value))
    }
}

impl From<bool> for Input {
    fn from(value: bool) -> Self {
        Input::Json(serde_json::Value::Bool(value))
    }
}

impl From<i32> for Input {
    fn from(value: i32) -> Self {
        Input::Json(value.into())
    }
}

impl From<i64> for Input {
    fn from(value: i64) -> Self {
        Input::Json(value.into())
    }
}

impl From<u64> for Input {
    fn from(value: u64) -> Self {
        Input::Json(value.into())
    }
}

impl From<f64> for Input {
    fn from(value: f64) -> Self {
        Input::Json(value.into())
    }
}

impl<T: Into<Input>> From<Option<T>> for Input {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Input::Undefined)
    }
}
