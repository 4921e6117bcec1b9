//! Dynamically-typed payload trees
//!
//! `Payload` is the closed set of value kinds that can cross the boundary
//! between a typed event payload and the Avro encoder. Every JSON value maps
//! to exactly one variant, so normalization never fails.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

use crate::error::{BrokerError, BrokerResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
}

impl Payload {
    /// Normalize a JSON tree
    ///
    /// Numbers become `Int` when they have no fractional part and fit in an
    /// `i64`, otherwise `Float`.
    pub fn normalize(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Payload::Null,
            serde_json::Value::Bool(b) => Payload::Bool(b),
            serde_json::Value::String(s) => Payload::String(s),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Payload::Int(i);
                }
                // u64 above i64::MAX or a real float
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                    Payload::Int(f as i64)
                } else {
                    Payload::Float(f)
                }
            }
            serde_json::Value::Array(items) => {
                Payload::List(items.into_iter().map(Payload::normalize).collect())
            }
            serde_json::Value::Object(fields) => Payload::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Payload::normalize(v)))
                    .collect(),
            ),
        }
    }

    /// Serialize a typed payload and normalize the result
    pub fn from_serialize<T: Serialize>(data: &T) -> BrokerResult<Self> {
        let value = serde_json::to_value(data).map_err(|e| BrokerError::Encode(e.to_string()))?;
        Ok(Payload::normalize(value))
    }

    /// Convert back into a JSON tree
    ///
    /// Non-finite floats have no JSON representation and become `null`.
    pub fn into_json(self) -> serde_json::Value {
        match self {
            Payload::Null => serde_json::Value::Null,
            Payload::Bool(b) => serde_json::Value::Bool(b),
            Payload::Int(i) => serde_json::Value::from(i),
            Payload::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Payload::String(s) => serde_json::Value::String(s),
            Payload::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Payload::into_json).collect())
            }
            Payload::Map(fields) => serde_json::Value::Object(
                fields.into_iter().map(|(k, v)| (k, v.into_json())).collect(),
            ),
        }
    }

    /// Deserialize into a typed payload
    pub fn into_typed<T: DeserializeOwned>(self) -> BrokerResult<T> {
        serde_json::from_value(self.into_json()).map_err(|e| BrokerError::Decode(e.to_string()))
    }

    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Null => "null",
            Payload::Bool(_) => "bool",
            Payload::Int(_) => "int",
            Payload::Float(_) => "float",
            Payload::String(_) => "string",
            Payload::List(_) => "list",
            Payload::Map(_) => "map",
        }
    }
}
