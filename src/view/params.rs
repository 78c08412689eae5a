//! Binding inbound values: query/path params and event payloads.
//!
//! Everything here fails with [`BindingError`], which the session treats as
//! "recovered locally": the handler call is dropped with a warning and the
//! connection carries on.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

use crate::render::Cid;

/// Shape or value problems in client-supplied data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("event payload is missing `{0}`")]
    MissingField(&'static str),

    #[error("event payload field `{field}` should be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("missing parameter `{0}`")]
    MissingParam(String),

    #[error("invalid value {value:?} for `{key}`: {reason}")]
    InvalidParam {
        key: String,
        value: String,
        reason: String,
    },
}

/// Multi-valued string parameters (`?tag=a&tag=b`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, Vec<String>>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode an `application/x-www-form-urlencoded` string.
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::new();
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            params.append(k.into_owned(), v.into_owned());
        }
        params
    }

    /// Flatten a JSON object; arrays become multiple values.
    pub fn from_json(value: &Value) -> Self {
        let mut params = Self::new();
        let Some(map) = value.as_object() else {
            return params;
        };
        for (k, v) in map {
            match v {
                Value::Array(items) => {
                    for item in items {
                        params.append(k.clone(), scalar_to_string(item));
                    }
                }
                other => params.append(k.clone(), scalar_to_string(other)),
            }
        }
        params
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// Replace all values of `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), vec![value.into()]);
    }

    /// Add every entry of `other`, overriding keys present in both.
    pub fn merge(&mut self, other: Params) {
        self.0.extend(other.0);
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn require(&self, key: &str) -> Result<&str, BindingError> {
        self.get(key)
            .ok_or_else(|| BindingError::MissingParam(key.to_string()))
    }

    /// Parse the first value of `key`.
    pub fn parse<T>(&self, key: &str) -> Result<T, BindingError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.require(key)?;
        raw.trim()
            .parse()
            .map_err(|e: T::Err| BindingError::InvalidParam {
                key: key.to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            })
    }

    /// Like [`Params::parse`], falling back to `default` when absent.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, BindingError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if self.contains(key) {
            self.parse(key)
        } else {
            Ok(default)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode back to a query string.
    pub fn to_query(&self) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, values) in &self.0 {
            for v in values {
                ser.append_pair(k, v);
            }
        }
        ser.finish()
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The payload of an inbound `event` message.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    /// `click`, `form`, `keyup`, ...
    pub kind: String,
    /// Raw client value.
    pub value: Value,
    /// `value` decoded into params (form fields, or object entries).
    pub params: Params,
    /// Target component, when the event was aimed at one.
    pub cid: Option<Cid>,
    /// Upload entries announced alongside a form change.
    pub uploads: Option<Value>,
}

impl EventPayload {
    /// Decode the payload of an `event` message into `(event name, payload)`.
    pub fn from_json(payload: &Value) -> Result<(String, Self), BindingError> {
        let event = payload
            .get("event")
            .ok_or(BindingError::MissingField("event"))?
            .as_str()
            .ok_or(BindingError::WrongType {
                field: "event",
                expected: "a string",
            })?
            .to_string();
        let value = payload
            .get("value")
            .cloned()
            .ok_or(BindingError::MissingField("value"))?;
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("click")
            .to_string();

        let params = if kind == "form" {
            let encoded = value.as_str().ok_or(BindingError::WrongType {
                field: "value",
                expected: "an urlencoded string for form events",
            })?;
            Params::from_query(encoded)
        } else {
            Params::from_json(&value)
        };

        let cid = match payload.get("cid") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|n| Cid::try_from(n).ok())
                    .ok_or(BindingError::WrongType {
                        field: "cid",
                        expected: "a component id",
                    })?,
            ),
        };

        Ok((
            event,
            Self {
                kind,
                value,
                params,
                cid,
                uploads: payload.get("uploads").cloned(),
            },
        ))
    }

    /// A payload built on the server, e.g. for a component's `send_parent`.
    pub fn from_value(value: Value) -> Self {
        Self {
            kind: "internal".into(),
            params: Params::from_json(&value),
            value,
            cid: None,
            uploads: None,
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    pub fn require<T>(&self, key: &str) -> Result<T, BindingError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.params.parse(key)
    }
}

// ============================================================================
// Tests
// ============================================================================
