//! Dynamic JSON value model for the expression language.
//!
//! Documents cross the admission boundary as `serde_json::Value`, but the
//! expression language needs one more state: a selector that walks off the
//! edge of a document yields `Undefined`, which is distinct from JSON
//! `null`. A key that is present with value `null` and a key that is absent
//! behave differently in match evaluation, so the distinction is preserved
//! end to end.

use std::collections::BTreeMap;
use std::fmt;

/// A JSON value as seen by the expression language.
///
/// `Undefined` marks the result of selecting a missing key or an
/// out-of-range index. It never round-trips back into a JSON document.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Convert back to a plain JSON value.
    ///
    /// Returns `None` for `Undefined`; undefined entries inside arrays are
    /// dropped, mirroring how selection results are filtered before use.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Undefined => None,
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Number(n) => Some(number_to_json(*n)),
            Value::String(s) => Some(serde_json::Value::String(s.clone())),
            Value::Array(items) => Some(serde_json::Value::Array(
                items.iter().filter_map(Value::to_json).collect(),
            )),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    if let Some(v) = v.to_json() {
                        out.insert(k.clone(), v);
                    }
                }
                Some(serde_json::Value::Object(out))
            }
        }
    }

    /// Render the value the way the matcher compares it against
    /// `matchValue`/`matchValues`/`matchRegex`: strings verbatim, numbers
    /// without a trailing `.0` when integral, containers as JSON.
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(_) | Value::Object(_) => match self.to_json() {
                Some(json) => write!(f, "{}", json),
                None => write!(f, "undefined"),
            },
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::from(&v)
    }
}

/// Integral floats print as integers; JSON has no separate integer type and
/// manifests compare port numbers and replica counts as `80`, not `80.0`.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9_007_199_254_740_992.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::Number(serde_json::Number::from(n as i64))
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}
