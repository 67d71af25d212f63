//! 📦 Resolved values: what a token turns into once it meets a dataset.

use serde_json::{Number, Value};

/// 🎯 The result of resolving one token.
///
/// `Missing` is the typed sentinel for absent, masked, NaN or otherwise non-finite values.
/// It is never the same thing as `0` or `""`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Resolved {
    #[default]
    Missing,
    Scalar(Value),
    List(Vec<Value>),
}

impl Resolved {
    /// Lift a raw JSON value. `null` becomes `Missing`, arrays become lists.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Resolved::Missing,
            Value::Array(items) => Resolved::List(items),
            other => Resolved::Scalar(other),
        }
    }

    /// Lift an optional JSON value; `None` is `Missing`.
    pub fn from_option(value: Option<Value>) -> Self {
        value.map(Resolved::from_json).unwrap_or_default()
    }

    /// 🔢 Numbers that aren't finite are missing. No quiet zeroes here.
    pub fn from_f64(number: f64) -> Self {
        match Number::from_f64(number) {
            Some(n) if number.is_finite() => Resolved::Scalar(Value::Number(n)),
            _ => Resolved::Missing,
        }
    }

    pub fn string(text: impl Into<String>) -> Self {
        Resolved::Scalar(Value::String(text.into()))
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Resolved::Missing)
    }

    /// Numeric view: numbers as-is, numeric strings parsed, everything else `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Resolved::Scalar(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()),
            Resolved::Scalar(Value::String(s)) => {
                s.trim().parse::<f64>().ok().filter(|f| f.is_finite())
            }
            _ => None,
        }
    }

    /// 🔑 String form used when joining composite keys.
    ///
    /// `None` for `Missing` and lists; lists have no single key form.
    pub fn as_key_string(&self) -> Option<String> {
        match self {
            Resolved::Scalar(Value::String(s)) => Some(s.clone()),
            Resolved::Scalar(Value::Number(n)) => Some(n.to_string()),
            Resolved::Scalar(Value::Bool(b)) => Some(b.to_string()),
            Resolved::Scalar(Value::Object(_)) | Resolved::Scalar(Value::Array(_)) => None,
            Resolved::Scalar(Value::Null) | Resolved::Missing | Resolved::List(_) => None,
        }
    }

    /// Back to JSON for a document body. `Missing` has no JSON form; the field is dropped.
    pub fn into_json(self) -> Option<Value> {
        match self {
            Resolved::Missing => None,
            Resolved::Scalar(value) => Some(value),
            Resolved::List(items) => Some(Value::Array(items)),
        }
    }
}
