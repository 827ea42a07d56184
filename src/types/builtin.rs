use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value as Json;

use super::{ConvertType, Value};

/// Textual datetime format with microsecond precision.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const DATETIME_INPUT_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

pub struct StringType;
pub struct IntegerType;
pub struct FloatType;
pub struct BooleanType;
pub struct DateTimeType;
pub struct ArrayType;
pub struct ObjectType;
/// Identity passthrough for arbitrary JSON.
pub struct MixedType;

impl ConvertType for StringType {
    fn to_store(&self, value: &Value) -> Json {
        match coerce_string(value) {
            Some(s) => Json::String(s),
            None => Json::Null,
        }
    }

    fn to_native(&self, value: &Json) -> Value {
        match coerce_string(&Value::from_json(value)) {
            Some(s) => Value::String(s),
            None => Value::Null,
        }
    }
}

impl ConvertType for IntegerType {
    fn to_store(&self, value: &Value) -> Json {
        coerce_int(value).map(Json::from).unwrap_or(Json::Null)
    }

    fn to_native(&self, value: &Json) -> Value {
        coerce_int(&Value::from_json(value))
            .map(Value::Int)
            .unwrap_or(Value::Null)
    }
}

impl ConvertType for FloatType {
    fn to_store(&self, value: &Value) -> Json {
        coerce_float(value)
            .map(|f| Value::Float(f).to_json())
            .unwrap_or(Json::Null)
    }

    fn to_native(&self, value: &Json) -> Value {
        coerce_float(&Value::from_json(value))
            .map(Value::Float)
            .unwrap_or(Value::Null)
    }
}

impl ConvertType for BooleanType {
    fn to_store(&self, value: &Value) -> Json {
        coerce_bool(value).map(Json::Bool).unwrap_or(Json::Null)
    }

    fn to_native(&self, value: &Json) -> Value {
        coerce_bool(&Value::from_json(value))
            .map(Value::Bool)
            .unwrap_or(Value::Null)
    }
}

impl ConvertType for DateTimeType {
    fn to_store(&self, value: &Value) -> Json {
        match coerce_datetime(value) {
            Some(dt) => Json::String(dt.format(DATETIME_FORMAT).to_string()),
            None => Json::Null,
        }
    }

    fn to_native(&self, value: &Json) -> Value {
        coerce_datetime(&Value::from_json(value))
            .map(Value::DateTime)
            .unwrap_or(Value::Null)
    }
}

impl ConvertType for ArrayType {
    fn to_store(&self, value: &Value) -> Json {
        match value {
            Value::Null => Json::Null,
            Value::Array(_) | Value::Object(_) => value.to_json(),
            scalar => Json::Array(vec![scalar.to_json()]),
        }
    }

    fn to_native(&self, value: &Json) -> Value {
        match Value::from_json(value) {
            Value::Null => Value::Null,
            array @ (Value::Array(_) | Value::Object(_)) => array,
            scalar => Value::Array(vec![scalar]),
        }
    }
}

impl ConvertType for ObjectType {
    fn to_store(&self, value: &Value) -> Json {
        match coerce_object(value.clone()) {
            Some(map) => Value::Object(map).to_json(),
            None => Json::Null,
        }
    }

    fn to_native(&self, value: &Json) -> Value {
        coerce_object(Value::from_json(value))
            .map(Value::Object)
            .unwrap_or(Value::Null)
    }
}

impl ConvertType for MixedType {
    fn to_store(&self, value: &Value) -> Json {
        value.to_json()
    }

    fn to_native(&self, value: &Json) -> Value {
        Value::from_json(value)
    }
}

// ============================================================================
// Coercions
// ============================================================================

pub(crate) fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::DateTime(dt) => Some(dt.format(DATETIME_FORMAT).to_string()),
        composite => Some(composite.to_json().to_string()),
    }
}

pub(crate) fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Null => None,
        Value::Int(i) => Some(*i),
        Value::Float(f) => Some(f.trunc() as i64),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => {
            let s = s.trim();
            Some(
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64))
                    .unwrap_or(0),
            )
        }
        Value::DateTime(dt) => Some(dt.and_utc().timestamp()),
        Value::Array(items) => Some(i64::from(!items.is_empty())),
        Value::Object(map) => Some(i64::from(!map.is_empty())),
    }
}

pub(crate) fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Null => None,
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        Value::String(s) => Some(s.trim().parse::<f64>().unwrap_or(0.0)),
        other => coerce_int(other).map(|i| i as f64),
    }
}

pub(crate) fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(*b),
        Value::Int(i) => Some(*i != 0),
        Value::Float(f) => Some(*f != 0.0),
        Value::String(s) => Some(!(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false"))),
        Value::DateTime(_) => Some(true),
        Value::Array(items) => Some(!items.is_empty()),
        Value::Object(map) => Some(!map.is_empty()),
    }
}

pub(crate) fn coerce_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::DateTime(dt) => Some(*dt),
        Value::String(s) => parse_datetime(s),
        Value::Int(secs) => DateTime::from_timestamp(*secs, 0).map(|dt| dt.naive_utc()),
        Value::Float(secs) => {
            let whole = secs.trunc();
            let nanos = ((secs - whole) * 1e9).round() as u32;
            DateTime::from_timestamp(whole as i64, nanos).map(|dt| dt.naive_utc())
        }
        _ => None,
    }
}

fn parse_datetime(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    DATETIME_INPUT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(input)
                .ok()
                .map(|dt| dt.naive_utc())
        })
}

pub(crate) fn coerce_object(value: Value) -> Option<BTreeMap<String, Value>> {
    match value {
        Value::Null => None,
        Value::Object(map) => Some(map),
        Value::Array(items) => Some(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
        ),
        scalar => Some(BTreeMap::from([("scalar".to_string(), scalar)])),
    }
}
