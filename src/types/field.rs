use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use super::builtin::{coerce_bool, coerce_datetime, coerce_float, coerce_int, coerce_string};
use super::Value;
use crate::error::{OdmError, Result};

/// A Rust type that can back a mapped scalar field.
///
/// `TYPE_NAME` is the converter used when the mapping does not name one.
pub trait FieldType: Sized + 'static {
    const TYPE_NAME: &'static str;

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Result<Self>;
}

fn conversion_error<T>(value: &Value) -> OdmError {
    OdmError::FieldConversion {
        value: format!("{:?}", value),
        target: std::any::type_name::<T>(),
    }
}

impl FieldType for String {
    const TYPE_NAME: &'static str = "string";

    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => Ok(coerce_string(&other).unwrap_or_default()),
        }
    }
}

macro_rules! integer_field {
    ($($ty:ty),*) => {$(
        impl FieldType for $ty {
            const TYPE_NAME: &'static str = "integer";

            fn to_value(&self) -> Value {
                Value::Int(*self as i64)
            }

            fn from_value(value: Value) -> Result<Self> {
                let int = coerce_int(&value).unwrap_or_default();
                <$ty>::try_from(int).map_err(|_| conversion_error::<$ty>(&value))
            }
        }
    )*};
}

integer_field!(i64, i32, u32, u64, usize);

impl FieldType for f64 {
    const TYPE_NAME: &'static str = "float";

    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(coerce_float(&value).unwrap_or_default())
    }
}

impl FieldType for f32 {
    const TYPE_NAME: &'static str = "float";

    fn to_value(&self) -> Value {
        Value::Float(f64::from(*self))
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(coerce_float(&value).unwrap_or_default() as f32)
    }
}

impl FieldType for bool {
    const TYPE_NAME: &'static str = "boolean";

    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(coerce_bool(&value).unwrap_or_default())
    }
}

impl FieldType for NaiveDateTime {
    const TYPE_NAME: &'static str = "datetime";

    fn to_value(&self) -> Value {
        Value::DateTime(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        coerce_datetime(&value).ok_or_else(|| conversion_error::<NaiveDateTime>(&value))
    }
}

impl FieldType for serde_json::Value {
    const TYPE_NAME: &'static str = "mixed";

    fn to_value(&self) -> Value {
        Value::from_json(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value.to_json())
    }
}

impl FieldType for Value {
    const TYPE_NAME: &'static str = "mixed";

    fn to_value(&self) -> Value {
        self.clone()
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl<F: FieldType> FieldType for Option<F> {
    const TYPE_NAME: &'static str = F::TYPE_NAME;

    fn to_value(&self) -> Value {
        match self {
            Some(inner) => inner.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => F::from_value(other).map(Some),
        }
    }
}

impl<F: FieldType> FieldType for Vec<F> {
    const TYPE_NAME: &'static str = "array";

    fn to_value(&self) -> Value {
        Value::Array(self.iter().map(FieldType::to_value).collect())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => items.into_iter().map(F::from_value).collect(),
            Value::Object(map) => map.into_values().map(F::from_value).collect(),
            scalar => Ok(vec![F::from_value(scalar)?]),
        }
    }
}

impl<F: FieldType> FieldType for BTreeMap<String, F> {
    const TYPE_NAME: &'static str = "object";

    fn to_value(&self) -> Value {
        Value::Object(
            self.iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(BTreeMap::new()),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, F::from_value(v)?)))
                .collect(),
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| Ok((i.to_string(), F::from_value(v)?)))
                .collect(),
            other => Err(conversion_error::<Self>(&other)),
        }
    }
}
