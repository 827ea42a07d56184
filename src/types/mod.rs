//! Types - Conversion between in-memory field values and store JSON.
//!
//! Every mapped scalar field declares a type name (`"string"`, `"integer"`,
//! `"datetime"`, ...). The [`TypeRegistry`] resolves that name to a
//! [`ConvertType`] implementation which moves values between the native
//! [`Value`] representation and the `serde_json::Value` the store persists.
//!
//! ## Example
//!
//! ```ignore
//! let types = TypeRegistry::with_defaults();
//! let stored = types.to_store("integer", &Value::Int(42))?;
//! assert_eq!(types.to_native("integer", &stored)?, Value::Int(42));
//! ```

mod builtin;
mod field;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::error::{OdmError, Result};

pub use builtin::{
    ArrayType, BooleanType, DateTimeType, FloatType, IntegerType, MixedType, ObjectType,
    StringType, DATETIME_FORMAT,
};
pub use field::FieldType;

/// Native representation of a mapped field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(NaiveDateTime),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Structural mapping from JSON, without any type coercion.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Structural mapping to JSON. Datetimes use [`DATETIME_FORMAT`].
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => {
                serde_json::Value::String(dt.format(DATETIME_FORMAT).to_string())
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// A stateless pair of conversions for one field type.
///
/// Both directions are total: input that does not fit the type is coerced
/// on a best-effort basis instead of failing.
pub trait ConvertType: Send + Sync {
    fn to_store(&self, value: &Value) -> serde_json::Value;
    fn to_native(&self, value: &serde_json::Value) -> Value;
}

/// Registry of field type converters, keyed by type name.
///
/// Owned by the application's configuration and shared between units of
/// work through an `Arc`.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<dyn ConvertType>>,
}

impl TypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in type registered.
    pub fn with_defaults() -> Self {
        let mut types: HashMap<String, Arc<dyn ConvertType>> = HashMap::new();
        types.insert("string".into(), Arc::new(StringType));
        types.insert("integer".into(), Arc::new(IntegerType));
        types.insert("float".into(), Arc::new(FloatType));
        types.insert("boolean".into(), Arc::new(BooleanType));
        types.insert("datetime".into(), Arc::new(DateTimeType));
        types.insert("array".into(), Arc::new(ArrayType));
        types.insert("object".into(), Arc::new(ObjectType));
        types.insert("mixed".into(), Arc::new(MixedType));
        Self { types }
    }

    /// Register a new type. Fails if the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        converter: impl ConvertType + 'static,
    ) -> Result<()> {
        let name = name.into();
        if self.types.contains_key(&name) {
            return Err(OdmError::DuplicateType(name));
        }
        self.types.insert(name, Arc::new(converter));
        Ok(())
    }

    /// Register a type, replacing any existing converter with the same name.
    pub fn override_type(
        &mut self,
        name: impl Into<String>,
        converter: impl ConvertType + 'static,
    ) {
        self.types.insert(name.into(), Arc::new(converter));
    }

    pub fn has(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&dyn ConvertType> {
        self.types
            .get(name)
            .map(|converter| converter.as_ref())
            .ok_or_else(|| OdmError::UnknownType(name.to_string()))
    }

    pub fn to_store(&self, name: &str, value: &Value) -> Result<serde_json::Value> {
        Ok(self.get(name)?.to_store(value))
    }

    pub fn to_native(&self, name: &str, value: &serde_json::Value) -> Result<Value> {
        Ok(self.get(name)?.to_native(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn round_trip(types: &TypeRegistry, name: &str, value: Value) -> Value {
        let stored = types.to_store(name, &value).unwrap();
        types.to_native(name, &stored).unwrap()
    }

    #[test]
    fn primitives_round_trip() {
        let types = TypeRegistry::with_defaults();

        assert_eq!(round_trip(&types, "integer", Value::Int(42)), Value::Int(42));
        assert_eq!(round_trip(&types, "float", Value::Float(3.14)), Value::Float(3.14));
        assert_eq!(round_trip(&types, "boolean", Value::Bool(true)), Value::Bool(true));
        assert_eq!(
            round_trip(&types, "string", Value::String("x".into())),
            Value::String("x".into())
        );

        let dt = NaiveDate::from_ymd_opt(2010, 10, 20)
            .unwrap()
            .and_hms_micro_opt(14, 23, 37, 123456)
            .unwrap();
        assert_eq!(
            types.to_store("datetime", &Value::DateTime(dt)).unwrap(),
            json!("2010-10-20 14:23:37.123456")
        );
        assert_eq!(round_trip(&types, "datetime", Value::DateTime(dt)), Value::DateTime(dt));
    }

    #[test]
    fn unknown_type_fails() {
        let types = TypeRegistry::with_defaults();
        assert!(matches!(
            types.to_store("uuid", &Value::Null),
            Err(OdmError::UnknownType(name)) if name == "uuid"
        ));
    }

    #[test]
    fn duplicate_registration_requires_override() {
        let mut types = TypeRegistry::with_defaults();
        let err = types.register("string", MixedType).unwrap_err();
        assert!(matches!(err, OdmError::DuplicateType(name) if name == "string"));

        types.override_type("string", MixedType);
        assert_eq!(
            types.to_native("string", &json!(5)).unwrap(),
            Value::Int(5)
        );
    }

    #[test]
    fn custom_type_registers_once() {
        struct Upper;
        impl ConvertType for Upper {
            fn to_store(&self, value: &Value) -> serde_json::Value {
                match value {
                    Value::String(s) => json!(s.to_uppercase()),
                    other => other.to_json(),
                }
            }
            fn to_native(&self, value: &serde_json::Value) -> Value {
                Value::from_json(value)
            }
        }

        let mut types = TypeRegistry::new();
        types.register("upper", Upper).unwrap();
        assert_eq!(
            types.to_store("upper", &Value::String("ann".into())).unwrap(),
            json!("ANN")
        );
    }

    #[test]
    fn json_structure_is_preserved() {
        let doc = json!({"a": [1, 2.5, "x", null], "b": {"c": true}});
        assert_eq!(Value::from_json(&doc).to_json(), doc);
    }
}
