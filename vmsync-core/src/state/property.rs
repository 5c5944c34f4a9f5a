//! Property descriptors and value coercion.
//!
//! Every view-model type declares its observable properties up front as a
//! static table of [`PropertyDescriptor`]s. The controller uses the table to
//! reject unknown and read-only keys, and to coerce incoming JSON values to
//! the property's semantic type before handing them to the instance.

use std::fmt;

use serde_json::{Number, Value};

use crate::error::PropertyError;

/// Semantic type of a property, used to coerce client-submitted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    String,
    Integer,
    Float,
    Bool,
    List,
    Object,
    /// Accepts any JSON value unchanged.
    Any,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Bool => "boolean",
            Self::List => "list",
            Self::Object => "object",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// Static description of one observable property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: &'static str,
    pub kind: PropertyKind,
    pub writable: bool,
    /// Properties this one is computed from. When any of them changes, this
    /// property is marked changed as well.
    pub depends_on: &'static [&'static str],
}

impl PropertyDescriptor {
    /// A writable property with no dependencies.
    pub const fn new(name: &'static str, kind: PropertyKind) -> Self {
        Self {
            name,
            kind,
            writable: true,
            depends_on: &[],
        }
    }

    /// A property the client may read but never assign.
    pub const fn read_only(name: &'static str, kind: PropertyKind) -> Self {
        Self {
            name,
            kind,
            writable: false,
            depends_on: &[],
        }
    }

    /// A read-only property computed from `depends_on`.
    pub const fn derived(
        name: &'static str,
        kind: PropertyKind,
        depends_on: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            kind,
            writable: false,
            depends_on,
        }
    }

    /// Coerce a client-submitted value to this property's kind.
    pub fn coerce(&self, value: Value) -> Result<Value, PropertyError> {
        coerce(self.kind, value).map_err(|found| PropertyError::Coercion {
            name: self.name.to_owned(),
            expected: self.kind,
            found,
        })
    }
}

/// Find the descriptor for `name` in a property table.
pub fn find<'a>(table: &'a [PropertyDescriptor], name: &str) -> Option<&'a PropertyDescriptor> {
    table.iter().find(|descriptor| descriptor.name == name)
}

/// JSON type name of a value, used in coercion errors.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Coerce `value` to `kind`, or return the JSON type name that was refused.
fn coerce(kind: PropertyKind, value: Value) -> Result<Value, &'static str> {
    let found = json_type_name(&value);
    match (kind, value) {
        (PropertyKind::Any, value) => Ok(value),

        // Strings, lists and objects are nullable; numbers and booleans are not.
        (PropertyKind::String | PropertyKind::List | PropertyKind::Object, Value::Null) => {
            Ok(Value::Null)
        }

        (PropertyKind::String, Value::String(s)) => Ok(Value::String(s)),
        (PropertyKind::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (PropertyKind::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),

        (PropertyKind::Integer, Value::Number(n)) => integer_from_number(&n).ok_or(found),
        (PropertyKind::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| found),

        (PropertyKind::Float, Value::Number(n)) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or(found),
        (PropertyKind::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or(found),

        (PropertyKind::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
        (PropertyKind::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(found),
        },

        (PropertyKind::List, Value::Array(items)) => Ok(Value::Array(items)),
        (PropertyKind::Object, Value::Object(map)) => Ok(Value::Object(map)),

        _ => Err(found),
    }
}

/// Integers pass through; floats are accepted only when they are whole.
fn integer_from_number(n: &Number) -> Option<Value> {
    if let Some(i) = n.as_i64() {
        return Some(Value::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Some(Value::from(u));
    }
    let f = n.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}
