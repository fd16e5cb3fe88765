//! Runtime value typing and coercion for edge transfers

use std::fmt;

use serde_json::Value;

use crate::error::{ErrorKind, ExecutionError};

/// Runtime classification of a JSON value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Absent or null
    Null,
    /// Boolean
    Boolean,
    /// Integer or float
    Number,
    /// Text
    String,
    /// Ordered list
    Array,
    /// Key/value mapping
    Object,
}

impl ValueKind {
    /// Classify a runtime value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        };
        write!(f, "{}", name)
    }
}

/// Coerce a value to the target kind
///
/// Supported conversions: string<->number, string<->boolean, boolean->string,
/// object->string and array->string (serialized). Anything else fails with a
/// `runtime` error.
pub fn convert(value: Value, target: ValueKind) -> Result<Value, ExecutionError> {
    let source = ValueKind::of(&value);
    if source == target {
        return Ok(value);
    }

    match (source, target) {
        (ValueKind::String, ValueKind::Number) => {
            let text = value.as_str().unwrap_or_default().trim().to_string();
            if let Ok(int) = text.parse::<i64>() {
                return Ok(Value::from(int));
            }
            match text.parse::<f64>() {
                Ok(float) => serde_json::Number::from_f64(float)
                    .map(Value::Number)
                    .ok_or_else(|| conversion_failed(&text, target)),
                Err(_) => Err(conversion_failed(&text, target)),
            }
        }
        (ValueKind::Number, ValueKind::String) => Ok(Value::String(value.to_string())),
        (ValueKind::String, ValueKind::Boolean) => {
            match value.as_str().unwrap_or_default().trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(conversion_failed(other, target)),
            }
        }
        (ValueKind::Boolean, ValueKind::String) => {
            Ok(Value::String(value.as_bool().unwrap_or_default().to_string()))
        }
        (ValueKind::Object, ValueKind::String) | (ValueKind::Array, ValueKind::String) => {
            serde_json::to_string(&value)
                .map(Value::String)
                .map_err(|e| {
                    ExecutionError::new(ErrorKind::Runtime, format!("serialization failed: {}", e))
                })
        }
        (from, to) => Err(ExecutionError::new(
            ErrorKind::Runtime,
            format!("unsupported conversion from {} to {}", from, to),
        )),
    }
}

fn conversion_failed(text: &str, target: ValueKind) -> ExecutionError {
    ExecutionError::new(
        ErrorKind::Runtime,
        format!("cannot convert '{}' to {}", text, target),
    )
}
