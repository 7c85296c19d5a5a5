//! JSON Schema checks for tool inputs and classified responses.
//!
//! Covers the subset of JSON Schema that tool and classification schemas use:
//! `type`, `required`, `properties`, `additionalProperties: false`, `enum`,
//! `const` and array `items`. Every violation is reported, not just the first.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::error::FieldError;

/// How forgiving structural checks are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Any mismatch fails, including properties the schema does not declare.
    Strict,
    /// Required fields and declared types are checked; extra fields pass.
    #[default]
    Lenient,
    /// No schema checks at all.
    None,
}

/// Validate `value` against `schema`, returning one entry per violation.
pub fn validate(value: &Value, schema: &Value, level: ValidationLevel) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if level != ValidationLevel::None {
        check(value, schema, level, "", &mut errors);
    }
    errors
}

fn check(value: &Value, schema: &Value, level: ValidationLevel, path: &str, errors: &mut Vec<FieldError>) {
    if let Some(expected) = schema.get("type") {
        if !type_matches(value, expected) {
            errors.push(FieldError::new(
                path,
                format!("expected {}, got {}", describe_type(expected), json_type_name(value)),
            ));
            return;
        }
    }

    if let Some(constant) = schema.get("const") {
        if value != constant {
            errors.push(FieldError::new(path, format!("expected {constant}, got {value}")));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|v| v.as_array()) {
        if !allowed.contains(value) {
            errors.push(FieldError::new(path, format!("{value} is not one of the allowed values")));
        }
    }

    if let Some(obj) = value.as_object() {
        let properties = schema.get("properties").and_then(|v| v.as_object());

        if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
            for name in required.iter().filter_map(|f| f.as_str()) {
                if !obj.contains_key(name) {
                    errors.push(FieldError::new(join(path, name), "missing required field"));
                }
            }
        }

        let closed = match schema.get("additionalProperties") {
            Some(Value::Bool(allowed)) => !allowed,
            _ => level == ValidationLevel::Strict && properties.is_some(),
        };

        for (key, field) in obj {
            match properties.and_then(|p| p.get(key)) {
                Some(field_schema) => check(field, field_schema, level, &join(path, key), errors),
                None if closed => errors.push(FieldError::new(join(path, key), "unexpected field")),
                None => {}
            }
        }
    }

    if let (Some(items), Some(array)) = (schema.get("items"), value.as_array()) {
        for (i, item) in array.iter().enumerate() {
            check(item, items, level, &format!("{path}[{i}]"), errors);
        }
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn type_matches(value: &Value, expected: &Value) -> bool {
    match expected {
        Value::String(t) => value_matches_type(value, t),
        Value::Array(types) => types
            .iter()
            .filter_map(|t| t.as_str())
            .any(|t| value_matches_type(value, t)),
        _ => true,
    }
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::String(t) => t.clone(),
        Value::Array(types) => types
            .iter()
            .filter_map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
