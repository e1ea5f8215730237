//! Column remapping and per-column transform expressions.
//!
//! Transform expressions are opaque strings on the table mapping, evaluated
//! here against each value. The recognized set is closed; an unknown
//! expression is a type mismatch, which is terminal for the chunk.

use sea_orm::JsonValue;
use serde_json::Map;

use crate::errors::AdapterError;
use crate::model::TableMapping;

/// Project one source row onto the target column layout: apply the column
/// mapping and any per-column transforms. Unmapped source columns pass
/// through under their own name.
pub fn project_row(
    row: &Map<String, JsonValue>,
    columns: &[String],
    mapping: &TableMapping,
) -> Result<Vec<JsonValue>, AdapterError> {
    let mut out = Vec::with_capacity(columns.len());
    for source_column in columns {
        let mut value = row.get(source_column).cloned().unwrap_or(JsonValue::Null);
        if let Some(expr) = mapping.transforms.get(source_column) {
            value = apply_transform(expr, value)
                .map_err(|e| AdapterError::TypeMismatch(format!("column {source_column}: {e}")))?;
        }
        out.push(value);
    }
    Ok(out)
}

/// Target column names for a batch, in source-column order.
pub fn target_columns(columns: &[String], mapping: &TableMapping) -> Vec<String> {
    columns.iter().map(|c| mapping.target_column(c)).collect()
}

/// Stable source-column order for a row: the map's key order (sorted).
pub fn source_columns(row: &Map<String, JsonValue>) -> Vec<String> {
    row.keys().cloned().collect()
}

pub fn apply_transform(expr: &str, value: JsonValue) -> Result<JsonValue, String> {
    match expr {
        "upper" => string_transform(value, |s| s.to_uppercase()),
        "lower" => string_transform(value, |s| s.to_lowercase()),
        "trim" => string_transform(value, |s| s.trim().to_string()),
        "null_if_empty" => Ok(match value {
            JsonValue::String(s) if s.is_empty() => JsonValue::Null,
            other => other,
        }),
        "cast:text" => Ok(match value {
            JsonValue::Null => JsonValue::Null,
            JsonValue::String(s) => JsonValue::String(s),
            other => JsonValue::String(other.to_string()),
        }),
        "cast:bigint" => match &value {
            JsonValue::Null => Ok(JsonValue::Null),
            JsonValue::Number(n) if n.is_i64() => Ok(value),
            JsonValue::Number(n) => n
                .as_f64()
                .map(|f| JsonValue::from(f as i64))
                .ok_or_else(|| format!("cannot cast {n} to bigint")),
            JsonValue::String(s) => s
                .trim()
                .parse::<i64>()
                .map(JsonValue::from)
                .map_err(|_| format!("cannot cast {s:?} to bigint")),
            JsonValue::Bool(b) => Ok(JsonValue::from(*b as i64)),
            other => Err(format!("cannot cast {other} to bigint")),
        },
        "cast:double" => match &value {
            JsonValue::Null => Ok(JsonValue::Null),
            JsonValue::Number(_) => Ok(value),
            JsonValue::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|f| JsonValue::from(f))
                .map_err(|_| format!("cannot cast {s:?} to double")),
            other => Err(format!("cannot cast {other} to double")),
        },
        _ => {
            if let Some(literal) = expr.strip_prefix("const:") {
                serde_json::from_str(literal).map_err(|e| format!("bad const literal: {e}"))
            } else {
                Err(format!("unknown transform expression {expr:?}"))
            }
        }
    }
}

fn string_transform(value: JsonValue, f: impl Fn(&str) -> String) -> Result<JsonValue, String> {
    match value {
        JsonValue::Null => Ok(JsonValue::Null),
        JsonValue::String(s) => Ok(JsonValue::String(f(&s))),
        other => Err(format!("expected text, got {other}")),
    }
}
