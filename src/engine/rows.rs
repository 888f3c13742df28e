//! Row serialization.
//!
//! Converts driver-specific rows into the JSON maps carried by
//! `QueryResult`. Values that are intrinsically numeric become JSON numbers
//! (unquoted), text becomes strings, absent values become null. SQLite's
//! dynamic typing needs special care: a column declared TEXT-ish can still
//! hold a number, so its values are reclassified by lexical form rather than
//! by declared column type alone.

use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Binary,
    Text,
}

/// Classify a declared column type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();
    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float")
        || lower.contains("double")
        || lower.contains("decimal")
        || lower.contains("numeric")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    TypeCategory::Text
}

/// Reclassify a textual value by its lexical form: integers and floats
/// become JSON numbers, everything else stays a string.
pub fn reclassify_lexical(value: String) -> JsonValue {
    let trimmed = value.trim();
    if !trimmed.is_empty() {
        if let Ok(n) = trimmed.parse::<i64>() {
            return JsonValue::Number(n.into());
        }
        // Reject inf/nan spellings; only plain numeric literals reclassify
        if trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        {
            if let Ok(f) = trimmed.parse::<f64>() {
                if let Some(n) = serde_json::Number::from_f64(f) {
                    return JsonValue::Number(n);
                }
            }
        }
    }
    JsonValue::String(value)
}

fn binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

/// Trait for converting driver rows into the serialized form.
pub trait RowToJson {
    fn column_names(&self) -> Vec<String>;
    fn to_json_map(&self) -> serde_json::Map<String, JsonValue>;
}

impl RowToJson for PgRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name());
                (col.name().to_string(), decode_pg(self, idx, category))
            })
            .collect()
    }
}

impl RowToJson for MySqlRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name());
                (col.name().to_string(), decode_mysql(self, idx, category))
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name());
                (col.name().to_string(), decode_sqlite(self, idx, category))
            })
            .collect()
    }
}

fn decode_pg(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Integer => {
            if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
                return JsonValue::Number(v.into());
            }
            if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
                return JsonValue::Number(v.into());
            }
            if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
                return JsonValue::Number(v.into());
            }
            JsonValue::Null
        }
        TypeCategory::Float => float_or_null(
            row.try_get::<Option<f64>, _>(idx).ok().flatten().or_else(|| {
                row.try_get::<Option<f32>, _>(idx)
                    .ok()
                    .flatten()
                    .map(f64::from)
            }),
        ),
        TypeCategory::Boolean => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null),
        TypeCategory::Binary => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| binary_value(&v))
            .unwrap_or(JsonValue::Null),
        TypeCategory::Text => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
    }
}

fn decode_mysql(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Integer => {
            if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
                return JsonValue::Number(v.into());
            }
            if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
                return JsonValue::Number(v.into());
            }
            JsonValue::Null
        }
        TypeCategory::Float => float_or_null(
            row.try_get::<Option<f64>, _>(idx).ok().flatten().or_else(|| {
                row.try_get::<Option<f32>, _>(idx)
                    .ok()
                    .flatten()
                    .map(f64::from)
            }),
        ),
        TypeCategory::Boolean => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null),
        TypeCategory::Binary => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| binary_value(&v))
            .unwrap_or(JsonValue::Null),
        TypeCategory::Text => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
    }
}

fn decode_sqlite(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Integer => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or(JsonValue::Null),
        TypeCategory::Float => float_or_null(row.try_get::<Option<f64>, _>(idx).ok().flatten()),
        TypeCategory::Boolean => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null),
        TypeCategory::Binary => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| binary_value(&v))
            .unwrap_or(JsonValue::Null),
        // SQLite stores values, not declarations: a TEXT-declared (or
        // undeclared) column can hold numbers, so inspect the value itself.
        TypeCategory::Text => {
            if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
                return JsonValue::Number(v.into());
            }
            if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
                return float_or_null(Some(v));
            }
            row.try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(reclassify_lexical)
                .unwrap_or(JsonValue::Null)
        }
    }
}

fn float_or_null(value: Option<f64>) -> JsonValue {
    value
        .and_then(serde_json::Number::from_f64)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type() {
        assert_eq!(categorize_type("INT8"), TypeCategory::Integer);
        assert_eq!(categorize_type("BIGINT"), TypeCategory::Integer);
        assert_eq!(categorize_type("bool"), TypeCategory::Boolean);
        assert_eq!(categorize_type("DOUBLE PRECISION"), TypeCategory::Float);
        assert_eq!(categorize_type("NUMERIC"), TypeCategory::Float);
        assert_eq!(categorize_type("BYTEA"), TypeCategory::Binary);
        assert_eq!(categorize_type("VARCHAR"), TypeCategory::Text);
        assert_eq!(categorize_type("TEXT"), TypeCategory::Text);
    }

    #[test]
    fn test_reclassify_integer() {
        assert_eq!(reclassify_lexical("42".into()), JsonValue::from(42));
        assert_eq!(reclassify_lexical("-7".into()), JsonValue::from(-7));
    }

    #[test]
    fn test_reclassify_float() {
        assert_eq!(reclassify_lexical("3.25".into()), JsonValue::from(3.25));
        assert_eq!(reclassify_lexical("1e3".into()), JsonValue::from(1000.0));
    }

    #[test]
    fn test_reclassify_text_stays_text() {
        assert_eq!(
            reclassify_lexical("42 copies".into()),
            JsonValue::String("42 copies".into())
        );
        assert_eq!(
            reclassify_lexical("".into()),
            JsonValue::String(String::new())
        );
        // "inf" parses as f64 but is not a numeric literal
        assert_eq!(
            reclassify_lexical("inf".into()),
            JsonValue::String("inf".into())
        );
    }
}
