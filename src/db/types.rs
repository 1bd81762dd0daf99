//! Row decoding into JSON maps.
//!
//! Columns are first classified into a [`TypeCategory`] from their declared type
//! name, then decoded by a backend-specific routine. Binary columns come back as
//! base64 strings, matching how [`QueryParam::Bytes`](crate::models::QueryParam)
//! is written.

use crate::models::{DatabaseType, Row as JsonRow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Text,
}

/// Classify a declared column type name.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Checked first: "numeric" would otherwise fall through to the float rules
    if lower.contains("decimal") || lower.contains("numeric") {
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") {
        return TypeCategory::Binary;
    }

    // varchar, text, char, date, time, enum, ...
    TypeCategory::Text
}

/// DECIMAL values kept as their exact textual representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

fn float_to_json(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn bytes_to_json(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

/// Text columns declared as JSON are parsed; anything unparsable stays a string.
fn text_to_json(text: String, type_name: &str) -> JsonValue {
    if type_name.to_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&text) {
            return json;
        }
    }
    JsonValue::String(text)
}

/// Conversion of a driver row into a column-name keyed JSON map.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .map(|col| {
                let idx = col.ordinal();
                let type_name = col.type_info().name();
                let value = match categorize_type(type_name, DatabaseType::MySQL) {
                    TypeCategory::Decimal => mysql::decimal(self, idx),
                    TypeCategory::Integer => mysql::integer(self, idx),
                    TypeCategory::Boolean => mysql::boolean(self, idx),
                    TypeCategory::Float => mysql::float(self, idx),
                    TypeCategory::Binary => mysql::binary(self, idx),
                    TypeCategory::Json => mysql::json(self, idx),
                    TypeCategory::Text => mysql::text(self, idx, type_name),
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .map(|col| {
                let idx = col.ordinal();
                let type_name = sqlite::column_type_name(self, col);
                let value = match categorize_type(&type_name, DatabaseType::SQLite) {
                    TypeCategory::Integer => sqlite::integer(self, idx),
                    TypeCategory::Boolean => sqlite::boolean(self, idx),
                    TypeCategory::Float | TypeCategory::Decimal => sqlite::float(self, idx),
                    TypeCategory::Binary => sqlite::binary(self, idx),
                    _ => sqlite::text(self, idx, &type_name),
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}

mod mysql {
    use super::*;

    pub(super) fn decimal(row: &MySqlRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!(column = idx, error = %e, "Failed to decode DECIMAL");
                JsonValue::Null
            }
        }
    }

    pub(super) fn integer(row: &MySqlRow, idx: usize) -> JsonValue {
        // MySQL is strict about width and signedness, so probe each one
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<u8>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        JsonValue::Null
    }

    pub(super) fn boolean(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    pub(super) fn float(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(float_to_json).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v
                .map(|v| float_to_json(f64::from(v)))
                .unwrap_or(JsonValue::Null);
        }
        JsonValue::Null
    }

    pub(super) fn binary(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| bytes_to_json(&v))
            .unwrap_or(JsonValue::Null)
    }

    pub(super) fn json(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<JsonValue>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    pub(super) fn text(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return text_to_json(v, type_name);
        }
        // DATE/TIME and friends are sent as text by the unprepared protocol but
        // as binary by the prepared one
        row.try_get_unchecked::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| match String::from_utf8(v) {
                Ok(s) => JsonValue::String(s),
                Err(e) => bytes_to_json(e.as_bytes()),
            })
            .unwrap_or(JsonValue::Null)
    }
}

mod sqlite {
    use super::*;
    use sqlx::ValueRef;
    use sqlx::sqlite::SqliteColumn;

    /// Declared column type, or the storage class of the value for expression
    /// columns (`COUNT(*)`, `1 + 1`) which have no declared type.
    pub(super) fn column_type_name(row: &SqliteRow, col: &SqliteColumn) -> String {
        let declared = col.type_info();
        if !declared.is_null() {
            return declared.name().to_string();
        }
        row.try_get_raw(col.ordinal())
            .map(|value| value.type_info().name().to_string())
            .unwrap_or_default()
    }

    pub(super) fn integer(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::Null)
    }

    pub(super) fn boolean(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    pub(super) fn float(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .map(float_to_json)
            .unwrap_or(JsonValue::Null)
    }

    pub(super) fn binary(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| bytes_to_json(&v))
            .unwrap_or(JsonValue::Null)
    }

    pub(super) fn text(row: &SqliteRow, idx: usize, type_name: &str) -> JsonValue {
        // Declared types like DATETIME are stored with TEXT affinity but are not
        // accepted by the checked String decoder
        row.try_get_unchecked::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(|v| text_to_json(v, type_name))
            .unwrap_or(JsonValue::Null)
    }
}
