//! Statement parameters and results.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One result row: column name to JSON value.
pub type Row = serde_json::Map<String, JsonValue>;

/// A positional parameter value bound into a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for QueryParam {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Result metadata of a statement that does not return rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecResult {
    /// Auto-generated id of the inserted row, when the backend reports one.
    pub insert_id: Option<u64>,
    pub affected_rows: u64,
}

/// Outcome of `QueryExecutor::insert`.
///
/// Fields are `None` when the driver returned no result data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InsertOutcome {
    /// Only the insert id was requested.
    Id(Option<u64>),
    WithAffectedRows {
        insert_id: Option<u64>,
        affected_rows: Option<u64>,
    },
}

impl InsertOutcome {
    pub(crate) fn from_exec(result: Option<ExecResult>, include_affected_rows: bool) -> Self {
        let insert_id = result.and_then(|r| r.insert_id);
        if include_affected_rows {
            Self::WithAffectedRows {
                insert_id,
                affected_rows: result.map(|r| r.affected_rows),
            }
        } else {
            Self::Id(insert_id)
        }
    }

    pub fn insert_id(&self) -> Option<u64> {
        match self {
            Self::Id(id) => *id,
            Self::WithAffectedRows { insert_id, .. } => *insert_id,
        }
    }

    pub fn affected_rows(&self) -> Option<u64> {
        match self {
            Self::Id(_) => None,
            Self::WithAffectedRows { affected_rows, .. } => *affected_rows,
        }
    }
}

/// Outcome of `QueryExecutor::update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateOutcome {
    /// Affected rows were not requested.
    Done,
    AffectedRows(Option<u64>),
}

impl UpdateOutcome {
    pub(crate) fn from_exec(result: Option<ExecResult>, include_affected_rows: bool) -> Self {
        if include_affected_rows {
            Self::AffectedRows(result.map(|r| r.affected_rows))
        } else {
            Self::Done
        }
    }
}
