//! Index specs and JSON path projection.
//!
//! An index spec declares that a dotted path inside soup entries is materialized
//! into its own typed column (or, for `json1`, read through `json_extract`).

use crate::error::{SmartSqlError, SmartSqlResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Storage type of an indexed path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    String,
    Integer,
    Floating,
    FullText,
    Json1,
}

impl IndexType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::String => "string",
            IndexType::Integer => "integer",
            IndexType::Floating => "floating",
            IndexType::FullText => "full_text",
            IndexType::Json1 => "json1",
        }
    }

    pub fn parse(s: &str) -> SmartSqlResult<Self> {
        match s {
            "string" => Ok(IndexType::String),
            "integer" => Ok(IndexType::Integer),
            "floating" => Ok(IndexType::Floating),
            "full_text" => Ok(IndexType::FullText),
            "json1" => Ok(IndexType::Json1),
            other => Err(SmartSqlError::UnknownIndexType(other.to_string())),
        }
    }

    /// SQL column type, or `None` when the path is not projected into a column
    pub fn column_type(&self) -> Option<&'static str> {
        match self {
            IndexType::String | IndexType::FullText => Some("TEXT"),
            IndexType::Integer => Some("INTEGER"),
            IndexType::Floating => Some("REAL"),
            IndexType::Json1 => None,
        }
    }

    pub fn has_column(&self) -> bool {
        self.column_type().is_some()
    }
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One indexed path of a soup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub path: String,
    #[serde(rename = "type")]
    pub index_type: IndexType,
    /// Physical column, assigned at registration
    #[serde(rename = "columnName", default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
}

impl IndexSpec {
    pub fn new(path: impl Into<String>, index_type: IndexType) -> Self {
        Self {
            path: path.into(),
            index_type,
            column_name: None,
        }
    }

    pub fn string(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::String)
    }

    pub fn integer(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Integer)
    }

    pub fn floating(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Floating)
    }

    pub fn full_text(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::FullText)
    }

    pub fn json1(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Json1)
    }

    pub fn with_column(mut self, column_name: impl Into<String>) -> Self {
        self.column_name = Some(column_name.into());
        self
    }

    /// Parse `{"path": "...", "type": "..."}`
    pub fn from_json(value: &Value) -> SmartSqlResult<Self> {
        let path = value
            .get("path")
            .and_then(|p| p.as_str())
            .ok_or_else(|| SmartSqlError::MissingField("path".to_string()))?;
        let index_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| SmartSqlError::MissingField("type".to_string()))?;
        let mut spec = IndexSpec::new(path, IndexType::parse(index_type)?);
        if let Some(col) = value.get("columnName").and_then(|c| c.as_str()) {
            spec.column_name = Some(col.to_string());
        }
        Ok(spec)
    }

    pub fn to_json(&self) -> Value {
        json!({ "path": self.path, "type": self.index_type.as_str() })
    }

    /// Same path and type, regardless of assigned column
    pub fn same_shape(&self, other: &IndexSpec) -> bool {
        self.path == other.path && self.index_type == other.index_type
    }
}

/// Compare two spec lists by path and type, ignoring column assignment and order
pub fn same_index_specs(a: &[IndexSpec], b: &[IndexSpec]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| x.same_shape(y)))
}

/// Walk a dotted path through a JSON document.
///
/// When an intermediate value is an array, the rest of the path is applied to
/// every element and the results are collected into an array. An empty path
/// returns the document itself.
pub fn project(doc: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(doc.clone());
    }
    let parts: Vec<&str> = path.split('.').collect();
    project_parts(doc, &parts)
}

fn project_parts(doc: &Value, parts: &[&str]) -> Option<Value> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(doc.clone());
    };
    match doc {
        Value::Object(map) => {
            let child = map.get(*head)?;
            project_parts(child, rest)
        }
        Value::Array(items) => {
            let values: Vec<Value> = items
                .iter()
                .filter_map(|item| project_parts(item, parts))
                .collect();
            Some(Value::Array(values))
        }
        _ => None,
    }
}
